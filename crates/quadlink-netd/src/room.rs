//! Room state and the pure coordination algorithms.
//!
//! A room is a join-ordered set of sessions sharing one lag value, one
//! authority regime, and one controller map. The algorithms that have
//! observable contracts (port assignment, autolag) live here as free
//! functions so they can be tested without any I/O.

use quadlink_netproto::constants::{DEFAULT_LAG, MAX_PLAYERS};
use quadlink_netproto::messages::input::InputMap;

use crate::net::inbound::ConnId;

pub struct Room {
    pub id: String,
    /// Members in join order; the order is the map tie-break.
    pub members: Vec<ConnId>,
    /// Monotonic: once true, destroying the room is the only exit.
    pub started: bool,
    pub lag: u8,
    pub autolag: bool,
    pub golf: bool,
    /// Host-input-authority tick rate in Hz; 0 = disabled.
    pub hia_rate: u32,
    pub next_input_tick: Option<tokio::time::Instant>,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            members: Vec::new(),
            started: false,
            lag: DEFAULT_LAG,
            autolag: true,
            golf: false,
            hia_rate: 0,
            next_input_tick: None,
        }
    }
}

/// One user's inputs to the port assignment sweep.
pub struct MapSlot {
    pub present: [bool; MAX_PLAYERS],
    pub manual: bool,
    pub map: InputMap,
}

/// Recompute automatic controller maps in place.
///
/// Manual-map users keep the map they supplied; their destinations are
/// subtracted from availability first. Every other user gets its present
/// local ports assigned to the lowest free destinations, processed
/// strictly in join order, until all four destinations are consumed.
pub fn recompute_input_maps(slots: &mut [MapSlot]) {
    let mut used = [false; MAX_PLAYERS];
    for slot in slots.iter().filter(|s| s.manual) {
        for src in 0..MAX_PLAYERS {
            for (dst, taken) in used.iter_mut().enumerate() {
                *taken |= slot.map.get(src, dst);
            }
        }
    }

    for slot in slots.iter_mut().filter(|s| !s.manual) {
        slot.map.clear();
        for src in 0..MAX_PLAYERS {
            if !slot.present[src] {
                continue;
            }
            let Some(dst) = used.iter().position(|taken| !taken) else {
                break;
            };
            used[dst] = true;
            slot.map.set(src, dst);
        }
    }
}

/// Tail latency for the autolag controller: the mean of the two largest
/// player medians, floored at zero. Unknown medians are skipped.
pub fn tail_latency(medians: impl Iterator<Item = f64>) -> f64 {
    let mut top1 = f64::NEG_INFINITY;
    let mut top2 = f64::NEG_INFINITY;
    for median in medians.filter(|m| !m.is_nan()) {
        if median > top1 {
            top2 = top1;
            top1 = median;
        } else if median > top2 {
            top2 = median;
        }
    }
    ((top1 + top2) / 2.0).max(0.0)
}

/// Smallest lag that still covers the observed round-trip latency.
pub fn ideal_lag(tail_latency: f64, fps: f64) -> u8 {
    (tail_latency * fps - 0.1).ceil().clamp(0.0, 255.0) as u8
}
