//! Client-side session state: the room mirror and the lag discipline.
//!
//! Everything here is plain state transitions so the contracts — the lag
//! queue depth, the golf swing edge, the remote history acceptance — are
//! testable without a socket in sight.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use quadlink_netproto::constants::{DEFAULT_LAG, INPUT_HISTORY_LENGTH, MAX_PLAYERS};
use quadlink_netproto::messages::input::{InputData, InputMap};
use quadlink_netproto::messages::session::{Controller, RomInfo, UserInfo};
use quadlink_netproto::msg_id::Application;

/// Z trigger bit in the raw 32-bit button word.
pub const Z_TRIG: u32 = 0x0000_0020;

/// What the client mirrors about another room member.
pub struct RemoteUser {
    pub info: UserInfo,
    pub authority: Application,
    pub input_id: u32,
    pub input_history: VecDeque<InputData>,
}

impl RemoteUser {
    pub fn new(info: UserInfo) -> Self {
        Self {
            info,
            authority: Application::Client,
            input_id: 0,
            input_history: VecDeque::new(),
        }
    }

    /// Same acceptance rule as the server: next expected sequence only.
    pub fn add_input_history(&mut self, id: u32, sample: InputData) -> bool {
        if id != self.input_id {
            return false;
        }
        self.input_history.push_back(sample);
        while self.input_history.len() > INPUT_HISTORY_LENGTH {
            self.input_history.pop_front();
        }
        self.input_id = self.input_id.wrapping_add(1);
        true
    }
}

pub struct ClientState {
    pub name: String,
    pub rom: RomInfo,
    pub local_controllers: [Controller; MAX_PLAYERS],
    /// Our local-to-netplay assignment, as the server computed it.
    pub local_map: InputMap,
    pub lag: u8,
    pub golf: bool,
    pub started: bool,
    pub authority: Application,
    pub hia_rate: u32,
    pub my_id: Option<u32>,
    pub users: BTreeMap<u32, RemoteUser>,
    /// The sample being assembled for the current frame.
    pub pending: InputData,
    pub input_id: u32,
    pub input_history: VecDeque<InputData>,
    current_lag: i32,
    prev_z: [bool; MAX_PLAYERS],
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            rom: RomInfo::default(),
            local_controllers: [Controller::default(); MAX_PLAYERS],
            local_map: InputMap::default(),
            lag: DEFAULT_LAG,
            golf: false,
            started: false,
            authority: Application::Client,
            hia_rate: 0,
            my_id: None,
            users: BTreeMap::new(),
            pending: InputData::default(),
            input_id: 0,
            input_history: VecDeque::new(),
            current_lag: 0,
            prev_z: [false; MAX_PLAYERS],
        }
    }

    /// Reset everything tied to one server session.
    pub fn reset_session(&mut self) {
        self.local_map = InputMap::default();
        self.started = false;
        self.authority = Application::Client;
        self.hia_rate = 0;
        self.my_id = None;
        self.users.clear();
        self.pending = InputData::default();
        self.input_id = 0;
        self.input_history.clear();
        self.current_lag = 0;
        self.prev_z = [false; MAX_PLAYERS];
    }

    /// Golf swing detection: fires on the Z press edge while golf mode
    /// is on and lag is still nonzero. Level-held triggers stay silent.
    pub fn z_swing(&mut self, port: usize, buttons: u32) -> bool {
        let pressed = buttons & Z_TRIG != 0;
        let fire = self.golf && self.lag != 0 && pressed && !self.prev_z[port];
        if port < MAX_PLAYERS {
            self.prev_z[port] = pressed;
        }
        fire
    }

    /// Advance the lag cursor by one frame and return how many samples
    /// must be emitted to keep the emulator exactly `lag` frames ahead
    /// of its own consumption cursor.
    pub fn frame_deficit(&mut self) -> u32 {
        self.current_lag -= 1;
        let mut emit = 0;
        while self.current_lag < i32::from(self.lag) {
            emit += 1;
            self.current_lag += 1;
        }
        emit
    }

    /// Finalize the pending sample: stamp our map, append to the
    /// outbound history ring and bump the sequence counter.
    pub fn record_local_sample(&mut self) -> InputData {
        let mut sample = self.pending;
        sample.map = self.local_map;
        self.input_history.push_back(sample);
        while self.input_history.len() > INPUT_HISTORY_LENGTH {
            self.input_history.pop_front();
        }
        self.input_id = self.input_id.wrapping_add(1);
        sample
    }

    /// First sequence number of the current history ring.
    pub fn history_first_id(&self) -> u32 {
        self.input_id.wrapping_sub(self.input_history.len() as u32)
    }

    /// True if any of our local ports is mapped to a netplay port.
    pub fn is_player(&self) -> bool {
        !self.local_map.is_empty()
    }
}

/// Expand one sample through its port map into (netplay port, word)
/// pairs.
pub fn route_sample(sample: &InputData) -> impl Iterator<Item = (usize, u32)> {
    let map = sample.map;
    let words = sample.data;
    (0..MAX_PLAYERS).flat_map(move |src| {
        (0..MAX_PLAYERS).filter_map(move |dst| map.get(src, dst).then_some((dst, words[src])))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_fills_the_lag_window() {
        let mut state = ClientState::new();
        state.lag = 3;
        // Frame 1 primes lag+1 samples, steady state emits one per frame.
        assert_eq!(state.frame_deficit(), 4);
        assert_eq!(state.frame_deficit(), 1);
        assert_eq!(state.frame_deficit(), 1);
    }

    #[test]
    fn zero_lag_emits_one_sample_per_frame() {
        let mut state = ClientState::new();
        state.lag = 0;
        assert_eq!(state.frame_deficit(), 1);
        assert_eq!(state.frame_deficit(), 1);
    }

    #[test]
    fn lowering_lag_drains_the_queue_before_sending_again() {
        let mut state = ClientState::new();
        state.lag = 3;
        assert_eq!(state.frame_deficit(), 4);
        state.lag = 0;
        // Three frames of buffered input drain with nothing new sent.
        assert_eq!(state.frame_deficit(), 0);
        assert_eq!(state.frame_deficit(), 0);
        assert_eq!(state.frame_deficit(), 0);
        assert_eq!(state.frame_deficit(), 1);
    }

    #[test]
    fn raising_lag_refills_immediately() {
        let mut state = ClientState::new();
        state.lag = 1;
        assert_eq!(state.frame_deficit(), 2);
        state.lag = 3;
        assert_eq!(state.frame_deficit(), 3);
        assert_eq!(state.frame_deficit(), 1);
    }

    #[test]
    fn z_swing_is_edge_triggered_per_port() {
        let mut state = ClientState::new();
        state.golf = true;
        state.lag = 5;
        assert!(state.z_swing(0, Z_TRIG));
        // Held trigger does not refire.
        assert!(!state.z_swing(0, Z_TRIG));
        assert!(!state.z_swing(0, 0));
        assert!(state.z_swing(0, Z_TRIG));
        // Other ports edge independently.
        assert!(state.z_swing(1, Z_TRIG));
    }

    #[test]
    fn z_swing_requires_golf_and_nonzero_lag() {
        let mut state = ClientState::new();
        state.lag = 5;
        assert!(!state.z_swing(0, Z_TRIG));
        state.golf = true;
        state.lag = 0;
        assert!(!state.z_swing(1, Z_TRIG));
    }

    #[test]
    fn recorded_samples_carry_the_local_map() {
        let mut state = ClientState::new();
        state.local_map.set(0, 2);
        state.pending.data[0] = 0xAB;
        let sample = state.record_local_sample();
        assert!(sample.map.get(0, 2));
        assert_eq!(state.input_id, 1);
        assert_eq!(state.history_first_id(), 0);
        for _ in 0..20 {
            state.record_local_sample();
        }
        assert_eq!(state.input_history.len(), INPUT_HISTORY_LENGTH);
        assert_eq!(state.history_first_id(), 21 - INPUT_HISTORY_LENGTH as u32);
    }

    #[test]
    fn samples_route_through_their_own_map() {
        let mut sample = InputData {
            data: [0xA, 0xB, 0, 0],
            map: InputMap::default(),
        };
        sample.map.set(0, 1);
        sample.map.set(1, 2);
        let routed: Vec<(usize, u32)> = route_sample(&sample).collect();
        assert_eq!(routed, vec![(1, 0xA), (2, 0xB)]);
    }

    #[test]
    fn remote_history_follows_the_acceptance_rule() {
        let mut remote = RemoteUser::new(UserInfo::default());
        assert!(remote.add_input_history(0, InputData::default()));
        assert!(!remote.add_input_history(0, InputData::default()));
        assert!(!remote.add_input_history(2, InputData::default()));
        assert!(remote.add_input_history(1, InputData::default()));
        assert_eq!(remote.input_id, 2);
    }
}
