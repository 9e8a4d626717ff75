use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use quadlink_netproto::packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::outbound::OutboundTx;

/// Unique connection identifier assigned by the network layer.
pub type ConnId = u64;

/// Channel feeding the server event loop.
pub type EventTx = mpsc::UnboundedSender<InboundEvent>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Events produced by the network layer.
///
/// `Connected` is emitted once per accepted connection with the handle
/// upper layers use to write back; `Packet` for every decoded frame on
/// either transport; `Disconnected` when the TCP reader exits.
#[derive(Debug)]
pub enum InboundEvent {
    Connected {
        conn_id: ConnId,
        peer: SocketAddr,
        local: SocketAddr,
        outbound: OutboundTx,
        cancel: CancellationToken,
    },
    Packet {
        conn_id: ConnId,
        packet: Packet,
        /// True when the frame arrived on the ordered TCP stream.
        reliable: bool,
    },
    Disconnected {
        conn_id: ConnId,
        reason: String,
    },
}
