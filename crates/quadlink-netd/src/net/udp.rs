use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use quadlink_netproto::codec::decode_datagram;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::inbound::{ConnId, EventTx, InboundEvent};

/// The unreliable half of a session: one UDP socket connected to the
/// peer's advertised port. Loss and reordering are the protocol's
/// problem; this layer only splits datagrams into frames.
#[derive(Debug)]
pub struct UdpLink {
    pub socket: Arc<UdpSocket>,
    pub local_port: u16,
}

/// Bind a socket next to the TCP endpoint and connect it to the peer.
/// The reader task exits on cancellation or the first socket error; a
/// dead UDP flow degrades the session to TCP-only, nothing more.
pub fn open_link(
    local_ip: IpAddr,
    peer: SocketAddr,
    conn_id: ConnId,
    tx: EventTx,
    cancel: CancellationToken,
) -> std::io::Result<UdpLink> {
    let socket = bind_near(local_ip, peer)?;
    socket.connect(peer)?;
    socket.set_nonblocking(true)?;
    let socket = Arc::new(UdpSocket::from_std(socket)?);
    let local_port = socket.local_addr()?.port();

    let reader = socket.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let received = tokio::select! {
                res = reader.recv(&mut buf) => res,
                _ = cancel.cancelled() => break,
            };
            let len = match received {
                Ok(len) => len,
                Err(e) => {
                    debug!(conn_id, "udp receive failed: {e}");
                    break;
                }
            };
            match decode_datagram(&buf[..len]) {
                Ok(packets) => {
                    for packet in packets {
                        if tx
                            .send(InboundEvent::Packet {
                                conn_id,
                                packet,
                                reliable: false,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => debug!(conn_id, "dropping malformed datagram: {e}"),
            }
        }
    });

    Ok(UdpLink { socket, local_port })
}

fn bind_near(local_ip: IpAddr, peer: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    match std::net::UdpSocket::bind((local_ip, 0)) {
        Ok(socket) => Ok(socket),
        // A v4-mapped listener address may not be bindable directly.
        Err(_) => {
            let unspecified: IpAddr = if peer.is_ipv4() {
                Ipv4Addr::UNSPECIFIED.into()
            } else {
                Ipv6Addr::UNSPECIFIED.into()
            };
            std::net::UdpSocket::bind((unspecified, 0))
        }
    }
}
