//! Client side of the dual-transport connection.
//!
//! One TCP stream (required) plus an optional UDP flow to the same
//! server. Reader tasks tag every event with the connection generation
//! so the handler can drop wakeups from a connection it already
//! replaced.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use quadlink_netproto::codec::{decode_datagram, frame_into, try_decode_frames};
use quadlink_netproto::constants::{MAX_UDP_DATAGRAM, UDP_QUERY_HOST, UDP_QUERY_PORT};
use quadlink_netproto::msg_id::PacketType;
use quadlink_netproto::packet::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::NetplayError;

/// Events from a connection's reader tasks, tagged with its generation.
#[derive(Debug)]
pub enum NetEvent {
    Packet { packet: Packet, reliable: bool },
    Disconnected { reason: String },
}

pub type NetTx = mpsc::UnboundedSender<(u64, NetEvent)>;

pub struct Connection {
    pub generation: u64,
    pub peer: SocketAddr,
    /// Externally observed UDP port to advertise in JOIN; 0 = TCP-only.
    pub udp_port: u16,
    pub can_send_udp: bool,
    pub can_recv_udp: bool,
    tcp_tx: mpsc::UnboundedSender<bytes::Bytes>,
    tcp_out: BytesMut,
    udp: Option<Arc<UdpSocket>>,
    udp_out: BytesMut,
    events: NetTx,
}

impl Connection {
    /// Resolve, connect, spawn reader/writer tasks and run UDP port
    /// discovery. Discovery failures silently degrade to TCP-only.
    pub async fn connect(
        host: &str,
        port: u16,
        generation: u64,
        events: NetTx,
    ) -> Result<Self, NetplayError> {
        let mut addrs = lookup_host(format!("{host}:{port}"))
            .await
            .map_err(|e| NetplayError::Resolve(format!("{host}: {e}")))?;
        let peer = addrs
            .next()
            .ok_or_else(|| NetplayError::Resolve(host.to_string()))?;

        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| NetplayError::Connect(format!("{peer}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        spawn_tcp_writer(write, tcp_rx);
        spawn_tcp_reader(read, generation, events.clone());

        let (udp, udp_port) = open_udp(peer).await;

        Ok(Self {
            generation,
            peer,
            udp_port,
            can_send_udp: false,
            can_recv_udp: false,
            tcp_tx,
            tcp_out: BytesMut::new(),
            udp,
            udp_out: BytesMut::new(),
            events,
        })
    }

    /// Wire the UDP socket to the server's advertised port (from ACCEPT)
    /// and start reading it. An advertised port of 0 drops UDP entirely.
    pub async fn establish_udp(&mut self, server_port: u16) {
        if server_port == 0 {
            self.udp = None;
            return;
        }
        let Some(socket) = self.udp.clone() else {
            return;
        };
        let target = SocketAddr::new(self.peer.ip(), server_port);
        if socket.connect(target).await.is_err() {
            self.udp = None;
            return;
        }
        let generation = self.generation;
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let len = match socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(_) => break,
                };
                match decode_datagram(&buf[..len]) {
                    Ok(packets) => {
                        for packet in packets {
                            if events
                                .send((generation, NetEvent::Packet {
                                    packet,
                                    reliable: false,
                                }))
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!("dropping malformed datagram: {e}"),
                }
            }
        });
    }

    pub fn has_udp(&self) -> bool {
        self.udp.is_some()
    }

    /// Queue a packet on the reliable stream.
    pub fn send(&mut self, p: &Packet) {
        frame_into(&mut self.tcp_out, p);
    }

    /// Queue a packet on the unreliable flow, falling back to TCP while
    /// no UDP socket is established.
    pub fn send_udp(&mut self, p: &Packet) {
        if self.udp.is_none() {
            return self.send(p);
        }
        if self.udp_out.len() + p.len() + 4 > MAX_UDP_DATAGRAM {
            self.flush_udp();
        }
        frame_into(&mut self.udp_out, p);
    }

    pub fn flush(&mut self) {
        self.flush_udp();
        if !self.tcp_out.is_empty() {
            let bytes = self.tcp_out.split().freeze();
            let _ = self.tcp_tx.send(bytes);
        }
    }

    fn flush_udp(&mut self) {
        if self.udp_out.is_empty() {
            return;
        }
        if let Some(socket) = &self.udp {
            let _ = socket.try_send(&self.udp_out);
        }
        self.udp_out.clear();
    }
}

fn spawn_tcp_writer(
    mut write: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<bytes::Bytes>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
    });
}

fn spawn_tcp_reader(mut read: tokio::net::tcp::OwnedReadHalf, generation: u64, events: NetTx) {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let reason;
        loop {
            buf.reserve(4096);
            match read.read_buf(&mut buf).await {
                Ok(0) => {
                    reason = "Disconnected from server".to_string();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    reason = e.to_string();
                    break;
                }
            }
            match try_decode_frames(&buf) {
                Ok((packets, consumed)) => {
                    bytes::Buf::advance(&mut buf, consumed);
                    for packet in packets {
                        if events
                            .send((generation, NetEvent::Packet {
                                packet,
                                reliable: true,
                            }))
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send((generation, NetEvent::Disconnected {
                        reason: format!("protocol error: {e}"),
                    }));
                    return;
                }
            }
        }
        let _ = events.send((generation, NetEvent::Disconnected { reason }));
    });
}

/// Bind the UDP socket and learn which port to advertise. Loopback and
/// private peers use the local port directly; public peers go through
/// the discovery helper.
async fn open_udp(peer: SocketAddr) -> (Option<Arc<UdpSocket>>, u16) {
    let unspecified: IpAddr = if peer.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let Ok(socket) = UdpSocket::bind((unspecified, 0)).await else {
        return (None, 0);
    };
    let Ok(local) = socket.local_addr() else {
        return (None, 0);
    };

    if peer.ip().is_loopback() || is_private_address(peer.ip()) {
        return (Some(Arc::new(socket)), local.port());
    }

    match discover_udp_port(&socket, peer).await {
        Some(port) => (Some(Arc::new(socket)), port),
        None => (None, 0),
    }
}

/// Ask the well-known helper which source port our datagrams appear
/// from. One probe, one second.
async fn discover_udp_port(socket: &UdpSocket, peer: SocketAddr) -> Option<u16> {
    let addrs = lookup_host((UDP_QUERY_HOST, UDP_QUERY_PORT)).await.ok()?;
    let helper = addrs.into_iter().find(|a| a.is_ipv4() == peer.is_ipv4())?;

    let mut probe = Packet::new();
    probe.write(&PacketType::UdpPort);
    socket.send_to(probe.as_slice(), helper).await.ok()?;

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;

    let mut reply = Packet::from_vec(buf[..len].to_vec());
    if reply.read::<PacketType>().ok()? != PacketType::UdpPort {
        return None;
    }
    reply.read::<u16>().ok()
}

/// RFC1918 / RFC3927 / RFC4193 (plus link-local v6) ranges that can
/// exchange datagrams without external port discovery.
pub fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return mapped.is_private() || mapped.is_link_local();
            }
            // fc00::/7 unique local, fe80::/10 link local.
            (v6.segments()[0] & 0xFE00) == 0xFC00 || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_bypass_discovery() {
        for ip in ["10.1.2.3", "172.16.0.9", "192.168.1.1", "169.254.0.3"] {
            let ip: IpAddr = ip.parse().expect("addr");
            assert!(is_private_address(ip), "{ip}");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "2001:db8::1"] {
            let ip: IpAddr = ip.parse().expect("addr");
            assert!(!is_private_address(ip), "{ip}");
        }
        assert!(is_private_address("fd12:3456::1".parse().expect("addr")));
        assert!(is_private_address("fe80::1".parse().expect("addr")));
        assert!(is_private_address("::ffff:192.168.0.2".parse().expect("addr")));
    }
}
