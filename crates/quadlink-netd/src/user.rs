//! Per-connection session state.
//!
//! A `User` owns the server side of one peer: its published info, the
//! accepted input history, latency telemetry, and the coalescing output
//! buffers for both transports. All mutation happens on the event loop.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::BytesMut;
use quadlink_netproto::codec::frame_into;
use quadlink_netproto::constants::{ERROR_MSG, INFO_MSG, INPUT_HISTORY_LENGTH, MAX_UDP_DATAGRAM};
use quadlink_netproto::messages::input::InputData;
use quadlink_netproto::messages::session::UserInfo;
use quadlink_netproto::msg_id::{Application, PacketType};
use quadlink_netproto::packet::Packet;
use tokio_util::sync::CancellationToken;

use crate::net::inbound::ConnId;
use crate::net::outbound::OutboundTx;
use crate::net::udp::UdpLink;

/// Latency samples kept for the median estimate.
const LATENCY_HISTORY_LENGTH: usize = 7;

/// Input timestamps older than this are dropped from the FPS window.
const INPUT_RATE_WINDOW: f64 = 2.0;

pub struct User {
    pub conn_id: ConnId,
    pub peer: SocketAddr,
    /// Local endpoint of the TCP socket; the UDP socket binds beside it.
    pub local: SocketAddr,
    pub cancel: CancellationToken,
    pub udp: Option<UdpLink>,
    /// Room the session currently occupies, at most one.
    pub room: Option<String>,
    pub info: UserInfo,
    pub authority: Application,
    /// Last HOST-authority sample received from the client.
    pub pending_input: InputData,
    /// Next expected input sequence number.
    pub input_id: u32,
    pub input_history: VecDeque<InputData>,
    /// Set once a pong proves our UDP datagrams reach the peer.
    pub can_send_udp: bool,
    /// Set once a ping arrives over UDP.
    pub can_recv_udp: bool,
    outbound: OutboundTx,
    latency_history: VecDeque<f64>,
    last_pong: f64,
    input_timestamps: VecDeque<f64>,
    tcp_out: BytesMut,
    udp_out: BytesMut,
    /// INPUT_DATA bundle accumulated for the current tick.
    udp_input: Packet,
}

impl User {
    pub fn new(
        conn_id: ConnId,
        peer: SocketAddr,
        local: SocketAddr,
        outbound: OutboundTx,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn_id,
            peer,
            local,
            cancel,
            udp: None,
            room: None,
            info: UserInfo::default(),
            authority: Application::Client,
            pending_input: InputData::default(),
            input_id: 0,
            input_history: VecDeque::new(),
            can_send_udp: false,
            can_recv_udp: false,
            outbound,
            latency_history: VecDeque::new(),
            last_pong: f64::NEG_INFINITY,
            input_timestamps: VecDeque::new(),
            tcp_out: BytesMut::new(),
            udp_out: BytesMut::new(),
            udp_input: Packet::new(),
        }
    }

    pub fn is_player(&self) -> bool {
        self.info.is_player()
    }

    /// Queue a packet on the reliable stream. Bytes reach the socket at
    /// the next [`flush`](Self::flush).
    pub fn send(&mut self, p: &Packet) {
        frame_into(&mut self.tcp_out, p);
    }

    /// Queue a packet on the unreliable flow, falling back to TCP while
    /// no UDP socket exists. Datagrams are cut before they would exceed
    /// the path MTU.
    pub fn send_udp(&mut self, p: &Packet) {
        if self.udp.is_none() {
            return self.send(p);
        }
        if self.udp_out.len() + p.len() + 4 > MAX_UDP_DATAGRAM {
            self.flush_udp();
        }
        frame_into(&mut self.udp_out, p);
    }

    /// Flush everything queued for this session: the input bundle first,
    /// then pending datagrams, then the reliable stream.
    pub fn flush(&mut self) {
        if !self.udp_input.is_empty() {
            let mut bundle = Packet::new();
            bundle.swap(&mut self.udp_input);
            self.send_udp(&bundle);
        }
        self.flush_udp();
        if !self.tcp_out.is_empty() {
            let bytes = self.tcp_out.split().freeze();
            let _ = self.outbound.send(bytes);
        }
    }

    fn flush_udp(&mut self) {
        if self.udp_out.is_empty() {
            return;
        }
        if let Some(link) = &self.udp {
            let _ = link.socket.try_send(&self.udp_out);
        }
        self.udp_out.clear();
    }

    /// Accept `sample` iff it carries the next expected sequence number.
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

    pub fn record_input_timestamp(&mut self, now: f64) {
        self.input_timestamps.push_back(now);
        while self
            .input_timestamps
            .front()
            .is_some_and(|&t| t < now - INPUT_RATE_WINDOW)
        {
            self.input_timestamps.pop_front();
        }
    }

    /// Observed input rate in samples per second; NaN while unknown.
    pub fn input_rate(&self) -> f64 {
        match (self.input_timestamps.front(), self.input_timestamps.back()) {
            (Some(first), Some(last)) if last > first => {
                (self.input_timestamps.len() - 1) as f64 / (last - first)
            }
            _ => f64::NAN,
        }
    }

    /// Fold one pong into the latency history. Timestamps not strictly
    /// newer than the last accepted one are ignored (out-of-order UDP).
    pub fn record_pong(&mut self, timestamp: f64, now: f64) {
        if timestamp <= self.last_pong {
            return;
        }
        self.last_pong = timestamp;
        self.info.latency = now - timestamp;
        self.latency_history.push_back(self.info.latency);
        while self.latency_history.len() > LATENCY_HISTORY_LENGTH {
            self.latency_history.pop_front();
        }
    }

    pub fn median_latency(&self) -> f64 {
        if self.latency_history.is_empty() {
            return f64::NAN;
        }
        let mut sorted: Vec<f64> = self.latency_history.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted[sorted.len() / 2]
    }

    pub fn send_version(&mut self, version: u32) {
        let mut p = Packet::new();
        p.write(&PacketType::Version).write(&version);
        self.send(&p);
    }

    pub fn send_path(&mut self, room_id: &str) {
        let mut p = Packet::new();
        p.write(&PacketType::Path);
        p.write_str(&format!("/{room_id}"));
        self.send(&p);
    }

    pub fn send_join(&mut self, info: &UserInfo) {
        let mut p = Packet::new();
        p.write(&PacketType::Join).write(info);
        self.send(&p);
    }

    pub fn send_quit(&mut self, user_id: u32) {
        let mut p = Packet::new();
        p.write(&PacketType::Quit).write(&user_id);
        self.send(&p);
    }

    pub fn send_name(&mut self, user_id: u32, name: &str) {
        let mut p = Packet::new();
        p.write(&PacketType::Name).write(&user_id);
        p.write_str(name);
        self.send(&p);
    }

    pub fn send_message(&mut self, user_id: u32, text: &str) {
        let mut p = Packet::new();
        p.write(&PacketType::Message).write(&user_id);
        p.write_str(text);
        self.send(&p);
    }

    pub fn send_info(&mut self, text: &str) {
        self.send_message(INFO_MSG, text);
    }

    pub fn send_error(&mut self, text: &str) {
        self.send_message(ERROR_MSG, text);
    }

    pub fn send_lag(&mut self, lag: u8) {
        let mut p = Packet::new();
        p.write(&PacketType::Lag)
            .write(&lag)
            .write(&false)
            .write(&true);
        self.send(&p);
    }

    pub fn send_start(&mut self) {
        let mut p = Packet::new();
        p.write(&PacketType::Start);
        self.send(&p);
    }

    pub fn send_golf(&mut self, on: bool) {
        let mut p = Packet::new();
        p.write(&PacketType::Golf).write(&on);
        self.send(&p);
    }

    pub fn send_input_rate(&mut self, rate: u32) {
        let mut p = Packet::new();
        p.write(&PacketType::InputRate).write(&rate);
        self.send(&p);
    }

    pub fn send_delegate_authority(&mut self, user_id: u32, authority: Application) {
        let mut p = Packet::new();
        p.write(&PacketType::DelegateAuthority)
            .write(&user_id)
            .write(&authority);
        self.send(&p);
    }

    /// One latency probe: over UDP when the socket exists, and over TCP
    /// as keepalive while UDP delivery is still unconfirmed.
    pub fn send_ping(&mut self, now: f64) {
        let mut p = Packet::new();
        p.write(&PacketType::Ping).write(&now);
        if self.udp.is_some() {
            self.send_udp(&p);
        }
        if !self.can_send_udp {
            self.send(&p);
        }
    }

    /// The loss-tolerant block for this user's whole history ring:
    /// appended to receivers' UDP bundles.
    pub fn history_chunk(&self) -> Packet {
        let first_id = self.input_id.wrapping_sub(self.input_history.len() as u32);
        let mut rows = Packet::new();
        for sample in &self.input_history {
            rows.write(sample);
        }
        let columns = rows
            .transpose(0, InputData::SIZE)
            .unwrap_or_else(|_| Packet::new());
        let mut chunk = Packet::new();
        chunk.write(&Application::Client);
        chunk.write_var(u64::from(self.info.id));
        chunk.write_var(u64::from(first_id));
        chunk.write_rle(columns.as_slice());
        chunk
    }

    /// The newest sample alone, pushed reliably so a dropped bundle is
    /// always recovered over TCP.
    pub fn latest_packet(&self) -> Packet {
        let mut p = Packet::new();
        p.write(&PacketType::InputData).write(&Application::Client);
        p.write_var(u64::from(self.info.id));
        p.write_var(u64::from(self.input_id.wrapping_sub(1)));
        let mut row = Packet::new();
        if let Some(sample) = self.input_history.back() {
            row.write(sample);
        }
        p.write_rle(row.as_slice());
        p
    }

    /// One host-authority tick of this user's last known state.
    pub fn host_packet(&self) -> Packet {
        let mut p = Packet::new();
        p.write(&PacketType::InputData).write(&Application::Host);
        p.write_var(u64::from(self.info.id));
        p.write(&self.pending_input);
        p
    }

    /// Append a relay chunk to the per-tick UDP INPUT_DATA bundle.
    pub fn append_udp_input(&mut self, chunk: &Packet) {
        if !self.can_send_udp || self.udp.is_none() {
            return;
        }
        if self.udp_input.is_empty() {
            self.udp_input.write(&PacketType::InputData);
        }
        self.udp_input.write_packet(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadlink_netproto::messages::input::InputMap;
    use tokio::sync::mpsc;

    fn user() -> (User, mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = User::new(
            1,
            "127.0.0.1:1".parse().expect("addr"),
            "127.0.0.1:6400".parse().expect("addr"),
            tx,
            CancellationToken::new(),
        );
        (user, rx)
    }

    fn sample(word: u32) -> InputData {
        InputData {
            data: [word, 0, 0, 0],
            map: InputMap::IDENTITY,
        }
    }

    #[test]
    fn history_accepts_only_the_next_sequence_number() {
        let (mut user, _rx) = user();
        assert!(user.add_input_history(0, sample(1)));
        assert!(user.add_input_history(1, sample(2)));
        // Replays and gaps are silently dropped.
        assert!(!user.add_input_history(1, sample(2)));
        assert!(!user.add_input_history(5, sample(9)));
        assert_eq!(user.input_id, 2);
        assert_eq!(user.input_history.len(), 2);
    }

    #[test]
    fn history_is_capped_and_contiguous() {
        let (mut user, _rx) = user();
        for i in 0..40 {
            assert!(user.add_input_history(i, sample(i)));
            assert!(user.input_history.len() <= INPUT_HISTORY_LENGTH);
        }
        assert_eq!(user.input_id, 40);
        assert_eq!(user.input_history.len(), INPUT_HISTORY_LENGTH);
        // Newest at the back, sequence input_id - 1.
        assert_eq!(user.input_history.back(), Some(&sample(39)));
        assert_eq!(user.input_history.front(), Some(&sample(28)));
    }

    #[test]
    fn median_latency_is_the_middle_order_statistic() {
        let (mut user, _rx) = user();
        assert!(user.median_latency().is_nan());
        for (i, latency) in [0.05, 0.01, 0.09, 0.03, 0.07, 0.02, 0.08]
            .into_iter()
            .enumerate()
        {
            let sent = i as f64;
            user.record_pong(sent, sent + latency);
        }
        assert!((user.median_latency() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn stale_pongs_are_ignored() {
        let (mut user, _rx) = user();
        user.record_pong(10.0, 10.5);
        user.record_pong(9.0, 12.0);
        user.record_pong(10.0, 12.0);
        assert!((user.info.latency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn input_rate_over_a_two_second_window() {
        let (mut user, _rx) = user();
        assert!(user.input_rate().is_nan());
        for i in 0..61 {
            user.record_input_timestamp(i as f64 / 60.0);
        }
        assert!((user.input_rate() - 60.0).abs() < 1.0);
    }

    #[test]
    fn latest_packet_round_trips_the_newest_sample() {
        let (mut user, _rx) = user();
        user.info.id = 7;
        for i in 0..5 {
            user.add_input_history(i, sample(i + 100));
        }
        let mut p = user.latest_packet();
        assert_eq!(p.read::<PacketType>().unwrap(), PacketType::InputData);
        assert_eq!(p.read::<Application>().unwrap(), Application::Client);
        assert_eq!(p.read_var().unwrap(), 7);
        assert_eq!(p.read_var().unwrap(), 4);
        let mut block = p.read_rle().unwrap().transpose(InputData::SIZE, 0).unwrap();
        assert_eq!(block.read::<InputData>().unwrap(), sample(104));
        assert_eq!(block.available(), 0);
    }

    #[test]
    fn history_chunk_round_trips_the_whole_ring() {
        let (mut user, _rx) = user();
        user.info.id = 3;
        for i in 0..20 {
            user.add_input_history(i, sample(i));
        }
        let mut chunk = user.history_chunk();
        assert_eq!(chunk.read::<Application>().unwrap(), Application::Client);
        assert_eq!(chunk.read_var().unwrap(), 3);
        assert_eq!(chunk.read_var().unwrap(), 8);
        let mut block = chunk
            .read_rle()
            .unwrap()
            .transpose(InputData::SIZE, 0)
            .unwrap();
        for i in 8..20 {
            assert_eq!(block.read::<InputData>().unwrap(), sample(i));
        }
        assert_eq!(block.available(), 0);
    }
}
