//! The server event loop.
//!
//! One task owns every room and session; the network layer feeds it
//! [`InboundEvent`]s and all state mutation happens here, serialized
//! without locks. Output is coalesced per session and flushed at the end
//! of each event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use quadlink_netproto::constants::{
    MAX_INPUT_RATE, MAX_PLAYERS, MIN_INPUT_RATE, PROTOCOL_VERSION,
};
use quadlink_netproto::error::ProtoError;
use quadlink_netproto::messages::input::{InputData, InputMap};
use quadlink_netproto::messages::session::{Controller, SaveInfo, UserInfo};
use quadlink_netproto::msg_id::{Application, PacketType};
use quadlink_netproto::packet::Packet;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::inbound::{ConnId, EventTx, InboundEvent};
use crate::net::udp;
use crate::room::{self, MapSlot, Room};
use crate::user::User;

const ENABLE_LIMIT_MSG: &str = "==> Please ENABLE your emulator's frame rate limit <==";
const DISABLE_LIMIT_MSG: &str = "==> Please DISABLE your emulator's frame rate limit <==";

pub struct Server {
    start: std::time::Instant,
    next_user_id: u32,
    users: HashMap<ConnId, User>,
    rooms: HashMap<String, Room>,
    /// Sender cloned into UDP reader tasks; absent in tests that never
    /// open a UDP link.
    event_tx: Option<EventTx>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
            next_user_id: 0,
            users: HashMap::new(),
            rooms: HashMap::new(),
            event_tx: None,
        }
    }

    pub fn with_event_tx(event_tx: EventTx) -> Self {
        Self {
            event_tx: Some(event_tx),
            ..Self::new()
        }
    }

    /// Monotonic seconds since the server started; ping timestamps.
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected {
                conn_id,
                peer,
                local,
                outbound,
                cancel,
            } => {
                let mut user = User::new(conn_id, peer, local, outbound, cancel);
                user.info.id = self.next_user_id;
                self.next_user_id += 1;
                user.send_version(PROTOCOL_VERSION);
                debug!(conn_id, %peer, user_id = user.info.id, "connected");
                self.users.insert(conn_id, user);
            }
            InboundEvent::Packet {
                conn_id,
                mut packet,
                reliable,
            } => {
                if let Err(e) = self.on_packet(conn_id, &mut packet, reliable) {
                    warn!(conn_id, "malformed packet: {e}");
                    self.drop_user(conn_id, "malformed packet");
                }
            }
            InboundEvent::Disconnected { conn_id, reason } => {
                self.drop_user(conn_id, &reason);
            }
        }
        self.flush_all();
    }

    /// The 1-second global tick: latency telemetry, autolag, pings.
    pub fn on_tick(&mut self) {
        let now = self.now();
        for room_id in self.room_ids() {
            self.send_latencies(&room_id);
            let run_autolag = self
                .rooms
                .get(&room_id)
                .is_some_and(|r| r.autolag && r.hia_rate == 0);
            if run_autolag {
                self.auto_adjust_lag(&room_id);
            }
            for conn in self.members(&room_id) {
                if let Some(user) = self.users.get_mut(&conn) {
                    user.send_ping(now);
                }
            }
        }
        self.flush_all();
    }

    /// Earliest pending host-input tick across all rooms.
    pub fn next_input_deadline(&self) -> Option<tokio::time::Instant> {
        self.rooms.values().filter_map(|r| r.next_input_tick).min()
    }

    /// Fire every due host-input tick, catching up if the clock ran past
    /// several deadlines, then re-arm.
    pub fn run_input_ticks(&mut self) {
        let now = tokio::time::Instant::now();
        for room_id in self.room_ids() {
            let Some((mut next, rate)) = self
                .rooms
                .get(&room_id)
                .and_then(|r| r.next_input_tick.map(|next| (next, r.hia_rate)))
            else {
                continue;
            };
            if rate == 0 {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.next_input_tick = None;
                }
                continue;
            }
            let period = Duration::from_secs_f64(1.0 / f64::from(rate));
            while next <= now {
                self.host_input_tick(&room_id);
                next += period;
            }
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.next_input_tick = Some(next);
            }
        }
        self.flush_all();
    }

    /// One host-driven tick: every player's last known input, fanned out
    /// to every member.
    fn host_input_tick(&mut self, room_id: &str) {
        let members = self.members(room_id);
        for player in &members {
            let Some(source) = self.users.get(player) else {
                continue;
            };
            if !source.is_player() {
                continue;
            }
            let packet = source.host_packet();
            for member in &members {
                if let Some(user) = self.users.get_mut(member) {
                    user.send(&packet);
                }
            }
        }
    }

    fn flush_all(&mut self) {
        for user in self.users.values_mut() {
            user.flush();
        }
    }

    fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    fn members(&self, room_id: &str) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    fn on_packet(
        &mut self,
        conn: ConnId,
        p: &mut Packet,
        reliable: bool,
    ) -> Result<(), ProtoError> {
        let Some(user) = self.users.get(&conn) else {
            return Ok(());
        };
        let ty = p.read::<PacketType>()?;
        // Everything but JOIN (and the pre-join room suggestion) is
        // discarded until the user has joined a room.
        if user.room.is_none() && !matches!(ty, PacketType::Join | PacketType::RoomCheck) {
            return Ok(());
        }
        match ty {
            PacketType::Join => self.on_join(conn, p),
            PacketType::RoomCheck => {
                self.on_room_check(conn);
                Ok(())
            }
            PacketType::Ping => self.on_ping(conn, p, reliable),
            PacketType::Pong => self.on_pong(conn, p),
            PacketType::Name => self.on_name(conn, p),
            PacketType::Message => self.on_message(conn, p),
            PacketType::Lag => self.on_lag(conn, p),
            PacketType::Autolag => self.on_autolag(conn, p),
            PacketType::Controllers => self.on_controllers(conn, p),
            PacketType::Start => {
                self.on_start(conn);
                Ok(())
            }
            PacketType::Golf => self.on_golf(conn, p),
            PacketType::InputMap => self.on_input_map(conn, p),
            PacketType::RequestAuthority => self.on_request_authority(conn, p),
            PacketType::InputData => self.on_input_data(conn, p),
            PacketType::InputRate => self.on_input_rate(conn, p),
            PacketType::SaveInfo => self.on_save_info(conn, p),
            PacketType::SaveSync => {
                self.on_save_sync(conn, p);
                Ok(())
            }
            // Server-to-client types and the reserved INPUT_UPDATE.
            _ => Ok(()),
        }
    }

    fn on_join(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        if self.users.get(&conn).is_none_or(|u| u.room.is_some()) {
            return Ok(());
        }
        let version = p.read::<u32>()?;
        if version != PROTOCOL_VERSION {
            info!(conn, version, "protocol version mismatch");
            self.drop_user(conn, "protocol version mismatch");
            return Ok(());
        }
        let room_id = normalize_room_id(&p.read::<String>()?);
        let mut joined = p.read::<UserInfo>()?;
        let udp_port = p.read::<u16>()?;

        let event_tx = self.event_tx.clone();
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        joined.id = user.info.id;
        joined.name = clean_name(&joined.name);
        joined.latency = f64::NAN;
        for controller in &mut joined.controllers {
            controller.raw_data = false;
        }
        user.info = joined;

        if udp_port != 0 && let Some(tx) = event_tx {
            let local_ip = user.local.ip();
            let peer = SocketAddr::new(user.peer.ip(), udp_port);
            let cancel = user.cancel.clone();
            match udp::open_link(local_ip, peer, conn, tx, cancel) {
                Ok(link) => user.udp = Some(link),
                Err(e) => debug!(conn, "udp setup failed, staying tcp-only: {e}"),
            }
        }

        if !self.rooms.contains_key(&room_id) {
            info!(room = %room_id, "room created");
            self.rooms.insert(room_id.clone(), Room::new(room_id.clone()));
        }
        self.room_user_join(&room_id, conn);
        Ok(())
    }

    fn room_user_join(&mut self, room_id: &str, conn: ConnId) {
        let Some((started, lag, golf, hia_rate)) = self
            .rooms
            .get(room_id)
            .map(|r| (r.started, r.lag, r.golf, r.hia_rate))
        else {
            return;
        };
        if started {
            if let Some(user) = self.users.get_mut(&conn) {
                user.send_error("Game is already in progress");
            }
            self.drop_user(conn, "room already started");
            return;
        }
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.push(conn);
        }

        let members = self.members(room_id);
        let existing: Vec<ConnId> = members[..members.len() - 1].to_vec();
        let snapshot: Vec<UserInfo> = members
            .iter()
            .filter_map(|c| self.users.get(c).map(|u| u.info.clone()))
            .collect();
        let new_info = snapshot.last().cloned().unwrap_or_default();

        let now = self.now();
        if let Some(joiner) = self.users.get_mut(&conn) {
            joiner.room = Some(room_id.to_string());

            let mut accept = Packet::new();
            accept.write(&PacketType::Accept);
            accept.write(&joiner.udp.as_ref().map(|l| l.local_port).unwrap_or(0));
            for member in &snapshot {
                accept.write(&true).write(member);
            }
            joiner.send(&accept);
            joiner.send_path(room_id);
        }

        for member in &existing {
            if let Some(user) = self.users.get_mut(member) {
                user.send_join(&new_info);
            }
        }
        for member in &existing {
            let Some(info) = self.users.get(member).map(|u| u.info.clone()) else {
                continue;
            };
            if let Some(joiner) = self.users.get_mut(&conn) {
                joiner.send_join(&info);
            }
        }

        info!(room = %room_id, name = %new_info.name, "joined");

        if let Some(joiner) = self.users.get_mut(&conn) {
            joiner.send_ping(now);
            if hia_rate == 0 {
                joiner.send_lag(lag);
            }
        }

        self.update_controller_map(room_id);
        self.send_controllers(room_id);

        if let Some(joiner) = self.users.get_mut(&conn) {
            if golf && hia_rate == 0 {
                joiner.send_golf(true);
            }
            joiner.send_input_rate(hia_rate);
        }
    }

    /// Remove a session everywhere: its room, the connection table, and
    /// both transports. Queued farewell bytes still reach the writer.
    pub fn drop_user(&mut self, conn: ConnId, reason: &str) {
        let Some(mut user) = self.users.remove(&conn) else {
            return;
        };
        user.flush();
        user.cancel.cancel();
        info!(conn, user_id = user.info.id, %reason, "session closed");
        if let Some(room_id) = user.room.take() {
            self.room_user_quit(&room_id, &user);
        }
    }

    fn room_user_quit(&mut self, room_id: &str, departed: &User) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.members.retain(|c| *c != departed.conn_id);
        let started = room.started;
        let members = room.members.clone();

        for member in &members {
            if let Some(user) = self.users.get_mut(member) {
                user.send_quit(departed.info.id);
            }
        }
        info!(room = %room_id, name = %departed.info.name, "quit");

        if started && departed.is_player() {
            self.close_room(room_id);
        } else if members.is_empty() {
            self.close_room(room_id);
        } else {
            self.update_controller_map(room_id);
            self.send_controllers(room_id);
        }
    }

    fn close_room(&mut self, room_id: &str) {
        let Some(room) = self.rooms.remove(room_id) else {
            return;
        };
        info!(room = %room_id, "room closed");
        for conn in room.members {
            if let Some(mut user) = self.users.remove(&conn) {
                user.room = None;
                user.flush();
                user.cancel.cancel();
            }
        }
    }

    fn on_room_check(&mut self, conn: ConnId) {
        let mut rng = rand::rng();
        let room_id = loop {
            let candidate: String = (0..4)
                .map(|_| char::from(rng.random_range(b'a'..=b'z')))
                .collect();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        if let Some(user) = self.users.get_mut(&conn) {
            user.send_path(&room_id);
        }
    }

    fn on_ping(&mut self, conn: ConnId, p: &mut Packet, reliable: bool) -> Result<(), ProtoError> {
        let timestamp = p.read::<f64>()?;
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        user.can_recv_udp |= !reliable;
        let mut pong = Packet::new();
        pong.write(&PacketType::Pong)
            .write(&reliable)
            .write(&timestamp);
        // Answer on the transport the probe arrived on; the pair stays
        // self-validating under loss.
        if reliable {
            user.send(&pong);
        } else {
            user.send_udp(&pong);
        }
        Ok(())
    }

    fn on_pong(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let reliable = p.read::<bool>()?;
        let timestamp = p.read::<f64>()?;
        let now = self.now();
        if let Some(user) = self.users.get_mut(&conn) {
            user.can_send_udp |= !reliable;
            user.record_pong(timestamp, now);
        }
        Ok(())
    }

    fn on_name(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let name = clean_name(&p.read::<String>()?);
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        let old = std::mem::replace(&mut user.info.name, name.clone());
        let id = user.info.id;
        if let Some(room_id) = user.room.clone() {
            info!(room = %room_id, "{old} is now {name}");
            self.for_other_members(&room_id, conn, |u| u.send_name(id, &name));
        }
        Ok(())
    }

    fn on_message(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let text = p.read::<String>()?;
        let Some(user) = self.users.get(&conn) else {
            return Ok(());
        };
        let id = user.info.id;
        if let Some(room_id) = user.room.clone() {
            self.for_other_members(&room_id, conn, |u| u.send_message(id, &text));
        }
        Ok(())
    }

    fn on_lag(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let lag = p.read::<u8>()?;
        let source_lag = p.read::<bool>()?;
        let room_lag = p.read::<bool>()?;
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        if source_lag {
            user.info.lag = lag;
        }
        if room_lag && let Some(room_id) = user.room.clone() {
            self.room_send_lag(&room_id, Some(conn), lag);
        }
        Ok(())
    }

    /// Set the room lag, echo `LAG` to everyone except the initiator and
    /// post the chat line for user-initiated changes.
    fn room_send_lag(&mut self, room_id: &str, source: Option<ConnId>, lag: u8) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.lag = lag;

        let message = source.and_then(|s| {
            let name = self.users.get(&s).map(|u| u.info.name.clone())?;
            let fps = self.room_fps(room_id);
            let mut text = format!("{name} set the lag to {lag}");
            if fps.is_finite() && fps > 0.0 {
                text += &format!(" ({} ms)", (f64::from(lag) / fps * 1000.0) as u32);
            }
            Some(text)
        });

        for member in self.members(room_id) {
            let Some(user) = self.users.get_mut(&member) else {
                continue;
            };
            if source != Some(member) {
                user.send_lag(lag);
            }
            if let Some(text) = &message {
                user.send_info(text);
            }
        }
    }

    fn on_autolag(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let value = p.read::<i8>()?;
        let Some(room_id) = self.users.get(&conn).and_then(|u| u.room.clone()) else {
            return Ok(());
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Ok(());
        };
        let enabled = match value {
            0 => false,
            1 => true,
            _ => !room.autolag,
        };
        if enabled == room.autolag {
            return Ok(());
        }
        room.autolag = enabled;
        let text = if enabled {
            "Automatic lag is enabled"
        } else {
            "Automatic lag is disabled"
        };
        self.room_send_info(&room_id, text);
        Ok(())
    }

    fn on_controllers(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let mut controllers = [Controller::default(); MAX_PLAYERS];
        for controller in &mut controllers {
            *controller = p.read::<Controller>()?;
            controller.raw_data = false;
        }
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        user.info.controllers = controllers;
        let Some(room_id) = user.room.clone() else {
            return Ok(());
        };
        let started = self.rooms.get(&room_id).is_some_and(|r| r.started);
        if !started {
            self.update_controller_map(&room_id);
        }
        self.send_controllers(&room_id);
        Ok(())
    }

    fn on_start(&mut self, conn: ConnId) {
        let Some(user) = self.users.get(&conn) else {
            return;
        };
        let Some(room_id) = user.room.clone() else {
            return;
        };
        info!(room = %room_id, name = %user.info.name, "started the game");
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if room.started {
            return;
        }
        room.started = true;
        if room.hia_rate > 0 {
            room.next_input_tick = Some(tokio::time::Instant::now());
        }
        for member in self.members(&room_id) {
            if let Some(user) = self.users.get_mut(&member) {
                user.send_start();
            }
        }
    }

    fn on_golf(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let on = p.read::<bool>()?;
        let Some(room_id) = self.users.get(&conn).and_then(|u| u.room.clone()) else {
            return Ok(());
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Ok(());
        };
        if room.golf == on {
            return Ok(());
        }
        room.golf = on;
        for member in self.members(&room_id) {
            if let Some(user) = self.users.get_mut(&member) {
                user.send_golf(on);
            }
        }
        if on {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.autolag = false;
            }
            self.room_send_lag(&room_id, None, 0);
            for member in self.members(&room_id) {
                self.set_authority(member, Application::Host, Application::Client);
            }
            self.room_send_info(&room_id, DISABLE_LIMIT_MSG);
        }
        Ok(())
    }

    fn on_input_map(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let map = p.read::<InputMap>()?;
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        user.info.map = map;
        user.info.manual_map = true;
        let id = user.info.id;
        if let Some(room_id) = user.room.clone() {
            let mut packet = Packet::new();
            packet.write(&PacketType::InputMap).write(&id).write(&map);
            self.for_other_members(&room_id, conn, |u| u.send(&packet));
        }
        Ok(())
    }

    fn on_request_authority(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let requested = p.read::<Application>()?;
        let changed = self.set_authority(conn, requested, Application::Client);
        if !changed || requested != Application::Client {
            return Ok(());
        }
        // In golf mode the user reclaiming its own inputs parks everyone
        // else under host authority.
        let Some(room_id) = self.users.get(&conn).and_then(|u| u.room.clone()) else {
            return Ok(());
        };
        if self.rooms.get(&room_id).is_some_and(|r| r.golf) {
            for member in self.members(&room_id) {
                if member != conn {
                    self.set_authority(member, Application::Host, Application::Client);
                }
            }
        }
        Ok(())
    }

    /// Apply an authority change request. Takes effect iff the value
    /// actually changes and either the new authority is CLIENT or the
    /// initiator is.
    fn set_authority(&mut self, target: ConnId, new: Application, initiator: Application) -> bool {
        let Some(user) = self.users.get_mut(&target) else {
            return false;
        };
        if user.authority == new {
            return false;
        }
        if new != Application::Client && initiator != Application::Client {
            return false;
        }
        user.authority = new;
        user.pending_input = InputData::default();
        let id = user.info.id;
        let Some(room_id) = user.room.clone() else {
            return true;
        };

        self.for_other_members(&room_id, target, |u| u.send_delegate_authority(id, new));
        if initiator == Application::Client || new == Application::Host {
            if let Some(user) = self.users.get_mut(&target) {
                user.send_delegate_authority(id, new);
            }
        }

        let members = self.members(&room_id);
        let client_count = members
            .iter()
            .filter(|m| {
                self.users
                    .get(m)
                    .is_some_and(|u| u.authority == Application::Client)
            })
            .count();
        let golf = self.rooms.get(&room_id).is_some_and(|r| r.golf);
        if !golf {
            if new == Application::Client && client_count == members.len() {
                self.room_send_info(&room_id, ENABLE_LIMIT_MSG);
            } else if new == Application::Host && client_count == members.len() - 1 {
                self.room_send_info(&room_id, DISABLE_LIMIT_MSG);
            }
        }
        true
    }

    fn on_input_data(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let application = p.read::<Application>()?;
        let now = self.now();
        match application {
            Application::Client => {
                let first_id = p.read_var()? as u32;
                let mut block = p.read_rle()?.transpose(InputData::SIZE, 0)?;
                let mut sequence = first_id;
                while block.available() > 0 {
                    let sample = block.read::<InputData>()?;
                    let accepted = match self.users.get_mut(&conn) {
                        Some(user) => {
                            let accepted = user.add_input_history(sequence, sample);
                            if accepted {
                                user.record_input_timestamp(now);
                            }
                            accepted
                        }
                        None => return Ok(()),
                    };
                    if accepted {
                        self.fan_out_input(conn);
                        self.on_input_from(conn);
                    }
                    sequence = sequence.wrapping_add(1);
                }
            }
            Application::Host => {
                let sample = p.read::<InputData>()?;
                if let Some(user) = self.users.get_mut(&conn) {
                    user.pending_input = sample;
                    user.record_input_timestamp(now);
                }
            }
        }
        Ok(())
    }

    /// Relay the sender's state to everyone else: the whole history ring
    /// into UDP bundles, the newest sample reliably over TCP.
    fn fan_out_input(&mut self, from: ConnId) {
        let Some(source) = self.users.get(&from) else {
            return;
        };
        let Some(room_id) = source.room.clone() else {
            return;
        };
        let chunk = source.history_chunk();
        let latest = source.latest_packet();
        self.for_other_members(&room_id, from, |u| {
            u.append_udp_input(&chunk);
            u.send(&latest);
        });
    }

    /// Server-side simulation hook: without a fixed host tick, every
    /// accepted client sample advances the host-authoritative players by
    /// one synthesized sample, so the active player drives the clock.
    fn on_input_from(&mut self, from: ConnId) {
        let Some(room_id) = self.users.get(&from).and_then(|u| u.room.clone()) else {
            return;
        };
        if self.rooms.get(&room_id).is_none_or(|r| r.hia_rate != 0) {
            return;
        }
        let members = self.members(&room_id);
        for member in &members {
            if *member == from {
                continue;
            }
            let Some(host) = self.users.get(member) else {
                continue;
            };
            if !host.is_player() || host.authority != Application::Host {
                continue;
            }
            let packet = host.host_packet();
            for receiver in &members {
                if let Some(user) = self.users.get_mut(receiver) {
                    user.send(&packet);
                }
            }
        }
    }

    fn on_input_rate(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let requested = p.read::<u32>()?;
        let rate = if requested == 0 {
            0
        } else {
            requested.clamp(MIN_INPUT_RATE, MAX_INPUT_RATE)
        };
        let Some(room_id) = self.users.get(&conn).and_then(|u| u.room.clone()) else {
            return Ok(());
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Ok(());
        };
        room.hia_rate = rate;
        if rate == 0 {
            room.next_input_tick = None;
        } else if room.started && room.next_input_tick.is_none() {
            room.next_input_tick = Some(tokio::time::Instant::now());
        }
        for member in self.members(&room_id) {
            if let Some(user) = self.users.get_mut(&member) {
                user.send_input_rate(rate);
            }
        }
        Ok(())
    }

    fn on_save_info(&mut self, conn: ConnId, p: &mut Packet) -> Result<(), ProtoError> {
        let index = p.read::<u8>()?;
        let save = p.read::<SaveInfo>()?;
        let Some(user) = self.users.get_mut(&conn) else {
            return Ok(());
        };
        let slot = user
            .info
            .saves
            .get_mut(usize::from(index))
            .ok_or(ProtoError::OutOfRange)?;
        *slot = save.clone();
        let id = user.info.id;
        if let Some(room_id) = user.room.clone() {
            let mut packet = Packet::new();
            packet
                .write(&PacketType::SaveInfo)
                .write(&id)
                .write(&index)
                .write(&save);
            self.for_other_members(&room_id, conn, |u| u.send(&packet));
        }
        Ok(())
    }

    fn on_save_sync(&mut self, conn: ConnId, p: &mut Packet) {
        let Some(user) = self.users.get(&conn) else {
            return;
        };
        let Some(room_id) = user.room.clone() else {
            return;
        };
        let mut packet = Packet::new();
        packet.write(&PacketType::SaveSync);
        packet.write_bytes(p.remaining());
        self.for_other_members(&room_id, conn, |u| u.send(&packet));
    }

    fn for_other_members(&mut self, room_id: &str, except: ConnId, mut f: impl FnMut(&mut User)) {
        for member in self.members(room_id) {
            if member == except {
                continue;
            }
            if let Some(user) = self.users.get_mut(&member) {
                f(user);
            }
        }
    }

    fn room_send_info(&mut self, room_id: &str, text: &str) {
        for member in self.members(room_id) {
            if let Some(user) = self.users.get_mut(&member) {
                user.send_info(text);
            }
        }
    }

    fn send_latencies(&mut self, room_id: &str) {
        let members = self.members(room_id);
        let mut packet = Packet::new();
        packet.write(&PacketType::Latency);
        for member in &members {
            if let Some(user) = self.users.get(member) {
                packet.write(&user.info.id).write(&user.info.latency);
            }
        }
        for member in &members {
            if let Some(user) = self.users.get_mut(member) {
                user.send(&packet);
            }
        }
    }

    /// FPS estimate for the room: the first player's observed input rate.
    fn room_fps(&self, room_id: &str) -> f64 {
        self.members(room_id)
            .iter()
            .filter_map(|c| self.users.get(c))
            .find(|u| u.is_player())
            .map(|u| u.input_rate())
            .unwrap_or(f64::NAN)
    }

    fn auto_adjust_lag(&mut self, room_id: &str) {
        let fps = self.room_fps(room_id);
        if !fps.is_finite() {
            return;
        }
        let medians: Vec<f64> = self
            .members(room_id)
            .iter()
            .filter_map(|c| self.users.get(c))
            .filter(|u| u.is_player())
            .map(|u| u.median_latency())
            .collect();
        let ideal = room::ideal_lag(room::tail_latency(medians.into_iter()), fps);
        let Some(lag) = self.rooms.get(room_id).map(|r| r.lag) else {
            return;
        };
        if ideal < lag {
            self.room_send_lag(room_id, None, lag - 1);
        } else if ideal > lag {
            self.room_send_lag(room_id, None, lag + 1);
        }
    }

    fn update_controller_map(&mut self, room_id: &str) {
        let members = self.members(room_id);
        let mut slots: Vec<MapSlot> = members
            .iter()
            .filter_map(|c| self.users.get(c))
            .map(|u| MapSlot {
                present: [
                    u.info.controllers[0].present,
                    u.info.controllers[1].present,
                    u.info.controllers[2].present,
                    u.info.controllers[3].present,
                ],
                manual: u.info.manual_map,
                map: u.info.map,
            })
            .collect();
        room::recompute_input_maps(&mut slots);
        for (member, slot) in members.iter().zip(slots) {
            if let Some(user) = self.users.get_mut(member) {
                user.info.map = slot.map;
            }
        }
    }

    fn send_controllers(&mut self, room_id: &str) {
        let members = self.members(room_id);
        let mut packet = Packet::new();
        packet.write(&PacketType::Controllers);
        for member in &members {
            let Some(user) = self.users.get(member) else {
                continue;
            };
            packet.write(&user.info.id);
            for controller in &user.info.controllers {
                packet.write(controller);
            }
            packet.write(&user.info.map.bits);
        }
        for member in &members {
            if let Some(user) = self.users.get_mut(member) {
                user.send(&packet);
            }
        }
    }
}

/// Drive a server from the network event channel, the 1-second global
/// tick, and the per-room host-input tick deadlines.
pub async fn run_server(
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    event_tx: EventTx,
) -> anyhow::Result<()> {
    let mut server = Server::with_event_tx(event_tx);
    let first = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut tick = tokio::time::interval_at(first, Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("server loop started");
    loop {
        let deadline = server.next_input_deadline();
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => server.handle_event(event),
                    None => break,
                }
            }
            _ = tick.tick() => server.on_tick(),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                if deadline.is_some() => server.run_input_ticks(),
        }
    }
    Ok(())
}

fn normalize_room_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_prefix('/').unwrap_or(trimmed).to_string()
}

/// Trim and cap a user name at 255 bytes without splitting a character.
fn clean_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut end = 0;
    for (index, c) in trimmed.char_indices() {
        if index + c.len_utf8() > 255 {
            break;
        }
        end = index + c.len_utf8();
    }
    trimmed[..end].to_string()
}
