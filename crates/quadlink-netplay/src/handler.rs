//! The client event loop.
//!
//! One task owns the [`ClientState`] and the connection; the emulator
//! and UI threads talk to it through [`NetplayCommand`]s and read
//! [`NetplayEvent`]s back. Merged frames leave through the
//! [`InputBridge`], never through this channel.

use std::sync::Arc;

use quadlink_netproto::constants::{ERROR_MSG, INFO_MSG, MAX_PLAYERS, PROTOCOL_VERSION};
use quadlink_netproto::error::ProtoError;
use quadlink_netproto::messages::input::{InputData, InputMap};
use quadlink_netproto::messages::session::{Controller, RomInfo, UserInfo};
use quadlink_netproto::msg_id::{Application, PacketType};
use quadlink_netproto::packet::Packet;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::InputBridge;
use crate::commands::{Command, parse_line};
use crate::connection::{Connection, NetEvent, NetTx};
use crate::state::{ClientState, RemoteUser, route_sample};

/// Requests into the client loop.
#[derive(Debug)]
pub enum NetplayCommand {
    /// A chat line: commands start with `/`, everything else is chat.
    Line(String),
    SetControllers([Controller; MAX_PLAYERS]),
    SetRom(RomInfo),
    LocalInput { port: usize, buttons: u32 },
    FrameComplete,
    Shutdown,
}

/// Status stream for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayEvent {
    Status(String),
    Error(String),
    Chat { name: String, text: String },
    UserList(Vec<UserSummary>),
    GameStarted,
}

#[derive(Debug, Clone)]
pub struct UserSummary {
    pub id: u32,
    pub name: String,
    /// Seconds; NaN while unknown.
    pub latency: f64,
}

// NaN latencies compare equal here so event assertions stay simple.
impl PartialEq for UserSummary {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && (self.latency == other.latency
                || (self.latency.is_nan() && other.latency.is_nan()))
    }
}

/// Handle used by the emulator and UI threads. All methods are
/// non-blocking except [`get_input`](Self::get_input) and
/// [`wait_for_start`](Self::wait_for_start), which park on the bridge.
#[derive(Clone)]
pub struct NetplayClient {
    cmd_tx: mpsc::UnboundedSender<NetplayCommand>,
    bridge: Arc<InputBridge>,
}

impl NetplayClient {
    /// Spawn the client loop on the current runtime.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<NetplayEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(InputBridge::new());

        let handler = Handler {
            state: ClientState::new(),
            bridge: bridge.clone(),
            events: event_tx,
            net_tx,
            conn: None,
            room: String::new(),
            generation: 0,
            authority_requested: false,
            local_server: None,
        };
        tokio::spawn(handler.run(cmd_rx, net_rx));

        (Self { cmd_tx, bridge }, event_rx)
    }

    pub fn line(&self, line: &str) {
        let _ = self.cmd_tx.send(NetplayCommand::Line(line.to_string()));
    }

    /// Publish the host plugin's controller descriptors. Raw-data mode
    /// is forced off before anything reaches the wire.
    pub fn set_local_controllers(&self, controllers: [Controller; MAX_PLAYERS]) {
        let _ = self
            .cmd_tx
            .send(NetplayCommand::SetControllers(controllers));
    }

    pub fn set_rom(&self, rom: RomInfo) {
        let _ = self.cmd_tx.send(NetplayCommand::SetRom(rom));
    }

    /// One raw button word from the emulator for a local port.
    pub fn process_input(&self, port: usize, buttons: u32) {
        let _ = self
            .cmd_tx
            .send(NetplayCommand::LocalInput { port, buttons });
    }

    /// The emulator finished sampling all local ports for this frame.
    pub fn frame_complete(&self) {
        let _ = self.cmd_tx.send(NetplayCommand::FrameComplete);
    }

    /// Blocking read of the merged frame word for a netplay port.
    pub fn get_input(&self, port: usize) -> u32 {
        self.bridge.get_input(port)
    }

    pub fn netplay_controllers(&self) -> [Controller; MAX_PLAYERS] {
        self.bridge.netplay_controllers()
    }

    /// Block the calling thread until the game starts (or the session is
    /// torn down).
    pub fn wait_for_start(&self) -> bool {
        self.bridge.wait_for_start()
    }

    pub fn bridge(&self) -> Arc<InputBridge> {
        self.bridge.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(NetplayCommand::Shutdown);
    }
}

struct Handler {
    state: ClientState,
    bridge: Arc<InputBridge>,
    events: mpsc::UnboundedSender<NetplayEvent>,
    net_tx: NetTx,
    conn: Option<Connection>,
    /// Room path to join on the current server.
    room: String,
    /// Bumped on every (re)connect; events from older generations are
    /// stale wakeups and dropped silently.
    generation: u64,
    /// An authority request is in flight; wait for the delegation before
    /// asking again.
    authority_requested: bool,
    local_server: Option<tokio::task::AbortHandle>,
}

impl Handler {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<NetplayCommand>,
        mut net_rx: mpsc::UnboundedReceiver<(u64, NetEvent)>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = net_rx.recv() => {
                    match event {
                        Some((generation, event)) => {
                            self.handle_net_event(generation, event).await;
                        }
                        None => break,
                    }
                }
            }
            if let Some(conn) = &mut self.conn {
                conn.flush();
            }
        }
        if let Some(server) = self.local_server.take() {
            server.abort();
        }
    }

    fn status(&self, text: impl Into<String>) {
        let _ = self.events.send(NetplayEvent::Status(text.into()));
    }

    fn error(&self, text: impl Into<String>) {
        let _ = self.events.send(NetplayEvent::Error(text.into()));
    }

    fn send_user_list(&self) {
        let users = self
            .state
            .users
            .values()
            .map(|u| UserSummary {
                id: u.info.id,
                name: u.info.name.clone(),
                latency: u.info.latency,
            })
            .collect();
        let _ = self.events.send(NetplayEvent::UserList(users));
    }

    async fn handle_command(&mut self, command: NetplayCommand) -> bool {
        match command {
            NetplayCommand::Line(line) => match parse_line(&line) {
                Ok(command) => self.run_command(command).await,
                Err(message) => self.error(message),
            },
            NetplayCommand::SetControllers(mut controllers) => {
                for controller in &mut controllers {
                    controller.raw_data = false;
                }
                self.state.local_controllers = controllers;
                if let Some(conn) = &mut self.conn {
                    let mut p = Packet::new();
                    p.write(&PacketType::Controllers);
                    for controller in &controllers {
                        p.write(controller);
                    }
                    conn.send(&p);
                }
            }
            NetplayCommand::SetRom(rom) => self.state.rom = rom,
            NetplayCommand::LocalInput { port, buttons } => self.local_input(port, buttons),
            NetplayCommand::FrameComplete => self.frame_complete(),
            NetplayCommand::Shutdown => {
                self.drop_connection();
                return true;
            }
        }
        false
    }

    async fn run_command(&mut self, command: Command) {
        match command {
            Command::Chat(text) => {
                let _ = self.events.send(NetplayEvent::Chat {
                    name: self.state.name.clone(),
                    text: text.clone(),
                });
                if let Some(conn) = &mut self.conn {
                    let mut p = Packet::new();
                    p.write(&PacketType::Message);
                    p.write_str(&text);
                    conn.send(&p);
                }
            }
            Command::Name(name) => {
                self.state.name = name;
                self.status(format!("Name set to {}.", self.state.name));
                if let Some(conn) = &mut self.conn {
                    let mut p = Packet::new();
                    p.write(&PacketType::Name);
                    p.write_str(&self.state.name);
                    conn.send(&p);
                }
            }
            Command::Host { port } => {
                if self.state.started {
                    return self.error("Game has already started.");
                }
                self.drop_connection();
                if let Some(server) = self.local_server.take() {
                    server.abort();
                }
                match quadlink_netd::spawn_server(port).await {
                    Ok((port, handle)) => {
                        self.local_server = Some(handle.abort_handle());
                        self.status(format!("Server is listening on port {port}..."));
                        self.connect("127.0.0.1", port, String::new()).await;
                    }
                    Err(e) => self.error(e.to_string()),
                }
            }
            Command::Join { host, port } => {
                if self.state.started {
                    return self.error("Game has already started.");
                }
                self.drop_connection();
                let (host, room) = match host.split_once('/') {
                    Some((host, room)) => (host.to_string(), room.to_string()),
                    None => (host, String::new()),
                };
                self.connect(&host, port, room).await;
            }
            Command::Start => {
                let Some(conn) = &mut self.conn else {
                    return self.error("Cannot start game unless connected to server.");
                };
                let mut p = Packet::new();
                p.write(&PacketType::Start);
                conn.send(&p);
            }
            Command::Lag(lag) => {
                self.set_local_lag(lag);
                self.send_lag(lag, false, true);
            }
            Command::MyLag(lag) => {
                self.set_local_lag(lag);
                self.send_lag(lag, true, false);
            }
            Command::YourLag(lag) => self.send_lag(lag, false, true),
            Command::Autolag => {
                let Some(conn) = &mut self.conn else {
                    return self.error("Cannot toggle automatic lag unless connected to server.");
                };
                let mut p = Packet::new();
                p.write(&PacketType::Autolag).write(&(-1i8));
                conn.send(&p);
            }
            Command::Golf => {
                self.state.golf = !self.state.golf;
                self.status(if self.state.golf {
                    "Golf mode is turned ON."
                } else {
                    "Golf mode is turned OFF."
                });
                let golf = self.state.golf;
                if let Some(conn) = &mut self.conn {
                    let mut p = Packet::new();
                    p.write(&PacketType::Golf).write(&golf);
                    conn.send(&p);
                }
            }
        }
    }

    async fn connect(&mut self, host: &str, port: u16, room: String) {
        self.status("Resolving...");
        self.generation += 1;
        match Connection::connect(host, port, self.generation, self.net_tx.clone()).await {
            Ok(conn) => {
                self.status("Connected!");
                self.conn = Some(conn);
                self.room = room;
                self.state.reset_session();
                self.bridge.reset();
                self.authority_requested = false;
                self.send_join();
            }
            Err(e) => self.error(e.to_string()),
        }
    }

    fn send_join(&mut self) {
        let info = UserInfo {
            name: self.state.name.clone(),
            rom: self.state.rom.clone(),
            lag: self.state.lag,
            controllers: self.state.local_controllers,
            ..UserInfo::default()
        };
        let room = self.room.clone();
        let Some(conn) = &mut self.conn else {
            return;
        };
        let mut p = Packet::new();
        p.write(&PacketType::Join).write(&PROTOCOL_VERSION);
        p.write_str(&room);
        p.write(&info).write(&conn.udp_port);
        conn.send(&p);
    }

    /// Tear the connection down on purpose (rehost, rejoin, shutdown).
    fn drop_connection(&mut self) {
        if self.conn.take().is_some() {
            self.generation += 1;
            self.state.reset_session();
            self.bridge.reset();
            self.send_user_list();
        }
    }

    /// The connection died under us.
    fn lost_connection(&mut self, reason: &str) {
        if self.conn.take().is_none() {
            return;
        }
        self.generation += 1;
        self.state.users.clear();
        self.send_user_list();
        // Unblock the emulator; every queue yields zeroed words now.
        self.bridge.interrupt(reason);
        self.error(reason);
    }

    fn set_local_lag(&mut self, lag: u8) {
        self.state.lag = lag;
        self.status(format!("Lag set to {lag}."));
    }

    fn send_lag(&mut self, lag: u8, source_lag: bool, room_lag: bool) {
        if let Some(conn) = &mut self.conn {
            let mut p = Packet::new();
            p.write(&PacketType::Lag)
                .write(&lag)
                .write(&source_lag)
                .write(&room_lag);
            conn.send(&p);
        }
    }

    fn local_input(&mut self, port: usize, buttons: u32) {
        match self.state.authority {
            Application::Client => {
                if self.state.z_swing(port, buttons) {
                    let lag = self.state.lag;
                    self.send_lag(lag, false, true);
                    self.set_local_lag(0);
                }
            }
            Application::Host => {
                // In golf mode the player about to act reclaims their own
                // inputs; the server parks everyone else back under host
                // authority.
                if self.state.golf && buttons != 0 && !self.authority_requested {
                    self.authority_requested = true;
                    if let Some(conn) = &mut self.conn {
                        let mut p = Packet::new();
                        p.write(&PacketType::RequestAuthority)
                            .write(&Application::Client);
                        conn.send(&p);
                    }
                }
            }
        }
        if port < MAX_PLAYERS {
            self.state.pending.data[port] = buttons;
        }
    }

    fn frame_complete(&mut self) {
        if self.conn.is_none() {
            return;
        }
        match self.state.authority {
            Application::Host => {
                // Under host authority the server ticks for us; just keep
                // it supplied with the latest state.
                let mut sample = self.state.pending;
                sample.map = self.state.local_map;
                let Some(conn) = &mut self.conn else {
                    return;
                };
                let mut p = Packet::new();
                p.write(&PacketType::InputData)
                    .write(&Application::Host)
                    .write(&sample);
                conn.send(&p);
            }
            Application::Client => {
                if !self.state.is_player() {
                    return;
                }
                let deficit = self.state.frame_deficit();
                for _ in 0..deficit {
                    let sample = self.state.record_local_sample();
                    // Our own inputs enter the merged stream locally; the
                    // server only relays them to the others.
                    for (dst, word) in route_sample(&sample) {
                        self.bridge.push_input(dst, word);
                    }
                    self.send_client_sample();
                }
            }
        }
    }

    /// Mirror of the server's relay packing: the whole history ring over
    /// UDP, the newest sample alone reliably over TCP.
    fn send_client_sample(&mut self) {
        let first_id = self.state.history_first_id();
        let latest_id = self.state.input_id.wrapping_sub(1);
        let mut rows = Packet::new();
        for sample in &self.state.input_history {
            rows.write(sample);
        }
        let columns = rows
            .transpose(0, InputData::SIZE)
            .unwrap_or_else(|_| Packet::new());
        let mut latest_row = Packet::new();
        if let Some(sample) = self.state.input_history.back() {
            latest_row.write(sample);
        }

        let Some(conn) = &mut self.conn else {
            return;
        };
        if conn.has_udp() && conn.can_recv_udp {
            let mut p = Packet::new();
            p.write(&PacketType::InputData).write(&Application::Client);
            p.write_var(u64::from(first_id));
            p.write_rle(columns.as_slice());
            conn.send_udp(&p);
        }
        let mut p = Packet::new();
        p.write(&PacketType::InputData).write(&Application::Client);
        p.write_var(u64::from(latest_id));
        p.write_rle(latest_row.as_slice());
        conn.send(&p);
    }

    async fn handle_net_event(&mut self, generation: u64, event: NetEvent) {
        if generation != self.generation {
            return;
        }
        match event {
            NetEvent::Packet { mut packet, reliable } => {
                if let Err(e) = self.on_packet(&mut packet, reliable).await {
                    debug!("malformed packet from server: {e}");
                    self.lost_connection(&format!("protocol error: {e}"));
                }
            }
            NetEvent::Disconnected { reason } => self.lost_connection(&reason),
        }
    }

    async fn on_packet(&mut self, p: &mut Packet, reliable: bool) -> Result<(), ProtoError> {
        match p.read::<PacketType>()? {
            PacketType::Version => {
                let version = p.read::<u32>()?;
                if version != PROTOCOL_VERSION {
                    self.error(crate::error::NetplayError::ProtocolMismatch.to_string());
                    self.drop_connection();
                }
            }
            PacketType::Accept => {
                let udp_port = p.read::<u16>()?;
                let mut last_id = None;
                while p.available() > 0 {
                    if !p.read::<bool>()? {
                        continue;
                    }
                    let info = p.read::<UserInfo>()?;
                    last_id = Some(info.id);
                    self.state.users.insert(info.id, RemoteUser::new(info));
                }
                // The snapshot ends with ourselves.
                self.state.my_id = last_id;
                if let Some(conn) = &mut self.conn {
                    conn.establish_udp(udp_port).await;
                }
                self.send_user_list();
            }
            PacketType::Path => {
                let path = p.read::<String>()?;
                self.status(format!("Joined room {path}"));
            }
            PacketType::Join => {
                let info = p.read::<UserInfo>()?;
                self.status(format!("{} joined.", info.name));
                self.state.users.insert(info.id, RemoteUser::new(info));
                self.send_user_list();
            }
            PacketType::Ping => {
                let timestamp = p.read::<f64>()?;
                let Some(conn) = &mut self.conn else {
                    return Ok(());
                };
                conn.can_recv_udp |= !reliable;
                let mut pong = Packet::new();
                pong.write(&PacketType::Pong)
                    .write(&reliable)
                    .write(&timestamp);
                if reliable {
                    conn.send(&pong);
                } else {
                    conn.send_udp(&pong);
                }
            }
            PacketType::Pong => {
                let pong_reliable = p.read::<bool>()?;
                if let Some(conn) = &mut self.conn {
                    conn.can_send_udp |= !pong_reliable;
                }
            }
            PacketType::Quit => {
                let id = p.read::<u32>()?;
                if let Some(user) = self.state.users.remove(&id) {
                    self.status(format!("{} has quit.", user.info.name));
                }
                self.send_user_list();
            }
            PacketType::Name => {
                let id = p.read::<u32>()?;
                let name = p.read::<String>()?;
                if let Some(user) = self.state.users.get_mut(&id) {
                    let old_name = user.info.name.clone();
                    user.info.name = name.clone();
                    self.status(format!("{old_name} is now {name}."));
                }
                self.send_user_list();
            }
            PacketType::Latency => {
                while p.available() >= 12 {
                    let id = p.read::<u32>()?;
                    let latency = p.read::<f64>()?;
                    if let Some(user) = self.state.users.get_mut(&id) {
                        user.info.latency = latency;
                    }
                }
                self.send_user_list();
            }
            PacketType::Message => {
                let id = p.read::<u32>()?;
                let text = p.read::<String>()?;
                match id {
                    INFO_MSG => self.status(text),
                    ERROR_MSG => self.error(text),
                    _ => {
                        let name = self
                            .state
                            .users
                            .get(&id)
                            .map(|u| u.info.name.clone())
                            .unwrap_or_default();
                        let _ = self.events.send(NetplayEvent::Chat { name, text });
                    }
                }
            }
            PacketType::Lag => {
                let lag = p.read::<u8>()?;
                let _source_lag = p.read::<bool>()?;
                let _room_lag = p.read::<bool>()?;
                self.state.lag = lag;
            }
            PacketType::Golf => {
                self.state.golf = p.read::<bool>()?;
            }
            PacketType::Start => {
                if !self.state.started {
                    self.state.started = true;
                    self.bridge.set_started();
                    self.status("Game has started!");
                    let _ = self.events.send(NetplayEvent::GameStarted);
                }
            }
            PacketType::Controllers => self.on_controllers(p)?,
            PacketType::InputMap => {
                let id = p.read::<u32>()?;
                let map = p.read::<InputMap>()?;
                if let Some(user) = self.state.users.get_mut(&id) {
                    user.info.map = map;
                    user.info.manual_map = true;
                }
            }
            PacketType::InputData => self.on_input_data(p)?,
            PacketType::InputRate => {
                self.state.hia_rate = p.read::<u32>()?;
            }
            PacketType::DelegateAuthority => {
                let id = p.read::<u32>()?;
                let authority = p.read::<Application>()?;
                if let Some(user) = self.state.users.get_mut(&id) {
                    user.authority = authority;
                }
                if self.state.my_id == Some(id) {
                    self.state.authority = authority;
                    self.authority_requested = false;
                }
            }
            // Save blobs belong to the surrounding GUI layer.
            PacketType::SaveInfo | PacketType::SaveSync => {}
            _ => {}
        }
        Ok(())
    }

    fn on_controllers(&mut self, p: &mut Packet) -> Result<(), ProtoError> {
        while p.available() > 0 {
            let id = p.read::<u32>()?;
            let mut controllers = [Controller::default(); MAX_PLAYERS];
            for controller in &mut controllers {
                *controller = p.read::<Controller>()?;
            }
            let map = InputMap::new(p.read::<u16>()?);
            if let Some(user) = self.state.users.get_mut(&id) {
                user.info.controllers = controllers;
                user.info.map = map;
            }
            if self.state.my_id == Some(id) {
                self.state.local_map = map;
            }
        }

        // Project every member's mapping into the four netplay ports the
        // emulated console exposes.
        let mut netplay = [Controller::default(); MAX_PLAYERS];
        for user in self.state.users.values() {
            for src in 0..MAX_PLAYERS {
                if !user.info.controllers[src].present {
                    continue;
                }
                for (dst, slot) in netplay.iter_mut().enumerate() {
                    if user.info.map.get(src, dst) {
                        *slot = user.info.controllers[src];
                    }
                }
            }
        }
        self.bridge.set_netplay_controllers(netplay);
        self.send_user_list();
        Ok(())
    }

    fn on_input_data(&mut self, p: &mut Packet) -> Result<(), ProtoError> {
        match p.read::<Application>()? {
            Application::Client => {
                let id = p.read_var()? as u32;
                let first_id = p.read_var()? as u32;
                let mut block = p.read_rle()?.transpose(InputData::SIZE, 0)?;
                let Some(user) = self.state.users.get_mut(&id) else {
                    return Ok(());
                };
                let mut sequence = first_id;
                while block.available() > 0 {
                    let sample = block.read::<InputData>()?;
                    if user.add_input_history(sequence, sample) {
                        for (dst, word) in route_sample(&sample) {
                            self.bridge.push_input(dst, word);
                        }
                    }
                    sequence = sequence.wrapping_add(1);
                }
            }
            Application::Host => {
                let _id = p.read_var()?;
                let sample = p.read::<InputData>()?;
                // Each host tick is one emulated frame for those ports.
                for (dst, word) in route_sample(&sample) {
                    self.bridge.push_input(dst, word);
                }
            }
        }
        Ok(())
    }
}
