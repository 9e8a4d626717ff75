//! End-to-end tests for the relay server over real sockets.
//!
//! A mock client speaks the wire protocol directly: version handshake,
//! join/accept flow, input relay, and room teardown when a player leaves
//! a running game.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use quadlink_netproto::codec::{encode_frame, try_decode_frames};
use quadlink_netproto::constants::{DEFAULT_LAG, PROTOCOL_VERSION};
use quadlink_netproto::messages::input::{InputData, InputMap};
use quadlink_netproto::messages::session::UserInfo;
use quadlink_netproto::msg_id::{Application, PacketType};
use quadlink_netproto::packet::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    pending: VecDeque<Packet>,
}

impl TestClient {
    async fn connect(port: u16) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            pending: VecDeque::new(),
        })
    }

    async fn send(&mut self, p: &Packet) -> anyhow::Result<()> {
        self.stream.write_all(&encode_frame(p)).await?;
        Ok(())
    }

    /// Next frame from the server, waiting up to two seconds.
    async fn recv(&mut self) -> anyhow::Result<Packet> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(packet);
            }
            self.buf.reserve(4096);
            let n = timeout(Duration::from_secs(2), self.stream.read_buf(&mut self.buf)).await??;
            if n == 0 {
                bail!("connection closed");
            }
            let (packets, consumed) = try_decode_frames(&self.buf)?;
            bytes::Buf::advance(&mut self.buf, consumed);
            self.pending.extend(packets);
        }
    }

    /// Skip frames until one of the wanted type arrives; the returned
    /// packet has the type byte consumed.
    async fn recv_type(&mut self, wanted: PacketType) -> anyhow::Result<Packet> {
        loop {
            let mut packet = self.recv().await?;
            let ty = packet.read::<PacketType>()?;
            if ty == wanted {
                return Ok(packet);
            }
        }
    }

    async fn join(&mut self, room: &str, name: &str, present: bool) -> anyhow::Result<()> {
        let mut info = UserInfo {
            name: name.to_string(),
            ..UserInfo::default()
        };
        info.controllers[0].present = present;
        let mut p = Packet::new();
        p.write(&PacketType::Join).write(&PROTOCOL_VERSION);
        p.write_str(room);
        p.write(&info).write(&0u16);
        self.send(&p).await
    }
}

fn sample(word: u32) -> InputData {
    InputData {
        data: [word, 0, 0, 0],
        map: InputMap::new(1),
    }
}

fn client_input(first_id: u32, samples: &[InputData]) -> Packet {
    let mut rows = Packet::new();
    for s in samples {
        rows.write(s);
    }
    let columns = rows.transpose(0, InputData::SIZE).expect("pack");
    let mut p = Packet::new();
    p.write(&PacketType::InputData).write(&Application::Client);
    p.write_var(u64::from(first_id));
    p.write_rle(columns.as_slice());
    p
}

#[tokio::test]
async fn version_handshake_and_join_flow() -> anyhow::Result<()> {
    let (port, _server) = quadlink_netd::spawn_server(0).await?;
    let mut client = TestClient::connect(port).await?;

    let mut version = client.recv_type(PacketType::Version).await?;
    assert_eq!(version.read::<u32>()?, PROTOCOL_VERSION);

    client.join("t", "alice", true).await?;

    let mut accept = client.recv_type(PacketType::Accept).await?;
    assert_eq!(accept.read::<u16>()?, 0, "no udp advertised");
    assert!(accept.read::<bool>()?);
    let me = accept.read::<UserInfo>()?;
    assert_eq!(me.name, "alice");
    assert_eq!(accept.available(), 0, "only the joiner in the snapshot");

    let mut path = client.recv_type(PacketType::Path).await?;
    assert_eq!(path.read::<String>()?, "/t");

    let mut lag = client.recv_type(PacketType::Lag).await?;
    assert_eq!(lag.read::<u8>()?, DEFAULT_LAG);

    let mut controllers = client.recv_type(PacketType::Controllers).await?;
    assert_eq!(controllers.read::<u32>()?, me.id);

    let mut rate = client.recv_type(PacketType::InputRate).await?;
    assert_eq!(rate.read::<u32>()?, 0);

    Ok(())
}

#[tokio::test]
async fn two_clients_start_and_relay_inputs() -> anyhow::Result<()> {
    let (port, _server) = quadlink_netd::spawn_server(0).await?;

    let mut alice = TestClient::connect(port).await?;
    alice.join("t", "alice", true).await?;
    let mut accept = alice.recv_type(PacketType::Accept).await?;
    accept.read::<u16>()?;
    accept.read::<bool>()?;
    let alice_info = accept.read::<UserInfo>()?;

    let mut bob = TestClient::connect(port).await?;
    bob.join("t", "bob", true).await?;

    // Alice hears about bob; bob's snapshot has both.
    let mut joined = alice.recv_type(PacketType::Join).await?;
    let bob_info = joined.read::<UserInfo>()?;
    assert_eq!(bob_info.name, "bob");
    assert_ne!(bob_info.id, alice_info.id);

    let mut start = Packet::new();
    start.write(&PacketType::Start);
    alice.send(&start).await?;
    alice.recv_type(PacketType::Start).await?;
    bob.recv_type(PacketType::Start).await?;

    // One sample from alice reaches bob, tagged with her id and sequence.
    alice.send(&client_input(0, &[sample(0xCAFE)])).await?;
    let mut relayed = bob.recv_type(PacketType::InputData).await?;
    assert_eq!(relayed.read::<Application>()?, Application::Client);
    assert_eq!(relayed.read_var()?, u64::from(alice_info.id));
    assert_eq!(relayed.read_var()?, 0);
    let mut block = relayed.read_rle()?.transpose(InputData::SIZE, 0)?;
    assert_eq!(block.read::<InputData>()?, sample(0xCAFE));

    Ok(())
}

#[tokio::test]
async fn player_quitting_a_started_game_closes_the_room() -> anyhow::Result<()> {
    let (port, _server) = quadlink_netd::spawn_server(0).await?;

    let mut alice = TestClient::connect(port).await?;
    alice.join("t", "alice", true).await?;
    let mut accept = alice.recv_type(PacketType::Accept).await?;
    accept.read::<u16>()?;
    accept.read::<bool>()?;
    let alice_info = accept.read::<UserInfo>()?;

    let mut bob = TestClient::connect(port).await?;
    bob.join("t", "bob", true).await?;

    let mut start = Packet::new();
    start.write(&PacketType::Start);
    bob.send(&start).await?;
    alice.recv_type(PacketType::Start).await?;
    bob.recv_type(PacketType::Start).await?;

    drop(alice);

    // Bob sees the departure, then the server closes his connection too.
    let mut quit = bob.recv_type(PacketType::Quit).await?;
    assert_eq!(quit.read::<u32>()?, alice_info.id);
    let mut saw_eof = false;
    for _ in 0..32 {
        if bob.recv().await.is_err() {
            saw_eof = true;
            break;
        }
    }
    assert!(saw_eof, "server should close remaining connections");

    Ok(())
}

#[tokio::test]
async fn join_after_start_is_refused() -> anyhow::Result<()> {
    let (port, _server) = quadlink_netd::spawn_server(0).await?;

    let mut alice = TestClient::connect(port).await?;
    alice.join("t", "alice", true).await?;
    let mut start = Packet::new();
    start.write(&PacketType::Start);
    alice.send(&start).await?;
    alice.recv_type(PacketType::Start).await?;

    let mut late = TestClient::connect(port).await?;
    late.join("t", "late", true).await?;
    let mut message = late.recv_type(PacketType::Message).await?;
    assert_eq!(
        message.read::<u32>()?,
        quadlink_netproto::constants::ERROR_MSG
    );
    assert_eq!(message.read::<String>()?, "Game is already in progress");

    Ok(())
}
