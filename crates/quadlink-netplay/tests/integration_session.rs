//! Full-stack client tests: real server, real clients, merged frames.

use std::time::Duration;

use quadlink_netplay::{NetplayClient, NetplayEvent};
use quadlink_netproto::constants::MAX_PLAYERS;
use quadlink_netproto::messages::session::Controller;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<NetplayEvent>,
    mut predicate: impl FnMut(&NetplayEvent) -> bool,
) -> anyhow::Result<NetplayEvent> {
    timeout(Duration::from_secs(5), async {
        loop {
            let Some(event) = rx.recv().await else {
                anyhow::bail!("event stream ended");
            };
            if predicate(&event) {
                return Ok(event);
            }
        }
    })
    .await?
}

fn one_controller() -> [Controller; MAX_PLAYERS] {
    let mut controllers = [Controller::default(); MAX_PLAYERS];
    controllers[0].present = true;
    controllers
}

async fn join_room(
    port: u16,
    name: &str,
) -> anyhow::Result<(NetplayClient, mpsc::UnboundedReceiver<NetplayEvent>)> {
    let (client, mut events) = NetplayClient::spawn();
    client.set_local_controllers(one_controller());
    client.line(&format!("/name {name}"));
    client.line(&format!("/join 127.0.0.1/t {port}"));
    wait_for(&mut events, |e| {
        matches!(e, NetplayEvent::Status(s) if s.contains("Joined room"))
    })
    .await?;
    Ok((client, events))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_clients_consume_the_same_merged_frames() -> anyhow::Result<()> {
    let (port, _server) = quadlink_netd::spawn_server(0).await?;

    let (alice, mut alice_events) = join_room(port, "alice").await?;
    let (bob, mut bob_events) = join_room(port, "bob").await?;

    // Bob's arrival is visible to alice.
    wait_for(&mut alice_events, |e| {
        matches!(e, NetplayEvent::Status(s) if s == "bob joined.")
    })
    .await?;

    alice.line("/start");
    wait_for(&mut alice_events, |e| matches!(e, NetplayEvent::GameStarted)).await?;
    wait_for(&mut bob_events, |e| matches!(e, NetplayEvent::GameStarted)).await?;

    // Both netplay ports are present after the map broadcast.
    let ports = alice.netplay_controllers();
    assert!(ports[0].present);
    assert!(ports[1].present);
    assert!(!ports[2].present);

    // One emulated frame on each side.
    alice.process_input(0, 0xA1);
    alice.frame_complete();
    bob.process_input(0, 0xB1);
    bob.frame_complete();

    // Each instance consumes the same 4-slot frame: alice's sample in
    // slot 0, bob's in slot 1, the rest zero (absent, no block).
    for client in [&alice, &bob] {
        let reader = client.clone();
        let frame = timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || {
                [
                    reader.get_input(0),
                    reader.get_input(1),
                    reader.get_input(2),
                    reader.get_input(3),
                ]
            }),
        )
        .await??;
        assert_eq!(frame, [0xA1, 0xB1, 0, 0]);
    }

    alice.shutdown();
    bob.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn room_lag_changes_are_announced_to_everyone() -> anyhow::Result<()> {
    let (port, _server) = quadlink_netd::spawn_server(0).await?;

    let (alice, mut alice_events) = join_room(port, "alice").await?;
    let (_bob, mut bob_events) = join_room(port, "bob").await?;
    wait_for(&mut alice_events, |e| {
        matches!(e, NetplayEvent::Status(s) if s == "bob joined.")
    })
    .await?;

    alice.line("/lag 2");
    wait_for(&mut alice_events, |e| {
        matches!(e, NetplayEvent::Status(s) if s == "Lag set to 2.")
    })
    .await?;

    // Bob gets the info line; alice gets it too (the echo LAG packet
    // goes everywhere but back to her).
    for events in [&mut alice_events, &mut bob_events] {
        wait_for(events, |e| {
            matches!(e, NetplayEvent::Status(s) if s.contains("alice set the lag to 2"))
        })
        .await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn player_quit_tears_down_the_room_and_unblocks_the_emulator() -> anyhow::Result<()> {
    use quadlink_netproto::codec::encode_frame;
    use quadlink_netproto::constants::PROTOCOL_VERSION;
    use quadlink_netproto::messages::session::UserInfo;
    use quadlink_netproto::msg_id::PacketType;
    use quadlink_netproto::packet::Packet;
    use tokio::io::AsyncWriteExt;

    let (port, _server) = quadlink_netd::spawn_server(0).await?;

    let (alice, mut alice_events) = join_room(port, "alice").await?;

    // A bare-socket player joins the same room and never sends inputs.
    let mut bob = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let mut info = UserInfo {
        name: "bob".to_string(),
        ..UserInfo::default()
    };
    info.controllers[0].present = true;
    let mut join = Packet::new();
    join.write(&PacketType::Join).write(&PROTOCOL_VERSION);
    join.write_str("t");
    join.write(&info).write(&0u16);
    bob.write_all(&encode_frame(&join)).await?;

    wait_for(&mut alice_events, |e| {
        matches!(e, NetplayEvent::Status(s) if s == "bob joined.")
    })
    .await?;
    alice.line("/start");
    wait_for(&mut alice_events, |e| matches!(e, NetplayEvent::GameStarted)).await?;

    // Park a consumer on bob's port, which will never be fed.
    let reader = alice.clone();
    let blocked = tokio::task::spawn_blocking(move || reader.get_input(1));

    // A player leaving a started game closes the room; the server drops
    // every remaining connection.
    drop(bob);
    wait_for(&mut alice_events, |e| matches!(e, NetplayEvent::Error(_))).await?;

    // The emulator thread unblocks with a zeroed word instead of hanging.
    let word = timeout(Duration::from_secs(5), blocked).await??;
    assert_eq!(word, 0);
    Ok(())
}
