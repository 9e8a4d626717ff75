use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::framing::TcpFramer;
use super::inbound::{EventTx, InboundEvent, next_conn_id};
use super::outbound::spawn_writer;
use tokio::sync::mpsc;

/// Run the accept loop on an existing listener. All decoded packets and
/// connection events are sent to `tx`.
pub async fn run_listener(listener: TcpListener, tx: EventTx) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let conn_id = next_conn_id();
        let tx = tx.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, conn_id, tx).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, conn_id: u64, tx: EventTx) {
    let _ = stream.set_nodelay(true);
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let (mut read, write) = stream.into_split();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(write, out_rx);
    let cancel = CancellationToken::new();

    if tx
        .send(InboundEvent::Connected {
            conn_id,
            peer,
            local,
            outbound: out_tx.clone(),
            cancel: cancel.clone(),
        })
        .is_err()
    {
        return;
    }

    let mut framer = TcpFramer::new(8 * 1024);
    let mut reason = "eof".to_string();

    loop {
        framer.buf_mut().reserve(4096);
        let read_res = tokio::select! {
            res = read.read_buf(framer.buf_mut()) => res,
            _ = cancel.cancelled() => {
                reason = "closed by server".to_string();
                break;
            }
        };

        match read_res {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                reason = format!("read error: {e}");
                break;
            }
        }

        match framer.drain_packets() {
            Ok(packets) => {
                for packet in packets {
                    if tx
                        .send(InboundEvent::Packet {
                            conn_id,
                            packet,
                            reliable: true,
                        })
                        .is_err()
                    {
                        // Event loop is gone; nothing left to notify.
                        return;
                    }
                }
            }
            Err(e) => {
                reason = format!("protocol error: {e}");
                break;
            }
        }
    }

    debug!(conn_id, %peer, %reason, "tcp connection closed");
    let _ = tx.send(InboundEvent::Disconnected { conn_id, reason });

    // Close the outbound channel so the writer drains and exits.
    drop(out_tx);
    let _ = writer.await;
}
