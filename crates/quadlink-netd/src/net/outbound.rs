use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;

/// Sender used by the event loop to write already-framed bytes to a
/// connection. Unbounded: pacing comes from the emulator frame rate, and
/// the reliable path must never silently drop frames.
pub type OutboundTx = mpsc::UnboundedSender<Bytes>;

/// Writer task for one TCP connection. Drains the channel until it
/// closes, then shuts the socket down so queued farewells still land.
pub fn spawn_writer(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
    })
}
