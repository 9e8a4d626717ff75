//! Rendezvous server for quadlink netplay.
//!
//! The network layer ([`net`]) turns sockets into an event stream; one
//! event-loop task ([`server`]) owns every room and session and performs
//! all coordination: lag discipline, autolag, input authority, controller
//! mapping, and the frame-paced input fan-out.

use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub mod net;
pub mod room;
pub mod server;
pub mod user;

pub use server::{Server, run_server};

/// Bind dual-stack IPv6 when the platform allows it, else plain IPv4.
pub async fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
    match TcpListener::bind((std::net::Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(listener) => Ok(listener),
        Err(_) => TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await,
    }
}

/// Start a server: bind, spawn the accept loop and the event loop.
/// Returns the bound port (useful with port 0) and the loop's handle.
pub async fn spawn_server(
    port: u16,
) -> anyhow::Result<(u16, tokio::task::JoinHandle<anyhow::Result<()>>)> {
    let listener = bind_dual_stack(port).await?;
    let port = listener.local_addr()?.port();

    let (tx, rx) = mpsc::unbounded_channel();
    let accept_tx = tx.clone();
    tokio::spawn(async move {
        let _ = net::tcp::run_listener(listener, accept_tx).await;
    });
    let handle = tokio::spawn(run_server(rx, tx));
    Ok((port, handle))
}
