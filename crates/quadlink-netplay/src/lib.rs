//! Netplay client library.
//!
//! Feeds the host emulator's per-frame input callback into a room on a
//! quadlink server and delivers the merged input stream back, holding
//! the local emulator exactly `lag` frames ahead of its own consumption
//! cursor.
//!
//! # Architecture
//!
//! - [`handler`]: the client event loop and the [`NetplayClient`] handle
//! - [`connection`]: dual-transport connection and UDP port discovery
//! - [`state`]: room mirror and the lag/authority discipline
//! - [`bridge`]: emulator-facing blocking side
//! - [`queue`]: the blocking frame queue
//! - [`commands`]: chat-line command parser
//! - [`error`]: error types

pub mod bridge;
pub mod commands;
pub mod connection;
pub mod error;
pub mod handler;
pub mod queue;
pub mod state;

pub use bridge::InputBridge;
pub use commands::{Command, parse_line};
pub use error::NetplayError;
pub use handler::{NetplayClient, NetplayCommand, NetplayEvent, UserSummary};
pub use queue::BlockingQueue;
pub use state::{ClientState, Z_TRIG};
