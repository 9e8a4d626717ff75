//! Client error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetplayError {
    #[error("Server protocol version does not match client protocol version.")]
    ProtocolMismatch,

    #[error("not connected to server")]
    NotConnected,

    #[error("failed to resolve {0}")]
    Resolve(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] quadlink_netproto::error::ProtoError),

    #[error("{0}")]
    Local(String),

    #[error("channel closed")]
    ChannelClosed,
}
