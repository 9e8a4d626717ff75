//! Wire protocol for quadlink netplay.
//!
//! Everything that crosses the network lives here: the cursor-based
//! [`packet::Packet`] codec (fixed-width little-endian fields, varints,
//! run-length blocks, columnar transpose), the stream/datagram framing in
//! [`codec`], and the protocol message types in [`messages`].

pub mod codec;
pub mod constants;
pub mod error;
pub mod messages;
pub mod msg_id;
pub mod packet;

pub use error::ProtoError;
pub use msg_id::{Application, PacketType};
pub use packet::{Packet, Wire};
