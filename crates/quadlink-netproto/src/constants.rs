//! Protocol constants.

/// Wire protocol version, negotiated in both directions on connect.
pub const PROTOCOL_VERSION: u32 = 47;

/// Controller ports exposed by the emulated console.
pub const MAX_PLAYERS: usize = 4;

/// Room lag applied until someone changes it.
pub const DEFAULT_LAG: u8 = 5;

/// Length of the per-user input history ring relayed over UDP.
pub const INPUT_HISTORY_LENGTH: usize = 12;

/// UDP datagrams are flushed before they would exceed this size.
pub const MAX_UDP_DATAGRAM: usize = 1500;

/// Hard cap on a single TCP frame. Save blobs are the largest payloads.
pub const MAX_TCP_FRAME: usize = 16 * 1024 * 1024;

/// Pseudo user id carrying informational chat lines.
pub const INFO_MSG: u32 = 0xFFFF_FFFF;

/// Pseudo user id carrying error chat lines.
pub const ERROR_MSG: u32 = 0xFFFF_FFFE;

/// Well-known helper that reports the externally observed UDP port.
pub const UDP_QUERY_HOST: &str = "udp.play64.com";
pub const UDP_QUERY_PORT: u16 = 6400;

/// Default TCP port for servers and clients.
pub const DEFAULT_PORT: u16 = 6400;

/// Accepted host-input-authority tick rates, in Hz. Zero disables.
pub const MIN_INPUT_RATE: u32 = 5;
pub const MAX_INPUT_RATE: u32 = 300;
