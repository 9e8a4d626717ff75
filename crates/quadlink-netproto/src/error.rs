use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("packet truncated")]
    Truncated,
    #[error("varint is too long")]
    VarintTooLong,
    #[error("string length exceeds remaining payload")]
    StringLength,
    #[error("string is not valid utf-8")]
    Utf8,
    #[error("run-length block corrupt")]
    Rle,
    #[error("matrix dimensions do not divide payload length")]
    Dimensions,
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
    #[error("unknown application: {0}")]
    UnknownApplication(u8),
    #[error("unknown pak type: {0}")]
    UnknownPak(u8),
    #[error("field out of range")]
    OutOfRange,
}
