pub mod framing;
pub mod inbound;
pub mod outbound;
pub mod tcp;
pub mod udp;
