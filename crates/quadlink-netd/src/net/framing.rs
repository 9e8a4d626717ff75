use bytes::{Buf, BytesMut};
use quadlink_netproto::codec::try_decode_frames;
use quadlink_netproto::error::ProtoError;
use quadlink_netproto::packet::Packet;

/// Stream framing helper: keeps bytes across socket reads and drains as
/// many complete frames as the buffer holds.
pub struct TcpFramer {
    buf: BytesMut,
}

impl TcpFramer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    /// Mutable access for `read_buf` into the internal buffer.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn drain_packets(&mut self) -> Result<Vec<Packet>, ProtoError> {
        let (packets, consumed) = try_decode_frames(&self.buf)?;
        self.buf.advance(consumed);
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadlink_netproto::codec::encode_frame;
    use quadlink_netproto::msg_id::PacketType;

    #[test]
    fn framer_decodes_across_split_reads() {
        let mut p = Packet::new();
        p.write(&PacketType::Start);
        let encoded = encode_frame(&p);

        let mut framer = TcpFramer::new(64);
        framer.buf_mut().extend_from_slice(&encoded[..1]);
        assert!(framer.drain_packets().unwrap().is_empty());
        framer.buf_mut().extend_from_slice(&encoded[1..]);
        framer.buf_mut().extend_from_slice(&encoded);

        let packets = framer.drain_packets().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], p);
    }
}
