//! Stream and datagram framing.
//!
//! TCP carries `varint(size) ‖ payload` frames back to back; a size of
//! zero is legal and skipped on read. A UDP datagram carries one or more
//! such frames and is kept under [`MAX_UDP_DATAGRAM`] by flushing early.

use bytes::BytesMut;

use crate::constants::MAX_TCP_FRAME;
use crate::error::ProtoError;
use crate::packet::Packet;

/// Append one framed packet to an output buffer.
pub fn frame_into(out: &mut BytesMut, p: &Packet) {
    let mut size = p.len() as u64;
    loop {
        let byte = (size & 0x7F) as u8;
        size >>= 7;
        if size == 0 {
            out.extend_from_slice(&[byte]);
            break;
        }
        out.extend_from_slice(&[byte | 0x80]);
    }
    out.extend_from_slice(p.as_slice());
}

/// Frame one packet into a fresh buffer.
pub fn encode_frame(p: &Packet) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(p.len() + 4);
    frame_into(&mut out, p);
    out.to_vec()
}

/// Decode the varint size prefix at the start of `buf`.
///
/// Returns `None` while the prefix is still incomplete.
fn peek_size(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtoError> {
    let mut size = 0u64;
    for (count, &byte) in buf.iter().enumerate() {
        if count >= 10 {
            return Err(ProtoError::VarintTooLong);
        }
        size |= u64::from(byte & 0x7F) << (count * 7);
        if byte & 0x80 == 0 {
            return Ok(Some((size as usize, count + 1)));
        }
    }
    Ok(None)
}

/// Decode as many complete frames as `buf` holds.
///
/// Returns the decoded packets and the number of consumed bytes; the
/// caller keeps the remainder for the next read.
pub fn try_decode_frames(buf: &[u8]) -> Result<(Vec<Packet>, usize), ProtoError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while let Some((size, prefix)) = peek_size(&buf[offset..])? {
        if size > MAX_TCP_FRAME {
            return Err(ProtoError::FrameTooLarge(size));
        }
        if buf.len() - offset < prefix + size {
            break;
        }
        offset += prefix;
        if size > 0 {
            frames.push(Packet::from_vec(buf[offset..offset + size].to_vec()));
            offset += size;
        }
    }

    Ok((frames, offset))
}

/// Decode a whole datagram into its packets. A truncated tail is an
/// error here: datagrams are not streams.
pub fn decode_datagram(data: &[u8]) -> Result<Vec<Packet>, ProtoError> {
    let (frames, consumed) = try_decode_frames(data)?;
    if consumed != data.len() {
        return Err(ProtoError::Truncated);
    }
    Ok(frames)
}
