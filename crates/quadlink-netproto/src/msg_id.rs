//! Packet type and input authority identifiers.

use strum::FromRepr;

use crate::error::ProtoError;
use crate::packet::{Packet, Wire};

/// First byte of every packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum PacketType {
    Version = 0,
    Join = 1,
    Accept = 2,
    Path = 3,
    Ping = 4,
    Pong = 5,
    Quit = 6,
    Name = 7,
    SaveInfo = 8,
    RoomCheck = 9,
    Latency = 10,
    Message = 11,
    Lag = 12,
    SaveSync = 13,
    Autolag = 14,
    Controllers = 15,
    Start = 16,
    Golf = 17,
    InputMap = 18,
    InputData = 19,
    InputUpdate = 20,
    InputRate = 21,
    RequestAuthority = 22,
    DelegateAuthority = 23,
    /// Out-of-band discovery probe/reply, never seen inside a room.
    UdpPort = 24,
}

impl Wire for PacketType {
    fn put(&self, p: &mut Packet) {
        p.write(&(*self as u8));
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        let raw = p.read::<u8>()?;
        PacketType::from_repr(raw).ok_or(ProtoError::UnknownPacketType(raw))
    }
}

/// Which side owns a user's inputs.
///
/// `Client` streams its own samples; `Host` lets the server synthesize
/// samples from the last known state at a fixed rate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum Application {
    Client = 0,
    Host = 1,
}

impl Wire for Application {
    fn put(&self, p: &mut Packet) {
        p.write(&(*self as u8));
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        let raw = p.read::<u8>()?;
        Application::from_repr(raw).ok_or(ProtoError::UnknownApplication(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_codes_are_locked() {
        assert_eq!(PacketType::Version as u8, 0);
        assert_eq!(PacketType::Lag as u8, 12);
        assert_eq!(PacketType::InputData as u8, 19);
        assert_eq!(PacketType::DelegateAuthority as u8, 23);
        assert_eq!(PacketType::from_repr(19), Some(PacketType::InputData));
        assert_eq!(PacketType::from_repr(25), None);
    }
}
