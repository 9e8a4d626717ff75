//! Input samples and controller-port mapping.

use crate::error::ProtoError;
use crate::packet::{Packet, Wire};

/// A 4x4 source-to-destination port permutation, one bit per pair
/// (`bit[src * 4 + dst]`). Bits referencing ports >= 4 are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputMap {
    pub bits: u16,
}

impl InputMap {
    /// The diagonal: local port N plays netplay port N.
    pub const IDENTITY: InputMap = InputMap { bits: 0x8421 };

    pub fn new(bits: u16) -> Self {
        Self { bits }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn get(&self, src: usize, dst: usize) -> bool {
        if src >= 4 || dst >= 4 {
            return false;
        }
        self.bits & (1 << (src * 4 + dst)) != 0
    }

    pub fn set(&mut self, src: usize, dst: usize) {
        if src >= 4 || dst >= 4 {
            return;
        }
        self.bits |= 1 << (src * 4 + dst);
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }
}

impl Wire for InputMap {
    fn put(&self, p: &mut Packet) {
        p.write(&self.bits);
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        Ok(InputMap::new(p.read::<u16>()?))
    }
}

/// One emulated frame of controller state: four raw 32-bit button words
/// (one per local port) plus the sender's port map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputData {
    pub data: [u32; 4],
    pub map: InputMap,
}

impl InputData {
    /// Wire size in bytes; the transpose packing depends on it.
    pub const SIZE: usize = 18;

    pub fn any(&self) -> bool {
        self.data.iter().any(|&word| word != 0)
    }
}

impl Wire for InputData {
    fn put(&self, p: &mut Packet) {
        for word in &self.data {
            p.write(word);
        }
        p.write(&self.map);
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        let mut data = [0u32; 4];
        for word in &mut data {
            *word = p.read::<u32>()?;
        }
        let map = p.read::<InputMap>()?;
        Ok(InputData { data, map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_bit_layout() {
        let mut map = InputMap::default();
        map.set(1, 2);
        assert_eq!(map.bits, 1 << 6);
        assert!(map.get(1, 2));
        assert!(!map.get(2, 1));

        // Out-of-range pairs are ignored on both sides.
        map.set(4, 0);
        assert_eq!(map.bits, 1 << 6);
        assert!(!map.get(0, 4));
    }

    #[test]
    fn identity_map_is_diagonal() {
        for port in 0..4 {
            assert!(InputMap::IDENTITY.get(port, port));
            for other in 0..4 {
                if other != port {
                    assert!(!InputMap::IDENTITY.get(port, other));
                }
            }
        }
    }

    #[test]
    fn input_data_wire_size() {
        let sample = InputData {
            data: [1, 2, 3, 4],
            map: InputMap::IDENTITY,
        };
        let mut p = Packet::new();
        p.write(&sample);
        assert_eq!(p.len(), InputData::SIZE);
        assert_eq!(p.read::<InputData>().unwrap(), sample);
    }
}
