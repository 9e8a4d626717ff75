//! Property-based laws for the packet codec.

use proptest::prelude::*;
use quadlink_netproto::packet::Packet;

proptest! {
    #[test]
    fn varint_round_trips(value in any::<u64>()) {
        let mut p = Packet::new();
        p.write_var(value);
        prop_assert_eq!(p.read_var().unwrap(), value);
        prop_assert_eq!(p.available(), 0);
    }

    #[test]
    fn rle_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let mut p = Packet::new();
        p.write_rle(&bytes);
        let decoded = p.read_rle().unwrap();
        prop_assert_eq!(decoded.as_slice(), bytes.as_slice());
        prop_assert_eq!(p.available(), 0);
    }

    // Runs dominate real input history blocks; bias the generator toward them.
    #[test]
    fn rle_round_trips_runs(runs in proptest::collection::vec((any::<u8>(), 1usize..64), 0..64)) {
        let bytes: Vec<u8> = runs
            .into_iter()
            .flat_map(|(byte, len)| std::iter::repeat_n(byte, len))
            .collect();
        let mut p = Packet::new();
        p.write_rle(&bytes);
        let decoded = p.read_rle().unwrap();
        prop_assert_eq!(decoded.as_slice(), bytes.as_slice());
    }

    #[test]
    fn transpose_is_an_involution(
        rows in 1usize..32,
        cols in 1usize..32,
        seed in any::<u64>(),
    ) {
        let bytes: Vec<u8> = (0..rows * cols)
            .map(|i| (seed.wrapping_mul(i as u64 + 1) >> 13) as u8)
            .collect();
        let p = Packet::from_vec(bytes);
        let round = p.clone().transpose(rows, cols).unwrap().transpose(cols, rows).unwrap();
        prop_assert_eq!(round, p);
    }
}
