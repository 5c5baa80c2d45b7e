#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property tests for the block-stream codecs.

use coffre_kdbx::blocks::{
    read_hashed_blocks, read_hmac_blocks, write_hashed_blocks, write_hmac_blocks,
};
use coffre_kdbx::{Progress, SecretBytes};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn v3_split_join_is_identity(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let start = vec![0x55u8; 32];
        let body = write_hashed_blocks(&data, &start, &Progress::new(100))
            .expect("write should succeed");
        let back = read_hashed_blocks(&body, &start, &Progress::new(100))
            .expect("read should succeed");
        prop_assert_eq!(back, data);
    }

    #[test]
    fn v4_split_join_is_identity(
        data in proptest::collection::vec(any::<u8>(), 0..8192),
        key in any::<[u8; 64]>(),
    ) {
        let key = SecretBytes::new(key);
        let body = write_hmac_blocks(&data, &key, &Progress::new(100))
            .expect("write should succeed");
        let back = read_hmac_blocks(&body, &key, &Progress::new(100))
            .expect("read should succeed");
        prop_assert_eq!(back, data);
    }

    #[test]
    fn v4_single_bit_flip_never_survives(
        data in proptest::collection::vec(any::<u8>(), 64..512),
        flip_at in any::<prop::sample::Index>(),
    ) {
        let key = SecretBytes::new([0x42u8; 64]);
        let mut body = write_hmac_blocks(&data, &key, &Progress::new(100))
            .expect("write should succeed");
        let index = flip_at.index(body.len());
        body[index] ^= 0x01;
        prop_assert!(read_hmac_blocks(&body, &key, &Progress::new(100)).is_err());
    }

    #[test]
    fn v3_truncation_never_survives(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        keep_fraction in 0.0f64..1.0,
    ) {
        let start = vec![0x55u8; 32];
        let body = write_hashed_blocks(&data, &start, &Progress::new(100))
            .expect("write should succeed");
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let keep = ((body.len() - 1) as f64 * keep_fraction) as usize;
        prop_assert!(read_hashed_blocks(&body[..keep], &start, &Progress::new(100)).is_err());
    }
}
