//! Property tests for the content hasher (C1), `spec.md` §8 P1-P3.

use docpipe::hash::hash_bytes;
use proptest::prelude::*;

/// P1: hashing is independent of how the bytes happen to be chunked by the
/// caller — `hash_bytes` only ever sees the full buffer, but this pins down
/// that concatenating sub-slices back together reproduces the same digest
/// as hashing the original buffer directly.
proptest! {
    #[test]
    fn hash_is_independent_of_how_the_buffer_was_assembled(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..500), 0..20)
    ) {
        let whole: Vec<u8> = chunks.iter().flatten().copied().collect();
        let mut reassembled = Vec::new();
        for chunk in &chunks {
            reassembled.extend_from_slice(chunk);
        }
        prop_assert_eq!(hash_bytes(&whole).hex, hash_bytes(&reassembled).hex);
    }
}

/// P2: collision resistance over random pairs — no two distinct inputs
/// sampled here produce the same digest.
#[test]
fn no_collisions_across_a_thousand_random_pairs() {
    let mut rng_state: u64 = 0x9E3779B97F4A7C15;
    let mut next = || {
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };

    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        let len = (next() % 256) as usize + 1;
        let bytes: Vec<u8> = (0..len).map(|_| (next() % 256) as u8).collect();
        let digest = hash_bytes(&bytes).hex;
        assert!(seen.insert((bytes, digest)), "collision encountered across random sample");
    }
}

/// P3: avalanche effect — flipping a single bit changes at least 85% of
/// the output bits, averaged across a sample of inputs.
#[test]
fn single_bit_flip_changes_at_least_85_percent_of_output_bits() {
    let mut rng_state: u64 = 0xD1B54A32D192ED03;
    let mut next = || {
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };

    let mut total_ratio = 0.0;
    let samples = 200;
    for _ in 0..samples {
        let len = (next() % 128) as usize + 1;
        let mut bytes: Vec<u8> = (0..len).map(|_| (next() % 256) as u8).collect();
        let original = hash_bytes(&bytes);

        let flip_byte = (next() as usize) % bytes.len();
        let flip_bit = (next() % 8) as u8;
        bytes[flip_byte] ^= 1 << flip_bit;
        let flipped = hash_bytes(&bytes);

        let original_bytes = hex::decode(&original.hex).expect("hex decodes");
        let flipped_bytes = hex::decode(&flipped.hex).expect("hex decodes");
        let differing_bits: u32 = original_bytes
            .iter()
            .zip(flipped_bytes.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        total_ratio += differing_bits as f64 / 256.0;
    }

    let average_ratio = total_ratio / samples as f64;
    assert!(average_ratio >= 0.85, "average avalanche ratio {average_ratio} below 0.85");
}

mod hex {
    pub fn decode(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd length".to_string());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
            .collect()
    }
}
