//! Bloom filter backing for hit sets
//!
//! Sized from an expected insertion count and a target false positive
//! probability. Probe positions use double hashing over two xxh64 digests.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

const SEED_A: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_B: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Fixed-size Bloom filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: u64,
}

impl BloomFilter {
    /// Filter sized for `expected` insertions at false positive rate `fpp`
    #[must_use]
    pub fn with_rate(expected: u64, fpp: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = fpp.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0);
        let k = ((m / n) * ln2).round().clamp(1.0, 32.0);

        let num_bits = m as u64;
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes: k as u32,
            inserted: 0,
        }
    }

    fn probes(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh64(key, SEED_A);
        let h2 = xxh64(key, SEED_B) | 1;
        (0..u64::from(self.num_hashes))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<u64> = self.probes(key).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.inserted += 1;
    }

    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.probes(key)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Number of insert calls (duplicates included)
    #[must_use]
    pub const fn inserted(&self) -> u64 {
        self.inserted
    }

    #[must_use]
    pub const fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub const fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Raw bit array
    #[must_use]
    pub fn bits(&self) -> &[u64] {
        &self.bits
    }
}
