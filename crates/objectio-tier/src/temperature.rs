//! Age and temperature estimation from the hit set history
//!
//! `access_age` is a lower bound on the seconds since the object was last
//! seen in a sealed window. `temperature` counts how many of the most
//! recent windows saw it; it ranks objects relative to each other and is
//! not a rate.

use crate::clock::Timestamp;
use crate::hitset::SealedHitSet;
use objectio_common::HObject;
use std::sync::Arc;

/// Estimated coldness of one object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgeEstimate {
    pub access_age: u64,
    pub temperature: u32,
}

/// Estimate age and temperature of `oid` from a sealed history snapshot
///
/// `history` is oldest first. `search_last_n` bounds how many recent
/// windows count towards temperature; 0 means all of them.
#[must_use]
pub fn estimate_age(
    history: &[Arc<SealedHitSet>],
    oid: &HObject,
    now: Timestamp,
    search_last_n: u32,
) -> AgeEstimate {
    let window = if search_last_n == 0 {
        history.len()
    } else {
        search_last_n as usize
    };

    let mut estimate = AgeEstimate::default();
    let mut last_seen = None;
    for (i, set) in history.iter().rev().enumerate() {
        if !set.contains(oid) {
            continue;
        }
        if last_seen.is_none() {
            last_seen = Some(set.start());
        }
        if i < window {
            estimate.temperature += 1;
        }
    }

    let since = last_seen.or_else(|| history.first().map(|set| set.start()));
    estimate.access_age = since.map_or(0, |start| now.saturating_sub(start));
    estimate
}

/// Histogram over power-of-two buckets
///
/// Bucket 0 holds the value 0; bucket `b > 0` holds values in
/// `[2^(b-1), 2^b)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pow2Histogram {
    buckets: Vec<u64>,
}

impl Pow2Histogram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn bucket(value: u64) -> usize {
        (u64::BITS - value.leading_zeros()) as usize
    }

    pub fn add(&mut self, value: u64) {
        let b = Self::bucket(value);
        if self.buckets.len() <= b {
            self.buckets.resize(b + 1, 0);
        }
        self.buckets[b] += 1;
    }

    /// Halve every bucket so older sweeps carry less weight
    pub fn decay(&mut self) {
        for count in &mut self.buckets {
            *count /= 2;
        }
        while self.buckets.last() == Some(&0) {
            self.buckets.pop();
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    #[must_use]
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Share of samples whose bucket is at or below the bucket of `value`
    ///
    /// An empty histogram reports 1.0, so every value ranks as the oldest.
    #[must_use]
    pub fn fraction_at_or_below(&self, value: u64) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        let b = Self::bucket(value);
        let below: u64 = self.buckets.iter().take(b + 1).sum();
        below as f64 / total as f64
    }
}
