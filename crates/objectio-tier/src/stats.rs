//! Pool fill and dirty ratios consumed by the tier agent

use objectio_common::PoolId;
use objectio_common::config::PoolTierConfig;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Fill and dirty level of a pool relative to its targets, in [0, 1+]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolRatios {
    pub full: f64,
    pub dirty: f64,
}

/// Raw pool usage summed over its placement groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub objects: u64,
    pub bytes: u64,
    pub dirty_objects: u64,
}

impl PoolUsage {
    /// Ratios against the pool's targets; `None` when no target is set
    #[must_use]
    pub fn ratios(&self, tiering: &PoolTierConfig) -> Option<PoolRatios> {
        if !tiering.has_targets() {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = |value: u64, target: u64| {
            if target == 0 {
                0.0
            } else {
                value as f64 / target as f64
            }
        };

        let avg_size = self.bytes.checked_div(self.objects).unwrap_or(0);
        let dirty_bytes = self.dirty_objects.saturating_mul(avg_size);
        Some(PoolRatios {
            full: ratio(self.bytes, tiering.target_max_bytes)
                .max(ratio(self.objects, tiering.target_max_objects)),
            dirty: ratio(dirty_bytes, tiering.target_max_bytes)
                .max(ratio(self.dirty_objects, tiering.target_max_objects)),
        })
    }
}

/// Source of per-pool ratios
pub trait PoolStatsFeed: Send + Sync {
    fn ratios(&self, pool: PoolId) -> Option<PoolRatios>;
}

/// Fixed ratios set by hand
#[derive(Debug, Default)]
pub struct StaticStatsFeed {
    ratios: Mutex<HashMap<PoolId, PoolRatios>>,
}

impl StaticStatsFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pool: PoolId, full: f64, dirty: f64) {
        self.ratios.lock().insert(pool, PoolRatios { full, dirty });
    }

    pub fn clear(&self, pool: PoolId) {
        self.ratios.lock().remove(&pool);
    }
}

impl PoolStatsFeed for StaticStatsFeed {
    fn ratios(&self, pool: PoolId) -> Option<PoolRatios> {
        self.ratios.lock().get(&pool).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios_need_targets() {
        let usage = PoolUsage {
            objects: 10,
            bytes: 1000,
            dirty_objects: 5,
        };
        assert!(usage.ratios(&PoolTierConfig::default()).is_none());

        let tiering = PoolTierConfig {
            target_max_objects: 20,
            ..Default::default()
        };
        let ratios = usage.ratios(&tiering).unwrap();
        assert!((ratios.full - 0.5).abs() < f64::EPSILON);
        assert!((ratios.dirty - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_byte_target_uses_average_object_size() {
        let usage = PoolUsage {
            objects: 4,
            bytes: 400,
            dirty_objects: 1,
        };
        let tiering = PoolTierConfig {
            target_max_bytes: 1000,
            ..Default::default()
        };
        let ratios = usage.ratios(&tiering).unwrap();
        assert!((ratios.full - 0.4).abs() < 1e-9);
        assert!((ratios.dirty - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_static_feed() {
        let feed = StaticStatsFeed::new();
        let pool = PoolId::new(3);
        assert!(feed.ratios(pool).is_none());
        feed.set(pool, 0.9, 0.1);
        assert_eq!(feed.ratios(pool).unwrap().full, 0.9);
        feed.clear(pool);
        assert!(feed.ratios(pool).is_none());
    }
}
