//! Overlay routing
//!
//! Decides which pool executes an operation and whether that pool applies
//! cache behaviour (promotion, whiteouts, forwarding). Per-operation flags
//! override the pool's overlay:
//!
//! - `ignore_overlay`: execute on the addressed pool even if it has a
//!   cache overlay
//! - `ignore_cache`: the cache tier serves the op as a plain pool, with no
//!   promotion or forwarding; internal copies use this to avoid recursion
//! - `skip_rw_locks`: do not take the per-object lock (reads and
//!   `try_flush` only)

use crate::osdmap::OsdMap;
use objectio_common::config::CacheMode;
use objectio_common::{Error, PoolId, Result, TierRole};

/// Per-operation override flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpFlags {
    pub ignore_overlay: bool,
    pub ignore_cache: bool,
    pub skip_rw_locks: bool,
}

impl OpFlags {
    pub const NONE: Self = Self {
        ignore_overlay: false,
        ignore_cache: false,
        skip_rw_locks: false,
    };

    /// Flags for internal copies between tiers
    pub const INTERNAL: Self = Self {
        ignore_overlay: true,
        ignore_cache: true,
        skip_rw_locks: false,
    };

    #[must_use]
    pub const fn ignore_overlay(mut self) -> Self {
        self.ignore_overlay = true;
        self
    }

    #[must_use]
    pub const fn ignore_cache(mut self) -> Self {
        self.ignore_cache = true;
        self
    }

    #[must_use]
    pub const fn skip_rw_locks(mut self) -> Self {
        self.skip_rw_locks = true;
        self
    }
}

/// Coarse class of an operation, as far as routing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Read,
    Write,
    /// Blocking cache flush
    Flush,
    /// Non-blocking flush or evict
    CacheTry,
}

/// Where an operation executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub pool: PoolId,
    pub role: TierRole,
    /// Cache behaviour applied by the target pool
    pub cache_mode: CacheMode,
}

impl Route {
    /// Whether the target pool promotes or forwards misses
    #[must_use]
    pub const fn applies_cache(&self) -> bool {
        !matches!(self.cache_mode, CacheMode::None)
    }
}

/// Stateless router over the current pool map
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayRouter;

impl OverlayRouter {
    /// Route an operation addressed to `pool`
    pub fn route(map: &OsdMap, pool: PoolId, class: OpClass, flags: OpFlags) -> Result<Route> {
        if flags.skip_rw_locks && matches!(class, OpClass::Write | OpClass::Flush) {
            return Err(Error::configuration(
                "skip_rw_locks is only valid for reads and non-blocking cache ops",
            ));
        }

        let addressed = map.require(pool)?;
        let redirect = match class {
            OpClass::Read => addressed.read_tier,
            OpClass::Write | OpClass::Flush | OpClass::CacheTry => addressed.write_tier,
        };
        let target = match redirect {
            Some(tier) if !flags.ignore_overlay => map.require(tier)?,
            _ => addressed,
        };

        if matches!(class, OpClass::Flush | OpClass::CacheTry) && !target.is_tier() {
            return Err(Error::configuration(format!(
                "pool {} is not a cache tier",
                target.name
            )));
        }

        let (role, cache_mode) = if target.is_tier() {
            let mode = if flags.ignore_cache {
                CacheMode::None
            } else {
                target.cache_mode
            };
            (TierRole::Cache, mode)
        } else {
            (TierRole::Base, CacheMode::None)
        };

        Ok(Route {
            pool: target.id,
            role,
            cache_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectio_common::config::PoolConfig;

    fn tiered() -> (OsdMap, PoolId, PoolId) {
        let mut map = OsdMap::new();
        let base = map
            .create_pool(&PoolConfig {
                name: "base".into(),
                ..Default::default()
            })
            .unwrap();
        let cache = map
            .create_pool(&PoolConfig {
                name: "cache".into(),
                ..Default::default()
            })
            .unwrap();
        map.tier_add(base, cache).unwrap();
        map.set_overlay(base, cache).unwrap();
        map.set_cache_mode(cache, CacheMode::Writeback).unwrap();
        (map, base, cache)
    }

    #[test]
    fn test_overlay_redirects_to_cache() {
        let (map, base, cache) = tiered();
        let route = OverlayRouter::route(&map, base, OpClass::Read, OpFlags::NONE).unwrap();
        assert_eq!(route.pool, cache);
        assert_eq!(route.role, TierRole::Cache);
        assert!(route.applies_cache());

        let route = OverlayRouter::route(&map, base, OpClass::Write, OpFlags::NONE).unwrap();
        assert_eq!(route.pool, cache);
    }

    #[test]
    fn test_ignore_overlay_and_cache() {
        let (map, base, cache) = tiered();
        let flags = OpFlags::NONE.ignore_overlay();
        let route = OverlayRouter::route(&map, base, OpClass::Read, flags).unwrap();
        assert_eq!(route.pool, base);
        assert_eq!(route.role, TierRole::Base);

        let route =
            OverlayRouter::route(&map, base, OpClass::Read, OpFlags::NONE.ignore_cache()).unwrap();
        assert_eq!(route.pool, cache);
        assert!(!route.applies_cache());

        let route = OverlayRouter::route(&map, cache, OpClass::Read, OpFlags::INTERNAL).unwrap();
        assert_eq!(route.pool, cache);
        assert!(!route.applies_cache());
    }

    #[test]
    fn test_cache_ops_need_a_tier() {
        let (mut map, base, cache) = tiered();
        assert_eq!(
            OverlayRouter::route(&map, base, OpClass::Flush, OpFlags::NONE)
                .unwrap()
                .pool,
            cache
        );
        let flags = OpFlags::NONE.ignore_overlay();
        assert!(OverlayRouter::route(&map, base, OpClass::CacheTry, flags).is_err());

        map.remove_overlay(base).unwrap();
        assert!(OverlayRouter::route(&map, base, OpClass::Flush, OpFlags::NONE).is_err());
    }

    #[test]
    fn test_malformed_flags_and_missing_pool() {
        let (map, _, cache) = tiered();
        let skip = OpFlags::NONE.skip_rw_locks();
        assert!(OverlayRouter::route(&map, cache, OpClass::Read, skip).is_ok());
        assert!(OverlayRouter::route(&map, cache, OpClass::CacheTry, skip).is_ok());
        assert!(matches!(
            OverlayRouter::route(&map, cache, OpClass::Write, skip),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            OverlayRouter::route(&map, cache, OpClass::Flush, skip),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            OverlayRouter::route(&map, PoolId::new(42), OpClass::Read, OpFlags::NONE),
            Err(Error::Configuration(_))
        ));
    }
}
