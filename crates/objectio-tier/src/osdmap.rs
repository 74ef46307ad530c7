//! Pool map
//!
//! The [`OsdMap`] is an immutable snapshot of every pool and the tier
//! relationships between them. The cluster publishes a new snapshot (with
//! a higher epoch) for each change; placement groups and the router read
//! whichever snapshot is current when an operation starts.

use objectio_common::config::{BackendKind, CacheMode, PoolConfig, PoolTierConfig};
use objectio_common::{Error, HObject, PgId, PoolId, Result, SnapContext, SnapId};
use std::collections::{BTreeMap, BTreeSet};

/// One pool and its tiering relationships
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub id: PoolId,
    pub name: String,
    pub pg_num: u32,
    pub size: usize,
    pub backend: BackendKind,
    pub tiering: PoolTierConfig,
    /// Cache pools attached to this (base) pool
    pub tiers: BTreeSet<PoolId>,
    /// Base pool this cache pool is attached to
    pub tier_of: Option<PoolId>,
    /// Pool reads are redirected to
    pub read_tier: Option<PoolId>,
    /// Pool writes are redirected to
    pub write_tier: Option<PoolId>,
    pub cache_mode: CacheMode,
    /// Newest self-managed snapshot id
    pub snap_seq: SnapId,
    /// Live self-managed snapshots, newest first
    pub snaps: Vec<SnapId>,
}

impl PoolInfo {
    fn from_config(id: PoolId, config: &PoolConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            pg_num: config.pg_num,
            size: config.size,
            backend: config.backend,
            tiering: config.tiering.clone(),
            tiers: BTreeSet::new(),
            tier_of: None,
            read_tier: None,
            write_tier: None,
            cache_mode: CacheMode::None,
            snap_seq: SnapId::default(),
            snaps: Vec::new(),
        }
    }

    /// Whether this pool is attached as a cache tier
    #[must_use]
    pub const fn is_tier(&self) -> bool {
        self.tier_of.is_some()
    }

    /// Whether this pool redirects operations to a cache tier
    #[must_use]
    pub const fn has_overlay(&self) -> bool {
        self.read_tier.is_some() || self.write_tier.is_some()
    }

    /// Placement group holding `oid`
    #[must_use]
    pub fn pg_of(&self, oid: &HObject) -> PgId {
        PgId::new(self.id, oid.pg_seed(self.pg_num))
    }

    /// All placement groups of the pool
    pub fn pgs(&self) -> impl Iterator<Item = PgId> + '_ {
        (0..self.pg_num).map(|seed| PgId::new(self.id, seed))
    }

    /// Whether a tier agent has any work to do for this pool
    #[must_use]
    pub const fn agent_eligible(&self) -> bool {
        let caching = self.is_tier() && !matches!(self.cache_mode, CacheMode::None);
        caching || self.tiering.hit_set.enabled()
    }
}

/// Snapshot of all pools
#[derive(Debug, Clone, Default)]
pub struct OsdMap {
    epoch: u64,
    pools: BTreeMap<PoolId, PoolInfo>,
    names: BTreeMap<String, PoolId>,
    next_pool_id: u64,
}

impl OsdMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: 1,
            next_pool_id: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) const fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    #[must_use]
    pub fn pool(&self, id: PoolId) -> Option<&PoolInfo> {
        self.pools.get(&id)
    }

    /// Pool by id, or a configuration error naming it
    pub fn require(&self, id: PoolId) -> Result<&PoolInfo> {
        self.pools
            .get(&id)
            .ok_or_else(|| Error::configuration(format!("pool {id} does not exist")))
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<PoolId> {
        self.names.get(name).copied()
    }

    pub fn require_name(&self, name: &str) -> Result<PoolId> {
        self.lookup(name)
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    pub fn pools(&self) -> impl Iterator<Item = &PoolInfo> {
        self.pools.values()
    }

    fn pool_mut(&mut self, id: PoolId) -> Result<&mut PoolInfo> {
        self.pools
            .get_mut(&id)
            .ok_or_else(|| Error::configuration(format!("pool {id} does not exist")))
    }

    /// Snapshot context for writes to `pool`; cache tiers share their base's
    #[must_use]
    pub fn snap_context(&self, pool: PoolId) -> SnapContext {
        let owner = self
            .pool(pool)
            .and_then(|p| p.tier_of)
            .unwrap_or(pool);
        self.pool(owner)
            .map(|p| SnapContext::new(p.snap_seq, p.snaps.clone()))
            .unwrap_or_default()
    }

    pub fn create_pool(&mut self, config: &PoolConfig) -> Result<PoolId> {
        config.validate()?;
        if self.names.contains_key(&config.name) {
            return Err(Error::configuration(format!(
                "pool {} already exists",
                config.name
            )));
        }
        let id = PoolId::new(self.next_pool_id);
        self.next_pool_id += 1;
        self.pools.insert(id, PoolInfo::from_config(id, config));
        self.names.insert(config.name.clone(), id);
        Ok(id)
    }

    pub fn delete_pool(&mut self, id: PoolId) -> Result<PoolInfo> {
        let pool = self.require(id)?;
        if !pool.tiers.is_empty() || pool.is_tier() {
            return Err(Error::configuration(format!(
                "pool {} is part of a tier relationship",
                pool.name
            )));
        }
        let pool = self
            .pools
            .remove(&id)
            .ok_or_else(|| Error::inconsistency("pool vanished"))?;
        self.names.remove(&pool.name);
        Ok(pool)
    }

    /// Attach `cache` as a tier of `base`
    pub fn tier_add(&mut self, base: PoolId, cache: PoolId) -> Result<()> {
        if base == cache {
            return Err(Error::configuration("a pool cannot be a tier of itself"));
        }
        let b = self.require(base)?;
        let c = self.require(cache)?;
        if c.is_tier() {
            return Err(Error::configuration(format!(
                "pool {} is already a tier",
                c.name
            )));
        }
        if b.is_tier() || !c.tiers.is_empty() {
            return Err(Error::configuration("tiers cannot be chained"));
        }
        if c.backend == BackendKind::ErasureCoded {
            return Err(Error::configuration(format!(
                "erasure-coded pool {} cannot be a cache tier",
                c.name
            )));
        }

        self.pool_mut(base)?.tiers.insert(cache);
        let c = self.pool_mut(cache)?;
        c.tier_of = Some(base);
        Ok(())
    }

    /// Detach `cache` from `base`
    pub fn tier_remove(&mut self, base: PoolId, cache: PoolId) -> Result<()> {
        let b = self.require(base)?;
        if !b.tiers.contains(&cache) {
            return Err(Error::configuration(format!(
                "pool {cache} is not a tier of {base}"
            )));
        }
        if b.read_tier == Some(cache) || b.write_tier == Some(cache) {
            return Err(Error::configuration(
                "tier is still the overlay; remove the overlay first",
            ));
        }
        self.pool_mut(base)?.tiers.remove(&cache);
        let c = self.pool_mut(cache)?;
        c.tier_of = None;
        c.cache_mode = CacheMode::None;
        Ok(())
    }

    /// Redirect operations on `base` to `cache`
    pub fn set_overlay(&mut self, base: PoolId, cache: PoolId) -> Result<()> {
        let b = self.require(base)?;
        if !b.tiers.contains(&cache) {
            return Err(Error::configuration(format!(
                "pool {cache} is not a tier of {base}"
            )));
        }
        if b.has_overlay() && b.read_tier != Some(cache) {
            return Err(Error::configuration(format!(
                "pool {base} already has an overlay"
            )));
        }
        let b = self.pool_mut(base)?;
        b.read_tier = Some(cache);
        b.write_tier = Some(cache);
        Ok(())
    }

    pub fn remove_overlay(&mut self, base: PoolId) -> Result<()> {
        let b = self.pool_mut(base)?;
        if !b.has_overlay() {
            return Err(Error::configuration(format!(
                "pool {base} has no overlay"
            )));
        }
        b.read_tier = None;
        b.write_tier = None;
        Ok(())
    }

    pub fn set_cache_mode(&mut self, cache: PoolId, mode: CacheMode) -> Result<()> {
        let c = self.pool_mut(cache)?;
        if !c.is_tier() {
            return Err(Error::configuration(format!(
                "pool {} is not a cache tier",
                c.name
            )));
        }
        c.cache_mode = mode;
        Ok(())
    }

    pub fn set_tiering(&mut self, pool: PoolId, tiering: PoolTierConfig) -> Result<()> {
        tiering.validate()?;
        self.pool_mut(pool)?.tiering = tiering;
        Ok(())
    }

    /// Allocate a self-managed snapshot id; cache tiers allocate on the base
    pub fn allocate_snap(&mut self, pool: PoolId) -> Result<SnapId> {
        let owner = self.require(pool)?.tier_of.unwrap_or(pool);
        let p = self.pool_mut(owner)?;
        let snap = SnapId::new(p.snap_seq.as_u64() + 1);
        p.snap_seq = snap;
        p.snaps.insert(0, snap);
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, backend: BackendKind) -> PoolConfig {
        PoolConfig {
            name: name.into(),
            pg_num: 4,
            backend,
            ..Default::default()
        }
    }

    fn setup() -> (OsdMap, PoolId, PoolId) {
        let mut map = OsdMap::new();
        let base = map.create_pool(&pool("base", BackendKind::Replicated)).unwrap();
        let cache = map.create_pool(&pool("cache", BackendKind::Replicated)).unwrap();
        (map, base, cache)
    }

    #[test]
    fn test_create_and_lookup() {
        let (mut map, base, _) = setup();
        assert_eq!(map.lookup("base"), Some(base));
        assert!(map.create_pool(&pool("base", BackendKind::Replicated)).is_err());
        assert!(map.require_name("nope").unwrap_err().is_not_found());
        assert_eq!(map.require(base).unwrap().pgs().count(), 4);
    }

    #[test]
    fn test_tier_lifecycle() {
        let (mut map, base, cache) = setup();
        assert!(map.set_overlay(base, cache).is_err());
        assert!(map.set_cache_mode(cache, CacheMode::Writeback).is_err());

        map.tier_add(base, cache).unwrap();
        map.set_overlay(base, cache).unwrap();
        map.set_cache_mode(cache, CacheMode::Writeback).unwrap();
        assert!(map.pool(base).unwrap().has_overlay());
        assert!(map.pool(cache).unwrap().agent_eligible());

        assert!(map.tier_remove(base, cache).is_err());
        assert!(map.delete_pool(cache).is_err());
        map.remove_overlay(base).unwrap();
        assert!(map.remove_overlay(base).is_err());
        map.tier_remove(base, cache).unwrap();
        assert!(!map.pool(cache).unwrap().is_tier());
        map.delete_pool(cache).unwrap();
        assert!(map.lookup("cache").is_none());
    }

    #[test]
    fn test_invalid_tier_combinations() {
        let (mut map, base, cache) = setup();
        let ec = map.create_pool(&pool("ec", BackendKind::ErasureCoded)).unwrap();
        let other = map.create_pool(&pool("other", BackendKind::Replicated)).unwrap();

        assert!(matches!(map.tier_add(base, base), Err(Error::Configuration(_))));
        assert!(matches!(map.tier_add(base, ec), Err(Error::Configuration(_))));
        // An erasure-coded pool is fine as a base
        map.tier_add(ec, other).unwrap();

        map.tier_add(base, cache).unwrap();
        assert!(map.tier_add(cache, PoolId::new(99)).is_err());
        assert!(map.tier_add(ec, cache).is_err());
    }

    #[test]
    fn test_snapshots_follow_base() {
        let (mut map, base, cache) = setup();
        map.tier_add(base, cache).unwrap();
        let s1 = map.allocate_snap(base).unwrap();
        let s2 = map.allocate_snap(cache).unwrap();
        assert!(s2 > s1);
        let snapc = map.snap_context(cache);
        assert_eq!(snapc.seq, s2);
        assert_eq!(snapc.snaps, vec![s2, s1]);
        assert!(snapc.is_valid());
    }
}
