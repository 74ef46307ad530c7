//! Configuration types for ObjectIO
//!
//! This module defines configuration structures for pools, cache tiering
//! and the background tier agent. Every struct deserializes from a partial
//! document, falling back to the `Default` impl for missing fields.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Root configuration for an ObjectIO storage node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Tier agent configuration
    pub agent: AgentConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Pools created at startup
    pub pools: Vec<PoolConfig>,
    /// Cache tier relationships established at startup
    pub tiers: Vec<TierConfig>,
}

impl Config {
    /// Validate the whole tree
    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        for pool in &self.pools {
            pool.validate()?;
        }
        for tier in &self.tiers {
            let known = |name: &str| self.pools.iter().any(|p| p.name == name);
            if !known(&tier.base) || !known(&tier.cache) {
                return Err(Error::configuration(format!(
                    "tier {} -> {} references an unknown pool",
                    tier.cache, tier.base
                )));
            }
        }
        Ok(())
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "objectio-osd".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Tier agent pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Run agents at all
    pub enabled: bool,
    /// Interval between agent passes (milliseconds)
    pub interval_ms: u64,
    /// Objects sampled per pass
    pub batch_size: usize,
    /// Maximum try-flush calls issued per pass
    pub max_flush_ops: usize,
    /// Maximum evict calls issued per pass
    pub max_evict_ops: usize,
    /// Capacity of the recently-clean candidate list
    pub recent_clean_max: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            batch_size: 64,
            max_flush_ops: 8,
            max_evict_ops: 16,
            recent_clean_max: 32,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::configuration("agent interval_ms must be positive"));
        }
        if self.batch_size == 0 {
            return Err(Error::configuration("agent batch_size must be positive"));
        }
        Ok(())
    }
}

/// Storage backend flavour of a pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Full copies on every replica
    #[default]
    Replicated,
    /// Whole-object writes only; cannot serve as a cache tier
    ErasureCoded,
}

/// A pool created at startup
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name
    pub name: String,
    /// Number of placement groups
    pub pg_num: u32,
    /// Number of copies (replicated pools)
    pub size: usize,
    /// Backend flavour
    pub backend: BackendKind,
    /// Tiering parameters (meaningful on cache pools)
    pub tiering: PoolTierConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            pg_num: 8,
            size: 1,
            backend: BackendKind::Replicated,
            tiering: PoolTierConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("pool name must not be empty"));
        }
        if self.pg_num == 0 {
            return Err(Error::configuration(format!(
                "pool {}: pg_num must be positive",
                self.name
            )));
        }
        if self.size == 0 {
            return Err(Error::configuration(format!(
                "pool {}: size must be positive",
                self.name
            )));
        }
        self.tiering.validate()
    }
}

/// Cache-tier flush/evict targets and hit set parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolTierConfig {
    /// Hit set tracking
    pub hit_set: HitSetParams,
    /// Byte capacity the fill ratios are measured against (0 = unlimited)
    pub target_max_bytes: u64,
    /// Object capacity the fill ratios are measured against (0 = unlimited)
    pub target_max_objects: u64,
    /// Dirty ratio at which flushing starts
    pub dirty_ratio_low: f64,
    /// Dirty ratio at which flushing runs at full rate
    pub dirty_ratio_high: f64,
    /// Full ratio at which eviction of cold objects starts
    pub full_ratio_low: f64,
    /// Full ratio at which eviction becomes unconditional
    pub full_ratio_high: f64,
}

impl Default for PoolTierConfig {
    fn default() -> Self {
        Self {
            hit_set: HitSetParams::default(),
            target_max_bytes: 0,
            target_max_objects: 0,
            dirty_ratio_low: 0.4,
            dirty_ratio_high: 0.6,
            full_ratio_low: 0.6,
            full_ratio_high: 0.8,
        }
    }
}

impl PoolTierConfig {
    pub fn validate(&self) -> Result<()> {
        check_watermarks("dirty", self.dirty_ratio_low, self.dirty_ratio_high)?;
        check_watermarks("full", self.full_ratio_low, self.full_ratio_high)?;
        self.hit_set.validate()
    }

    /// Whether any tiering pressure can ever be computed for this pool
    #[must_use]
    pub const fn has_targets(&self) -> bool {
        self.target_max_bytes > 0 || self.target_max_objects > 0
    }
}

fn check_watermarks(what: &str, low: f64, high: f64) -> Result<()> {
    let in_range = |v: f64| (0.0..=1.0).contains(&v);
    if !in_range(low) || !in_range(high) {
        return Err(Error::configuration(format!(
            "{what} watermarks must be within [0, 1]: low={low} high={high}"
        )));
    }
    if low > high {
        return Err(Error::configuration(format!(
            "{what} low watermark {low} exceeds high watermark {high}"
        )));
    }
    Ok(())
}

/// Backing representation for hit sets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSetKind {
    /// Hit sets disabled
    #[default]
    None,
    /// Exact set of object identities
    ExplicitObject,
    /// Exact set of 32-bit object hashes
    ExplicitHash,
    /// Bloom filter sized for `target_size` entries at `fpp`
    Bloom,
}

/// Pool-level hit set parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitSetParams {
    /// Representation
    pub kind: HitSetKind,
    /// Number of sealed hit sets retained
    pub count: u32,
    /// Window length (seconds)
    pub period_secs: u64,
    /// Bloom false positive probability
    pub fpp: f64,
    /// Expected insertions per window (bloom sizing)
    pub target_size: u64,
    /// Number of most recent sealed sets counted towards temperature
    pub search_last_n: u32,
}

impl Default for HitSetParams {
    fn default() -> Self {
        Self {
            kind: HitSetKind::None,
            count: 0,
            period_secs: 0,
            fpp: 0.05,
            target_size: 1000,
            search_last_n: 0,
        }
    }
}

impl HitSetParams {
    #[must_use]
    pub const fn enabled(&self) -> bool {
        !matches!(self.kind, HitSetKind::None) && self.count > 0
    }

    pub fn validate(&self) -> Result<()> {
        if matches!(self.kind, HitSetKind::None) {
            return Ok(());
        }
        if self.period_secs == 0 {
            return Err(Error::configuration("hit_set period must be positive"));
        }
        if matches!(self.kind, HitSetKind::Bloom) {
            if !(self.fpp > 0.0 && self.fpp < 1.0) {
                return Err(Error::configuration(format!(
                    "hit_set fpp must be within (0, 1): {}",
                    self.fpp
                )));
            }
            if self.target_size == 0 {
                return Err(Error::configuration("hit_set target_size must be positive"));
            }
        }
        Ok(())
    }
}

/// Cache mode of a cache-tier pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Pass-through; no promotion
    #[default]
    None,
    /// Promote on miss, absorb writes, flush later
    Writeback,
    /// Serve resident objects, forward misses to the base pool
    Forward,
}

/// A cache tier relationship established at startup
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Base (backing) pool name
    pub base: String,
    /// Cache pool name
    pub cache: String,
    /// Cache mode to apply
    #[serde(default = "default_cache_mode")]
    pub mode: CacheMode,
    /// Also install the cache as the base pool's overlay
    #[serde(default = "default_overlay")]
    pub overlay: bool,
}

const fn default_cache_mode() -> CacheMode {
    CacheMode::Writeback
}

const fn default_overlay() -> bool {
    true
}
