//! Tier agent
//!
//! One agent runs per cache-tier placement group. Each pass it:
//!
//! 1. rotates the hit set archive (the agent is its only writer)
//! 2. derives flush and evict modes from the pool's dirty and full ratios
//! 3. samples a batch of objects from a resumable cursor and records their
//!    estimated access ages in a histogram
//! 4. try-flushes dirty objects and evicts clean ones, oldest first
//!
//! The agent never blocks foreground writes: it only uses `try_flush` and
//! `evict`, and skips any candidate that reports `Busy`.

use crate::pg::{PlacementGroup, TierCounters};
use crate::stats::{PoolRatios, PoolStatsFeed};
use crate::temperature::{AgeEstimate, Pow2Histogram, estimate_age};
use derive_more::Display;
use objectio_common::config::{AgentConfig, PoolTierConfig};
use objectio_common::{HObject, PgId, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Whether the agent flushes dirty objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum FlushMode {
    #[default]
    #[display("idle")]
    Idle,
    #[display("active")]
    Active,
}

/// How aggressively the agent evicts clean objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum EvictMode {
    #[default]
    #[display("idle")]
    Idle,
    /// Evict the coldest fraction only
    #[display("some")]
    Some,
    /// Evict oldest first regardless of temperature
    #[display("full")]
    Full,
}

/// Flush mode for a dirty ratio
#[must_use]
pub fn flush_mode(dirty: f64, tiering: &PoolTierConfig) -> FlushMode {
    if dirty < tiering.dirty_ratio_low {
        FlushMode::Idle
    } else {
        FlushMode::Active
    }
}

/// Evict mode and effort in [0, 1] for a full ratio
#[must_use]
pub fn evict_mode(full: f64, tiering: &PoolTierConfig) -> (EvictMode, f64) {
    let (low, high) = (tiering.full_ratio_low, tiering.full_ratio_high);
    if full < low {
        (EvictMode::Idle, 0.0)
    } else if full < high {
        let effort = if high > low {
            ((full - low) / (high - low)).clamp(0.0, 1.0)
        } else {
            1.0
        };
        (EvictMode::Some, effort)
    } else {
        (EvictMode::Full, 1.0)
    }
}

/// State owned by one agent
#[derive(Debug, Clone, Default)]
pub struct TierAgentState {
    /// Resume point of the sweep; `None` restarts from the beginning
    pub position: Option<HObject>,
    pub age_histogram: Pow2Histogram,
    /// Objects recently seen or made clean, tried first for eviction
    pub recent_clean: VecDeque<HObject>,
    pub flush_mode: FlushMode,
    pub evict_mode: EvictMode,
    pub evict_effort: f64,
}

impl TierAgentState {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.flush_mode == FlushMode::Idle && self.evict_mode == EvictMode::Idle
    }
}

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub scanned: usize,
    pub flushed: usize,
    pub evicted: usize,
    /// The sweep reached the end and restarts next pass
    pub wrapped: bool,
}

/// Read-only view of an agent published after every pass
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub pgid: PgId,
    pub flush_mode: FlushMode,
    pub evict_mode: EvictMode,
    pub evict_effort: f64,
    pub position: Option<HObject>,
    pub histogram: Vec<u64>,
    pub passes: u64,
    pub last_pass: PassReport,
    pub counters: TierCounters,
}

/// Background flush/evict driver for one placement group
pub struct TierAgent {
    pg: Arc<PlacementGroup>,
    config: AgentConfig,
    feed: Arc<dyn PoolStatsFeed>,
    state: TierAgentState,
    passes: u64,
    status: watch::Sender<AgentStatus>,
}

impl TierAgent {
    pub fn new(pg: Arc<PlacementGroup>, config: AgentConfig, feed: Arc<dyn PoolStatsFeed>) -> Self {
        let status = watch::Sender::new(AgentStatus {
            pgid: pg.pgid(),
            flush_mode: FlushMode::Idle,
            evict_mode: EvictMode::Idle,
            evict_effort: 0.0,
            position: None,
            histogram: Vec::new(),
            passes: 0,
            last_pass: PassReport::default(),
            counters: pg.stats().counters(),
        });
        Self {
            pg,
            config,
            feed,
            state: TierAgentState::default(),
            passes: 0,
            status,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub const fn state(&self) -> &TierAgentState {
        &self.state
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    fn ratios(&self) -> Option<PoolRatios> {
        let map = self.pg.osdmap();
        let pool = map.pool(self.pg.pgid().pool)?;
        if !pool.is_tier() {
            return None;
        }
        self.feed.ratios(pool.id)
    }

    fn update_modes(&mut self, ratios: Option<PoolRatios>, tiering: &PoolTierConfig) {
        let ratios = ratios.unwrap_or_default();
        let flush = flush_mode(ratios.dirty, tiering);
        let (evict, effort) = evict_mode(ratios.full, tiering);

        if flush != self.state.flush_mode {
            info!(
                "pg {}: flush mode {} -> {flush} (dirty ratio {:.3})",
                self.pg.pgid(),
                self.state.flush_mode,
                ratios.dirty
            );
        }
        if evict != self.state.evict_mode {
            info!(
                "pg {}: evict mode {} -> {evict} (full ratio {:.3})",
                self.pg.pgid(),
                self.state.evict_mode,
                ratios.full
            );
        }
        self.state.flush_mode = flush;
        self.state.evict_mode = evict;
        self.state.evict_effort = effort;
    }

    fn remember_clean(&mut self, oid: HObject) {
        if self.config.recent_clean_max == 0 || self.state.recent_clean.contains(&oid) {
            return;
        }
        while self.state.recent_clean.len() >= self.config.recent_clean_max {
            self.state.recent_clean.pop_front();
        }
        self.state.recent_clean.push_back(oid);
    }

    /// Whether eviction should go on at the current full ratio
    fn eviction_pending(&self, tiering: &PoolTierConfig) -> bool {
        let full = self.ratios().unwrap_or_default().full;
        match self.state.evict_mode {
            EvictMode::Idle => false,
            EvictMode::Some => full >= tiering.full_ratio_low,
            EvictMode::Full => full >= tiering.full_ratio_high,
        }
    }

    /// Whether an object is cold enough to evict in the current mode
    fn is_cold(&self, estimate: AgeEstimate) -> bool {
        match self.state.evict_mode {
            EvictMode::Idle => false,
            EvictMode::Full => true,
            EvictMode::Some => {
                estimate.temperature == 0
                    && self.state.age_histogram.fraction_at_or_below(estimate.access_age)
                        >= 1.0 - self.state.evict_effort
            }
        }
    }

    /// Run one pass
    pub async fn tick(&mut self) -> Result<PassReport> {
        let mut report = PassReport::default();
        let pgid = self.pg.pgid();

        if let Some(rotation) = self.pg.hit_set_rotate().await? {
            info!(
                "pg {pgid}: sealed hit set [{}, {}), trimmed {}",
                rotation.sealed.start(),
                rotation.sealed.end(),
                rotation.trimmed.len()
            );
        }

        let map = self.pg.osdmap();
        let Some(pool) = map.pool(pgid.pool) else {
            return Ok(report);
        };
        let tiering = pool.tiering.clone();
        self.update_modes(self.ratios(), &tiering);
        if self.state.is_idle() {
            self.publish(report);
            return Ok(report);
        }

        // Sample the next batch and age it against the hit set history
        let batch = self
            .pg
            .agent_scan(self.state.position.as_ref(), self.config.batch_size)
            .await?;
        report.scanned = batch.objects.len();
        report.wrapped = batch.complete;
        self.state.position = if batch.complete { None } else { batch.last };
        if batch.complete {
            self.state.age_histogram.decay();
        }

        let history = self.pg.hit_sets().snapshot();
        let now = self.pg.now();
        let search = tiering.hit_set.search_last_n;
        let mut dirty = Vec::new();
        let mut clean = Vec::new();
        for (oid, state) in batch.objects {
            let estimate = estimate_age(&history, &oid, now, search);
            self.state.age_histogram.add(estimate.access_age);
            if state.dirty {
                dirty.push((oid, estimate));
            } else if state.is_evictable() {
                clean.push((oid, estimate));
            }
        }
        dirty.sort_by(|a, b| b.1.access_age.cmp(&a.1.access_age));
        clean.sort_by(|a, b| b.1.access_age.cmp(&a.1.access_age));

        if self.state.flush_mode == FlushMode::Active {
            let dirty_ratio = self.ratios().unwrap_or_default().dirty;
            let quota = if dirty_ratio >= tiering.dirty_ratio_high {
                self.config.max_flush_ops
            } else {
                (self.config.max_flush_ops / 2).max(1)
            };
            for (oid, _) in dirty.into_iter().take(quota) {
                match self.pg.cache_try_flush(&oid, false).await {
                    Ok(_) => {
                        report.flushed += 1;
                        self.remember_clean(oid);
                    }
                    Err(e) if e.is_retryable() || e.is_not_found() => {
                        debug!("pg {pgid}: agent skipped flush of {oid}: {e}");
                    }
                    Err(e) => warn!("pg {pgid}: agent flush of {oid} failed: {e}"),
                }
            }
        }

        let mut leftover = Vec::new();
        if self.state.evict_mode != EvictMode::Idle {
            let mut candidates: Vec<(HObject, AgeEstimate)> = self
                .state
                .recent_clean
                .drain(..)
                .map(|oid| {
                    let estimate = estimate_age(&history, &oid, now, search);
                    (oid, estimate)
                })
                .collect();
            for entry in clean {
                if !candidates.iter().any(|(oid, _)| *oid == entry.0) {
                    candidates.push(entry);
                }
            }

            for (oid, estimate) in candidates {
                if report.evicted >= self.config.max_evict_ops || !self.eviction_pending(&tiering) {
                    leftover.push(oid);
                    continue;
                }
                if !self.is_cold(estimate) {
                    leftover.push(oid);
                    continue;
                }
                match self.pg.cache_evict(&oid).await {
                    Ok(_) => report.evicted += 1,
                    Err(e) if e.is_retryable() || e.is_not_found() => {
                        debug!("pg {pgid}: agent skipped evict of {oid}: {e}");
                    }
                    Err(e) => warn!("pg {pgid}: agent evict of {oid} failed: {e}"),
                }
            }
        } else {
            leftover.extend(clean.into_iter().map(|(oid, _)| oid));
        }
        for oid in leftover {
            self.remember_clean(oid);
        }

        if report.flushed > 0 || report.evicted > 0 {
            debug!(
                "pg {pgid}: agent pass flushed {} evicted {} of {} sampled",
                report.flushed, report.evicted, report.scanned
            );
        }
        self.publish(report);
        Ok(report)
    }

    fn publish(&mut self, report: PassReport) {
        self.passes += 1;
        self.status.send_replace(AgentStatus {
            pgid: self.pg.pgid(),
            flush_mode: self.state.flush_mode,
            evict_mode: self.state.evict_mode,
            evict_effort: self.state.evict_effort,
            position: self.state.position.clone(),
            histogram: self.state.age_histogram.buckets().to_vec(),
            passes: self.passes,
            last_pass: report,
            counters: self.pg.stats().counters(),
        });
    }

    /// Run passes every `interval_ms` until shutdown or the pool stops
    /// needing an agent
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let pgid = self.pg.pgid();
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("pg {pgid}: tier agent started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.pg.agent_eligible() {
                        info!("pg {pgid}: pool no longer needs a tier agent");
                        break;
                    }
                    if let Err(e) = self.tick().await {
                        warn!("pg {pgid}: tier agent pass failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("pg {pgid}: tier agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StaticStatsFeed;
    use crate::testing::TieredCluster;
    use bytes::Bytes;
    use objectio_common::config::{HitSetKind, HitSetParams};

    fn tiering() -> PoolTierConfig {
        PoolTierConfig {
            target_max_objects: 100,
            dirty_ratio_low: 0.4,
            dirty_ratio_high: 0.6,
            full_ratio_low: 0.6,
            full_ratio_high: 0.8,
            ..Default::default()
        }
    }

    #[test]
    fn test_mode_thresholds() {
        let t = tiering();
        assert_eq!(flush_mode(0.1, &t), FlushMode::Idle);
        assert_eq!(flush_mode(0.4, &t), FlushMode::Active);
        assert_eq!(evict_mode(0.5, &t), (EvictMode::Idle, 0.0));
        let (mode, effort) = evict_mode(0.7, &t);
        assert_eq!(mode, EvictMode::Some);
        assert!((effort - 0.5).abs() < 1e-9);
        assert_eq!(evict_mode(0.9, &t), (EvictMode::Full, 1.0));
        assert_eq!(EvictMode::Some.to_string(), "some");
    }

    async fn agent_with(t: &TieredCluster, feed: Arc<StaticStatsFeed>) -> TierAgent {
        t.set_cache_tiering(tiering()).await;
        let pg = t.cache_pg();
        TierAgent::new(pg, AgentConfig::default(), feed)
    }

    #[tokio::test]
    async fn test_idle_agent_does_nothing() {
        let t = TieredCluster::new().await;
        t.base_io.write_full("foo", Bytes::from_static(b"x")).await.unwrap();
        let feed = Arc::new(StaticStatsFeed::new());
        let mut agent = agent_with(&t, feed).await;

        let report = agent.tick().await.unwrap();
        assert!(agent.is_idle());
        assert_eq!(report, PassReport::default());
        assert!(t.cache_io.is_dirty("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_active_flush_cleans_dirty_objects() {
        let t = TieredCluster::new().await;
        for name in ["a", "b", "c"] {
            t.base_io.write_full(name, Bytes::from_static(b"x")).await.unwrap();
        }
        let feed = Arc::new(StaticStatsFeed::new());
        feed.set(t.cache_pool, 0.1, 0.7);
        let mut agent = agent_with(&t, feed).await;
        let status = agent.subscribe();

        let report = agent.tick().await.unwrap();
        assert_eq!(agent.state().flush_mode, FlushMode::Active);
        assert_eq!(agent.state().evict_mode, EvictMode::Idle);
        assert_eq!(report.flushed, 3);
        assert!(report.wrapped);
        for name in ["a", "b", "c"] {
            assert!(!t.cache_io.is_dirty(name).await.unwrap());
        }
        assert_eq!(t.base_pool_objects().await, vec!["a", "b", "c"]);
        assert_eq!(agent.state().recent_clean.len(), 3);

        let status = status.borrow().clone();
        assert_eq!(status.passes, 1);
        assert_eq!(status.counters.flushes, 3);
    }

    #[tokio::test]
    async fn test_flush_quota_below_high_watermark() {
        let t = TieredCluster::new().await;
        for i in 0..10 {
            t.base_io
                .write_full(&format!("obj{i}"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let feed = Arc::new(StaticStatsFeed::new());
        feed.set(t.cache_pool, 0.0, 0.5);
        let mut agent = agent_with(&t, feed.clone()).await;

        let report = agent.tick().await.unwrap();
        assert_eq!(report.flushed, AgentConfig::default().max_flush_ops / 2);

        feed.set(t.cache_pool, 0.0, 0.9);
        let report = agent.tick().await.unwrap();
        assert_eq!(report.flushed, 10 - AgentConfig::default().max_flush_ops / 2);
    }

    #[tokio::test]
    async fn test_full_mode_evicts_clean_objects() {
        let t = TieredCluster::new().await;
        for name in ["a", "b"] {
            t.base_io.write_full(name, Bytes::from_static(b"x")).await.unwrap();
            t.cache_io.cache_flush(name).await.unwrap();
        }
        t.base_io.write_full("dirty", Bytes::from_static(b"x")).await.unwrap();

        let feed = Arc::new(StaticStatsFeed::new());
        feed.set(t.cache_pool, 0.95, 0.0);
        let mut agent = agent_with(&t, feed).await;

        let report = agent.tick().await.unwrap();
        assert_eq!(agent.state().evict_mode, EvictMode::Full);
        assert_eq!(report.evicted, 2);
        assert_eq!(t.cache_io.list_objects().await.unwrap(), vec!["dirty"]);
        assert!(!agent.is_idle());
    }

    #[tokio::test]
    async fn test_some_mode_evicts_only_the_coldest() {
        let t = TieredCluster::new().await;
        t.set_cache_tiering(PoolTierConfig {
            hit_set: HitSetParams {
                kind: HitSetKind::ExplicitObject,
                count: 4,
                period_secs: 10,
                search_last_n: 1,
                ..Default::default()
            },
            ..tiering()
        })
        .await;
        for name in ["cold1", "cold2", "cold3", "hot", "warm"] {
            t.base_io.write_full(name, Bytes::from_static(b"x")).await.unwrap();
            t.cache_io.cache_flush(name).await.unwrap();
        }
        let pg = t.cache_pg();

        // [1000, 1100) saw every object, [1100, 1110) only "warm"
        t.clock.advance(100);
        assert!(pg.hit_set_rotate().await.unwrap().is_some());
        t.base_io.read("warm", 0, None).await.unwrap();
        t.clock.advance(10);
        assert!(pg.hit_set_rotate().await.unwrap().is_some());

        // [1110, 1120) saw only "hot"; the pass seals it
        t.base_io.read("hot", 0, None).await.unwrap();
        t.clock.advance(10);

        let feed = Arc::new(StaticStatsFeed::new());
        feed.set(t.cache_pool, 0.7, 0.0);
        let mut agent = TierAgent::new(pg, AgentConfig::default(), feed);
        let report = agent.tick().await.unwrap();

        assert_eq!(agent.state().evict_mode, EvictMode::Some);
        assert!((agent.state().evict_effort - 0.5).abs() < 1e-9);
        assert_eq!(report.scanned, 5);
        assert_eq!(report.evicted, 3);
        assert_eq!(t.cache_io.list_objects().await.unwrap(), vec!["hot", "warm"]);
        assert_eq!(t.base_pool_objects().await.len(), 5);
    }

    #[tokio::test]
    async fn test_eviction_stops_below_target() {
        let t = TieredCluster::new().await;
        t.base_io.write_full("a", Bytes::from_static(b"x")).await.unwrap();
        t.cache_io.cache_flush("a").await.unwrap();

        let feed = Arc::new(StaticStatsFeed::new());
        feed.set(t.cache_pool, 0.85, 0.0);
        let mut agent = agent_with(&t, feed.clone()).await;
        agent.update_modes(feed.ratios(t.cache_pool), &tiering());
        assert_eq!(agent.state().evict_mode, EvictMode::Full);

        // The ratio fell under the high watermark before the pass ran
        feed.set(t.cache_pool, 0.7, 0.0);
        assert!(!agent.eviction_pending(&tiering()));
    }

    #[tokio::test]
    async fn test_sweep_resumes_from_position() {
        let t = TieredCluster::new().await;
        for i in 0..5 {
            t.base_io
                .write_full(&format!("obj{i}"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let feed = Arc::new(StaticStatsFeed::new());
        feed.set(t.cache_pool, 0.0, 0.45);
        t.set_cache_tiering(tiering()).await;
        let config = AgentConfig {
            batch_size: 3,
            max_flush_ops: 2,
            ..AgentConfig::default()
        };
        let mut agent = TierAgent::new(t.cache_pg(), config, feed);

        let first = agent.tick().await.unwrap();
        assert!(!first.wrapped);
        assert!(agent.state().position.is_some());
        let second = agent.tick().await.unwrap();
        assert!(second.wrapped);
        assert!(agent.state().position.is_none());
        assert_eq!(first.scanned + second.scanned, 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let t = TieredCluster::new().await;
        let feed = Arc::new(StaticStatsFeed::new());
        let agent = agent_with(&t, feed).await;
        let status = agent.subscribe();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(rx));

        let mut changes = status.clone();
        changes.wait_for(|s| s.passes >= 1).await.unwrap();
        tx.send_replace(true);
        handle.await.unwrap();
    }
}
