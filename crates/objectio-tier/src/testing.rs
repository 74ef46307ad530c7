//! Two-pool fixture shared by the unit tests

use crate::clock::ManualClock;
use crate::cluster::{Cluster, IoCtx};
use crate::op::{OpReply, OpRequest, OsdOp};
use crate::pg::{PlacementGroup, TierCounters};
use crate::router::OpFlags;
use objectio_common::config::{CacheMode, PoolConfig, PoolTierConfig};
use objectio_common::{HObject, PoolId, Result};
use objectio_storage::{IoGate, MemStore, ObjectStore, StoreStats};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A base pool backed by one gated store plus a single-PG cache pool
pub(crate) struct TieredCluster {
    pub cluster: Cluster,
    pub clock: Arc<ManualClock>,
    pub base_gate: Arc<IoGate>,
    pub base_store: Arc<MemStore>,
    pub base_pool: PoolId,
    pub cache_pool: PoolId,
    pub base_io: IoCtx,
    pub cache_io: IoCtx,
}

impl TieredCluster {
    /// Both pools exist but are not related yet
    pub async fn untiered() -> Self {
        let clock = Arc::new(ManualClock::new(1000));
        let base_gate = Arc::new(IoGate::new());
        let base_store = Arc::new(MemStore::with_gate(base_gate.clone()));

        let store = base_store.clone();
        let cluster = Cluster::builder()
            .clock(clock.clone())
            .store_factory(move |pool, _, _| {
                if pool == "base" {
                    store.clone() as Arc<dyn ObjectStore>
                } else {
                    Arc::new(MemStore::new()) as Arc<dyn ObjectStore>
                }
            })
            .build();

        let pool = |name: &str| PoolConfig {
            name: name.to_string(),
            pg_num: 1,
            size: 1,
            ..Default::default()
        };
        let base_pool = cluster.create_pool(&pool("base")).await.unwrap();
        let cache_pool = cluster.create_pool(&pool("cache")).await.unwrap();
        let base_io = cluster.io_ctx("base").unwrap();
        let cache_io = cluster.io_ctx("cache").unwrap();

        Self {
            cluster,
            clock,
            base_gate,
            base_store,
            base_pool,
            cache_pool,
            base_io,
            cache_io,
        }
    }

    /// Cache attached as a writeback overlay of the base
    pub async fn new() -> Self {
        let t = Self::untiered().await;
        t.configure_tier().await;
        t
    }

    pub async fn configure_tier(&self) {
        self.cluster.tier_add("base", "cache").await.unwrap();
        self.cluster.tier_set_overlay("base", "cache").await.unwrap();
        self.set_cache_mode(CacheMode::Writeback).await;
    }

    pub async fn set_cache_mode(&self, mode: CacheMode) {
        self.cluster.tier_cache_mode("cache", mode).await.unwrap();
    }

    pub async fn set_cache_tiering(&self, tiering: PoolTierConfig) {
        self.cluster.set_pool_tiering("cache", tiering).await.unwrap();
    }

    /// Heads stored in the base pool, whiteouts included
    pub async fn base_pool_objects(&self) -> Vec<String> {
        self.cluster
            .list_objects(self.base_pool)
            .await
            .unwrap()
            .into_iter()
            .map(|oid: HObject| oid.name)
            .collect()
    }

    pub fn cache_stats(&self) -> TierCounters {
        self.cluster.pool_counters(self.cache_pool)
    }

    pub fn base_store_stats(&self) -> &StoreStats {
        self.base_store.stats()
    }

    pub fn base_store_offline(&self, offline: bool) {
        self.base_store.set_offline(offline);
    }

    pub fn cache_pg(&self) -> Arc<PlacementGroup> {
        self.cluster
            .pool_pgs(self.cache_pool)
            .into_iter()
            .next()
            .unwrap()
    }

    /// Run `op` on the cache pool's copy of `name` in the background
    pub fn spawn_cache_op(&self, name: &str, op: OsdOp) -> JoinHandle<Result<OpReply>> {
        let cluster = self.cluster.clone();
        let pool = self.cache_pool;
        let req = OpRequest::new(HObject::head(name), op).with_flags(OpFlags::NONE);
        tokio::spawn(async move { cluster.operate(pool, req).await })
    }
}
