//! Cluster facade
//!
//! A [`Cluster`] owns the pool map, one [`PlacementGroup`] per pool shard
//! and the store factory that backs them. Pool and tier administration
//! publishes a new map epoch and tells the affected placement groups about
//! it. Client I/O goes through an [`IoCtx`] bound to one pool, which routes
//! every operation through the overlay router.

use crate::agent::{AgentStatus, TierAgent};
use crate::backend::{ErasureCodedBackend, PgBackend, ReplicatedBackend};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::op::{OpReply, OpRequest, OsdOp, ReplyBody};
use crate::osdmap::{OsdMap, PoolInfo};
use crate::pg::{OpDispatcher, PlacementGroup, TierCounters};
use crate::router::{OpClass, OpFlags, OverlayRouter};
use crate::stats::{PoolRatios, PoolStatsFeed, PoolUsage};
use async_trait::async_trait;
use bytes::Bytes;
use objectio_common::config::{AgentConfig, BackendKind, CacheMode, PoolConfig, PoolTierConfig};
use objectio_common::{Error, HObject, PgId, PoolId, Result, SnapContext, SnapId};
use objectio_storage::{MemStore, ObjectStat, ObjectStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates the store for replica `index` of placement group `pgid` in the
/// named pool
pub type StoreFactory = Arc<dyn Fn(&str, PgId, usize) -> Arc<dyn ObjectStore> + Send + Sync>;

/// Builder for [`Cluster`]
pub struct ClusterBuilder {
    clock: Arc<dyn Clock>,
    store_factory: StoreFactory,
    feed: Option<Arc<dyn PoolStatsFeed>>,
    agent: AgentConfig,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBuilder {
    /// Wall clock, in-memory stores, usage-derived pool ratios
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            store_factory: Arc::new(|_: &str, _: PgId, _: usize| {
                Arc::new(MemStore::new()) as Arc<dyn ObjectStore>
            }),
            feed: None,
            agent: AgentConfig::default(),
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn store_factory(
        mut self,
        factory: impl Fn(&str, PgId, usize) -> Arc<dyn ObjectStore> + Send + Sync + 'static,
    ) -> Self {
        self.store_factory = Arc::new(factory);
        self
    }

    /// Replace the usage-derived ratios the agents act on
    #[must_use]
    pub fn stats_feed(mut self, feed: Arc<dyn PoolStatsFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    #[must_use]
    pub fn agent_config(mut self, config: AgentConfig) -> Self {
        self.agent = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Cluster {
        let inner = Arc::new_cyclic(|this: &Weak<ClusterInner>| {
            let feed = self.feed.unwrap_or_else(|| {
                Arc::new(ClusterStatsFeed {
                    cluster: this.clone(),
                }) as Arc<dyn PoolStatsFeed>
            });
            ClusterInner {
                map: watch::Sender::new(Arc::new(OsdMap::new())),
                pgs: RwLock::new(HashMap::new()),
                clock: self.clock,
                store_factory: self.store_factory,
                feed,
                agent: self.agent,
                admin: tokio::sync::Mutex::new(()),
                this: this.clone(),
            }
        });
        Cluster { inner }
    }
}

struct ClusterInner {
    map: watch::Sender<Arc<OsdMap>>,
    pgs: RwLock<HashMap<PgId, Arc<PlacementGroup>>>,
    clock: Arc<dyn Clock>,
    store_factory: StoreFactory,
    feed: Arc<dyn PoolStatsFeed>,
    agent: AgentConfig,
    /// Serializes map changes
    admin: tokio::sync::Mutex<()>,
    this: Weak<ClusterInner>,
}

impl ClusterInner {
    fn osdmap(&self) -> Arc<OsdMap> {
        self.map.borrow().clone()
    }

    fn pg(&self, pgid: PgId) -> Result<Arc<PlacementGroup>> {
        self.pgs
            .read()
            .get(&pgid)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("pg {pgid} is not hosted")))
    }

    fn pool_pgs(&self, pool: PoolId) -> Vec<Arc<PlacementGroup>> {
        let mut pgs: Vec<_> = self
            .pgs
            .read()
            .values()
            .filter(|pg| pg.pgid().pool == pool)
            .cloned()
            .collect();
        pgs.sort_by_key(|pg| pg.pgid());
        pgs
    }

    fn pool_usage(&self, pool: PoolId) -> PoolUsage {
        let mut usage = PoolUsage::default();
        for pg in self.pool_pgs(pool) {
            let store = pg.usage();
            usage.objects += store.objects;
            usage.bytes += store.bytes;
            usage.dirty_objects += pg.stats().dirty();
        }
        usage
    }

    async fn operate(&self, pool: PoolId, req: OpRequest) -> Result<OpReply> {
        let map = self.osdmap();
        let route = OverlayRouter::route(&map, pool, req.op.class(), req.flags)?;
        let pgid = map.require(route.pool)?.pg_of(&req.oid);
        let pg = self.pg(pgid)?;
        pg.do_op(req, route).await
    }

    fn make_backend(&self, pool: &PoolInfo, pgid: PgId) -> Arc<dyn PgBackend> {
        let store = |index| (self.store_factory)(&pool.name, pgid, index);
        match pool.backend {
            BackendKind::Replicated => {
                let replicas = (1..pool.size).map(store).collect();
                Arc::new(ReplicatedBackend::new(store(0), replicas))
            }
            BackendKind::ErasureCoded => Arc::new(ErasureCodedBackend::new(store(0))),
        }
    }

    /// Apply `change` to a copy of the map and publish it as a new epoch
    async fn update_map<T>(
        &self,
        affected: &[PoolId],
        change: impl FnOnce(&mut OsdMap) -> Result<T>,
    ) -> Result<T> {
        let _admin = self.admin.lock().await;
        let mut next = OsdMap::clone(&self.osdmap());
        let out = change(&mut next)?;
        next.bump_epoch();
        let epoch = next.epoch();
        self.map.send_replace(Arc::new(next));
        debug!("published osdmap epoch {epoch}");

        for pool in affected {
            for pg in self.pool_pgs(*pool) {
                pg.on_map_change().await?;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl OpDispatcher for ClusterInner {
    async fn dispatch(&self, pool: PoolId, req: OpRequest) -> Result<OpReply> {
        self.operate(pool, req).await
    }
}

/// Pool ratios derived from placement group usage and dirty counts
pub struct ClusterStatsFeed {
    cluster: Weak<ClusterInner>,
}

impl PoolStatsFeed for ClusterStatsFeed {
    fn ratios(&self, pool: PoolId) -> Option<PoolRatios> {
        let cluster = self.cluster.upgrade()?;
        let map = cluster.osdmap();
        let info = map.pool(pool)?;
        cluster.pool_usage(pool).ratios(&info.tiering)
    }
}

/// Running tier agents
pub struct AgentSupervisor {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    status: BTreeMap<PgId, watch::Receiver<AgentStatus>>,
}

impl AgentSupervisor {
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Latest status published by the agent of `pgid`
    #[must_use]
    pub fn status(&self, pgid: PgId) -> Option<AgentStatus> {
        self.status.get(&pgid).map(|rx| rx.borrow().clone())
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.status.values().map(|rx| rx.borrow().clone()).collect()
    }

    /// Stop every agent and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("tier agent task failed: {e}");
            }
        }
        info!("tier agents stopped");
    }
}

/// Handle to a set of pools and their placement groups
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    #[must_use]
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    /// Current pool map
    #[must_use]
    pub fn osdmap(&self) -> Arc<OsdMap> {
        self.inner.osdmap()
    }

    #[must_use]
    pub fn subscribe_map(&self) -> watch::Receiver<Arc<OsdMap>> {
        self.inner.map.subscribe()
    }

    pub fn pool_id(&self, name: &str) -> Result<PoolId> {
        self.osdmap().require_name(name)
    }

    pub fn pg(&self, pgid: PgId) -> Result<Arc<PlacementGroup>> {
        self.inner.pg(pgid)
    }

    #[must_use]
    pub fn pool_pgs(&self, pool: PoolId) -> Vec<Arc<PlacementGroup>> {
        self.inner.pool_pgs(pool)
    }

    /// Create a pool and activate its placement groups
    pub async fn create_pool(&self, config: &PoolConfig) -> Result<PoolId> {
        let id = self.inner.update_map(&[], |map| map.create_pool(config)).await?;
        let pool = self.osdmap().require(id)?.clone();
        let dispatcher: Weak<dyn OpDispatcher> = self.inner.this.clone();

        for pgid in pool.pgs() {
            let pg = Arc::new(PlacementGroup::new(
                pgid,
                self.inner.make_backend(&pool, pgid),
                self.subscribe_map(),
                self.inner.clock.clone(),
                dispatcher.clone(),
            ));
            pg.activate().await?;
            self.inner.pgs.write().insert(pgid, pg);
        }
        info!(
            "created pool {} (id {id}, {} pgs, {} backend)",
            pool.name,
            pool.pg_num,
            match pool.backend {
                BackendKind::Replicated => "replicated",
                BackendKind::ErasureCoded => "erasure-coded",
            }
        );
        Ok(id)
    }

    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        let id = self.pool_id(name)?;
        self.inner.update_map(&[], |map| map.delete_pool(id)).await?;
        self.inner.pgs.write().retain(|pgid, _| pgid.pool != id);
        info!("deleted pool {name}");
        Ok(())
    }

    /// Attach `cache` as a cache tier of `base`
    pub async fn tier_add(&self, base: &str, cache: &str) -> Result<()> {
        let (b, c) = (self.pool_id(base)?, self.pool_id(cache)?);
        self.inner.update_map(&[b, c], |map| map.tier_add(b, c)).await?;
        info!("pool {cache} is now a tier of {base}");
        Ok(())
    }

    pub async fn tier_remove(&self, base: &str, cache: &str) -> Result<()> {
        let (b, c) = (self.pool_id(base)?, self.pool_id(cache)?);
        self.inner.update_map(&[b, c], |map| map.tier_remove(b, c)).await?;
        info!("pool {cache} is no longer a tier of {base}");
        Ok(())
    }

    pub async fn tier_set_overlay(&self, base: &str, cache: &str) -> Result<()> {
        let (b, c) = (self.pool_id(base)?, self.pool_id(cache)?);
        self.inner.update_map(&[b, c], |map| map.set_overlay(b, c)).await?;
        info!("pool {base} overlay set to {cache}");
        Ok(())
    }

    pub async fn tier_remove_overlay(&self, base: &str) -> Result<()> {
        let b = self.pool_id(base)?;
        self.inner.update_map(&[b], |map| map.remove_overlay(b)).await?;
        info!("pool {base} overlay removed");
        Ok(())
    }

    pub async fn tier_cache_mode(&self, cache: &str, mode: CacheMode) -> Result<()> {
        let c = self.pool_id(cache)?;
        self.inner.update_map(&[c], |map| map.set_cache_mode(c, mode)).await?;
        info!("pool {cache} cache mode set to {mode:?}");
        Ok(())
    }

    /// Replace the hit set and flush/evict parameters of a pool
    pub async fn set_pool_tiering(&self, pool: &str, tiering: PoolTierConfig) -> Result<()> {
        let id = self.pool_id(pool)?;
        self.inner
            .update_map(&[id], |map| map.set_tiering(id, tiering))
            .await?;
        info!("pool {pool} tiering parameters updated");
        Ok(())
    }

    /// Allocate a self-managed snapshot id in `pool` (or its base)
    pub async fn selfmanaged_snap_create(&self, pool: PoolId) -> Result<SnapId> {
        self.inner
            .update_map(&[], |map| map.allocate_snap(pool))
            .await
    }

    /// Route and execute one operation addressed to `pool`
    pub async fn operate(&self, pool: PoolId, req: OpRequest) -> Result<OpReply> {
        self.inner.operate(pool, req).await
    }

    /// Heads stored in `pool` itself, whiteouts included, sorted
    pub async fn list_objects(&self, pool: PoolId) -> Result<Vec<HObject>> {
        self.osdmap().require(pool)?;
        let mut out = Vec::new();
        for pg in self.pool_pgs(pool) {
            out.extend(pg.list_objects().await?);
        }
        out.sort();
        Ok(out)
    }

    #[must_use]
    pub fn pool_usage(&self, pool: PoolId) -> PoolUsage {
        self.inner.pool_usage(pool)
    }

    /// Tier counters summed over the placement groups of `pool`
    #[must_use]
    pub fn pool_counters(&self, pool: PoolId) -> TierCounters {
        let mut total = TierCounters::default();
        for pg in self.pool_pgs(pool) {
            total += pg.stats().counters();
        }
        total
    }

    /// Agent for one placement group, for callers that drive passes by hand
    pub fn tier_agent(&self, pgid: PgId) -> Result<TierAgent> {
        Ok(TierAgent::new(
            self.pg(pgid)?,
            self.inner.agent.clone(),
            self.inner.feed.clone(),
        ))
    }

    /// Spawn an agent for every placement group whose pool needs one
    #[must_use]
    pub fn start_agents(&self) -> AgentSupervisor {
        let (shutdown, rx) = watch::channel(false);
        let mut supervisor = AgentSupervisor {
            shutdown,
            tasks: Vec::new(),
            status: BTreeMap::new(),
        };
        if !self.inner.agent.enabled {
            info!("tier agents disabled");
            return supervisor;
        }

        let mut pgs: Vec<_> = self.inner.pgs.read().values().cloned().collect();
        pgs.sort_by_key(|pg| pg.pgid());
        for pg in pgs {
            if !pg.agent_eligible() {
                continue;
            }
            let pgid = pg.pgid();
            let agent = TierAgent::new(pg, self.inner.agent.clone(), self.inner.feed.clone());
            supervisor.status.insert(pgid, agent.subscribe());
            supervisor.tasks.push(tokio::spawn(agent.run(rx.clone())));
        }
        info!("started {} tier agents", supervisor.len());
        supervisor
    }

    /// I/O context bound to the named pool
    pub fn io_ctx(&self, pool: &str) -> Result<IoCtx> {
        let pool = self.pool_id(pool)?;
        Ok(IoCtx {
            cluster: self.clone(),
            pool,
            state: Arc::new(IoCtxState {
                snapc: Mutex::new(SnapContext::default()),
                read_snap: Mutex::new(SnapId::NOSNAP),
                last_version: AtomicU64::new(0),
            }),
        })
    }
}

struct IoCtxState {
    snapc: Mutex<SnapContext>,
    read_snap: Mutex<SnapId>,
    last_version: AtomicU64,
}

/// Client view of one pool
///
/// Clones share the write snapshot context, the read snapshot and the last
/// observed version.
#[derive(Clone)]
pub struct IoCtx {
    cluster: Cluster,
    pool: PoolId,
    state: Arc<IoCtxState>,
}

impl IoCtx {
    #[must_use]
    pub const fn pool(&self) -> PoolId {
        self.pool
    }

    /// Object version observed by the last successful operation
    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.state.last_version.load(Ordering::SeqCst)
    }

    /// Placement group holding `name` in this pool
    pub fn object_pg(&self, name: &str) -> Result<PgId> {
        Ok(self
            .cluster
            .osdmap()
            .require(self.pool)?
            .pg_of(&HObject::head(name)))
    }

    /// Run `op` on `name`; reads and cache ops address the read snapshot
    pub async fn operate(&self, name: &str, op: OsdOp, flags: OpFlags) -> Result<OpReply> {
        let snap = match op.class() {
            OpClass::Write => SnapId::NOSNAP,
            OpClass::Read | OpClass::Flush | OpClass::CacheTry => *self.state.read_snap.lock(),
        };
        self.operate_at(name, snap, op, flags).await
    }

    /// Run `op` on revision `snap` of `name`
    pub async fn operate_at(
        &self,
        name: &str,
        snap: SnapId,
        op: OsdOp,
        flags: OpFlags,
    ) -> Result<OpReply> {
        let snapc = self.state.snapc.lock().clone();
        let req = OpRequest::new(HObject::head(name).with_snap(snap), op)
            .with_flags(flags)
            .with_snapc(snapc);
        let reply = self.cluster.operate(self.pool, req).await?;
        self.state
            .last_version
            .store(reply.version, Ordering::SeqCst);
        Ok(reply)
    }

    async fn run(&self, name: &str, op: OsdOp) -> Result<ReplyBody> {
        Ok(self.operate(name, op, OpFlags::NONE).await?.body)
    }

    pub async fn read(&self, name: &str, offset: u64, len: Option<u64>) -> Result<Bytes> {
        match self.run(name, OsdOp::Read { offset, len }).await? {
            ReplyBody::Data(data) => Ok(data),
            other => Err(unexpected("read", &other)),
        }
    }

    pub async fn stat(&self, name: &str) -> Result<ObjectStat> {
        match self.run(name, OsdOp::Stat).await? {
            ReplyBody::Stat(stat) => Ok(stat),
            other => Err(unexpected("stat", &other)),
        }
    }

    pub async fn get_attr(&self, name: &str, key: &str) -> Result<Bytes> {
        let op = OsdOp::GetAttr {
            key: key.to_string(),
        };
        match self.run(name, op).await? {
            ReplyBody::Attr(value) => Ok(value),
            other => Err(unexpected("getxattr", &other)),
        }
    }

    pub async fn is_dirty(&self, name: &str) -> Result<bool> {
        match self.run(name, OsdOp::IsDirty).await? {
            ReplyBody::Dirty(dirty) => Ok(dirty),
            other => Err(unexpected("isdirty", &other)),
        }
    }

    pub async fn create(&self, name: &str, exclusive: bool) -> Result<()> {
        self.run(name, OsdOp::Create { exclusive }).await?;
        Ok(())
    }

    pub async fn write_full(&self, name: &str, data: Bytes) -> Result<()> {
        self.run(name, OsdOp::WriteFull { data }).await?;
        Ok(())
    }

    pub async fn write(&self, name: &str, offset: u64, data: Bytes) -> Result<()> {
        self.run(name, OsdOp::Write { offset, data }).await?;
        Ok(())
    }

    pub async fn truncate(&self, name: &str, size: u64) -> Result<()> {
        self.run(name, OsdOp::Truncate { size }).await?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.run(name, OsdOp::Remove).await?;
        Ok(())
    }

    pub async fn set_attr(&self, name: &str, key: &str, value: Bytes) -> Result<()> {
        let op = OsdOp::SetAttr {
            key: key.to_string(),
            value,
        };
        self.run(name, op).await?;
        Ok(())
    }

    pub async fn undirty(&self, name: &str) -> Result<()> {
        self.run(name, OsdOp::Undirty).await?;
        Ok(())
    }

    pub async fn cache_flush(&self, name: &str) -> Result<()> {
        self.run(name, OsdOp::CacheFlush).await?;
        Ok(())
    }

    pub async fn cache_try_flush(&self, name: &str) -> Result<()> {
        self.run(name, OsdOp::CacheTryFlush).await?;
        Ok(())
    }

    pub async fn cache_evict(&self, name: &str) -> Result<()> {
        self.run(name, OsdOp::CacheEvict).await?;
        Ok(())
    }

    /// Names of the heads stored in this pool itself, whiteouts included
    pub async fn list_objects(&self) -> Result<Vec<String>> {
        Ok(self
            .cluster
            .list_objects(self.pool)
            .await?
            .into_iter()
            .map(|oid| oid.name)
            .collect())
    }

    pub async fn selfmanaged_snap_create(&self) -> Result<SnapId> {
        self.cluster.selfmanaged_snap_create(self.pool).await
    }

    /// Snapshot context for subsequent writes
    pub fn set_write_ctx(&self, seq: SnapId, snaps: Vec<SnapId>) -> Result<()> {
        let snapc = SnapContext::new(seq, snaps);
        if !snapc.is_valid() {
            return Err(Error::invalid_argument(format!("invalid snap context {snapc:?}")));
        }
        *self.state.snapc.lock() = snapc;
        Ok(())
    }

    /// Snapshot subsequent reads address; `SnapId::NOSNAP` reads the head
    pub fn snap_set_read(&self, snap: SnapId) {
        *self.state.read_snap.lock() = snap;
    }

    fn hash_pg(&self, hash: u32) -> Result<Arc<PlacementGroup>> {
        let map = self.cluster.osdmap();
        let pool = map.require(self.pool)?;
        self.cluster.pg(PgId::new(self.pool, hash % pool.pg_num.max(1)))
    }

    /// Sealed hit set windows of the placement group owning `hash`
    pub fn hit_set_list(&self, hash: u32) -> Result<Vec<(Timestamp, Timestamp)>> {
        Ok(self.hash_pg(hash)?.hit_set_list())
    }

    /// Encoded hit set covering `ts` in the placement group owning `hash`
    pub fn hit_set_get(&self, hash: u32, ts: Timestamp) -> Result<Bytes> {
        let set = self.hash_pg(hash)?.hit_set_get(ts)?;
        Ok(Bytes::from(set.encode()?))
    }
}

fn unexpected(op: &str, body: &ReplyBody) -> Error {
    Error::inconsistency(format!("{op} returned {body:?}"))
}
