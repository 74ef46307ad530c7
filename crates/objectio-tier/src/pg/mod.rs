//! Placement groups
//!
//! A [`PlacementGroup`] executes object operations for one shard of one
//! pool. It owns the per-object contexts, the hit set archive and the tier
//! counters, and reaches other pools (the base tier of a cache) only
//! through an [`OpDispatcher`].
//!
//! Operations arrive already routed. When the route applies writeback
//! caching, a miss is promoted before the operation runs; when it applies
//! forward caching, a miss is sent on to the base pool unchanged.

mod flush;
mod promote;

use crate::backend::PgBackend;
use crate::clock::{Clock, Timestamp};
use crate::hitset::{HitSetArchive, Rotation, SealedHitSet};
use crate::lock::{ObjectContextRegistry, PromoteOutcome};
use crate::op::{CopiedObject, OpReply, OpRequest, OsdOp, ReplyBody};
use crate::osdmap::{OsdMap, PoolInfo};
use crate::router::{OpFlags, Route};
use crate::snap::{SNAPSET_ATTR, SnapResolution, SnapSet};
use crate::state::{ObjectTierState, TIER_STATE_ATTR, is_user_attr};
use async_trait::async_trait;
use bytes::Bytes;
use objectio_common::config::CacheMode;
use objectio_common::{Error, HObject, PgId, PoolId, Result, SnapContext};
use objectio_storage::{StoreUsage, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Attempts to find a promoted object still present once its lock is held
const PROMOTE_RETRIES: usize = 3;

/// Page size for full listings
const LIST_CHUNK: usize = 256;

/// Sends an operation to whichever placement group owns it in `pool`
#[async_trait]
pub trait OpDispatcher: Send + Sync {
    async fn dispatch(&self, pool: PoolId, req: OpRequest) -> Result<OpReply>;
}

/// Tier counters of one placement group
#[derive(Debug, Default)]
pub struct PgStats {
    pub promotions: AtomicU64,
    pub whiteouts: AtomicU64,
    pub flushes: AtomicU64,
    pub evictions: AtomicU64,
    /// Objects currently dirty
    pub num_dirty: AtomicU64,
}

impl PgStats {
    fn account(&self, before: Option<&ObjectTierState>, after: Option<&ObjectTierState>) {
        let was = before.is_some_and(|s| s.dirty);
        let is = after.is_some_and(|s| s.dirty);
        match (was, is) {
            (false, true) => {
                self.num_dirty.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                let _ = self
                    .num_dirty
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        Some(n.saturating_sub(1))
                    });
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn dirty(&self) -> u64 {
        self.num_dirty.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counters(&self) -> TierCounters {
        TierCounters {
            promotions: self.promotions.load(Ordering::Relaxed),
            whiteouts: self.whiteouts.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dirty: self.dirty(),
        }
    }
}

/// Point-in-time copy of [`PgStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounters {
    pub promotions: u64,
    pub whiteouts: u64,
    pub flushes: u64,
    pub evictions: u64,
    pub dirty: u64,
}

impl std::ops::AddAssign for TierCounters {
    fn add_assign(&mut self, other: Self) {
        self.promotions += other.promotions;
        self.whiteouts += other.whiteouts;
        self.flushes += other.flushes;
        self.evictions += other.evictions;
        self.dirty += other.dirty;
    }
}

/// Tier state of a stored object together with its raw attribute bytes
#[derive(Debug, Clone)]
struct StoredState {
    state: ObjectTierState,
    raw: Option<Bytes>,
}

impl StoredState {
    const fn visible(&self) -> bool {
        !self.state.whiteout
    }
}

/// One page of objects walked by the tier agent
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    /// Heads and clones with their tier state
    pub objects: Vec<(HObject, ObjectTierState)>,
    /// Last key listed, to resume from
    pub last: Option<HObject>,
    /// The listing reached the end of the placement group
    pub complete: bool,
}

/// One shard of one pool
pub struct PlacementGroup {
    pgid: PgId,
    backend: Arc<dyn PgBackend>,
    map: watch::Receiver<Arc<OsdMap>>,
    contexts: ObjectContextRegistry,
    hit_sets: HitSetArchive,
    clock: Arc<dyn Clock>,
    dispatcher: Weak<dyn OpDispatcher>,
    stats: PgStats,
}

impl PlacementGroup {
    pub fn new(
        pgid: PgId,
        backend: Arc<dyn PgBackend>,
        map: watch::Receiver<Arc<OsdMap>>,
        clock: Arc<dyn Clock>,
        dispatcher: Weak<dyn OpDispatcher>,
    ) -> Self {
        let params = map
            .borrow()
            .pool(pgid.pool)
            .map(|p| p.tiering.hit_set.clone())
            .unwrap_or_default();
        Self {
            pgid,
            backend,
            map,
            contexts: ObjectContextRegistry::new(),
            hit_sets: HitSetArchive::new(params),
            clock,
            dispatcher,
            stats: PgStats::default(),
        }
    }

    #[must_use]
    pub const fn pgid(&self) -> PgId {
        self.pgid
    }

    #[must_use]
    pub const fn backend(&self) -> &Arc<dyn PgBackend> {
        &self.backend
    }

    #[must_use]
    pub const fn stats(&self) -> &PgStats {
        &self.stats
    }

    #[must_use]
    pub const fn hit_sets(&self) -> &HitSetArchive {
        &self.hit_sets
    }

    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    #[must_use]
    pub fn osdmap(&self) -> Arc<OsdMap> {
        self.map.borrow().clone()
    }

    #[must_use]
    pub fn usage(&self) -> StoreUsage {
        self.backend.usage()
    }

    fn pool_info(&self) -> Result<PoolInfo> {
        self.osdmap().require(self.pgid.pool).cloned()
    }

    fn base_pool(&self) -> Result<PoolId> {
        let pool = self.pool_info()?;
        pool.tier_of.ok_or_else(|| {
            Error::configuration(format!("pool {} is not a cache tier", pool.name))
        })
    }

    /// Whether the pool still wants a tier agent for this group
    #[must_use]
    pub fn agent_eligible(&self) -> bool {
        self.osdmap()
            .pool(self.pgid.pool)
            .is_some_and(PoolInfo::agent_eligible)
    }

    async fn dispatch(&self, pool: PoolId, req: OpRequest) -> Result<OpReply> {
        let dispatcher = self
            .dispatcher
            .upgrade()
            .ok_or_else(|| Error::configuration("cluster is shutting down"))?;
        dispatcher.dispatch(pool, req).await
    }

    /// Load persisted hit sets and open the recording window
    pub async fn activate(&self) -> Result<()> {
        let prefix = self.hit_set_prefix();
        let stored = self
            .list_raw(|oid| oid.is_internal() && oid.name.starts_with(&prefix))
            .await?;

        let mut sets = Vec::with_capacity(stored.len());
        for oid in stored {
            let data = self.backend.objects_read(&oid, 0, None).await?;
            match SealedHitSet::decode(&data) {
                Ok(set) => sets.push(set),
                Err(e) => warn!("pg {}: ignoring unreadable hit set {oid}: {e}", self.pgid),
            }
        }

        let restored = sets.len();
        let trimmed = self.hit_sets.restore(sets);
        self.remove_hit_sets(&trimmed).await?;
        self.hit_sets.activate(self.now())?;
        if restored > 0 {
            info!(
                "pg {}: restored {} hit sets",
                self.pgid,
                restored - trimmed.len()
            );
        }
        Ok(())
    }

    /// Apply a new pool map to this group
    pub async fn on_map_change(&self) -> Result<()> {
        if let Some(pool) = self.osdmap().pool(self.pgid.pool) {
            let removed = self
                .hit_sets
                .reconfigure(pool.tiering.hit_set.clone(), self.now())?;
            self.remove_hit_sets(&removed).await?;
        }
        self.backend.on_change().await?;
        Ok(())
    }

    fn hit_set_prefix(&self) -> String {
        format!("hit_set_{}_archive_", self.pgid)
    }

    fn hit_set_oid(&self, set: &SealedHitSet) -> HObject {
        HObject::internal(format!("{}{}", self.hit_set_prefix(), set.end()))
    }

    async fn remove_hit_sets(&self, sets: &[Arc<SealedHitSet>]) -> Result<()> {
        let mut txn = Transaction::new();
        for set in sets {
            let oid = self.hit_set_oid(set);
            if self.backend.objects_exists(&oid).await? {
                txn.remove(&oid);
            }
        }
        if !txn.is_empty() {
            self.backend.submit_transaction(txn).await?;
        }
        Ok(())
    }

    /// Seal the open hit set if its period elapsed, persisting the result
    pub async fn hit_set_rotate(&self) -> Result<Option<Rotation>> {
        let Some(rotation) = self.hit_sets.rotate(self.now())? else {
            return Ok(None);
        };

        let mut txn = Transaction::new();
        txn.write_full(
            &self.hit_set_oid(&rotation.sealed),
            Bytes::from(rotation.sealed.encode()?),
        );
        for set in &rotation.trimmed {
            let oid = self.hit_set_oid(set);
            if self.backend.objects_exists(&oid).await? {
                txn.remove(&oid);
            }
        }
        self.backend.submit_transaction(txn).await?;
        Ok(Some(rotation))
    }

    /// Sealed windows as `(start, end)`, oldest first
    #[must_use]
    pub fn hit_set_list(&self) -> Vec<(Timestamp, Timestamp)> {
        self.hit_sets.list()
    }

    /// Hit set whose window covers `ts`
    pub fn hit_set_get(&self, ts: Timestamp) -> Result<Arc<SealedHitSet>> {
        if !self.hit_sets.enabled() {
            return Err(Error::not_found(format!("hit set at {ts} in pg {}", self.pgid)));
        }
        self.hit_sets
            .get(ts, self.now())
            .ok_or_else(|| Error::not_found(format!("hit set at {ts} in pg {}", self.pgid)))
    }

    async fn list_raw(&self, keep: impl Fn(&HObject) -> bool + Send) -> Result<Vec<HObject>> {
        let mut out = Vec::new();
        let mut after: Option<HObject> = None;
        loop {
            let chunk = self.backend.objects_list(after.as_ref(), LIST_CHUNK).await?;
            let complete = chunk.len() < LIST_CHUNK;
            after = chunk.last().cloned();
            out.extend(chunk.into_iter().filter(|oid| keep(oid)));
            if complete {
                return Ok(out);
            }
        }
    }

    /// User-visible heads, whiteouts included
    pub async fn list_objects(&self) -> Result<Vec<HObject>> {
        self.list_raw(|oid| oid.is_head() && !oid.is_internal())
            .await
    }

    /// Next page of objects for the tier agent
    pub async fn agent_scan(&self, after: Option<&HObject>, max: usize) -> Result<ScanBatch> {
        let chunk = self.backend.objects_list(after, max).await?;
        let mut batch = ScanBatch {
            objects: Vec::with_capacity(chunk.len()),
            last: chunk.last().cloned(),
            complete: chunk.len() < max,
        };
        for oid in chunk {
            if oid.is_internal() || oid.is_snapdir() {
                continue;
            }
            if let Some(stored) = self.load(&oid).await? {
                batch.objects.push((oid, stored.state));
            }
        }
        Ok(batch)
    }

    async fn load(&self, oid: &HObject) -> Result<Option<StoredState>> {
        match self.backend.objects_get_attr(oid, TIER_STATE_ATTR).await {
            Ok(raw) => Ok(Some(StoredState {
                state: ObjectTierState::from_attr(raw.as_ref())?,
                raw,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load_snapset(&self, head: &HObject) -> Result<SnapSet> {
        match self
            .backend
            .objects_get_attr(&head.to_snapdir(), SNAPSET_ATTR)
            .await
        {
            Ok(Some(raw)) => SnapSet::decode(&raw),
            Ok(None) => Ok(SnapSet::default()),
            Err(e) if e.is_not_found() => Ok(SnapSet::default()),
            Err(e) => Err(e),
        }
    }

    /// Whether the head or its snapdir has an entry here
    async fn knows_head(&self, head: &HObject) -> Result<bool> {
        Ok(self.backend.objects_exists(head).await?
            || self.backend.objects_exists(&head.to_snapdir()).await?)
    }

    /// Revision serving `oid` according to the local snap set
    async fn resolve_local(&self, oid: &HObject) -> Result<HObject> {
        if oid.is_head() {
            return Ok(oid.clone());
        }
        let head = oid.to_head();
        match self.load_snapset(&head).await?.resolve(oid.snap) {
            SnapResolution::Head => Ok(head),
            SnapResolution::Clone(id) => Ok(head.with_snap(id)),
            SnapResolution::Missing => Err(Error::not_found(oid)),
        }
    }

    /// Full copy of a stored revision
    async fn snapshot_object(&self, oid: &HObject, stored: &StoredState) -> Result<CopiedObject> {
        let mut copied = CopiedObject {
            version: stored.state.version,
            ..CopiedObject::default()
        };
        if oid.is_head() {
            let snapset = self.load_snapset(oid).await?;
            copied.snapset = (!snapset.is_empty()).then_some(snapset);
        }
        if stored.visible() {
            copied.data = Some(self.backend.objects_read(oid, 0, None).await?);
            copied.attrs = self
                .backend
                .objects_get_attrs(oid)
                .await?
                .into_iter()
                .filter(|(key, _)| is_user_attr(key))
                .collect();
        }
        Ok(copied)
    }

    /// Execute a routed operation
    pub async fn do_op(&self, req: OpRequest, route: Route) -> Result<OpReply> {
        let OpRequest {
            oid,
            op,
            flags,
            snapc,
        } = req;
        if oid.is_snapdir() || (oid.is_internal() && op.is_client_op()) {
            return Err(Error::invalid_argument(format!("{oid} is not addressable")));
        }

        if op.is_client_op()
            && !matches!(op, OsdOp::CacheFlush | OsdOp::CacheTryFlush | OsdOp::CacheEvict)
            && let Err(e) = self.hit_sets.record(&oid, self.now())
        {
            warn!("pg {}: failed to record hit on {oid}: {e}", self.pgid);
        }
        debug!("pg {}: {} {oid} via {}", self.pgid, op.name(), route.role);

        let name = op.name();
        let result = match op {
            OsdOp::CopyGet => self.copy_get(&oid).await,
            OsdOp::CopyFrom(copied) => self.copy_from(&oid, *copied).await,
            OsdOp::CacheFlush => {
                let target = self.resolve_local(&oid).await?;
                self.cache_flush(&target).await
            }
            OsdOp::CacheTryFlush => {
                let target = self.resolve_local(&oid).await?;
                self.cache_try_flush(&target, flags.skip_rw_locks).await
            }
            OsdOp::CacheEvict => {
                let target = self.resolve_local(&oid).await?;
                self.cache_evict(&target).await
            }
            OsdOp::Read { .. } | OsdOp::Stat | OsdOp::GetAttr { .. } | OsdOp::IsDirty => {
                self.do_read(oid.clone(), op, flags, route).await
            }
            op => self.do_write(oid.clone(), op, flags, snapc, route).await,
        };
        if let Err(e @ Error::InternalInconsistency(_)) = &result {
            error!("pg {}: {name} {oid}: {e}", self.pgid);
        }
        result
    }

    async fn forward(&self, oid: HObject, op: OsdOp, flags: OpFlags) -> Result<OpReply> {
        let base = self.base_pool()?;
        debug!("pg {}: forwarding {} {oid} to pool {base}", self.pgid, op.name());
        let req = OpRequest::new(oid, op).with_flags(flags.ignore_overlay());
        self.dispatch(base, req).await
    }

    async fn promote_if_missing(&self, oid: &HObject) -> Result<()> {
        if self.backend.objects_exists(oid).await? {
            return Ok(());
        }
        match self.promote(oid).await? {
            PromoteOutcome::Promoted | PromoteOutcome::Whiteout => Ok(()),
            PromoteOutcome::NotFound => Err(Error::not_found(oid)),
            PromoteOutcome::Failed(msg) => Err(Error::storage(msg)),
        }
    }

    async fn do_read(
        &self,
        oid: HObject,
        op: OsdOp,
        flags: OpFlags,
        route: Route,
    ) -> Result<OpReply> {
        let target = match route.cache_mode {
            CacheMode::Writeback if !oid.is_head() => {
                let head = oid.to_head();
                if !self.knows_head(&head).await? {
                    // Promoting the head brings its snap set along
                    self.promote_if_missing(&head).await?;
                }
                self.resolve_local(&oid).await?
            }
            CacheMode::Forward if !oid.is_head() && !self.knows_head(&oid.to_head()).await? => {
                return self.forward(oid, op, flags).await;
            }
            _ => self.resolve_local(&oid).await?,
        };

        let ctx = self.contexts.get(&target);
        for _ in 0..PROMOTE_RETRIES {
            if route.cache_mode == CacheMode::Writeback {
                self.promote_if_missing(&target).await?;
            }
            let guard = if flags.skip_rw_locks {
                None
            } else {
                Some(ctx.rwlock().read().await)
            };
            let stored = self.load(&target).await?;
            match (stored, route.cache_mode) {
                (None, CacheMode::Writeback) => {}
                (None, CacheMode::Forward) => {
                    drop(guard);
                    return self.forward(oid, op, flags).await;
                }
                (stored, _) => return self.execute_read(&target, op, stored).await,
            }
        }
        Err(Error::busy(&oid))
    }

    async fn execute_read(
        &self,
        oid: &HObject,
        op: OsdOp,
        stored: Option<StoredState>,
    ) -> Result<OpReply> {
        let Some(stored) = stored.filter(StoredState::visible) else {
            return Err(Error::not_found(oid));
        };

        let body = match op {
            OsdOp::Read { offset, len } => {
                ReplyBody::Data(self.backend.objects_read(oid, offset, len).await?)
            }
            OsdOp::Stat => ReplyBody::Stat(self.backend.objects_stat(oid).await?),
            OsdOp::GetAttr { key } => {
                if !is_user_attr(&key) {
                    return Err(Error::invalid_argument(format!("bad attribute name {key:?}")));
                }
                let value = self
                    .backend
                    .objects_get_attr(oid, &key)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("{oid} attribute {key}")))?;
                ReplyBody::Attr(value)
            }
            OsdOp::IsDirty => ReplyBody::Dirty(stored.state.dirty),
            other => {
                return Err(Error::inconsistency(format!("{} is not a read", other.name())));
            }
        };
        Ok(OpReply::new(body, stored.state.version))
    }

    async fn do_write(
        &self,
        oid: HObject,
        op: OsdOp,
        flags: OpFlags,
        snapc: SnapContext,
        route: Route,
    ) -> Result<OpReply> {
        if !oid.is_head() {
            return Err(Error::invalid_argument(format!(
                "{} must address the head of {}",
                op.name(),
                oid.name
            )));
        }
        if !snapc.is_valid() {
            return Err(Error::invalid_argument(format!("invalid snap context {snapc:?}")));
        }

        let ctx = self.contexts.get(&oid);
        for _ in 0..PROMOTE_RETRIES {
            ctx.cancel_try_flush();
            if route.cache_mode == CacheMode::Writeback {
                self.promote_if_missing(&oid).await?;
            }
            let guard = ctx.rwlock().write().await;
            // A try_flush may have started while we queued for the lock
            ctx.cancel_try_flush();

            let stored = self.load(&oid).await?;
            match (&stored, route.cache_mode) {
                (None, CacheMode::Writeback) => {}
                (None, CacheMode::Forward) => {
                    drop(guard);
                    return self.forward(oid, op, flags).await;
                }
                _ => return self.execute_write(&oid, op, stored, &snapc, route).await,
            }
        }
        Err(Error::busy(&oid))
    }

    async fn execute_write(
        &self,
        oid: &HObject,
        op: OsdOp,
        stored: Option<StoredState>,
        snapc: &SnapContext,
        route: Route,
    ) -> Result<OpReply> {
        if matches!(op, OsdOp::Undirty) {
            return self.undirty(oid, stored).await;
        }

        let visible = stored.as_ref().is_some_and(StoredState::visible);
        match &op {
            OsdOp::Create { exclusive: true } if visible => {
                return Err(Error::ObjectExists(oid.to_string()));
            }
            OsdOp::Remove if !visible => return Err(Error::not_found(oid)),
            OsdOp::SetAttr { key, .. } if !is_user_attr(key) => {
                return Err(Error::invalid_argument(format!("bad attribute name {key:?}")));
            }
            _ => {}
        }

        let now = self.now();
        let pool = self.pool_info()?;
        let before = stored.as_ref().map(|s| s.state);
        let current = before.unwrap_or(ObjectTierState {
            redirect: pool.tier_of,
            ..ObjectTierState::default()
        });
        let mut txn = Transaction::new();

        // Copy-on-write for snapshots taken since the last head write
        let mut snapset = self.load_snapset(oid).await?;
        let prior_seq = snapset.seq;
        let head_size = if visible {
            self.backend.objects_stat(oid).await?.size
        } else {
            0
        };
        let mut clone_state = None;
        if let Some(clone) = snapset.make_writeable(snapc, visible, head_size) {
            let clone_oid = oid.with_snap(clone.id);
            // A clone made in a cache tier exists nowhere else yet
            let state = if pool.is_tier() {
                ObjectTierState {
                    dirty: true,
                    ..current
                }
            } else {
                current
            };
            txn.clone_object(oid, &clone_oid)
                .set_attr(&clone_oid, TIER_STATE_ATTR, state.encode()?);
            clone_state = Some(state);
            debug!("pg {}: cloned {oid} to {clone_oid}", self.pgid);
        }
        let snapdir_changed = snapset.seq != prior_seq;
        if snapdir_changed {
            txn.set_attr(&oid.to_snapdir(), SNAPSET_ATTR, snapset.encode()?);
        }

        // A whiteout entry is replaced by a fresh object
        if stored.is_some() && !visible {
            txn.remove(oid);
        }

        let after = match op {
            OsdOp::Create { .. } => {
                txn.touch(oid);
                Some(current.written(now))
            }
            OsdOp::WriteFull { data } => {
                txn.write_full(oid, data);
                Some(current.written(now))
            }
            OsdOp::Write { offset, data } => {
                txn.write(oid, offset, data);
                Some(current.written(now))
            }
            OsdOp::Truncate { size } => {
                txn.truncate(oid, size);
                Some(current.written(now))
            }
            OsdOp::SetAttr { key, value } => {
                txn.set_attr(oid, &key, value);
                Some(current.written(now))
            }
            OsdOp::Remove if route.applies_cache() => {
                txn.remove(oid).touch(oid);
                Some(current.deleted(now))
            }
            OsdOp::Remove => {
                txn.remove(oid);
                let snapdir = oid.to_snapdir();
                if snapset.clones.is_empty()
                    && (snapdir_changed || self.backend.objects_exists(&snapdir).await?)
                {
                    txn.remove(&snapdir);
                }
                None
            }
            other => {
                return Err(Error::inconsistency(format!("{} is not a write", other.name())));
            }
        };
        if let Some(state) = &after {
            txn.set_attr(oid, TIER_STATE_ATTR, state.encode()?);
        }

        self.backend.submit_transaction(txn).await?;
        self.stats.account(None, clone_state.as_ref());
        self.stats.account(before.as_ref(), after.as_ref());
        Ok(OpReply::ok(after.map_or(0, |s| s.version)))
    }

    async fn undirty(&self, oid: &HObject, stored: Option<StoredState>) -> Result<OpReply> {
        let Some(stored) = stored else {
            return Ok(OpReply::ok(0));
        };
        if !stored.state.dirty {
            return Ok(OpReply::ok(stored.state.version));
        }

        let clean = stored.state.cleaned();
        let mut txn = Transaction::new();
        txn.set_attr(oid, TIER_STATE_ATTR, clean.encode()?);
        self.backend.submit_transaction(txn).await?;
        self.stats.account(Some(&stored.state), Some(&clean));
        Ok(OpReply::ok(clean.version))
    }
}
