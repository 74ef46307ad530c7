//! Flush and eviction of cache tier objects
//!
//! A flush copies a dirty object to the base tier and then marks it clean
//! with a compare-and-swap on its tier state, so a write that lands during
//! the copy keeps the object dirty. Dirty clones are flushed ahead of their
//! head, oldest first.
//!
//! A blocking flush holds the object read lock for the whole copy, so
//! writes wait for it. A try-flush drops the lock before the copy; any
//! write cancels it, and a canceled try-flush reports `Busy`.

use super::{PlacementGroup, StoredState};
use crate::lock::{FlushOp, FlushOutcome, FlushRegistration, ObjectContext};
use crate::op::{CopiedObject, OpReply, OpRequest, OsdOp};
use crate::router::OpFlags;
use crate::snap::SNAPSET_ATTR;
use crate::state::{ObjectTierState, TIER_STATE_ATTR};
use objectio_common::{Error, HObject, Result};
use objectio_storage::Transaction;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;

fn flush_outcome(result: &Result<OpReply>) -> FlushOutcome {
    match result {
        Ok(_) => FlushOutcome::Flushed,
        Err(Error::Busy(_)) => FlushOutcome::Canceled,
        Err(e) => FlushOutcome::Failed(e.to_string()),
    }
}

impl PlacementGroup {
    /// Flush `oid`, waiting for locks; joins a blocking flush in progress
    pub async fn cache_flush(&self, oid: &HObject) -> Result<OpReply> {
        let ctx = self.contexts.get(oid);
        loop {
            match ctx.register_flush(true) {
                FlushRegistration::Leader(op) => {
                    let result = self.flush_locked(&ctx, oid).await;
                    ctx.finish_flush(&op, flush_outcome(&result));
                    return result;
                }
                FlushRegistration::Joined(op) => {
                    if op.wait().await == FlushOutcome::Flushed {
                        return self.current_version(oid).await;
                    }
                    // The flush we joined failed; run our own
                }
            }
        }
    }

    /// Flush `oid` unless something else holds or wants it
    pub async fn cache_try_flush(&self, oid: &HObject, skip_rw_locks: bool) -> Result<OpReply> {
        let ctx = self.contexts.get(oid);
        let op = match ctx.register_flush(false) {
            FlushRegistration::Leader(op) => op,
            FlushRegistration::Joined(op) => {
                return match op.wait().await {
                    FlushOutcome::Flushed => self.current_version(oid).await,
                    _ => Err(Error::busy(oid)),
                };
            }
        };

        let result = self.flush_unlocked(&ctx, &op, oid, skip_rw_locks).await;
        ctx.finish_flush(&op, flush_outcome(&result));
        result
    }

    async fn current_version(&self, oid: &HObject) -> Result<OpReply> {
        let version = self.load(oid).await?.map_or(0, |s| s.state.version);
        Ok(OpReply::ok(version))
    }

    async fn flush_locked(&self, ctx: &ObjectContext, oid: &HObject) -> Result<OpReply> {
        let _guard = ctx.rwlock().read().await;
        let stored = self.load(oid).await?.ok_or_else(|| Error::not_found(oid))?;
        if !stored.state.dirty {
            return Ok(OpReply::ok(stored.state.version));
        }
        if oid.is_head() {
            self.flush_clones(oid).await?;
        }

        let copied = self.snapshot_object(oid, &stored).await?;
        let _copy = ctx.copy_lock().lock().await;
        self.copy_out(oid, copied).await?;
        self.mark_clean(oid, &stored).await
    }

    async fn flush_unlocked(
        &self,
        ctx: &ObjectContext,
        op: &Arc<FlushOp>,
        oid: &HObject,
        skip_rw_locks: bool,
    ) -> Result<OpReply> {
        let (stored, copied) = {
            let _guard = if skip_rw_locks {
                None
            } else {
                Some(ctx.rwlock().try_read().map_err(|_| Error::busy(oid))?)
            };
            let stored = self.load(oid).await?.ok_or_else(|| Error::not_found(oid))?;
            if !stored.state.dirty {
                return Ok(OpReply::ok(stored.state.version));
            }
            let copied = self.snapshot_object(oid, &stored).await?;
            (stored, copied)
        };

        // Clones go out only once the head is known to be dirty and unlocked
        if oid.is_head() {
            if op.is_canceled() {
                return Err(Error::busy(oid));
            }
            self.flush_clones(oid).await?;
        }

        let _copy = ctx.copy_lock().lock().await;
        if op.is_canceled() {
            return Err(Error::busy(oid));
        }
        self.copy_out(oid, copied).await?;
        if op.is_canceled() {
            return Err(Error::busy(oid));
        }
        match self.mark_clean(oid, &stored).await {
            Err(Error::CompareMismatch { .. }) => Err(Error::busy(oid)),
            other => other,
        }
    }

    /// Flush the dirty clones of `head`, oldest first
    async fn flush_clones(&self, head: &HObject) -> Result<()> {
        let snapset = self.load_snapset(head).await?;
        for clone in snapset.clone_oids(head) {
            let ctx = self.contexts.get(&clone);
            let _copy = ctx.copy_lock().lock().await;
            let Some(stored) = self.load(&clone).await? else {
                continue;
            };
            if !stored.state.dirty {
                continue;
            }
            let copied = self.snapshot_object(&clone, &stored).await?;
            self.copy_out(&clone, copied).await?;
            self.mark_clean(&clone, &stored).await?;
        }
        Ok(())
    }

    async fn copy_out(&self, oid: &HObject, copied: CopiedObject) -> Result<()> {
        let base = self.base_pool()?;
        debug!(
            "pg {}: flushing {oid} version {} to pool {base}",
            self.pgid, copied.version
        );
        let req = OpRequest::new(oid.clone(), OsdOp::CopyFrom(Box::new(copied)))
            .with_flags(OpFlags::INTERNAL);
        self.dispatch(base, req).await?;
        Ok(())
    }

    /// Clear the dirty flag if the tier state is still what was flushed
    async fn mark_clean(&self, oid: &HObject, flushed: &StoredState) -> Result<OpReply> {
        let clean = flushed.state.cleaned();
        let mut txn = Transaction::new();
        txn.assert_attr(oid, TIER_STATE_ATTR, flushed.raw.clone())
            .set_attr(oid, TIER_STATE_ATTR, clean.encode()?);
        self.backend.submit_transaction(txn).await?;

        self.stats.account(Some(&flushed.state), Some(&clean));
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(OpReply::ok(clean.version))
    }

    /// Install a revision sent by a cache tier flush
    pub(super) async fn copy_from(&self, oid: &HObject, copied: CopiedObject) -> Result<OpReply> {
        let ctx = self.contexts.get(oid);
        let _guard = ctx.rwlock().write().await;
        let before = self.load(oid).await?;
        let exists = self.backend.objects_exists(oid).await?;

        let mut txn = Transaction::new();
        if exists {
            txn.remove(oid);
        }
        let after = match copied.data {
            Some(data) => {
                let state = ObjectTierState {
                    version: copied.version,
                    mtime: self.now(),
                    ..Default::default()
                };
                txn.write_full(oid, data);
                for (key, value) in copied.attrs {
                    txn.set_attr(oid, &key, value);
                }
                txn.set_attr(oid, TIER_STATE_ATTR, state.encode()?);
                Some(state)
            }
            None => None,
        };
        if oid.is_head()
            && let Some(snapset) = &copied.snapset
        {
            txn.set_attr(&oid.to_snapdir(), SNAPSET_ATTR, snapset.encode()?);
        }

        if !txn.is_empty() {
            self.backend.submit_transaction(txn).await?;
        }
        self.stats
            .account(before.as_ref().map(|s| &s.state), after.as_ref());
        Ok(OpReply::ok(copied.version))
    }

    /// Drop a clean object from the cache tier
    pub async fn cache_evict(&self, oid: &HObject) -> Result<OpReply> {
        let ctx = self.contexts.get(oid);
        if ctx.promote_in_progress() || ctx.flush_in_progress() {
            return Err(Error::busy(oid));
        }
        let _guard = ctx.rwlock().try_write().map_err(|_| Error::busy(oid))?;

        let stored = self.load(oid).await?.ok_or_else(|| Error::not_found(oid))?;
        if stored.state.dirty {
            return Err(Error::busy(oid));
        }

        let mut txn = Transaction::new();
        txn.remove(oid);
        if oid.is_head() {
            let snapset = self.load_snapset(oid).await?;
            for clone in snapset.clone_oids(oid) {
                if self.backend.objects_exists(&clone).await? {
                    return Err(Error::busy(oid));
                }
            }
            let snapdir = oid.to_snapdir();
            if self.backend.objects_exists(&snapdir).await? {
                txn.remove(&snapdir);
            }
        }
        self.backend.submit_transaction(txn).await?;

        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        debug!("pg {}: evicted {oid}", self.pgid);
        Ok(OpReply::ok(stored.state.version))
    }
}
