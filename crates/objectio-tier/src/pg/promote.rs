//! Promotion of objects from the base tier into a cache tier
//!
//! At most one copy runs per object at a time. Concurrent misses join the
//! in-flight promotion and observe its outcome instead of issuing their
//! own base reads.

use super::{PlacementGroup, StoredState};
use crate::lock::PromoteOutcome;
use crate::op::{CopiedObject, OpReply, OpRequest, OsdOp, ReplyBody};
use crate::router::OpFlags;
use crate::snap::SNAPSET_ATTR;
use crate::state::{ObjectTierState, TIER_STATE_ATTR};
use objectio_common::{Error, HObject, Result};
use objectio_storage::Transaction;
use std::sync::atomic::Ordering;
use tracing::debug;

impl PlacementGroup {
    /// Copy `oid` in from the base tier, joining a promotion in progress
    pub(super) async fn promote(&self, oid: &HObject) -> Result<PromoteOutcome> {
        let ctx = self.contexts.get(oid);
        let (flight, leader) = ctx.register_promote();
        if !leader {
            debug!("pg {}: waiting for promotion of {oid}", self.pgid);
            return Ok(flight.wait().await);
        }

        let result = self.copy_in(oid).await;
        let outcome = match &result {
            Ok(outcome) => outcome.clone(),
            Err(e) => PromoteOutcome::Failed(e.to_string()),
        };
        ctx.finish_promote(&flight, outcome);
        result
    }

    async fn copy_in(&self, oid: &HObject) -> Result<PromoteOutcome> {
        // A promotion that completed just before ours registered
        if self.backend.objects_exists(oid).await? {
            return Ok(PromoteOutcome::Promoted);
        }

        let base = self.base_pool()?;
        let req = OpRequest::new(oid.clone(), OsdOp::CopyGet).with_flags(OpFlags::INTERNAL);
        let reply = self.dispatch(base, req).await?;
        let ReplyBody::Copied(copied) = reply.body else {
            return Err(Error::inconsistency(format!(
                "copy-get of {oid} returned no object"
            )));
        };
        let CopiedObject {
            data,
            attrs,
            version,
            snapset,
        } = *copied;

        let now = self.now();
        let mut txn = Transaction::new();
        txn.assert_absent(oid);
        let (state, outcome) = match data {
            Some(data) => {
                txn.write_full(oid, data);
                for (key, value) in attrs {
                    txn.set_attr(oid, &key, value);
                }
                (
                    ObjectTierState::promoted(base, version, now),
                    PromoteOutcome::Promoted,
                )
            }
            None if oid.is_head() => {
                txn.touch(oid);
                (ObjectTierState::absent_in(base, now), PromoteOutcome::Whiteout)
            }
            None => {
                debug!("pg {}: clone {oid} does not exist in pool {base}", self.pgid);
                return Ok(PromoteOutcome::NotFound);
            }
        };
        txn.set_attr(oid, TIER_STATE_ATTR, state.encode()?);
        if oid.is_head()
            && let Some(snapset) = &snapset
        {
            txn.set_attr(&oid.to_snapdir(), SNAPSET_ATTR, snapset.encode()?);
        }

        match self.backend.submit_transaction(txn).await {
            Ok(()) => {}
            // Raced with a direct write of the same object
            Err(Error::ObjectExists(_)) => return Ok(PromoteOutcome::Promoted),
            Err(e) => return Err(e),
        }

        match outcome {
            PromoteOutcome::Whiteout => self.stats.whiteouts.fetch_add(1, Ordering::Relaxed),
            _ => self.stats.promotions.fetch_add(1, Ordering::Relaxed),
        };
        debug!(
            "pg {}: promoted {oid} from pool {base} at version {version} ({outcome:?})",
            self.pgid
        );
        Ok(outcome)
    }

    /// Serve a full copy of `oid` to a cache tier
    pub(super) async fn copy_get(&self, oid: &HObject) -> Result<OpReply> {
        let ctx = self.contexts.get(oid);
        let _guard = ctx.rwlock().read().await;
        let stored = self.load(oid).await?.unwrap_or(StoredState {
            state: ObjectTierState {
                whiteout: true,
                ..ObjectTierState::default()
            },
            raw: None,
        });
        let copied = self.snapshot_object(oid, &stored).await?;
        let version = copied.version;
        Ok(OpReply::new(ReplyBody::Copied(Box::new(copied)), version))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TieredCluster;
    use bytes::Bytes;
    use futures::future::join_all;
    use objectio_storage::IoKind;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_promote_on_read() {
        let t = TieredCluster::untiered().await;
        t.base_io.write_full("foo", Bytes::from_static(b"hi there")).await.unwrap();
        t.base_io.write_full("bar", Bytes::from_static(b"hi there")).await.unwrap();
        t.base_io.set_attr("bar", "color", Bytes::from_static(b"red")).await.unwrap();
        let bar_version = t.base_io.last_version();
        t.configure_tier().await;

        assert_eq!(t.base_io.read("foo", 0, Some(1)).await.unwrap(), "h");
        assert!(t.base_io.read("bam", 0, Some(1)).await.unwrap_err().is_not_found());
        assert_eq!(t.base_io.get_attr("bar", "color").await.unwrap(), "red");
        assert_eq!(t.base_io.last_version(), bar_version);

        // foo and bar promoted, bam left a whiteout
        assert_eq!(t.cache_io.list_objects().await.unwrap(), vec!["bam", "bar", "foo"]);
        assert!(!t.cache_io.is_dirty("foo").await.unwrap());
        let stats = t.cache_stats();
        assert_eq!(stats.promotions, 2);
        assert_eq!(stats.whiteouts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_promote_once() {
        let t = TieredCluster::untiered().await;
        t.base_io.write_full("foo", Bytes::from_static(b"hi there")).await.unwrap();
        t.configure_tier().await;
        t.base_store_stats().reads.store(0, Ordering::Relaxed);

        t.base_gate.close(IoKind::Read);
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let io = t.base_io.clone();
                tokio::spawn(async move { io.read("foo", 0, None).await })
            })
            .collect();
        t.base_gate.wait_parked(1).await;
        t.base_gate.open(IoKind::Read);

        for result in join_all(readers).await {
            assert_eq!(result.unwrap().unwrap(), "hi there");
        }
        assert_eq!(t.base_store_stats().reads.load(Ordering::Relaxed), 1);
        assert_eq!(t.cache_stats().promotions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_whiteout() {
        let t = TieredCluster::new().await;
        t.base_gate.close(IoKind::Read);
        let first = {
            let io = t.base_io.clone();
            tokio::spawn(async move { io.stat("nope").await })
        };
        t.base_gate.wait_parked(1).await;
        let second = {
            let io = t.base_io.clone();
            tokio::spawn(async move { io.read("nope", 0, None).await })
        };
        t.base_gate.open(IoKind::Read);

        assert!(first.await.unwrap().unwrap_err().is_not_found());
        assert!(second.await.unwrap().unwrap_err().is_not_found());
        assert_eq!(t.cache_stats().whiteouts, 1);
        assert_eq!(t.cache_io.list_objects().await.unwrap(), vec!["nope"]);
    }

    #[tokio::test]
    async fn test_failed_promotion_reaches_every_waiter() {
        let t = TieredCluster::untiered().await;
        t.base_io.write_full("foo", Bytes::from_static(b"x")).await.unwrap();
        t.configure_tier().await;

        t.base_gate.close(IoKind::Read);
        let first = {
            let io = t.base_io.clone();
            tokio::spawn(async move { io.read("foo", 0, None).await })
        };
        t.base_gate.wait_parked(1).await;
        let second = {
            let io = t.base_io.clone();
            tokio::spawn(async move { io.read("foo", 0, None).await })
        };
        t.base_store_offline(true);
        t.base_gate.open(IoKind::Read);

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert!(t.cache_io.list_objects().await.unwrap().is_empty());

        // The object is promoted once the base is reachable again
        t.base_store_offline(false);
        assert_eq!(t.base_io.read("foo", 0, None).await.unwrap(), "x");
    }
}
