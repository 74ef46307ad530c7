//! Placement group backends
//!
//! The tiering core reads and mutates objects only through [`PgBackend`].
//! Two variants exist:
//!
//! - [`ReplicatedBackend`]: applies every transaction to the primary and
//!   then to each replica. A replica that fails a write is recorded as
//!   missing the affected objects and repaired later by `recover_object`
//!   or `on_change`; the client write still succeeds.
//! - [`ErasureCodedBackend`]: whole-object writes only. Partial overwrites
//!   and truncates are rejected, which keeps such pools out of cache tiers.

use async_trait::async_trait;
use bytes::Bytes;
use objectio_common::config::BackendKind;
use objectio_common::{Error, HObject, Result};
use objectio_storage::{Attrs, ObjectStat, ObjectStore, StoreUsage, Transaction};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage capability consumed by a placement group
#[async_trait]
pub trait PgBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn objects_read(&self, oid: &HObject, offset: u64, len: Option<u64>) -> Result<Bytes>;

    async fn objects_stat(&self, oid: &HObject) -> Result<ObjectStat>;

    async fn objects_get_attr(&self, oid: &HObject, key: &str) -> Result<Option<Bytes>>;

    async fn objects_get_attrs(&self, oid: &HObject) -> Result<Attrs>;

    async fn objects_exists(&self, oid: &HObject) -> Result<bool>;

    async fn objects_list(&self, after: Option<&HObject>, max: usize) -> Result<Vec<HObject>>;

    /// Apply a transaction atomically on the authoritative copy
    async fn submit_transaction(&self, txn: Transaction) -> Result<()>;

    /// Bring every copy of `oid` in line with the authoritative one
    async fn recover_object(&self, oid: &HObject) -> Result<()>;

    /// React to a pool map change; returns the number of objects repaired
    async fn on_change(&self) -> Result<usize>;

    fn usage(&self) -> StoreUsage;
}

/// Primary-copy replication over one store per replica
pub struct ReplicatedBackend {
    primary: Arc<dyn ObjectStore>,
    replicas: Vec<Arc<dyn ObjectStore>>,
    /// Objects each replica (by index) is known to lack or hold stale
    missing: Mutex<BTreeMap<HObject, BTreeSet<usize>>>,
}

impl ReplicatedBackend {
    #[must_use]
    pub fn new(primary: Arc<dyn ObjectStore>, replicas: Vec<Arc<dyn ObjectStore>>) -> Self {
        Self {
            primary,
            replicas,
            missing: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of (object, replica) pairs awaiting recovery
    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.missing.lock().values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn is_missing(&self, oid: &HObject) -> bool {
        self.missing.lock().contains_key(oid)
    }

    fn mark_missing(&self, replica: usize, txn: &Transaction) {
        let mut missing = self.missing.lock();
        for op in txn.ops() {
            missing.entry(op.oid().clone()).or_default().insert(replica);
        }
    }

    fn lagging(&self, replica: usize, txn: &Transaction) -> bool {
        let missing = self.missing.lock();
        txn.ops()
            .iter()
            .any(|op| missing.get(op.oid()).is_some_and(|r| r.contains(&replica)))
    }

    async fn repair(&self, oid: &HObject, replica: usize) -> Result<()> {
        let target = self
            .replicas
            .get(replica)
            .ok_or_else(|| Error::inconsistency(format!("replica {replica} out of range")))?;

        let mut txn = Transaction::new();
        if target.exists(oid).await? {
            txn.remove(oid);
        }
        if self.primary.exists(oid).await? {
            let data = self.primary.read(oid, 0, None).await?;
            let attrs = self.primary.get_attrs(oid).await?;
            txn.write_full(oid, data);
            for (key, value) in attrs {
                txn.set_attr(oid, &key, value);
            }
        }
        if !txn.is_empty() {
            target.submit(txn).await?;
        }
        debug!("recovered {oid} on replica {replica}");
        Ok(())
    }
}

#[async_trait]
impl PgBackend for ReplicatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Replicated
    }

    async fn objects_read(&self, oid: &HObject, offset: u64, len: Option<u64>) -> Result<Bytes> {
        self.primary.read(oid, offset, len).await
    }

    async fn objects_stat(&self, oid: &HObject) -> Result<ObjectStat> {
        self.primary.stat(oid).await
    }

    async fn objects_get_attr(&self, oid: &HObject, key: &str) -> Result<Option<Bytes>> {
        self.primary.get_attr(oid, key).await
    }

    async fn objects_get_attrs(&self, oid: &HObject) -> Result<Attrs> {
        self.primary.get_attrs(oid).await
    }

    async fn objects_exists(&self, oid: &HObject) -> Result<bool> {
        self.primary.exists(oid).await
    }

    async fn objects_list(&self, after: Option<&HObject>, max: usize) -> Result<Vec<HObject>> {
        self.primary.list(after, max).await
    }

    async fn submit_transaction(&self, txn: Transaction) -> Result<()> {
        self.primary.submit(txn.clone()).await?;

        for (i, replica) in self.replicas.iter().enumerate() {
            if self.lagging(i, &txn) {
                self.mark_missing(i, &txn);
                continue;
            }
            if let Err(e) = replica.submit(txn.clone()).await {
                warn!("replica {i} failed a write, marking objects missing: {e}");
                self.mark_missing(i, &txn);
            }
        }
        Ok(())
    }

    async fn recover_object(&self, oid: &HObject) -> Result<()> {
        let replicas = self.missing.lock().get(oid).cloned().unwrap_or_default();
        for replica in replicas {
            self.repair(oid, replica).await?;
            let mut missing = self.missing.lock();
            if let Some(set) = missing.get_mut(oid) {
                set.remove(&replica);
                if set.is_empty() {
                    missing.remove(oid);
                }
            }
        }
        Ok(())
    }

    async fn on_change(&self) -> Result<usize> {
        let pending: Vec<HObject> = self.missing.lock().keys().cloned().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut recovered = 0;
        for oid in &pending {
            match self.recover_object(oid).await {
                Ok(()) => recovered += 1,
                Err(e) => warn!("recovery of {oid} failed: {e}"),
            }
        }
        info!("recovered {recovered}/{} objects after map change", pending.len());
        Ok(recovered)
    }

    fn usage(&self) -> StoreUsage {
        self.primary.usage()
    }
}

/// Single-store erasure-coded backend supporting whole-object writes only
pub struct ErasureCodedBackend {
    store: Arc<dyn ObjectStore>,
}

impl ErasureCodedBackend {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PgBackend for ErasureCodedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ErasureCoded
    }

    async fn objects_read(&self, oid: &HObject, offset: u64, len: Option<u64>) -> Result<Bytes> {
        self.store.read(oid, offset, len).await
    }

    async fn objects_stat(&self, oid: &HObject) -> Result<ObjectStat> {
        self.store.stat(oid).await
    }

    async fn objects_get_attr(&self, oid: &HObject, key: &str) -> Result<Option<Bytes>> {
        self.store.get_attr(oid, key).await
    }

    async fn objects_get_attrs(&self, oid: &HObject) -> Result<Attrs> {
        self.store.get_attrs(oid).await
    }

    async fn objects_exists(&self, oid: &HObject) -> Result<bool> {
        self.store.exists(oid).await
    }

    async fn objects_list(&self, after: Option<&HObject>, max: usize) -> Result<Vec<HObject>> {
        self.store.list(after, max).await
    }

    async fn submit_transaction(&self, txn: Transaction) -> Result<()> {
        if let Some(op) = txn.ops().iter().find(|op| op.is_partial_write()) {
            return Err(Error::not_implemented(format!(
                "partial overwrite of {} on an erasure-coded pool",
                op.oid()
            )));
        }
        self.store.submit(txn).await
    }

    async fn recover_object(&self, _oid: &HObject) -> Result<()> {
        Ok(())
    }

    async fn on_change(&self) -> Result<usize> {
        Ok(0)
    }

    fn usage(&self) -> StoreUsage {
        self.store.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectio_storage::MemStore;

    fn replicated(n: usize) -> (ReplicatedBackend, Arc<MemStore>, Vec<Arc<MemStore>>) {
        let primary = Arc::new(MemStore::new());
        let replicas: Vec<Arc<MemStore>> = (0..n).map(|_| Arc::new(MemStore::new())).collect();
        let backend = ReplicatedBackend::new(
            primary.clone(),
            replicas
                .iter()
                .map(|r| r.clone() as Arc<dyn ObjectStore>)
                .collect(),
        );
        (backend, primary, replicas)
    }

    #[tokio::test]
    async fn test_replicated_write_reaches_every_copy() {
        let (backend, primary, replicas) = replicated(2);
        let oid = HObject::head("foo");
        let mut txn = Transaction::new();
        txn.write_full(&oid, Bytes::from_static(b"data"))
            .set_attr(&oid, "k", Bytes::from_static(b"v"));
        backend.submit_transaction(txn).await.unwrap();

        assert_eq!(primary.read(&oid, 0, None).await.unwrap(), "data");
        for replica in &replicas {
            assert_eq!(replica.read(&oid, 0, None).await.unwrap(), "data");
        }
        assert_eq!(backend.missing_count(), 0);
    }

    #[tokio::test]
    async fn test_degraded_write_and_recovery() {
        let (backend, _, replicas) = replicated(2);
        let oid = HObject::head("foo");

        replicas[1].set_offline(true);
        backend
            .submit_transaction({
                let mut txn = Transaction::new();
                txn.write_full(&oid, Bytes::from_static(b"v1"));
                txn
            })
            .await
            .unwrap();
        assert!(backend.is_missing(&oid));

        // Later writes skip the lagging replica even once it is back
        replicas[1].set_offline(false);
        backend
            .submit_transaction({
                let mut txn = Transaction::new();
                txn.write(&oid, 2, Bytes::from_static(b"v2"));
                txn
            })
            .await
            .unwrap();
        assert!(!replicas[1].exists(&oid).await.unwrap());

        assert_eq!(backend.on_change().await.unwrap(), 1);
        assert_eq!(backend.missing_count(), 0);
        assert_eq!(replicas[1].read(&oid, 0, None).await.unwrap(), "v1v2");
        assert_eq!(replicas[0].read(&oid, 0, None).await.unwrap(), "v1v2");
    }

    #[tokio::test]
    async fn test_recovery_propagates_removal() {
        let (backend, _, replicas) = replicated(1);
        let oid = HObject::head("foo");
        let mut txn = Transaction::new();
        txn.write_full(&oid, Bytes::from_static(b"x"));
        backend.submit_transaction(txn).await.unwrap();

        replicas[0].set_offline(true);
        let mut txn = Transaction::new();
        txn.remove(&oid);
        backend.submit_transaction(txn).await.unwrap();
        replicas[0].set_offline(false);
        assert!(replicas[0].exists(&oid).await.unwrap());

        backend.recover_object(&oid).await.unwrap();
        assert!(!replicas[0].exists(&oid).await.unwrap());
    }

    #[tokio::test]
    async fn test_primary_failure_fails_the_write() {
        let (backend, primary, _) = replicated(1);
        primary.set_offline(true);
        let mut txn = Transaction::new();
        txn.touch(&HObject::head("foo"));
        assert!(matches!(
            backend.submit_transaction(txn).await,
            Err(Error::DiskIo(_))
        ));
    }

    #[tokio::test]
    async fn test_erasure_coded_rejects_partial_writes() {
        let backend = ErasureCodedBackend::new(Arc::new(MemStore::new()));
        let oid = HObject::head("foo");

        let mut txn = Transaction::new();
        txn.write_full(&oid, Bytes::from_static(b"whole"));
        backend.submit_transaction(txn).await.unwrap();

        let mut txn = Transaction::new();
        txn.write(&oid, 1, Bytes::from_static(b"x"));
        assert!(matches!(
            backend.submit_transaction(txn).await,
            Err(Error::NotImplemented(_))
        ));

        let mut txn = Transaction::new();
        txn.truncate(&oid, 1);
        assert!(backend.submit_transaction(txn).await.is_err());
        assert_eq!(backend.objects_read(&oid, 0, None).await.unwrap(), "whole");
    }
}
