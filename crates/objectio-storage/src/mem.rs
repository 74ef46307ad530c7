//! In-memory object store
//!
//! `MemStore` keeps objects in an ordered map behind a `parking_lot`
//! lock. Transactions are staged against a private copy of the touched
//! objects and published in one step, so a failing op leaves no trace.

use crate::gate::{IoGate, IoKind};
use crate::store::{Attrs, ObjectStat, ObjectStore, StoreUsage, Transaction, TxnOp};
use async_trait::async_trait;
use bytes::Bytes;
use objectio_common::{Error, HObject, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Clone, Debug, Default)]
struct StoredObject {
    data: Vec<u8>,
    attrs: Attrs,
}

/// Store I/O statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Data reads served
    pub reads: AtomicU64,
    /// Attribute and stat lookups served
    pub lookups: AtomicU64,
    /// Transactions committed
    pub commits: AtomicU64,
    /// Transactions rejected
    pub aborts: AtomicU64,
    /// Bytes returned by reads
    pub bytes_read: AtomicU64,
    /// Bytes carried by committed data ops
    pub bytes_written: AtomicU64,
}

impl StoreStats {
    /// Reset all statistics
    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.lookups.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.aborts.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

/// In-memory [`ObjectStore`]
#[derive(Default)]
pub struct MemStore {
    objects: RwLock<BTreeMap<HObject, StoredObject>>,
    stats: StoreStats,
    gate: Option<Arc<IoGate>>,
    offline: AtomicBool,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose I/O passes through `gate`
    #[must_use]
    pub fn with_gate(gate: Arc<IoGate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Make every subsequent operation fail with an I/O error
    pub fn set_offline(&self, offline: bool) {
        if offline {
            warn!("store taken offline");
        }
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored objects, internal ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    async fn enter(&self, kind: IoKind) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.pass(kind).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::DiskIo(std::io::Error::other("store offline")));
        }
        Ok(())
    }

    fn lookup<T>(&self, oid: &HObject, f: impl FnOnce(&StoredObject) -> T) -> Result<T> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.read();
        objects
            .get(oid)
            .map(f)
            .ok_or_else(|| Error::not_found(oid))
    }

    fn apply(
        objects: &BTreeMap<HObject, StoredObject>,
        staged: &mut HashMap<HObject, Option<StoredObject>>,
        op: TxnOp,
    ) -> Result<u64> {
        fn slot<'a>(
            objects: &BTreeMap<HObject, StoredObject>,
            staged: &'a mut HashMap<HObject, Option<StoredObject>>,
            oid: &HObject,
        ) -> &'a mut Option<StoredObject> {
            staged
                .entry(oid.clone())
                .or_insert_with(|| objects.get(oid).cloned())
        }

        match op {
            TxnOp::Touch { oid } => {
                slot(objects, staged, &oid).get_or_insert_with(StoredObject::default);
                Ok(0)
            }
            TxnOp::WriteFull { oid, data } => {
                let obj = slot(objects, staged, &oid).get_or_insert_with(StoredObject::default);
                obj.data = data.to_vec();
                Ok(data.len() as u64)
            }
            TxnOp::Write { oid, offset, data } => {
                let obj = slot(objects, staged, &oid).get_or_insert_with(StoredObject::default);
                let start = usize::try_from(offset)
                    .map_err(|_| Error::invalid_argument(format!("offset {offset} too large")))?;
                let end = start + data.len();
                if obj.data.len() < end {
                    obj.data.resize(end, 0);
                }
                obj.data[start..end].copy_from_slice(&data);
                Ok(data.len() as u64)
            }
            TxnOp::Truncate { oid, size } => {
                let obj = slot(objects, staged, &oid).get_or_insert_with(StoredObject::default);
                let size = usize::try_from(size)
                    .map_err(|_| Error::invalid_argument(format!("size {size} too large")))?;
                obj.data.resize(size, 0);
                Ok(0)
            }
            TxnOp::Remove { oid } => {
                let entry = slot(objects, staged, &oid);
                if entry.take().is_none() {
                    return Err(Error::not_found(&oid));
                }
                Ok(0)
            }
            TxnOp::Clone { src, dst } => {
                let source = slot(objects, staged, &src)
                    .clone()
                    .ok_or_else(|| Error::not_found(&src))?;
                let bytes = source.data.len() as u64;
                *slot(objects, staged, &dst) = Some(source);
                Ok(bytes)
            }
            TxnOp::SetAttr { oid, key, value } => {
                let obj = slot(objects, staged, &oid).get_or_insert_with(StoredObject::default);
                obj.attrs.insert(key, value);
                Ok(0)
            }
            TxnOp::RmAttr { oid, key } => {
                let obj = slot(objects, staged, &oid)
                    .as_mut()
                    .ok_or_else(|| Error::not_found(&oid))?;
                obj.attrs.remove(&key);
                Ok(0)
            }
            TxnOp::AssertAttr { oid, key, expected } => {
                let current = slot(objects, staged, &oid)
                    .as_ref()
                    .and_then(|obj| obj.attrs.get(&key));
                if current != expected.as_ref() {
                    return Err(Error::CompareMismatch {
                        object: oid.to_string(),
                        attr: key,
                    });
                }
                Ok(0)
            }
            TxnOp::AssertAbsent { oid } => {
                if slot(objects, staged, &oid).is_some() {
                    return Err(Error::ObjectExists(oid.to_string()));
                }
                Ok(0)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn read(&self, oid: &HObject, offset: u64, len: Option<u64>) -> Result<Bytes> {
        self.enter(IoKind::Read).await?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);

        let objects = self.objects.read();
        let obj = objects.get(oid).ok_or_else(|| Error::not_found(oid))?;
        let size = obj.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(size);
        let end = match len {
            Some(len) => start.saturating_add(usize::try_from(len).unwrap_or(usize::MAX)),
            None => size,
        }
        .min(size);

        self.stats
            .bytes_read
            .fetch_add((end - start) as u64, Ordering::Relaxed);
        Ok(Bytes::copy_from_slice(&obj.data[start..end]))
    }

    async fn stat(&self, oid: &HObject) -> Result<ObjectStat> {
        self.enter(IoKind::Read).await?;
        self.lookup(oid, |obj| ObjectStat {
            size: obj.data.len() as u64,
        })
    }

    async fn get_attr(&self, oid: &HObject, key: &str) -> Result<Option<Bytes>> {
        self.enter(IoKind::Read).await?;
        self.lookup(oid, |obj| obj.attrs.get(key).cloned())
    }

    async fn get_attrs(&self, oid: &HObject) -> Result<Attrs> {
        self.enter(IoKind::Read).await?;
        self.lookup(oid, |obj| obj.attrs.clone())
    }

    async fn exists(&self, oid: &HObject) -> Result<bool> {
        self.enter(IoKind::Read).await?;
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.read().contains_key(oid))
    }

    async fn submit(&self, txn: Transaction) -> Result<()> {
        self.enter(IoKind::Write).await?;

        let mut objects = self.objects.write();
        let mut staged = HashMap::new();
        let mut bytes = 0;
        for op in txn {
            match Self::apply(&objects, &mut staged, op) {
                Ok(n) => bytes += n,
                Err(e) => {
                    debug!("transaction aborted: {e}");
                    self.stats.aborts.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        for (oid, obj) in staged {
            match obj {
                Some(obj) => {
                    objects.insert(oid, obj);
                }
                None => {
                    objects.remove(&oid);
                }
            }
        }
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    async fn list(&self, after: Option<&HObject>, max: usize) -> Result<Vec<HObject>> {
        self.enter(IoKind::Read).await?;
        let objects = self.objects.read();
        let iter: Box<dyn Iterator<Item = &HObject>> = match after {
            Some(after) => Box::new(
                objects
                    .range::<HObject, _>((
                        std::ops::Bound::Excluded(after),
                        std::ops::Bound::Unbounded,
                    ))
                    .map(|(k, _)| k),
            ),
            None => Box::new(objects.keys()),
        };
        Ok(iter.take(max).cloned().collect())
    }

    fn usage(&self) -> StoreUsage {
        let objects = self.objects.read();
        objects
            .iter()
            .filter(|(oid, _)| !oid.is_internal())
            .fold(StoreUsage::default(), |mut usage, (_, obj)| {
                usage.objects += 1;
                usage.bytes += obj.data.len() as u64;
                usage
            })
    }
}
