//! Object store interface
//!
//! The tiering layer talks to local storage exclusively through
//! [`ObjectStore`]. Reads are individual calls; every mutation goes through
//! an atomic [`Transaction`] so that metadata updates (tier state,
//! snapshot sets) land together with the data they describe.

use async_trait::async_trait;
use bytes::Bytes;
use objectio_common::{HObject, Result};
use std::collections::BTreeMap;

/// Extended attributes of one object
pub type Attrs = BTreeMap<String, Bytes>;

/// Size information for one object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
}

/// Aggregate usage of a store (user objects only)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub objects: u64,
    pub bytes: u64,
}

/// One mutation inside a transaction
#[derive(Clone, Debug, PartialEq)]
pub enum TxnOp {
    /// Create an empty object if absent
    Touch { oid: HObject },
    /// Replace the object data, creating the object if absent
    WriteFull { oid: HObject, data: Bytes },
    /// Write at an offset, zero-filling any gap
    Write {
        oid: HObject,
        offset: u64,
        data: Bytes,
    },
    /// Set the object size, creating the object if absent
    Truncate { oid: HObject, size: u64 },
    /// Remove the object; fails if absent
    Remove { oid: HObject },
    /// Copy data and attributes of `src` over `dst`
    Clone { src: HObject, dst: HObject },
    /// Set an attribute, creating the object if absent
    SetAttr {
        oid: HObject,
        key: String,
        value: Bytes,
    },
    /// Remove an attribute; fails if the object is absent
    RmAttr { oid: HObject, key: String },
    /// Abort the transaction unless the attribute currently equals `expected`
    /// (`None` meaning the object or attribute is absent)
    AssertAttr {
        oid: HObject,
        key: String,
        expected: Option<Bytes>,
    },
    /// Abort the transaction if the object exists
    AssertAbsent { oid: HObject },
}

impl TxnOp {
    /// Object this op mutates or inspects
    #[must_use]
    pub const fn oid(&self) -> &HObject {
        match self {
            Self::Touch { oid }
            | Self::WriteFull { oid, .. }
            | Self::Write { oid, .. }
            | Self::Truncate { oid, .. }
            | Self::Remove { oid }
            | Self::SetAttr { oid, .. }
            | Self::RmAttr { oid, .. }
            | Self::AssertAttr { oid, .. }
            | Self::AssertAbsent { oid } => oid,
            Self::Clone { dst, .. } => dst,
        }
    }

    /// Whether the op modifies object data (as opposed to attributes)
    #[must_use]
    pub const fn is_partial_write(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Truncate { .. })
    }
}

/// An ordered batch of mutations applied all-or-nothing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: TxnOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn touch(&mut self, oid: &HObject) -> &mut Self {
        self.push(TxnOp::Touch { oid: oid.clone() })
    }

    pub fn write_full(&mut self, oid: &HObject, data: Bytes) -> &mut Self {
        self.push(TxnOp::WriteFull {
            oid: oid.clone(),
            data,
        })
    }

    pub fn write(&mut self, oid: &HObject, offset: u64, data: Bytes) -> &mut Self {
        self.push(TxnOp::Write {
            oid: oid.clone(),
            offset,
            data,
        })
    }

    pub fn truncate(&mut self, oid: &HObject, size: u64) -> &mut Self {
        self.push(TxnOp::Truncate {
            oid: oid.clone(),
            size,
        })
    }

    pub fn remove(&mut self, oid: &HObject) -> &mut Self {
        self.push(TxnOp::Remove { oid: oid.clone() })
    }

    pub fn clone_object(&mut self, src: &HObject, dst: &HObject) -> &mut Self {
        self.push(TxnOp::Clone {
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    pub fn set_attr(&mut self, oid: &HObject, key: &str, value: Bytes) -> &mut Self {
        self.push(TxnOp::SetAttr {
            oid: oid.clone(),
            key: key.to_string(),
            value,
        })
    }

    pub fn rm_attr(&mut self, oid: &HObject, key: &str) -> &mut Self {
        self.push(TxnOp::RmAttr {
            oid: oid.clone(),
            key: key.to_string(),
        })
    }

    pub fn assert_attr(&mut self, oid: &HObject, key: &str, expected: Option<Bytes>) -> &mut Self {
        self.push(TxnOp::AssertAttr {
            oid: oid.clone(),
            key: key.to_string(),
            expected,
        })
    }

    pub fn assert_absent(&mut self, oid: &HObject) -> &mut Self {
        self.push(TxnOp::AssertAbsent { oid: oid.clone() })
    }

    #[must_use]
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

impl IntoIterator for Transaction {
    type Item = TxnOp;
    type IntoIter = std::vec::IntoIter<TxnOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Local object storage used by a placement group
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read `len` bytes at `offset` (`None` reads to the end)
    async fn read(&self, oid: &HObject, offset: u64, len: Option<u64>) -> Result<Bytes>;

    /// Object size; `ObjectNotFound` if absent
    async fn stat(&self, oid: &HObject) -> Result<ObjectStat>;

    /// One attribute; `Ok(None)` if the object exists without it
    async fn get_attr(&self, oid: &HObject, key: &str) -> Result<Option<Bytes>>;

    /// All attributes of an existing object
    async fn get_attrs(&self, oid: &HObject) -> Result<Attrs>;

    /// Whether the object exists
    async fn exists(&self, oid: &HObject) -> Result<bool>;

    /// Apply a transaction atomically
    async fn submit(&self, txn: Transaction) -> Result<()>;

    /// Objects strictly after `after`, in key order, at most `max`
    async fn list(&self, after: Option<&HObject>, max: usize) -> Result<Vec<HObject>>;

    /// Current usage
    fn usage(&self) -> StoreUsage;

    /// Replace the object data
    async fn write_full(&self, oid: &HObject, data: Bytes) -> Result<()> {
        let mut txn = Transaction::new();
        txn.write_full(oid, data);
        self.submit(txn).await
    }

    /// Remove the object
    async fn remove(&self, oid: &HObject) -> Result<()> {
        let mut txn = Transaction::new();
        txn.remove(oid);
        self.submit(txn).await
    }

    /// Set one attribute
    async fn set_attr(&self, oid: &HObject, key: &str, value: Bytes) -> Result<()> {
        let mut txn = Transaction::new();
        txn.set_attr(oid, key, value);
        self.submit(txn).await
    }

    /// Replace an attribute only if it currently equals `expected`
    async fn compare_and_swap_attr(
        &self,
        oid: &HObject,
        key: &str,
        expected: Option<Bytes>,
        value: Bytes,
    ) -> Result<()> {
        let mut txn = Transaction::new();
        txn.assert_attr(oid, key, expected).set_attr(oid, key, value);
        self.submit(txn).await
    }
}
