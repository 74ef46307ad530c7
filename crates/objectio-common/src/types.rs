//! Core type definitions for ObjectIO
//!
//! This module defines the identifiers shared by the storage engine and the
//! tiering layer: pools, placement groups, snapshots and object names.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checksum::object_hash;

/// Namespace reserved for internal per-PG metadata objects
pub const INTERNAL_NAMESPACE: &str = ".objectio-internal";

/// Unique identifier for a pool
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
    Display,
)]
#[display("{_0}")]
pub struct PoolId(u64);

impl PoolId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Placement group identifier: a pool plus a hash-space seed
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PgId {
    pub pool: PoolId,
    pub seed: u32,
}

impl PgId {
    #[must_use]
    pub const fn new(pool: PoolId, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Debug for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgId({self})")
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

/// Snapshot identifier
///
/// Clones carry the id of the newest snapshot they were taken for. Two
/// reserved values sit at the top of the range: `NOSNAP` addresses the
/// writable head and `SNAPDIR` addresses the per-object snapshot directory.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, From, Into,
)]
pub struct SnapId(u64);

impl SnapId {
    pub const NOSNAP: Self = Self(u64::MAX - 1);
    pub const SNAPDIR: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this addresses a real snapshot rather than head or snapdir
    #[must_use]
    pub const fn is_snap(&self) -> bool {
        self.0 < Self::NOSNAP.0
    }
}

impl fmt::Debug for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapId({self})")
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOSNAP => f.write_str("head"),
            Self::SNAPDIR => f.write_str("snapdir"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

/// Identity of one stored object revision: namespace, name and snapshot
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HObject {
    pub namespace: String,
    pub name: String,
    pub snap: SnapId,
}

impl HObject {
    /// Head revision of a user object in the default namespace
    pub fn head(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
            snap: SnapId::NOSNAP,
        }
    }

    /// Internal metadata object, never visible in user listings
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            namespace: INTERNAL_NAMESPACE.to_string(),
            name: name.into(),
            snap: SnapId::NOSNAP,
        }
    }

    /// Same object at a different revision
    #[must_use]
    pub fn with_snap(&self, snap: SnapId) -> Self {
        Self {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            snap,
        }
    }

    #[must_use]
    pub fn to_head(&self) -> Self {
        self.with_snap(SnapId::NOSNAP)
    }

    #[must_use]
    pub fn to_snapdir(&self) -> Self {
        self.with_snap(SnapId::SNAPDIR)
    }

    #[must_use]
    pub fn is_head(&self) -> bool {
        self.snap == SnapId::NOSNAP
    }

    #[must_use]
    pub fn is_snapdir(&self) -> bool {
        self.snap == SnapId::SNAPDIR
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.namespace == INTERNAL_NAMESPACE
    }

    /// Placement hash; identical for every revision of the same object
    #[must_use]
    pub fn hash(&self) -> u32 {
        object_hash(&self.namespace, &self.name)
    }

    /// Placement group seed for a pool with `pg_num` groups
    #[must_use]
    pub fn pg_seed(&self, pg_num: u32) -> u32 {
        self.hash() % pg_num.max(1)
    }
}

impl fmt::Debug for HObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HObject({self})")
    }
}

impl fmt::Display for HObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}@{}", self.name, self.snap)
        } else {
            write!(f, "{}/{}@{}", self.namespace, self.name, self.snap)
        }
    }
}

/// Write-side snapshot context: newest snapshot seq plus existing snaps
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    pub seq: SnapId,
    /// Existing snapshots, newest first
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    #[must_use]
    pub const fn new(seq: SnapId, snaps: Vec<SnapId>) -> Self {
        Self { seq, snaps }
    }

    /// A context is valid when snaps are strictly descending and none is
    /// newer than seq
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if let Some(first) = self.snaps.first()
            && *first > self.seq
        {
            return false;
        }
        self.snaps.windows(2).all(|w| w[0] > w[1])
    }
}

/// Which tier an operation was ultimately served from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TierRole {
    #[display("base")]
    Base,
    #[display("cache")]
    Cache,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_id_reserved_values() {
        assert!(SnapId::new(4).is_snap());
        assert!(!SnapId::NOSNAP.is_snap());
        assert!(!SnapId::SNAPDIR.is_snap());
        assert!(SnapId::new(4) < SnapId::NOSNAP);
        assert_eq!(SnapId::NOSNAP.to_string(), "head");
    }

    #[test]
    fn test_hobject_revisions_share_hash() {
        let head = HObject::head("foo");
        let clone = head.with_snap(SnapId::new(3));
        assert_eq!(head.hash(), clone.hash());
        assert_eq!(head.pg_seed(8), clone.to_snapdir().pg_seed(8));
        assert!(clone.to_head().is_head());
        assert_eq!(clone.to_string(), "foo@3");
        assert!(!head.is_internal());
        assert!(HObject::internal("hit_set").is_internal());
    }

    #[test]
    fn test_hobject_ordering_groups_revisions() {
        let mut v = vec![
            HObject::head("b"),
            HObject::head("a").to_snapdir(),
            HObject::head("a"),
            HObject::head("a").with_snap(SnapId::new(2)),
        ];
        v.sort();
        assert_eq!(v[0], HObject::head("a").with_snap(SnapId::new(2)));
        assert_eq!(v[1], HObject::head("a"));
        assert_eq!(v[2], HObject::head("a").to_snapdir());
        assert_eq!(v[3], HObject::head("b"));
    }

    #[test]
    fn test_snap_context_validity() {
        let ok = SnapContext::new(SnapId::new(5), vec![SnapId::new(5), SnapId::new(2)]);
        assert!(ok.is_valid());
        let bad = SnapContext::new(SnapId::new(1), vec![SnapId::new(5)]);
        assert!(!bad.is_valid());
        let unordered = SnapContext::new(SnapId::new(9), vec![SnapId::new(2), SnapId::new(5)]);
        assert!(!unordered.is_valid());
    }

    #[test]
    fn test_pg_id_display() {
        assert_eq!(PgId::new(PoolId::new(3), 0x1f).to_string(), "3.1f");
    }
}
