//! Hit sets
//!
//! A hit set records which objects were accessed during one time window.
//! Three representations trade precision for space:
//!
//! - `ExplicitObject`: the exact object identities
//! - `ExplicitHash`: the exact 32-bit placement hashes (collisions possible)
//! - `Bloom`: a Bloom filter with a configured false positive rate
//!
//! An [`OpenHitSet`] accepts inserts until its window closes; sealing it
//! produces an immutable [`SealedHitSet`] that is shared behind `Arc` and
//! persisted in the placement group's store.

pub mod archive;
pub mod bloom;

pub use archive::{HitSetArchive, Rotation};
pub use bloom::BloomFilter;

use crate::clock::Timestamp;
use objectio_common::checksum::{open_frame, seal_frame};
use objectio_common::config::{HitSetKind, HitSetParams};
use objectio_common::{Error, HObject, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Frame magic for encoded hit sets ("HSET")
const HIT_SET_MAGIC: u32 = 0x5445_5348;
const HIT_SET_VERSION: u16 = 1;

/// Membership structure of one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitSet {
    ExplicitObject(BTreeSet<HObject>),
    ExplicitHash(BTreeSet<u32>),
    Bloom(BloomFilter),
}

impl HitSet {
    /// Empty set of the configured kind
    pub fn new(params: &HitSetParams) -> Result<Self> {
        match params.kind {
            HitSetKind::None => Err(Error::configuration("hit sets are disabled")),
            HitSetKind::ExplicitObject => Ok(Self::ExplicitObject(BTreeSet::new())),
            HitSetKind::ExplicitHash => Ok(Self::ExplicitHash(BTreeSet::new())),
            HitSetKind::Bloom => Ok(Self::Bloom(BloomFilter::with_rate(
                params.target_size,
                params.fpp,
            ))),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> HitSetKind {
        match self {
            Self::ExplicitObject(_) => HitSetKind::ExplicitObject,
            Self::ExplicitHash(_) => HitSetKind::ExplicitHash,
            Self::Bloom(_) => HitSetKind::Bloom,
        }
    }

    pub fn insert(&mut self, oid: &HObject) {
        match self {
            Self::ExplicitObject(set) => {
                set.insert(oid.clone());
            }
            Self::ExplicitHash(set) => {
                set.insert(oid.hash());
            }
            Self::Bloom(bloom) => bloom.insert(&bloom_key(oid)),
        }
    }

    #[must_use]
    pub fn contains(&self, oid: &HObject) -> bool {
        match self {
            Self::ExplicitObject(set) => set.contains(oid),
            Self::ExplicitHash(set) => set.contains(&oid.hash()),
            Self::Bloom(bloom) => bloom.contains(&bloom_key(oid)),
        }
    }

    /// Approximate number of distinct insertions
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::ExplicitObject(set) => set.len() as u64,
            Self::ExplicitHash(set) => set.len() as u64,
            Self::Bloom(bloom) => bloom.inserted(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn bloom_key(oid: &HObject) -> Vec<u8> {
    let mut key = Vec::with_capacity(oid.namespace.len() + oid.name.len() + 10);
    key.extend_from_slice(oid.namespace.as_bytes());
    key.push(0);
    key.extend_from_slice(oid.name.as_bytes());
    key.push(0);
    key.extend_from_slice(&oid.snap.as_u64().to_le_bytes());
    key
}

/// Hit set for the window currently being recorded
#[derive(Debug, Clone)]
pub struct OpenHitSet {
    start: Timestamp,
    set: HitSet,
}

impl OpenHitSet {
    #[must_use]
    pub const fn new(start: Timestamp, set: HitSet) -> Self {
        Self { start, set }
    }

    #[must_use]
    pub const fn start(&self) -> Timestamp {
        self.start
    }

    pub fn insert(&mut self, oid: &HObject) {
        self.set.insert(oid);
    }

    #[must_use]
    pub fn contains(&self, oid: &HObject) -> bool {
        self.set.contains(oid)
    }

    /// Close the window at `end`
    #[must_use]
    pub fn seal(self, end: Timestamp) -> SealedHitSet {
        SealedHitSet {
            start: self.start,
            end: end.max(self.start),
            set: self.set,
        }
    }

    /// Sealed copy of the current contents; the open set keeps recording
    #[must_use]
    pub fn snapshot(&self, end: Timestamp) -> SealedHitSet {
        self.clone().seal(end)
    }
}

/// Immutable hit set for the window `[start, end]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedHitSet {
    start: Timestamp,
    end: Timestamp,
    set: HitSet,
}

impl SealedHitSet {
    #[must_use]
    pub const fn start(&self) -> Timestamp {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> Timestamp {
        self.end
    }

    #[must_use]
    pub const fn set(&self) -> &HitSet {
        &self.set
    }

    #[must_use]
    pub fn contains(&self, oid: &HObject) -> bool {
        self.set.contains(oid)
    }

    /// Whether `ts` falls inside this window (both ends inclusive)
    #[must_use]
    pub const fn covers(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Checksummed binary encoding
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        Ok(seal_frame(HIT_SET_MAGIC, HIT_SET_VERSION, &payload))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (version, payload) = open_frame(HIT_SET_MAGIC, data)?;
        if version != HIT_SET_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported hit set version {version}"
            )));
        }
        bincode::deserialize(payload).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kind: HitSetKind) -> HitSetParams {
        HitSetParams {
            kind,
            count: 4,
            period_secs: 10,
            fpp: 0.01,
            target_size: 100,
            search_last_n: 0,
        }
    }

    #[test]
    fn test_disabled_kind_rejected() {
        assert!(HitSet::new(&params(HitSetKind::None)).is_err());
    }

    #[test]
    fn test_insert_contains_all_kinds() {
        for kind in [
            HitSetKind::ExplicitObject,
            HitSetKind::ExplicitHash,
            HitSetKind::Bloom,
        ] {
            let mut set = HitSet::new(&params(kind)).unwrap();
            assert_eq!(set.kind(), kind);
            set.insert(&HObject::head("foo"));
            assert!(set.contains(&HObject::head("foo")), "{kind:?}");
            assert!(!set.is_empty());
        }
    }

    #[test]
    fn test_explicit_object_distinguishes_revisions() {
        let mut set = HitSet::new(&params(HitSetKind::ExplicitObject)).unwrap();
        set.insert(&HObject::head("foo"));
        let clone = HObject::head("foo").with_snap(objectio_common::SnapId::new(2));
        assert!(!set.contains(&clone));

        // Hash sets key on placement hash, which revisions share
        let mut hashes = HitSet::new(&params(HitSetKind::ExplicitHash)).unwrap();
        hashes.insert(&HObject::head("foo"));
        assert!(hashes.contains(&clone));
    }

    #[test]
    fn test_seal_and_encode() {
        let set = HitSet::new(&params(HitSetKind::ExplicitObject)).unwrap();
        let mut open = OpenHitSet::new(100, set);
        open.insert(&HObject::head("a"));
        open.insert(&HObject::head("b"));
        let sealed = open.seal(110);
        assert_eq!((sealed.start(), sealed.end()), (100, 110));
        assert!(sealed.covers(100) && sealed.covers(110) && !sealed.covers(111));

        let decoded = SealedHitSet::decode(&sealed.encode().unwrap()).unwrap();
        assert_eq!(decoded, sealed);
        assert!(decoded.contains(&HObject::head("a")));
        assert!(!decoded.contains(&HObject::head("c")));
    }

    #[test]
    fn test_bloom_encoding_preserves_bits() {
        let mut open = OpenHitSet::new(0, HitSet::new(&params(HitSetKind::Bloom)).unwrap());
        for i in 0..50 {
            open.insert(&HObject::head(format!("obj{i}")));
        }
        let sealed = open.seal(5);
        let decoded = SealedHitSet::decode(&sealed.encode().unwrap()).unwrap();
        match (sealed.set(), decoded.set()) {
            (HitSet::Bloom(a), HitSet::Bloom(b)) => assert_eq!(a.bits(), b.bits()),
            _ => panic!("expected bloom sets"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SealedHitSet::decode(b"not a hit set").is_err());
    }
}
