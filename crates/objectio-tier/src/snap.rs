//! Snapshot sets
//!
//! Every object with snapshot history carries a [`SnapSet`] on its snapdir
//! entry. The set lists the immutable clones, each tagged with the
//! snapshots it serves, and the newest snapshot sequence the head has been
//! written under. Keeping it off the head lets the history survive a head
//! delete.

use bytes::Bytes;
use objectio_common::{Error, HObject, Result, SnapContext, SnapId};
use serde::{Deserialize, Serialize};

/// Attribute key holding the encoded [`SnapSet`] on the snapdir entry
pub const SNAPSET_ATTR: &str = "_snapset";

/// One immutable clone of the head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneInfo {
    /// Newest snapshot the clone was taken for; also its object snap id
    pub id: SnapId,
    /// Snapshots this clone serves, newest first
    pub snaps: Vec<SnapId>,
    pub size: u64,
}

/// Where a read at some snapshot is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapResolution {
    Head,
    Clone(SnapId),
    Missing,
}

/// Clone history of one object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSet {
    /// Newest snapshot sequence the head was written under
    pub seq: SnapId,
    /// Clones, oldest first
    pub clones: Vec<CloneInfo>,
}

impl SnapSet {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seq == SnapId::default() && self.clones.is_empty()
    }

    /// Clone objects of `head`, oldest first
    #[must_use]
    pub fn clone_oids(&self, head: &HObject) -> Vec<HObject> {
        self.clones.iter().map(|c| head.with_snap(c.id)).collect()
    }

    /// Resolve a read at `snap`
    ///
    /// Snapshots newer than `seq` see the head. Older ones are served by the
    /// first clone at or after them, provided that clone lists the snapshot;
    /// otherwise the object did not exist at that snapshot.
    #[must_use]
    pub fn resolve(&self, snap: SnapId) -> SnapResolution {
        if snap == SnapId::NOSNAP || snap > self.seq {
            return SnapResolution::Head;
        }
        match self.clones.iter().find(|c| c.id >= snap) {
            Some(clone) if clone.snaps.contains(&snap) => SnapResolution::Clone(clone.id),
            _ => SnapResolution::Missing,
        }
    }

    /// Prepare a head write under `snapc`
    ///
    /// Returns the clone to take before the write, if the head exists and
    /// snapshots were created since it was last written. Always advances
    /// `seq` to the context's sequence.
    pub fn make_writeable(
        &mut self,
        snapc: &SnapContext,
        head_exists: bool,
        head_size: u64,
    ) -> Option<CloneInfo> {
        if snapc.seq <= self.seq {
            return None;
        }

        let newer: Vec<SnapId> = snapc
            .snaps
            .iter()
            .copied()
            .filter(|s| *s > self.seq)
            .collect();
        self.seq = snapc.seq;

        if !head_exists || newer.is_empty() {
            return None;
        }
        let clone = CloneInfo {
            id: newer[0],
            snaps: newer,
            size: head_size,
        };
        self.clones.push(clone.clone());
        Some(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapc(seq: u64, snaps: &[u64]) -> SnapContext {
        SnapContext::new(
            SnapId::new(seq),
            snaps.iter().map(|s| SnapId::new(*s)).collect(),
        )
    }

    #[test]
    fn test_no_snapshots_reads_head() {
        let set = SnapSet::default();
        assert!(set.is_empty());
        assert_eq!(set.resolve(SnapId::NOSNAP), SnapResolution::Head);
        assert_eq!(set.resolve(SnapId::new(3)), SnapResolution::Head);
    }

    #[test]
    fn test_clone_on_first_write_after_snapshot() {
        let mut set = SnapSet::default();
        let clone = set.make_writeable(&snapc(2, &[2]), true, 8).unwrap();
        assert_eq!(clone.id, SnapId::new(2));
        assert_eq!(clone.size, 8);
        assert_eq!(set.seq, SnapId::new(2));

        // A second write under the same context does not clone again
        assert!(set.make_writeable(&snapc(2, &[2]), true, 5).is_none());

        assert_eq!(set.resolve(SnapId::new(2)), SnapResolution::Clone(SnapId::new(2)));
        assert_eq!(set.resolve(SnapId::new(3)), SnapResolution::Head);
        assert_eq!(
            set.clone_oids(&HObject::head("foo")),
            vec![HObject::head("foo").with_snap(SnapId::new(2))]
        );
    }

    #[test]
    fn test_object_created_after_snapshot() {
        let mut set = SnapSet::default();
        assert!(set.make_writeable(&snapc(4, &[4]), false, 0).is_none());
        assert_eq!(set.seq, SnapId::new(4));
        assert_eq!(set.resolve(SnapId::new(4)), SnapResolution::Missing);
        assert_eq!(set.resolve(SnapId::new(5)), SnapResolution::Head);
    }

    #[test]
    fn test_clone_serves_multiple_snaps() {
        let mut set = SnapSet::default();
        let clone = set.make_writeable(&snapc(5, &[5, 3]), true, 1).unwrap();
        assert_eq!(clone.snaps, vec![SnapId::new(5), SnapId::new(3)]);
        assert_eq!(set.resolve(SnapId::new(3)), SnapResolution::Clone(SnapId::new(5)));
        assert_eq!(set.resolve(SnapId::new(4)), SnapResolution::Missing);

        let second = set.make_writeable(&snapc(7, &[7, 5, 3]), true, 1).unwrap();
        assert_eq!(second.snaps, vec![SnapId::new(7)]);
        assert_eq!(set.resolve(SnapId::new(7)), SnapResolution::Clone(SnapId::new(7)));
        assert_eq!(set.resolve(SnapId::new(5)), SnapResolution::Clone(SnapId::new(5)));
    }

    #[test]
    fn test_encode_decode() {
        let mut set = SnapSet::default();
        set.make_writeable(&snapc(2, &[2]), true, 3);
        let decoded = SnapSet::decode(&set.encode().unwrap()).unwrap();
        assert_eq!(decoded, set);
    }
}
