//! Per-placement-group hit set archive
//!
//! Holds the open window plus the sealed windows in FIFO order, trimmed to
//! `count`. Readers take a snapshot (`Arc` of the sealed list) and never
//! observe a half-applied rotation. Rotation, trimming and restore are
//! driven by the placement group's tier agent.

use super::{HitSet, OpenHitSet, SealedHitSet};
use crate::clock::Timestamp;
use objectio_common::config::HitSetParams;
use objectio_common::{HObject, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

/// Sealed windows, oldest first
pub type HitSetHistory = Arc<Vec<Arc<SealedHitSet>>>;

/// Result of one rotation, for the caller to persist
#[derive(Debug, Clone)]
pub struct Rotation {
    /// Window that was just sealed
    pub sealed: Arc<SealedHitSet>,
    /// Windows dropped from the archive
    pub trimmed: Vec<Arc<SealedHitSet>>,
}

/// Open hit set plus the sealed history
#[derive(Debug)]
pub struct HitSetArchive {
    params: Mutex<HitSetParams>,
    open: Mutex<Option<OpenHitSet>>,
    sealed: RwLock<HitSetHistory>,
}

impl HitSetArchive {
    #[must_use]
    pub fn new(params: HitSetParams) -> Self {
        Self {
            params: Mutex::new(params),
            open: Mutex::new(None),
            sealed: RwLock::new(Arc::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn params(&self) -> HitSetParams {
        self.params.lock().clone()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.params.lock().enabled()
    }

    fn open_new(params: &HitSetParams, now: Timestamp) -> Result<OpenHitSet> {
        Ok(OpenHitSet::new(now, HitSet::new(params)?))
    }

    /// Start recording if hit sets are enabled and no window is open
    pub fn activate(&self, now: Timestamp) -> Result<()> {
        let params = self.params();
        if !params.enabled() {
            return Ok(());
        }
        let mut open = self.open.lock();
        if open.is_none() {
            *open = Some(Self::open_new(&params, now)?);
        }
        Ok(())
    }

    /// Record an access in the open window
    pub fn record(&self, oid: &HObject, now: Timestamp) -> Result<()> {
        let params = self.params();
        if !params.enabled() {
            return Ok(());
        }
        let mut open = self.open.lock();
        match open.as_mut() {
            Some(set) => set.insert(oid),
            None => {
                let mut set = Self::open_new(&params, now)?;
                set.insert(oid);
                *open = Some(set);
            }
        }
        Ok(())
    }

    /// Seal the open window if its period has elapsed
    pub fn rotate(&self, now: Timestamp) -> Result<Option<Rotation>> {
        let params = self.params();
        if !params.enabled() {
            return Ok(None);
        }

        let sealed = {
            let mut open = self.open.lock();
            let due = open
                .as_ref()
                .is_some_and(|set| now >= set.start().saturating_add(params.period_secs));
            if !due {
                if open.is_none() {
                    *open = Some(Self::open_new(&params, now)?);
                }
                return Ok(None);
            }
            let next = Self::open_new(&params, now)?;
            open.replace(next).map(|set| Arc::new(set.seal(now)))
        };
        let Some(sealed) = sealed else {
            return Ok(None);
        };

        let trimmed = {
            let mut history = self.sealed.write();
            let mut next: Vec<_> = history.iter().cloned().collect();
            next.push(sealed.clone());
            let excess = next.len().saturating_sub(params.count as usize);
            let trimmed: Vec<_> = next.drain(..excess).collect();
            *history = Arc::new(next);
            trimmed
        };

        debug!(
            "sealed hit set [{}, {}], {} entries",
            sealed.start(),
            sealed.end(),
            sealed.set().len()
        );
        Ok(Some(Rotation { sealed, trimmed }))
    }

    /// Consistent view of the sealed history
    #[must_use]
    pub fn snapshot(&self) -> HitSetHistory {
        self.sealed.read().clone()
    }

    /// Sealed windows as `(start, end)`, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<(Timestamp, Timestamp)> {
        self.snapshot()
            .iter()
            .map(|set| (set.start(), set.end()))
            .collect()
    }

    /// Window covering `ts`; the open window is returned as a sealed copy
    #[must_use]
    pub fn get(&self, ts: Timestamp, now: Timestamp) -> Option<Arc<SealedHitSet>> {
        if let Some(set) = self.snapshot().iter().find(|set| set.covers(ts)) {
            return Some(set.clone());
        }
        let open = self.open.lock();
        open.as_ref()
            .filter(|set| set.start() <= ts && ts <= now)
            .map(|set| Arc::new(set.snapshot(now)))
    }

    /// Load persisted windows; returns those beyond `count` for removal
    pub fn restore(&self, mut sets: Vec<SealedHitSet>) -> Vec<Arc<SealedHitSet>> {
        let count = self.params.lock().count as usize;
        sets.sort_by_key(SealedHitSet::start);
        let mut all: Vec<_> = sets.into_iter().map(Arc::new).collect();
        let excess = all.len().saturating_sub(count);
        let trimmed: Vec<_> = all.drain(..excess).collect();
        *self.sealed.write() = Arc::new(all);
        trimmed
    }

    /// Apply new parameters; returns windows that must be removed
    ///
    /// A change of representation or disabling discards the whole history;
    /// a smaller count trims the oldest windows.
    pub fn reconfigure(
        &self,
        params: HitSetParams,
        now: Timestamp,
    ) -> Result<Vec<Arc<SealedHitSet>>> {
        let mut current = self.params.lock();
        if *current == params {
            return Ok(Vec::new());
        }

        let reset = current.kind != params.kind || !params.enabled();
        let mut history = self.sealed.write();
        let mut open = self.open.lock();

        let removed: Vec<Arc<SealedHitSet>> = if reset {
            *open = None;
            let removed = history.iter().cloned().collect();
            *history = Arc::new(Vec::new());
            removed
        } else {
            let mut kept: Vec<_> = history.iter().cloned().collect();
            let excess = kept.len().saturating_sub(params.count as usize);
            let removed = kept.drain(..excess).collect();
            *history = Arc::new(kept);
            removed
        };

        if params.enabled() && open.is_none() {
            *open = Some(Self::open_new(&params, now)?);
        }
        *current = params;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectio_common::config::HitSetKind;

    fn params(kind: HitSetKind, count: u32, period_secs: u64) -> HitSetParams {
        HitSetParams {
            kind,
            count,
            period_secs,
            fpp: 0.01,
            target_size: 100,
            search_last_n: 0,
        }
    }

    #[test]
    fn test_disabled_archive_records_nothing() {
        let archive = HitSetArchive::new(HitSetParams::default());
        archive.record(&HObject::head("foo"), 0).unwrap();
        assert!(archive.rotate(100).unwrap().is_none());
        assert!(archive.list().is_empty());
        assert!(archive.get(0, 100).is_none());
    }

    #[test]
    fn test_rotation_seals_after_period() {
        let archive = HitSetArchive::new(params(HitSetKind::ExplicitObject, 4, 10));
        archive.activate(100).unwrap();
        archive.record(&HObject::head("foo"), 101).unwrap();

        assert!(archive.rotate(105).unwrap().is_none());
        let rotation = archive.rotate(110).unwrap().unwrap();
        assert_eq!((rotation.sealed.start(), rotation.sealed.end()), (100, 110));
        assert!(rotation.trimmed.is_empty());
        assert!(rotation.sealed.contains(&HObject::head("foo")));
        assert_eq!(archive.list(), vec![(100, 110)]);

        // Open window is served too
        archive.record(&HObject::head("bar"), 111).unwrap();
        let open = archive.get(112, 112).unwrap();
        assert!(open.contains(&HObject::head("bar")));
        assert!(!open.contains(&HObject::head("foo")));
        assert!(archive.get(105, 112).unwrap().contains(&HObject::head("foo")));
    }

    #[test]
    fn test_trim_is_fifo() {
        let archive = HitSetArchive::new(params(HitSetKind::Bloom, 3, 1));
        archive.activate(0).unwrap();
        let mut trimmed = Vec::new();
        for t in 1..=6 {
            let rotation = archive.rotate(t).unwrap().unwrap();
            trimmed.extend(rotation.trimmed.iter().map(|s| s.start()));
        }
        assert_eq!(archive.list(), vec![(3, 4), (4, 5), (5, 6)]);
        assert_eq!(trimmed, vec![0, 1, 2]);
    }

    #[test]
    fn test_snapshot_is_stable_across_rotation() {
        let archive = HitSetArchive::new(params(HitSetKind::ExplicitHash, 2, 1));
        archive.activate(0).unwrap();
        archive.rotate(1).unwrap();
        let before = archive.snapshot();
        archive.rotate(2).unwrap();
        archive.rotate(3).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].start(), 0);
        assert_eq!(archive.snapshot().len(), 2);
    }

    #[test]
    fn test_restore_and_reconfigure() {
        let archive = HitSetArchive::new(params(HitSetKind::ExplicitObject, 2, 1));
        let make = |start| {
            OpenHitSet::new(
                start,
                HitSet::new(&params(HitSetKind::ExplicitObject, 2, 1)).unwrap(),
            )
            .seal(start + 1)
        };
        let trimmed = archive.restore(vec![make(5), make(1), make(3)]);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].start(), 1);
        assert_eq!(archive.list(), vec![(3, 4), (5, 6)]);

        let removed = archive
            .reconfigure(params(HitSetKind::ExplicitObject, 1, 1), 10)
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(archive.list(), vec![(5, 6)]);

        let removed = archive
            .reconfigure(params(HitSetKind::Bloom, 1, 1), 10)
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(archive.list().is_empty());

        let removed = archive.reconfigure(HitSetParams::default(), 10).unwrap();
        assert!(removed.is_empty());
        assert!(!archive.enabled());
    }
}
