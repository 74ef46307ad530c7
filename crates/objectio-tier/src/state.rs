//! Per-object tier state
//!
//! Stored as the `_tier` attribute next to the object's data in whichever
//! pool holds the copy. An object without the attribute (written before
//! tiering was enabled) is treated as a clean, non-whiteout copy at
//! version 0.

use bytes::Bytes;
use objectio_common::{Error, PoolId, Result};
use serde::{Deserialize, Serialize};

/// Attribute key holding the encoded [`ObjectTierState`]
pub const TIER_STATE_ATTR: &str = "_tier";

/// Prefix reserved for internal attributes
pub const INTERNAL_ATTR_PREFIX: char = '_';

/// Tiering metadata of one stored object copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTierState {
    /// The copy holds data not yet present in the base tier
    pub dirty: bool,
    /// The copy records a deletion (or a known-absent object)
    pub whiteout: bool,
    /// Per-object write counter, preserved across flush and promotion
    pub version: u64,
    /// Pool the copy was promoted from and flushes to
    pub redirect: Option<PoolId>,
    /// Time of the last modification (seconds)
    pub mtime: u64,
}

impl ObjectTierState {
    /// State of a copy promoted from `base` at `version`
    #[must_use]
    pub const fn promoted(base: PoolId, version: u64, mtime: u64) -> Self {
        Self {
            dirty: false,
            whiteout: false,
            version,
            redirect: Some(base),
            mtime,
        }
    }

    /// Clean whiteout recording that `base` does not have the object
    #[must_use]
    pub const fn absent_in(base: PoolId, mtime: u64) -> Self {
        Self {
            dirty: false,
            whiteout: true,
            version: 0,
            redirect: Some(base),
            mtime,
        }
    }

    /// Whether the copy can be dropped without losing data
    #[must_use]
    pub const fn is_evictable(&self) -> bool {
        !self.dirty
    }

    /// State after a write at `now`: dirty, not a whiteout, next version
    #[must_use]
    pub const fn written(self, now: u64) -> Self {
        Self {
            dirty: true,
            whiteout: false,
            version: self.version + 1,
            redirect: self.redirect,
            mtime: now,
        }
    }

    /// State after a cache-tier delete: a dirty whiteout
    #[must_use]
    pub const fn deleted(self, now: u64) -> Self {
        Self {
            dirty: true,
            whiteout: true,
            version: self.version + 1,
            redirect: self.redirect,
            mtime: now,
        }
    }

    /// Same state with the dirty flag cleared
    #[must_use]
    pub const fn cleaned(self) -> Self {
        Self {
            dirty: false,
            ..self
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Decode an optional attribute value
    pub fn from_attr(value: Option<&Bytes>) -> Result<Self> {
        value.map_or_else(|| Ok(Self::default()), |v| Self::decode(v))
    }
}

/// Whether a user-supplied attribute name is acceptable
#[must_use]
pub fn is_user_attr(key: &str) -> bool {
    !key.is_empty() && !key.starts_with(INTERNAL_ATTR_PREFIX)
}
