//! Object operations executed by placement groups

use crate::router::{OpClass, OpFlags};
use crate::snap::SnapSet;
use bytes::Bytes;
use objectio_common::{HObject, SnapContext};
use objectio_storage::{Attrs, ObjectStat};

/// Full copy of one object revision, moved between tiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopiedObject {
    /// Object data; `None` when the revision does not exist (or is a whiteout)
    pub data: Option<Bytes>,
    /// User attributes
    pub attrs: Attrs,
    pub version: u64,
    /// Snapshot history, carried with head copies only
    pub snapset: Option<SnapSet>,
}

/// One operation on one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsdOp {
    Read { offset: u64, len: Option<u64> },
    Stat,
    GetAttr { key: String },
    IsDirty,
    Create { exclusive: bool },
    WriteFull { data: Bytes },
    Write { offset: u64, data: Bytes },
    Truncate { size: u64 },
    Remove,
    SetAttr { key: String, value: Bytes },
    /// Clear the dirty flag without flushing
    Undirty,
    CacheFlush,
    CacheTryFlush,
    CacheEvict,
    /// Internal: read a full revision for promotion
    CopyGet,
    /// Internal: install a full revision sent by a flush
    CopyFrom(Box<CopiedObject>),
}

impl OsdOp {
    #[must_use]
    pub const fn class(&self) -> OpClass {
        match self {
            Self::Read { .. } | Self::Stat | Self::GetAttr { .. } | Self::IsDirty | Self::CopyGet => {
                OpClass::Read
            }
            Self::Create { .. }
            | Self::WriteFull { .. }
            | Self::Write { .. }
            | Self::Truncate { .. }
            | Self::Remove
            | Self::SetAttr { .. }
            | Self::Undirty
            | Self::CopyFrom(_) => OpClass::Write,
            Self::CacheFlush => OpClass::Flush,
            Self::CacheTryFlush | Self::CacheEvict => OpClass::CacheTry,
        }
    }

    /// Whether the op is issued by a client (as opposed to between tiers)
    #[must_use]
    pub const fn is_client_op(&self) -> bool {
        !matches!(self, Self::CopyGet | Self::CopyFrom(_))
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Stat => "stat",
            Self::GetAttr { .. } => "getxattr",
            Self::IsDirty => "isdirty",
            Self::Create { .. } => "create",
            Self::WriteFull { .. } => "writefull",
            Self::Write { .. } => "write",
            Self::Truncate { .. } => "truncate",
            Self::Remove => "delete",
            Self::SetAttr { .. } => "setxattr",
            Self::Undirty => "undirty",
            Self::CacheFlush => "cache-flush",
            Self::CacheTryFlush => "cache-try-flush",
            Self::CacheEvict => "cache-evict",
            Self::CopyGet => "copy-get",
            Self::CopyFrom(_) => "copy-from",
        }
    }
}

/// An operation addressed to one object revision
#[derive(Debug, Clone)]
pub struct OpRequest {
    /// Target object; a snapshot id in `oid.snap` reads at that snapshot
    pub oid: HObject,
    pub op: OsdOp,
    pub flags: OpFlags,
    /// Snapshot context for writes
    pub snapc: SnapContext,
}

impl OpRequest {
    #[must_use]
    pub fn new(oid: HObject, op: OsdOp) -> Self {
        Self {
            oid,
            op,
            flags: OpFlags::NONE,
            snapc: SnapContext::default(),
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: OpFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_snapc(mut self, snapc: SnapContext) -> Self {
        self.snapc = snapc;
        self
    }
}

/// Payload of a successful operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    None,
    Data(Bytes),
    Stat(ObjectStat),
    Attr(Bytes),
    Dirty(bool),
    Copied(Box<CopiedObject>),
}

/// Result of a successful operation plus the object version it observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReply {
    pub body: ReplyBody,
    pub version: u64,
}

impl OpReply {
    #[must_use]
    pub const fn new(body: ReplyBody, version: u64) -> Self {
        Self { body, version }
    }

    #[must_use]
    pub const fn ok(version: u64) -> Self {
        Self::new(ReplyBody::None, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_classes() {
        assert_eq!(OsdOp::Stat.class(), OpClass::Read);
        assert_eq!(OsdOp::Undirty.class(), OpClass::Write);
        assert_eq!(OsdOp::CacheFlush.class(), OpClass::Flush);
        assert_eq!(OsdOp::CacheEvict.class(), OpClass::CacheTry);
        assert!(!OsdOp::CopyGet.is_client_op());
        assert!(OsdOp::Remove.is_client_op());
        assert_eq!(OsdOp::CacheTryFlush.name(), "cache-try-flush");
    }
}
