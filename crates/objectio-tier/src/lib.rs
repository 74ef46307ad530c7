//! ObjectIO Tier - Cache tiering for object pools
//!
//! This crate layers a fast cache pool over a slower base pool:
//! - Per-PG hit sets recording recent accesses, and object temperature
//! - Overlay routing of client operations to the cache tier
//! - Promotion on miss, whiteouts for absent objects, forward mode
//! - Flush, try-flush and evict with per-object serialization
//! - Self-managed snapshots carried across tiers
//! - A background tier agent that flushes and evicts by pool pressure

pub mod agent;
pub mod backend;
pub mod clock;
pub mod cluster;
pub mod hitset;
pub mod lock;
pub mod op;
pub mod osdmap;
pub mod pg;
pub mod router;
pub mod snap;
pub mod state;
pub mod stats;
pub mod temperature;

#[cfg(test)]
mod testing;

// Re-exports
pub use agent::{AgentStatus, EvictMode, FlushMode, PassReport, TierAgent};
pub use backend::{ErasureCodedBackend, PgBackend, ReplicatedBackend};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use cluster::{AgentSupervisor, Cluster, ClusterBuilder, IoCtx};
pub use hitset::{HitSetArchive, SealedHitSet};
pub use op::{OpReply, OpRequest, OsdOp, ReplyBody};
pub use osdmap::{OsdMap, PoolInfo};
pub use pg::{PlacementGroup, TierCounters};
pub use router::{OpFlags, OverlayRouter};
pub use state::ObjectTierState;
pub use stats::{PoolRatios, PoolStatsFeed, StaticStatsFeed};
