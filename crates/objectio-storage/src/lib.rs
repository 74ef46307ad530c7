//! ObjectIO Storage Engine - Local object storage
//!
//! This crate implements the storage collaborator used by placement groups:
//! - The `ObjectStore` interface (reads, attributes, atomic transactions)
//! - An in-memory engine with I/O statistics
//! - An I/O gate for holding store access at a well-defined point

pub mod gate;
pub mod mem;
pub mod store;

// Re-exports
pub use gate::{IoGate, IoKind};
pub use mem::{MemStore, StoreStats};
pub use store::{Attrs, ObjectStat, ObjectStore, StoreUsage, Transaction, TxnOp};
