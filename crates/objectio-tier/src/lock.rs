//! Per-object contexts
//!
//! An [`ObjectContext`] exists while some operation on the object is in
//! progress. It carries:
//!
//! - an advisory read/write lock: writes take it exclusively, reads and
//!   blocking flushes take it shared, `try_flush` and evict only ever
//!   try-acquire it
//! - the in-flight flush, which later flush-family calls may join
//! - the in-flight promotion, which concurrent misses join
//! - a copy lock serializing writes of this object into the base tier
//!
//! The lock is fair, so a queued write holds back readers that arrive
//! after it and blocking flushes cannot starve writers.

use objectio_common::HObject;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, watch};

/// One-shot result shared by every waiter of an in-flight operation
#[derive(Debug)]
pub struct InFlight<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for InFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> InFlight<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    /// Publish the outcome; later calls are ignored
    pub fn complete(&self, outcome: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    #[must_use]
    pub fn outcome(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender is owned by self, so this cannot observe a close
            let _ = rx.changed().await;
        }
    }
}

/// Outcome of a flush or try-flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Base tier now holds the flushed version; object is clean
    Flushed,
    /// Superseded by a write or a blocking flush before completing
    Canceled,
    /// Failed with the given error message
    Failed(String),
}

/// Outcome of a promotion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Object copied into the cache tier
    Promoted,
    /// Base lacks the object; a whiteout now records that
    Whiteout,
    /// Base lacks the requested clone
    NotFound,
    /// Copy failed with the given error message
    Failed(String),
}

/// An in-flight flush registered on an object
#[derive(Debug)]
pub struct FlushOp {
    blocking: bool,
    canceled: AtomicBool,
    done: InFlight<FlushOutcome>,
}

impl FlushOp {
    #[must_use]
    pub fn new(blocking: bool) -> Arc<Self> {
        Arc::new(Self {
            blocking,
            canceled: AtomicBool::new(false),
            done: InFlight::new(),
        })
    }

    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn complete(&self, outcome: FlushOutcome) {
        self.done.complete(outcome);
    }

    pub async fn wait(&self) -> FlushOutcome {
        self.done.wait().await
    }
}

/// How a new flush request relates to one already in progress
#[derive(Debug)]
pub enum FlushRegistration {
    /// Caller owns the new op and must complete it
    Leader(Arc<FlushOp>),
    /// Caller joins an existing op and reports its outcome
    Joined(Arc<FlushOp>),
}

/// Shared state for one object while operations reference it
#[derive(Debug)]
pub struct ObjectContext {
    oid: HObject,
    rwlock: RwLock<()>,
    flush: Mutex<Option<Arc<FlushOp>>>,
    promote: Mutex<Option<Arc<InFlight<PromoteOutcome>>>>,
    copy: tokio::sync::Mutex<()>,
}

impl ObjectContext {
    fn new(oid: HObject) -> Self {
        Self {
            oid,
            rwlock: RwLock::new(()),
            flush: Mutex::new(None),
            promote: Mutex::new(None),
            copy: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn oid(&self) -> &HObject {
        &self.oid
    }

    #[must_use]
    pub const fn rwlock(&self) -> &RwLock<()> {
        &self.rwlock
    }

    #[must_use]
    pub const fn copy_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.copy
    }

    /// Register a flush
    ///
    /// A blocking flush joins a blocking flush in progress and cancels a
    /// non-blocking one, taking its place. A non-blocking flush joins
    /// whatever is in progress.
    pub fn register_flush(&self, blocking: bool) -> FlushRegistration {
        let mut slot = self.flush.lock();
        if let Some(current) = slot.as_ref() {
            if !blocking || current.is_blocking() {
                return FlushRegistration::Joined(current.clone());
            }
            current.cancel();
        }
        let op = FlushOp::new(blocking);
        *slot = Some(op.clone());
        FlushRegistration::Leader(op)
    }

    /// Remove `op` from the flush slot if it is still installed
    pub fn finish_flush(&self, op: &Arc<FlushOp>, outcome: FlushOutcome) {
        {
            let mut slot = self.flush.lock();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, op)) {
                *slot = None;
            }
        }
        op.complete(outcome);
    }

    /// Cancel a non-blocking flush in progress; returns whether one was
    pub fn cancel_try_flush(&self) -> bool {
        let slot = self.flush.lock();
        match slot.as_ref() {
            Some(op) if !op.is_blocking() => {
                op.cancel();
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn flush_in_progress(&self) -> bool {
        self.flush.lock().is_some()
    }

    /// Join or start a promotion; the boolean is true for the leader
    pub fn register_promote(&self) -> (Arc<InFlight<PromoteOutcome>>, bool) {
        let mut slot = self.promote.lock();
        if let Some(current) = slot.as_ref() {
            return (current.clone(), false);
        }
        let flight = Arc::new(InFlight::new());
        *slot = Some(flight.clone());
        (flight, true)
    }

    pub fn finish_promote(&self, flight: &Arc<InFlight<PromoteOutcome>>, outcome: PromoteOutcome) {
        {
            let mut slot = self.promote.lock();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, flight)) {
                *slot = None;
            }
        }
        flight.complete(outcome);
    }

    #[must_use]
    pub fn promote_in_progress(&self) -> bool {
        self.promote.lock().is_some()
    }
}

/// Hands out one shared context per object
#[derive(Debug, Default)]
pub struct ObjectContextRegistry {
    contexts: Mutex<HashMap<HObject, Weak<ObjectContext>>>,
}

impl ObjectContextRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for `oid`, created if no live one exists
    pub fn get(&self, oid: &HObject) -> Arc<ObjectContext> {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(oid).and_then(Weak::upgrade) {
            return ctx;
        }
        if contexts.len() > 1024 {
            contexts.retain(|_, ctx| ctx.strong_count() > 0);
        }
        let ctx = Arc::new(ObjectContext::new(oid.clone()));
        contexts.insert(oid.clone(), Arc::downgrade(&ctx));
        ctx
    }

    /// Number of live contexts
    #[must_use]
    pub fn live(&self) -> usize {
        self.contexts
            .lock()
            .values()
            .filter(|ctx| ctx.strong_count() > 0)
            .count()
    }
}
