//! I/O gate
//!
//! A gate sits in front of a store and can hold reads and writes
//! separately. Closing it parks every new operation of that kind until it
//! is reopened; the number of parked operations is observable so a caller
//! can wait until a concurrent operation has reached the store before
//! issuing a competing one.

use tokio::sync::watch;

/// Kind of store access controlled by the gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Open/close switch in front of a store
#[derive(Debug)]
pub struct IoGate {
    reads_open: watch::Sender<bool>,
    writes_open: watch::Sender<bool>,
    parked: watch::Sender<usize>,
}

impl Default for IoGate {
    fn default() -> Self {
        Self::new()
    }
}

impl IoGate {
    /// A gate with both directions open
    #[must_use]
    pub fn new() -> Self {
        Self {
            reads_open: watch::Sender::new(true),
            writes_open: watch::Sender::new(true),
            parked: watch::Sender::new(0),
        }
    }

    const fn switch(&self, kind: IoKind) -> &watch::Sender<bool> {
        match kind {
            IoKind::Read => &self.reads_open,
            IoKind::Write => &self.writes_open,
        }
    }

    pub fn close(&self, kind: IoKind) {
        self.switch(kind).send_replace(false);
    }

    pub fn open(&self, kind: IoKind) {
        self.switch(kind).send_replace(true);
    }

    #[must_use]
    pub fn is_open(&self, kind: IoKind) -> bool {
        *self.switch(kind).borrow()
    }

    /// Number of operations currently parked
    #[must_use]
    pub fn parked(&self) -> usize {
        *self.parked.borrow()
    }

    /// Wait until the gate lets an operation of `kind` through
    pub async fn pass(&self, kind: IoKind) {
        let mut rx = self.switch(kind).subscribe();
        if *rx.borrow_and_update() {
            return;
        }

        self.parked.send_modify(|n| *n += 1);
        // The sender lives as long as the gate, so wait_for cannot fail
        let _ = rx.wait_for(|open| *open).await;
        self.parked.send_modify(|n| *n -= 1);
    }

    /// Wait until at least `n` operations are parked
    pub async fn wait_parked(&self, n: usize) {
        let mut rx = self.parked.subscribe();
        let _ = rx.wait_for(|parked| *parked >= n).await;
    }
}
