//! Core mutable state shared by the pipeline and the signature handler
//!
//! The order book and pending transfer registry are mutated from the
//! interleaver/pipeline path and the peer-signature handler; both run
//! behind this single lock so every mutation has one logical owner.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::book::OrderBookEngine;
use crate::registry::PendingTransferRegistry;
use crate::snapshot::Snapshot;

pub struct CoreState {
    pub book: OrderBookEngine,
    pub registry: PendingTransferRegistry,
    /// Latest captured snapshot, the fork-recovery restore point
    pub last_snapshot: Option<Snapshot>,
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            book: OrderBookEngine::new(),
            registry: PendingTransferRegistry::new(),
            last_snapshot: None,
        }
    }
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedState = Arc<Mutex<CoreState>>;

pub fn shared_state() -> SharedState {
    Arc::new(Mutex::new(CoreState::new()))
}
