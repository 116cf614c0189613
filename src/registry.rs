//! Pending transfer registry - outgoing multisig transactions awaiting quorum
//!
//! Insertion order is preserved and doubles as the expiry scan order;
//! re-authoring an existing id removes the old entry first so the queue
//! stays a valid expiry FIFO.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ledger::{ChainId, OutgoingTransaction};

/// One outgoing multisig transaction accumulating member signatures
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingTransfer {
    pub transaction: OutgoingTransaction,
    pub target_chain: ChainId,
    /// Dedup index over raw signature strings
    pub processed_signatures: HashSet<String>,
    /// Member addresses whose signatures are attached
    pub contributors: HashSet<String>,
    /// This node's member verifying key, hex
    pub public_key: String,
    /// Source-chain height at authoring
    pub creation_height: u64,
    /// Wall-clock monotonic ms at registration
    pub inserted_at: u64,
    /// Quorum reached
    pub is_ready: bool,
}

#[derive(Debug, Default)]
pub struct PendingTransferRegistry {
    entries: HashMap<String, PendingTransfer>,
    /// Insertion sequence -> transaction id
    order: BTreeMap<u64, String>,
    /// Transaction id -> insertion sequence
    sequence: HashMap<String, u64>,
    next_seq: u64,
}

impl PendingTransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, removing any prior entry with the same id first
    pub fn put(&mut self, id: String, entry: PendingTransfer) {
        self.remove(&id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id.clone());
        self.sequence.insert(id.clone(), seq);
        self.entries.insert(id, entry);
    }

    pub fn get(&self, id: &str) -> Option<&PendingTransfer> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PendingTransfer> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<PendingTransfer> {
        let entry = self.entries.remove(id)?;
        if let Some(seq) = self.sequence.remove(id) {
            self.order.remove(&seq);
        }
        Some(entry)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Entries in insertion order
    pub fn values(&self) -> impl Iterator<Item = &PendingTransfer> {
        self.order.values().map(move |id| &self.entries[id])
    }

    /// Drop entries from the head while they are at least `max_age_ms` old
    ///
    /// The scan stops at the first entry younger than the threshold; since
    /// insertion order tracks `inserted_at`, only a prefix is ever removed.
    pub fn expire(&mut self, now_ms: u64, max_age_ms: u64) -> Vec<PendingTransfer> {
        let mut expired = Vec::new();
        while let Some((&seq, id)) = self.order.iter().next() {
            let id = id.clone();
            let entry = &self.entries[&id];
            if now_ms.saturating_sub(entry.inserted_at) < max_age_ms {
                break;
            }
            self.order.remove(&seq);
            self.sequence.remove(&id);
            expired.push(self.entries.remove(&id).expect("indexed entry exists"));
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.sequence.clear();
    }
}
