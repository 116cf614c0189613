//! P2P bus - signature gossip between federation members
//!
//! The transport is a black box; the node only needs fire-and-forget emit
//! and a subscription stream. Channels scope broadcasts to peers serving
//! the same (base, quote) wallet pair.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One member signature travelling between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEvent {
    pub transaction_id: String,
    /// Hex-encoded ed25519 signature
    pub signature: String,
    /// Hex-encoded verifying key of the signing member
    pub public_key: String,
}

/// Channel name scoping signature gossip to one wallet pair
pub fn signature_channel(module: &str, base_address: &str, quote_address: &str) -> String {
    format!("{module}?baseAddress={base_address}&quoteAddress={quote_address}:signature")
}

pub trait P2pBus: Send + Sync {
    /// Broadcast a signature to all peers on `channel`
    fn emit_signature(&self, channel: &str, event: SignatureEvent);

    /// Subscribe to all signature traffic; consumers filter by channel
    fn subscribe_signatures(&self) -> broadcast::Receiver<(String, SignatureEvent)>;
}

/// Process-local bus backed by a tokio broadcast channel
pub struct MemoryBus {
    tx: broadcast::Sender<(String, SignatureEvent)>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl P2pBus for MemoryBus {
    fn emit_signature(&self, channel: &str, event: SignatureEvent) {
        // A send with no subscribers is not an error.
        let _ = self.tx.send((channel.to_string(), event));
    }

    fn subscribe_signatures(&self) -> broadcast::Receiver<(String, SignatureEvent)> {
        self.tx.subscribe()
    }
}
