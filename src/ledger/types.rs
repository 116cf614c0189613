//! Chain-facing data types shared across the node

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque symbol naming one of the two chains a node operates over
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(symbol: &str) -> Self {
        Self(symbol.to_string())
    }
}

/// Height and timestamp of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    /// Unix seconds
    pub timestamp: u64,
}

/// One transfer recorded on a ledger
///
/// Outbound multisig transfers carry the member signatures that authorized
/// them; inbound transfers have an empty signature list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    /// Free-form transfer data (the memo)
    pub memo: String,
    pub height: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub signatures: Vec<MemberSignature>,
}

/// One federation member's signature over a transaction hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSignature {
    /// Hex-encoded ed25519 verifying key
    pub public_key: String,
    /// Hex-encoded ed25519 signature
    pub signature: String,
}

/// Multisig wallet description loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultisigWalletInfo {
    /// Hex-encoded member verifying keys
    pub members: BTreeSet<String>,
    pub member_count: usize,
    pub required_signature_count: usize,
}

impl MultisigWalletInfo {
    pub fn is_member(&self, public_key: &str) -> bool {
        self.members.contains(public_key)
    }
}

/// An outgoing multisig transfer under construction or awaiting quorum
///
/// `id` is the hex SHA-256 of the canonical transaction payload without
/// member signatures, so every federation member derives the same id for
/// the same payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingTransaction {
    pub id: String,
    pub chain: ChainId,
    /// The multisig wallet address on the target chain
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub timestamp: u64,
    /// Source-chain height at authoring
    pub height: u64,
    pub memo: String,
    /// Signature by the shared wallet key over the canonical payload
    pub wallet_signature: String,
    /// Accumulating member signatures
    pub signatures: Vec<MemberSignature>,
}
