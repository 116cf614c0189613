//! Ledger module - read-only chain views and transaction posting
//!
//! The node consumes each underlying ledger as a black-box service: block
//! iteration by height, transfer lookup per block and wallet, and posting
//! of fully-signed multisig transactions. `LedgerClient` is that boundary;
//! `MemoryLedger` is the embedded implementation used by the dev node and
//! the test suite.

mod types;

pub use types::{
    BlockHeader, ChainId, MemberSignature, MultisigWalletInfo, OutgoingTransaction, Transfer,
};

use crate::error::{NodeError, NodeResult};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;

/// Read view of one chain plus transaction posting
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn chain_id(&self) -> &ChainId;

    /// Height of the chain tip
    async fn max_height(&self) -> NodeResult<u64>;

    /// Header of the block at `height`, if one exists
    async fn block_at_height(&self, height: u64) -> NodeResult<Option<BlockHeader>>;

    /// Blocks with `from_exclusive < height <= to_inclusive`, oldest first,
    /// at most `limit` of them
    async fn blocks_in_range(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        limit: usize,
    ) -> NodeResult<Vec<BlockHeader>>;

    /// Transfers credited to `wallet` in the block at `height`
    async fn inbound_transfers(&self, height: u64, wallet: &str) -> NodeResult<Vec<Transfer>>;

    /// Transfers debited from `wallet` in the block at `height`
    async fn outbound_transfers(&self, height: u64, wallet: &str) -> NodeResult<Vec<Transfer>>;

    /// Transfers debited from `wallet` over `from..=to`, oldest first
    async fn outbound_transfers_in_range(
        &self,
        from: u64,
        to: u64,
        wallet: &str,
    ) -> NodeResult<Vec<Transfer>>;

    /// Multisig account description from the chain's account database
    async fn multisig_wallet_info(&self, wallet: &str) -> NodeResult<MultisigWalletInfo>;

    /// Post a fully-signed transaction to the chain's transaction pool
    async fn post_transaction(&self, tx: &OutgoingTransaction) -> NodeResult<()>;

    /// New-block notifications, used for fork detection
    fn subscribe_new_blocks(&self) -> broadcast::Receiver<BlockHeader>;
}

/// One block's contents as held by the in-memory ledger
#[derive(Debug, Clone, Default)]
struct BlockData {
    timestamp: u64,
    inbound: Vec<Transfer>,
    outbound: Vec<Transfer>,
}

#[derive(Default)]
struct MemoryLedgerInner {
    blocks: BTreeMap<u64, BlockData>,
    wallet_info: Option<MultisigWalletInfo>,
    posted: Vec<OutgoingTransaction>,
}

/// Embedded in-memory ledger
pub struct MemoryLedger {
    chain: ChainId,
    inner: RwLock<MemoryLedgerInner>,
    block_tx: broadcast::Sender<BlockHeader>,
}

impl MemoryLedger {
    pub fn new(chain: ChainId) -> Arc<Self> {
        let (block_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            chain,
            inner: RwLock::new(MemoryLedgerInner::default()),
            block_tx,
        })
    }

    /// Append a block and notify subscribers
    pub async fn push_block(
        &self,
        header: BlockHeader,
        inbound: Vec<Transfer>,
        outbound: Vec<Transfer>,
    ) {
        let mut inner = self.inner.write().await;
        inner.blocks.insert(
            header.height,
            BlockData {
                timestamp: header.timestamp,
                inbound,
                outbound,
            },
        );
        drop(inner);
        let _ = self.block_tx.send(header);
    }

    pub async fn set_wallet_info(&self, info: MultisigWalletInfo) {
        self.inner.write().await.wallet_info = Some(info);
    }

    /// Transactions posted through this client, in posting order
    pub async fn posted_transactions(&self) -> Vec<OutgoingTransaction> {
        self.inner.read().await.posted.clone()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    fn chain_id(&self) -> &ChainId {
        &self.chain
    }

    async fn max_height(&self) -> NodeResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner.blocks.keys().next_back().copied().unwrap_or(0))
    }

    async fn block_at_height(&self, height: u64) -> NodeResult<Option<BlockHeader>> {
        let inner = self.inner.read().await;
        Ok(inner.blocks.get(&height).map(|data| BlockHeader {
            height,
            timestamp: data.timestamp,
        }))
    }

    async fn blocks_in_range(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        limit: usize,
    ) -> NodeResult<Vec<BlockHeader>> {
        if to_inclusive <= from_exclusive {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .range(from_exclusive + 1..=to_inclusive)
            .take(limit)
            .map(|(height, data)| BlockHeader {
                height: *height,
                timestamp: data.timestamp,
            })
            .collect())
    }

    async fn inbound_transfers(&self, height: u64, wallet: &str) -> NodeResult<Vec<Transfer>> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .get(&height)
            .map(|data| {
                data.inbound
                    .iter()
                    .filter(|t| t.recipient == wallet)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn outbound_transfers(&self, height: u64, wallet: &str) -> NodeResult<Vec<Transfer>> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .get(&height)
            .map(|data| {
                data.outbound
                    .iter()
                    .filter(|t| t.sender == wallet)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn outbound_transfers_in_range(
        &self,
        from: u64,
        to: u64,
        wallet: &str,
    ) -> NodeResult<Vec<Transfer>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for (_, data) in inner.blocks.range(from..=to) {
            out.extend(data.outbound.iter().filter(|t| t.sender == wallet).cloned());
        }
        Ok(out)
    }

    async fn multisig_wallet_info(&self, wallet: &str) -> NodeResult<MultisigWalletInfo> {
        let inner = self.inner.read().await;
        inner
            .wallet_info
            .clone()
            .ok_or_else(|| NodeError::LedgerUnavailable {
                chain: self.chain.to_string(),
                message: format!("no multisig account registered for {}", wallet),
            })
    }

    async fn post_transaction(&self, tx: &OutgoingTransaction) -> NodeResult<()> {
        self.inner.write().await.posted.push(tx.clone());
        Ok(())
    }

    fn subscribe_new_blocks(&self) -> broadcast::Receiver<BlockHeader> {
        self.block_tx.subscribe()
    }
}
