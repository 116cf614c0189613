//! Signature coordination for outgoing multisig transfers
//!
//! Every payout the pipeline schedules becomes a pending transfer carrying
//! this node's signature; peer signatures are verified, deduplicated, and
//! accumulated until quorum, at which point the transaction is posted to
//! the target ledger after a short absorption delay.

mod wallet;

pub use wallet::{
    decrypt_passphrase, digest_of, public_key_hex, sign_digest, signing_key_from_passphrase,
    transaction_digest, verify_digest, ChainWallet,
};

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::ledger::{ChainId, LedgerClient, MemberSignature};
use crate::metrics;
use crate::p2p::{P2pBus, SignatureEvent};
use crate::registry::PendingTransfer;
use crate::state::SharedState;

/// One payout the pipeline wants settled on a target chain
#[derive(Debug, Clone)]
pub struct PayoutInstruction {
    pub amount: u64,
    pub recipient: String,
    /// Source-chain height at authoring
    pub height: u64,
    pub timestamp: u64,
}

pub struct CoordinatorConfig {
    /// Bus channel scoped to this node's (base, quote) wallet pair
    pub channel: String,
    pub signature_broadcast_delay: Duration,
    pub transaction_submit_delay: Duration,
    /// Per target chain: exclusive (after, until) bounds in safe heights
    /// past creation during which pending transfers are re-announced
    pub rebroadcast_windows: HashMap<ChainId, (u64, u64)>,
    pub passive: bool,
}

pub struct SignatureCoordinator {
    core: SharedState,
    ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
    bus: Arc<dyn P2pBus>,
    wallets: HashMap<ChainId, ChainWallet>,
    config: CoordinatorConfig,
}

impl SignatureCoordinator {
    pub fn new(
        core: SharedState,
        ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
        bus: Arc<dyn P2pBus>,
        wallets: HashMap<ChainId, ChainWallet>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            core,
            ledgers,
            bus,
            wallets,
            config,
        }
    }

    /// Author an outgoing transfer on `target`, register it, and schedule
    /// the delayed broadcast of this node's signature
    ///
    /// Returns the transaction id, or `None` in passive mode.
    pub async fn author_outgoing(
        &self,
        target: &ChainId,
        payout: PayoutInstruction,
        memo: String,
    ) -> NodeResult<Option<String>> {
        if self.config.passive {
            return Ok(None);
        }
        if payout.amount == 0 {
            return Err(NodeError::PayoutUnderflow { context: memo });
        }
        let wallet = self
            .wallets
            .get(target)
            .ok_or_else(|| NodeError::ChainNotFound(target.to_string()))?;

        let tx = wallet.build_transaction(
            &payout.recipient,
            payout.amount,
            payout.timestamp,
            payout.height,
            memo,
        );
        let own_signature = tx.signatures[0].clone();
        let id = tx.id.clone();

        metrics::record_payout_authored(target.as_str(), &tx.memo);
        debug!(
            "Authored {} -> {} on {} ({})",
            payout.amount, payout.recipient, target, tx.memo
        );

        let entry = PendingTransfer {
            target_chain: target.clone(),
            processed_signatures: HashSet::from([own_signature.signature.clone()]),
            contributors: HashSet::from([own_signature.public_key.clone()]),
            public_key: wallet.member_public.clone(),
            creation_height: payout.height,
            inserted_at: Utc::now().timestamp_millis() as u64,
            is_ready: tx.signatures.len() >= wallet.info.required_signature_count,
            transaction: tx,
        };

        {
            let mut core = self.core.lock().await;
            if core.registry.contains(&id) {
                debug!("Re-authoring {}; earlier entry dropped", id);
            }
            core.registry.put(id.clone(), entry);
            metrics::record_pending_transfers(core.registry.len());
        }

        let bus = self.bus.clone();
        let channel = self.config.channel.clone();
        let delay = self.config.signature_broadcast_delay;
        let event = SignatureEvent {
            transaction_id: id.clone(),
            signature: own_signature.signature,
            public_key: own_signature.public_key,
        };
        tokio::spawn(async move {
            sleep(delay).await;
            bus.emit_signature(&channel, event);
        });

        Ok(Some(id))
    }

    /// Process one peer signature
    ///
    /// Unknown transactions, duplicates, non-members, and failed
    /// verifications are dropped silently; acceptance rebroadcasts the
    /// signature, and exact quorum schedules the delayed submission.
    pub async fn on_peer_signature(&self, event: SignatureEvent) {
        match self.accept_signature(&event).await {
            Ok((quota, target)) => {
                metrics::record_signature_accepted();
                // Accepted signatures propagate to peers that may have
                // missed them.
                self.bus.emit_signature(&self.config.channel, event.clone());
                if quota == 0 {
                    self.schedule_submission(&target, event.transaction_id);
                }
            }
            Err(e) => {
                metrics::record_signature_rejected();
                debug!("Dropped peer signature: {}", e);
            }
        }
    }

    async fn accept_signature(&self, event: &SignatureEvent) -> NodeResult<(i64, ChainId)> {
        let mut core = self.core.lock().await;
        let entry = core
            .registry
            .get_mut(&event.transaction_id)
            .ok_or_else(|| NodeError::TransactionNotFound(event.transaction_id.clone()))?;
        if entry.processed_signatures.contains(&event.signature) {
            return Err(NodeError::SignatureReject {
                tx_id: event.transaction_id.clone(),
                reason: "duplicate signature".to_string(),
            });
        }
        let wallet = self
            .wallets
            .get(&entry.target_chain)
            .ok_or_else(|| NodeError::ChainNotFound(entry.target_chain.to_string()))?;
        let digest = wallet::digest_of(&entry.transaction);
        if !wallet.info.is_member(&event.public_key) {
            return Err(NodeError::SignatureReject {
                tx_id: event.transaction_id.clone(),
                reason: format!("{} is not a member", event.public_key),
            });
        }
        if !wallet::verify_digest(&event.public_key, &event.signature, &digest) {
            return Err(NodeError::SignatureReject {
                tx_id: event.transaction_id.clone(),
                reason: "verification failed".to_string(),
            });
        }

        entry.transaction.signatures.push(MemberSignature {
            public_key: event.public_key.clone(),
            signature: event.signature.clone(),
        });
        entry.contributors.insert(event.public_key.clone());
        entry.processed_signatures.insert(event.signature.clone());
        let quota = entry.transaction.signatures.len() as i64
            - wallet.info.required_signature_count as i64;
        entry.is_ready = quota >= 0;
        Ok((quota, entry.target_chain.clone()))
    }

    /// Submit after `transaction_submit_delay`, absorbing any signatures
    /// still arriving into the same submission
    fn schedule_submission(&self, target: &ChainId, transaction_id: String) {
        let Some(ledger) = self.ledgers.get(target).cloned() else {
            return;
        };
        let core = self.core.clone();
        let delay = self.config.transaction_submit_delay;
        let chain = target.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let tx = {
                let core = core.lock().await;
                core.registry
                    .get(&transaction_id)
                    .filter(|entry| entry.is_ready)
                    .map(|entry| entry.transaction.clone())
            };
            let Some(tx) = tx else {
                return;
            };
            match ledger.post_transaction(&tx).await {
                Ok(()) => metrics::record_transaction_submitted(chain.as_str()),
                Err(e) => warn!("Failed to post transaction {}: {}", transaction_id, e),
            }
        });
    }

    /// Re-announce pending transfers targeting `chain` whose age in safe
    /// heights sits strictly inside the rebroadcast window
    pub async fn rebroadcast_sweep(&self, chain: &ChainId, current_safe_height: u64) {
        let Some(&(after, until)) = self.config.rebroadcast_windows.get(chain) else {
            return;
        };

        let mut posts = Vec::new();
        let mut emits = Vec::new();
        {
            let core = self.core.lock().await;
            for entry in core.registry.values() {
                if entry.target_chain != *chain {
                    continue;
                }
                let age = current_safe_height.saturating_sub(entry.creation_height);
                if age <= after || age >= until {
                    continue;
                }
                if entry.is_ready {
                    posts.push(entry.transaction.clone());
                } else if let Some(own) = entry.transaction.signatures.first() {
                    emits.push(SignatureEvent {
                        transaction_id: entry.transaction.id.clone(),
                        signature: own.signature.clone(),
                        public_key: own.public_key.clone(),
                    });
                }
            }
        }

        for event in emits {
            self.bus.emit_signature(&self.config.channel, event);
        }

        if let Some(ledger) = self.ledgers.get(chain) {
            let results =
                futures::future::join_all(posts.iter().map(|tx| ledger.post_transaction(tx)))
                    .await;
            for (tx, result) in posts.iter().zip(results) {
                if let Err(e) = result {
                    warn!("Rebroadcast post of {} failed: {}", tx.id, e);
                }
            }
        }
    }
}
