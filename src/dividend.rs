//! Dividend processing - periodic member payouts from trade fees
//!
//! The pipeline enqueues a job whenever a chain crosses a dividend height
//! boundary; a single consumer scans the multisig wallet's outbound trade
//! transfers over the covered window, attributes pre-fee volume to every
//! member that signed each transfer, and authors one dividend payout per
//! member.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::NodeResult;
use crate::ledger::{ChainId, LedgerClient, MultisigWalletInfo};
use crate::signing::{verify_digest, PayoutInstruction, SignatureCoordinator};

/// One dividend window to settle on a chain
#[derive(Debug, Clone)]
pub struct DividendJob {
    pub chain: ChainId,
    pub to_height: u64,
}

/// Inputs to the dividend function
pub struct DividendShare {
    pub dividend_rate: Decimal,
    pub exchange_fee_rate: Decimal,
    pub member_count: usize,
}

/// Maps one member's attributed pre-fee volume to a payout amount
pub type DividendFn = Arc<dyn Fn(u64, &DividendShare) -> u64 + Send + Sync>;

/// Default dividend: contribution * dividendRate * feeRate / memberCount,
/// floored
pub fn default_dividend_fn() -> DividendFn {
    Arc::new(|contribution, share| {
        if share.member_count == 0 {
            return 0;
        }
        (Decimal::from(contribution) * share.dividend_rate * share.exchange_fee_rate
            / Decimal::from(share.member_count as u64))
        .floor()
        .to_u64()
        .unwrap_or(0)
    })
}

#[derive(Debug, Clone)]
pub struct DividendChainParams {
    pub wallet_address: String,
    pub dividend_height_interval: u64,
    pub dividend_rate: Decimal,
    pub exchange_fee_rate: Decimal,
}

pub struct DividendProcessor {
    jobs: mpsc::Receiver<DividendJob>,
    ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
    coordinator: Arc<SignatureCoordinator>,
    params: HashMap<ChainId, DividendChainParams>,
    wallet_info: HashMap<ChainId, MultisigWalletInfo>,
    dividend_fn: DividendFn,
}

impl DividendProcessor {
    pub fn new(
        jobs: mpsc::Receiver<DividendJob>,
        ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
        coordinator: Arc<SignatureCoordinator>,
        params: HashMap<ChainId, DividendChainParams>,
        wallet_info: HashMap<ChainId, MultisigWalletInfo>,
        dividend_fn: DividendFn,
    ) -> Self {
        Self {
            jobs,
            ledgers,
            coordinator,
            params,
            wallet_info,
            dividend_fn,
        }
    }

    /// Consume jobs until the queue closes
    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            if let Err(e) = self.process(&job).await {
                warn!(
                    "Dividend job for {} up to height {} failed: {}",
                    job.chain, job.to_height, e
                );
            }
        }
    }

    async fn process(&self, job: &DividendJob) -> NodeResult<()> {
        let params = &self.params[&job.chain];
        let info = &self.wallet_info[&job.chain];
        let ledger = &self.ledgers[&job.chain];

        let from_height = job
            .to_height
            .saturating_sub(params.dividend_height_interval)
            .max(1);
        let transfers = ledger
            .outbound_transfers_in_range(from_height + 1, job.to_height, &params.wallet_address)
            .await?;

        let mut contributions: BTreeMap<String, u64> = BTreeMap::new();
        for transfer in transfers.iter().filter(|t| t.memo.starts_with('t')) {
            let Ok(digest_bytes) = hex::decode(&transfer.id) else {
                continue;
            };
            let Ok(digest) = <[u8; 32]>::try_from(digest_bytes.as_slice()) else {
                continue;
            };
            let before_fee = amount_before_fee(transfer.amount, params.exchange_fee_rate);
            for signature in &transfer.signatures {
                if !info.is_member(&signature.public_key) {
                    continue;
                }
                if verify_digest(&signature.public_key, &signature.signature, &digest) {
                    *contributions.entry(signature.public_key.clone()).or_default() +=
                        before_fee;
                }
            }
        }

        let share = DividendShare {
            dividend_rate: params.dividend_rate,
            exchange_fee_rate: params.exchange_fee_rate,
            member_count: info.member_count,
        };
        let timestamp = ledger
            .block_at_height(job.to_height)
            .await?
            .map(|h| h.timestamp)
            .unwrap_or(0);

        for (member, contribution) in contributions {
            let amount = (self.dividend_fn)(contribution, &share);
            if amount == 0 {
                debug!("Member {} earned no dividend this window", member);
                continue;
            }
            let memo = format!("d1,{},{}: Member dividend", from_height, job.to_height);
            let payout = PayoutInstruction {
                amount,
                recipient: member.clone(),
                height: job.to_height,
                timestamp,
            };
            if let Err(e) = self
                .coordinator
                .author_outgoing(&job.chain, payout, memo)
                .await
            {
                warn!("Failed to author dividend for {}: {}", member, e);
            }
        }

        Ok(())
    }
}

/// Reverse the proportional fee: the transfer amount is post-fee
pub fn amount_before_fee(amount: u64, fee_rate: Decimal) -> u64 {
    let divisor = Decimal::ONE - fee_rate;
    if divisor <= Decimal::ZERO {
        return 0;
    }
    (Decimal::from(amount) / divisor).floor().to_u64().unwrap_or(0)
}
