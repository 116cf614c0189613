//! Per-block processing pipeline
//!
//! Each safe block runs the same phase sequence: rebroadcast sweep,
//! dividend scheduling, outbound observation, intent parsing, rejection
//! refunds, order expiry, closes, matching, and the base-chain snapshot
//! tick. Per-order failures are logged and never abort sibling work; only
//! ledger-level failures bubble up so the interleaver can retry the block.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::book::{MatchResult, Order, Side};
use crate::dividend::DividendJob;
use crate::error::{NodeError, NodeResult};
use crate::intent::{Intent, IntentKind, IntentParser};
use crate::ledger::{ChainId, LedgerClient};
use crate::metrics;
use crate::signing::{PayoutInstruction, SignatureCoordinator};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::state::SharedState;

/// One safe block as handed over by the interleaver
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub chain: ChainId,
    pub height: u64,
    pub timestamp: u64,
    /// Current safe height of every chain
    pub latest_chain_heights: BTreeMap<ChainId, u64>,
    /// Final block of this chain's batch in the current tick
    pub is_last_block: bool,
}

/// Per-chain parameters the pipeline consults
#[derive(Debug, Clone)]
pub struct PipelineChainParams {
    pub wallet_address: String,
    pub order_height_expiry: u64,
    pub exchange_fee_base: u64,
    pub exchange_fee_rate: Decimal,
    pub dividend_start_height: u64,
    pub dividend_height_interval: u64,
    pub dividend_height_offset: u64,
    pub dex_disabled_from_height: Option<u64>,
    pub dex_moved_to_address: Option<String>,
}

pub struct Pipeline {
    core: SharedState,
    coordinator: Arc<SignatureCoordinator>,
    ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
    parser: IntentParser,
    snapshots: Arc<SnapshotStore>,
    dividends: mpsc::Sender<DividendJob>,
    base: ChainId,
    params: HashMap<ChainId, PipelineChainParams>,
    snapshot_finality: u64,
}

/// A payout scheduled during a phase, authored in category batches
type ScheduledPayout = (ChainId, PayoutInstruction, String);

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: SharedState,
        coordinator: Arc<SignatureCoordinator>,
        ledgers: HashMap<ChainId, Arc<dyn LedgerClient>>,
        parser: IntentParser,
        snapshots: Arc<SnapshotStore>,
        dividends: mpsc::Sender<DividendJob>,
        base: ChainId,
        params: HashMap<ChainId, PipelineChainParams>,
        snapshot_finality: u64,
    ) -> Self {
        Self {
            core,
            coordinator,
            ledgers,
            parser,
            snapshots,
            dividends,
            base,
            params,
            snapshot_finality,
        }
    }

    /// Run all phases for one block
    pub async fn process_block(&self, ctx: &BlockContext) -> NodeResult<()> {
        let params = &self.params[&ctx.chain];
        let ledger = self
            .ledgers
            .get(&ctx.chain)
            .ok_or_else(|| NodeError::ChainNotFound(ctx.chain.to_string()))?;

        // Phase 1: rebroadcast sweep on the batch's final block.
        if ctx.is_last_block {
            let safe = ctx
                .latest_chain_heights
                .get(&ctx.chain)
                .copied()
                .unwrap_or(ctx.height);
            self.coordinator.rebroadcast_sweep(&ctx.chain, safe).await;
        }

        // Phase 2: dividend scheduling on interval boundaries.
        self.schedule_dividends(ctx, params);

        // Phase 3: outbound transfers confirm pending entries on-chain.
        let outbound = ledger
            .outbound_transfers(ctx.height, &params.wallet_address)
            .await?;
        if !outbound.is_empty() {
            let mut core = self.core.lock().await;
            for transfer in &outbound {
                if core.registry.remove(&transfer.id).is_some() {
                    debug!("Pending transfer {} confirmed on-chain", transfer.id);
                }
            }
            metrics::record_pending_transfers(core.registry.len());
        }

        // Phase 4: parse inbound transfers into intents.
        let inbound = ledger
            .inbound_transfers(ctx.height, &params.wallet_address)
            .await?;
        let intents: Vec<Intent> = {
            let core = self.core.lock().await;
            inbound
                .iter()
                .map(|t| self.parser.parse(t, &ctx.chain, &core.book))
                .collect()
        };
        for intent in &intents {
            metrics::record_intent(ctx.chain.as_str(), intent_kind_name(&intent.kind));
        }

        // Phase 5: refund rejected intents.
        let refunds: Vec<ScheduledPayout> = intents
            .iter()
            .filter(|i| i.is_rejection())
            .filter_map(|i| self.rejection_refund(i, params, ctx))
            .collect();
        self.author_all(refunds).await;

        // Phase 6: expire orders on this chain's side of the book.
        self.expire_orders(ctx, ledger).await?;

        // Phase 7: close orders.
        self.close_orders(ctx, params, &intents).await;

        // Phase 8: match limit and market intents.
        self.match_orders(ctx, params, &intents).await;

        // Phase 9: snapshot tick on base-chain finality heights.
        if ctx.chain == self.base
            && self.snapshot_finality > 0
            && ctx.height % self.snapshot_finality == 0
        {
            self.snapshot_tick(ctx, params).await;
        }

        metrics::record_block_processed(ctx.chain.as_str(), ctx.height);
        Ok(())
    }

    fn schedule_dividends(&self, ctx: &BlockContext, params: &PipelineChainParams) {
        if params.dividend_height_interval == 0 {
            return;
        }
        let Some(shifted) = ctx.height.checked_sub(params.dividend_height_offset) else {
            return;
        };
        if shifted <= params.dividend_start_height
            || shifted % params.dividend_height_interval != 0
        {
            return;
        }
        let job = DividendJob {
            chain: ctx.chain.clone(),
            to_height: shifted,
        };
        if let Err(e) = self.dividends.try_send(job) {
            warn!("Dividend queue rejected job at height {}: {}", ctx.height, e);
        }
    }

    fn rejection_refund(
        &self,
        intent: &Intent,
        params: &PipelineChainParams,
        ctx: &BlockContext,
    ) -> Option<ScheduledPayout> {
        let memo = match &intent.kind {
            IntentKind::Invalid { reason } => {
                format!("r1,{}: {}", intent.transfer_id, reason)
            }
            IntentKind::Oversized => format!("r1,{}: Oversized order", intent.transfer_id),
            IntentKind::Undersized => format!("r1,{}: Undersized order", intent.transfer_id),
            IntentKind::Moved { to_address } => {
                format!("r5,{},{}: DEX has moved", intent.transfer_id, to_address)
            }
            IntentKind::Disabled => {
                format!("r6,{}: DEX has been disabled", intent.transfer_id)
            }
            _ => return None,
        };
        let amount = intent.amount.saturating_sub(params.exchange_fee_base);
        if amount == 0 {
            debug!("Refund of {} fully consumed by fees", intent.transfer_id);
            return None;
        }
        Some((
            intent.source_chain.clone(),
            PayoutInstruction {
                amount,
                recipient: intent.source_wallet.clone(),
                height: ctx.height,
                timestamp: ctx.timestamp,
            },
            memo,
        ))
    }

    async fn expire_orders(
        &self,
        ctx: &BlockContext,
        ledger: &Arc<dyn LedgerClient>,
    ) -> NodeResult<()> {
        let expired = {
            let mut core = self.core.lock().await;
            if ctx.chain == self.base {
                core.book.expire_bid_orders(ctx.height)
            } else {
                core.book.expire_ask_orders(ctx.height)
            }
        };
        if expired.is_empty() {
            return Ok(());
        }

        let mut refunds: Vec<ScheduledPayout> = Vec::new();
        for order in &expired {
            let params = &self.params[&order.source_chain];
            // The refund is stamped with the block the order actually
            // expired in, which is this block only when heights coincide.
            let timestamp = if order.expiry_height == ctx.height {
                ctx.timestamp
            } else {
                match ledger.block_at_height(order.expiry_height).await {
                    Ok(Some(header)) => header.timestamp,
                    Ok(None) => ctx.timestamp,
                    Err(e) => {
                        warn!(
                            "Falling back to block timestamp for expired order {}: {}",
                            order.id, e
                        );
                        ctx.timestamp
                    }
                }
            };
            let amount = order.remaining().saturating_sub(params.exchange_fee_base);
            if amount == 0 {
                continue;
            }
            refunds.push((
                order.source_chain.clone(),
                PayoutInstruction {
                    amount,
                    recipient: order.source_wallet.clone(),
                    height: ctx.height,
                    timestamp,
                },
                format!("r2,{}: Expired order", order.id),
            ));
        }
        self.author_all(refunds).await;
        Ok(())
    }

    async fn close_orders(
        &self,
        ctx: &BlockContext,
        params: &PipelineChainParams,
        intents: &[Intent],
    ) {
        let mut refunds: Vec<ScheduledPayout> = Vec::new();
        {
            let mut core = self.core.lock().await;
            for intent in intents {
                let IntentKind::Close { order_id } = &intent.kind else {
                    continue;
                };
                match core.book.close_order(order_id) {
                    Ok(order) => {
                        let amount = (order.remaining() + intent.amount)
                            .saturating_sub(params.exchange_fee_base);
                        if amount == 0 {
                            continue;
                        }
                        refunds.push((
                            intent.source_chain.clone(),
                            PayoutInstruction {
                                amount,
                                recipient: intent.source_wallet.clone(),
                                height: ctx.height,
                                timestamp: ctx.timestamp,
                            },
                            format!("r3,{},{}: Closed order", order.id, intent.transfer_id),
                        ));
                    }
                    Err(e) => warn!("Close of {} failed: {}", order_id, e),
                }
            }
        }
        self.author_all(refunds).await;
    }

    async fn match_orders(
        &self,
        ctx: &BlockContext,
        params: &PipelineChainParams,
        intents: &[Intent],
    ) {
        let mut payouts: Vec<ScheduledPayout> = Vec::new();
        for intent in intents {
            let Some(order) = self.order_from_intent(intent, params) else {
                continue;
            };
            let is_market = order.price.is_none();
            let result = {
                let mut core = self.core.lock().await;
                let result = core.book.add_order(order);
                metrics::record_book_depth(core.book.bid_count(), core.book.ask_count());
                result
            };
            let result: MatchResult = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!("Order {} was not admitted: {}", intent.transfer_id, e);
                    continue;
                }
            };

            if result.take_size > 0 {
                self.schedule_taker_payout(&result, ctx, &mut payouts);
                for fill in &result.makers {
                    let gross = if fill.order.target_chain == self.base {
                        fill.value_taken
                    } else {
                        fill.size_taken
                    };
                    let maker_params = &self.params[&fill.order.target_chain];
                    let Some(amount) = net_after_fees(gross, maker_params) else {
                        debug!("Maker payout for {} underflowed", fill.order.id);
                        continue;
                    };
                    payouts.push((
                        fill.order.target_chain.clone(),
                        PayoutInstruction {
                            amount,
                            recipient: fill.order.target_wallet.clone(),
                            height: ctx.height,
                            timestamp: ctx.timestamp + 1,
                        },
                        format!(
                            "t2,{},{},{}: Order made",
                            fill.order.source_chain, fill.order.id, result.taker.id
                        ),
                    ));
                }
            }

            // Market residual is refunded on the source chain.
            if is_market && result.taker.remaining() > 0 {
                let amount = result
                    .taker
                    .remaining()
                    .saturating_sub(params.exchange_fee_base);
                if amount > 0 {
                    payouts.push((
                        result.taker.source_chain.clone(),
                        PayoutInstruction {
                            amount,
                            recipient: result.taker.source_wallet.clone(),
                            height: ctx.height,
                            timestamp: ctx.timestamp,
                        },
                        format!("r4,{}: Unmatched market order part", result.taker.id),
                    ));
                }
            }
        }
        self.author_all(payouts).await;
    }

    fn schedule_taker_payout(
        &self,
        result: &MatchResult,
        ctx: &BlockContext,
        payouts: &mut Vec<ScheduledPayout>,
    ) {
        let taker = &result.taker;
        let gross = if taker.target_chain == self.base {
            result.take_value
        } else {
            result.take_size
        };
        let taker_params = &self.params[&taker.target_chain];
        let Some(amount) = net_after_fees(gross, taker_params) else {
            debug!("Taker payout for {} underflowed", taker.id);
            return;
        };
        payouts.push((
            taker.target_chain.clone(),
            PayoutInstruction {
                amount,
                recipient: taker.target_wallet.clone(),
                height: ctx.height,
                timestamp: ctx.timestamp + 1,
            },
            format!("t1,{},{}: Orders taken", taker.source_chain, taker.id),
        ));
    }

    fn order_from_intent(
        &self,
        intent: &Intent,
        params: &PipelineChainParams,
    ) -> Option<Order> {
        let (price, target_wallet) = match &intent.kind {
            IntentKind::Limit {
                price,
                target_wallet,
            } => (Some(*price), target_wallet.clone()),
            IntentKind::Market { target_wallet } => (None, target_wallet.clone()),
            _ => return None,
        };
        let side = if intent.source_chain == self.base {
            Side::Bid
        } else {
            Side::Ask
        };
        let (value, size) = match side {
            Side::Bid => (intent.amount, 0),
            Side::Ask => (0, intent.amount),
        };
        Some(Order {
            id: intent.transfer_id.clone(),
            side,
            source_chain: intent.source_chain.clone(),
            source_wallet: intent.source_wallet.clone(),
            target_chain: self.counter_chain(&intent.source_chain),
            target_wallet,
            height: intent.height,
            expiry_height: intent.height + params.order_height_expiry,
            timestamp: intent.timestamp,
            price,
            value,
            value_remaining: value,
            size,
            size_remaining: size,
            arrival: 0,
        })
    }

    async fn snapshot_tick(&self, ctx: &BlockContext, params: &PipelineChainParams) {
        let prior = { self.core.lock().await.last_snapshot.clone() };

        if let Some(prior) = &prior {
            // If the disable height first falls inside the window the prior
            // snapshot covers, every captured order is refunded.
            if let Some(disabled_from) = params.dex_disabled_from_height {
                let prior_height = prior.base_height(&self.base);
                if prior_height < disabled_from && disabled_from <= ctx.height {
                    let refunds = self.disable_refunds(prior, ctx);
                    self.author_all(refunds).await;
                }
            }

            match self.snapshots.save(prior, &self.base) {
                Ok(()) => metrics::record_snapshot_written(),
                Err(e) => warn!("Snapshot persist failed: {}", e),
            }
        }

        let mut core = self.core.lock().await;
        core.last_snapshot = Some(Snapshot {
            order_book: core.book.get_snapshot(),
            chain_heights: ctx.latest_chain_heights.clone(),
        });
    }

    fn disable_refunds(&self, prior: &Snapshot, ctx: &BlockContext) -> Vec<ScheduledPayout> {
        let mut refunds = Vec::new();
        let orders = prior
            .order_book
            .bid_limit_orders
            .iter()
            .chain(prior.order_book.ask_limit_orders.iter());
        for order in orders {
            let source_params = &self.params[&order.source_chain];
            let amount = order.remaining().saturating_sub(source_params.exchange_fee_base);
            if amount == 0 {
                continue;
            }
            let memo = match &source_params.dex_moved_to_address {
                Some(addr) => format!("r5,{},{}: DEX has moved", order.id, addr),
                None => format!("r6,{}: DEX has been disabled", order.id),
            };
            refunds.push((
                order.source_chain.clone(),
                PayoutInstruction {
                    amount,
                    recipient: order.source_wallet.clone(),
                    height: ctx.height,
                    timestamp: ctx.timestamp,
                },
                memo,
            ));
        }
        refunds
    }

    /// Author one category of payouts concurrently
    async fn author_all(&self, payouts: Vec<ScheduledPayout>) {
        let results = futures::future::join_all(payouts.into_iter().map(
            |(chain, payout, memo)| async move {
                let outcome = self
                    .coordinator
                    .author_outgoing(&chain, payout, memo.clone())
                    .await;
                (memo, outcome)
            },
        ))
        .await;
        for (memo, outcome) in results {
            match outcome {
                Ok(_) => {}
                Err(NodeError::PayoutUnderflow { .. }) => {
                    debug!("Skipped underflowing payout {}", memo)
                }
                Err(e) => warn!("Failed to author {}: {}", memo, e),
            }
        }
    }

    fn counter_chain(&self, chain: &ChainId) -> ChainId {
        self.params
            .keys()
            .find(|c| *c != chain)
            .cloned()
            .unwrap_or_else(|| self.base.clone())
    }
}

fn intent_kind_name(kind: &IntentKind) -> &'static str {
    match kind {
        IntentKind::Limit { .. } => "limit",
        IntentKind::Market { .. } => "market",
        IntentKind::Close { .. } => "close",
        IntentKind::Invalid { .. } => "invalid",
        IntentKind::Oversized => "oversized",
        IntentKind::Undersized => "undersized",
        IntentKind::Moved { .. } => "moved",
        IntentKind::Disabled => "disabled",
    }
}

/// Apply the proportional then the flat fee, floored; `None` when nothing
/// positive remains
fn net_after_fees(gross: u64, params: &PipelineChainParams) -> Option<u64> {
    let net = (Decimal::from(gross) * (Decimal::ONE - params.exchange_fee_rate)).floor()
        - Decimal::from(params.exchange_fee_base);
    if net > Decimal::ZERO {
        net.to_u64()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::ParserChainParams;
    use crate::ledger::{BlockHeader, MemoryLedger, MultisigWalletInfo, Transfer};
    use crate::p2p::MemoryBus;
    use crate::signing::{
        public_key_hex, signing_key_from_passphrase, ChainWallet, CoordinatorConfig,
    };
    use crate::state::shared_state;
    use std::collections::BTreeSet;
    use std::time::Duration;

    const BASE: &str = "alpha";
    const QUOTE: &str = "beta";

    struct Fixture {
        pipeline: Pipeline,
        base_ledger: Arc<MemoryLedger>,
        quote_ledger: Arc<MemoryLedger>,
        _dividend_rx: mpsc::Receiver<DividendJob>,
        snapshot_dir: tempfile::TempDir,
    }

    fn wallet_address(chain: &str) -> String {
        format!("multisig-{chain}")
    }

    fn chain_params(fee_base: u64) -> PipelineChainParams {
        PipelineChainParams {
            wallet_address: String::new(),
            order_height_expiry: 10,
            exchange_fee_base: fee_base,
            exchange_fee_rate: Decimal::ZERO,
            dividend_start_height: 1_000_000,
            dividend_height_interval: 0,
            dividend_height_offset: 0,
            dex_disabled_from_height: None,
            dex_moved_to_address: None,
        }
    }

    fn fixture(tweak: impl Fn(&mut HashMap<ChainId, PipelineChainParams>)) -> Fixture {
        let base = ChainId::new(BASE);
        let quote = ChainId::new(QUOTE);
        let base_ledger = MemoryLedger::new(base.clone());
        let quote_ledger = MemoryLedger::new(quote.clone());

        let member = signing_key_from_passphrase("node member");
        let members: BTreeSet<String> = [public_key_hex(&member)].into();
        let info = MultisigWalletInfo {
            members,
            member_count: 1,
            required_signature_count: 2,
        };

        let mut ledgers: HashMap<ChainId, Arc<dyn LedgerClient>> = HashMap::new();
        ledgers.insert(base.clone(), base_ledger.clone());
        ledgers.insert(quote.clone(), quote_ledger.clone());

        let mut wallets = HashMap::new();
        let mut rebroadcast_windows = HashMap::new();
        for chain in [&base, &quote] {
            wallets.insert(
                chain.clone(),
                ChainWallet::new(
                    chain.clone(),
                    wallet_address(chain.as_str()),
                    signing_key_from_passphrase(&format!("shared {chain}")),
                    member.clone(),
                    info.clone(),
                ),
            );
            rebroadcast_windows.insert(chain.clone(), (10, 100));
        }

        let core = shared_state();
        let coordinator = Arc::new(SignatureCoordinator::new(
            core.clone(),
            ledgers.clone(),
            Arc::new(MemoryBus::new()),
            wallets,
            CoordinatorConfig {
                channel: "test:signature".to_string(),
                signature_broadcast_delay: Duration::from_millis(10),
                transaction_submit_delay: Duration::from_millis(10),
                rebroadcast_windows,
                passive: false,
            },
        ));

        let mut params = HashMap::new();
        let mut p = chain_params(0);
        p.wallet_address = wallet_address(BASE);
        params.insert(base.clone(), p);
        let mut p = chain_params(0);
        p.wallet_address = wallet_address(QUOTE);
        params.insert(quote.clone(), p);
        tweak(&mut params);

        let parser_params: HashMap<ChainId, ParserChainParams> = params
            .iter()
            .map(|(chain, p)| {
                (
                    chain.clone(),
                    ParserChainParams {
                        min_order_amount: 1,
                        exchange_fee_base: p.exchange_fee_base,
                        dex_disabled_from_height: p.dex_disabled_from_height,
                        dex_moved_to_address: p.dex_moved_to_address.clone(),
                    },
                )
            })
            .collect();
        let parser = IntentParser::new(base.clone(), quote.clone(), parser_params);

        let snapshot_dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(SnapshotStore::new(
            snapshot_dir.path().join("current.json"),
            snapshot_dir.path().join("backups"),
            10,
        ));

        let (dividend_tx, dividend_rx) = mpsc::channel(16);

        let pipeline = Pipeline::new(
            core,
            coordinator,
            ledgers,
            parser,
            snapshots,
            dividend_tx,
            base,
            params,
            100,
        );

        Fixture {
            pipeline,
            base_ledger,
            quote_ledger,
            _dividend_rx: dividend_rx,
            snapshot_dir,
        }
    }

    fn inbound(id: &str, sender: &str, chain: &str, amount: u64, memo: &str, height: u64) -> Transfer {
        Transfer {
            id: id.to_string(),
            sender: sender.to_string(),
            recipient: wallet_address(chain),
            amount,
            memo: memo.to_string(),
            height,
            timestamp: height * 10,
            signatures: Vec::new(),
        }
    }

    fn ctx(chain: &str, height: u64) -> BlockContext {
        let mut latest = BTreeMap::new();
        latest.insert(ChainId::new(BASE), height);
        latest.insert(ChainId::new(QUOTE), height);
        BlockContext {
            chain: ChainId::new(chain),
            height,
            timestamp: height * 10,
            latest_chain_heights: latest,
            is_last_block: false,
        }
    }

    async fn process(f: &Fixture, chain: &str, height: u64, transfers: Vec<Transfer>) {
        let ledger = if chain == BASE {
            &f.base_ledger
        } else {
            &f.quote_ledger
        };
        ledger
            .push_block(
                BlockHeader {
                    height,
                    timestamp: height * 10,
                },
                transfers,
                Vec::new(),
            )
            .await;
        f.pipeline.process_block(&ctx(chain, height)).await.unwrap();
    }

    async fn authored(f: &Fixture) -> Vec<(String, String, u64, String)> {
        let core = f.pipeline.core.lock().await;
        core.registry
            .values()
            .map(|e| {
                (
                    e.target_chain.to_string(),
                    e.transaction.recipient.clone(),
                    e.transaction.amount,
                    e.transaction.memo.clone(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_basic_match_settles_both_sides() {
        let f = fixture(|_| {});
        process(
            &f,
            QUOTE,
            1,
            vec![inbound("ask1", "wA-src", QUOTE, 100, "alpha,limit,2,wA", 1)],
        )
        .await;
        process(
            &f,
            BASE,
            1,
            vec![inbound("bid1", "wB-src", BASE, 200, "beta,limit,2,wB", 1)],
        )
        .await;

        let payouts = authored(&f).await;
        assert_eq!(payouts.len(), 2);
        assert_eq!(
            payouts[0],
            (
                QUOTE.to_string(),
                "wB".to_string(),
                100,
                "t1,alpha,bid1: Orders taken".to_string()
            )
        );
        assert_eq!(
            payouts[1],
            (
                BASE.to_string(),
                "wA".to_string(),
                200,
                "t2,beta,ask1,bid1: Order made".to_string()
            )
        );

        let core = f.pipeline.core.lock().await;
        assert_eq!(core.book.bid_count() + core.book.ask_count(), 0);
    }

    #[tokio::test]
    async fn test_market_residual_is_refunded() {
        let f = fixture(|_| {});
        process(
            &f,
            QUOTE,
            1,
            vec![inbound("ask1", "wA-src", QUOTE, 100, "alpha,limit,2,wA", 1)],
        )
        .await;
        process(
            &f,
            BASE,
            1,
            vec![inbound("mkt1", "wB-src", BASE, 300, "beta,market,wB", 1)],
        )
        .await;

        let payouts = authored(&f).await;
        assert_eq!(payouts.len(), 3);
        assert_eq!(payouts[0].1, "wB");
        assert_eq!(payouts[0].2, 100);
        assert_eq!(payouts[1].1, "wA");
        assert_eq!(payouts[1].2, 200);
        assert_eq!(
            payouts[2],
            (
                BASE.to_string(),
                "wB-src".to_string(),
                100,
                "r4,mkt1: Unmatched market order part".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_rejection_refund_memos() {
        let f = fixture(|params| {
            for p in params.values_mut() {
                p.exchange_fee_base = 1;
            }
        });
        process(
            &f,
            BASE,
            1,
            vec![
                inbound("bad1", "w1", BASE, 50, "gamma,limit,2,w", 1),
                inbound("bad2", "w2", BASE, 50, "beta,stake,2", 1),
            ],
        )
        .await;

        let payouts = authored(&f).await;
        assert_eq!(payouts.len(), 2);
        assert_eq!(payouts[0].3, "r1,bad1: Invalid target chain");
        assert_eq!(payouts[0].2, 49);
        assert_eq!(payouts[1].3, "r1,bad2: Invalid operation");
    }

    #[tokio::test]
    async fn test_expiry_refund_uses_expiry_block_timestamp() {
        let f = fixture(|_| {});
        process(
            &f,
            BASE,
            5,
            vec![inbound("bid1", "w1", BASE, 200, "beta,limit,2,wB", 5)],
        )
        .await;

        // expiry_height = 5 + 10 = 15; the block at 15 exists with its own
        // timestamp, but the order is only observed expired at height 16.
        f.base_ledger
            .push_block(
                BlockHeader {
                    height: 15,
                    timestamp: 150,
                },
                Vec::new(),
                Vec::new(),
            )
            .await;
        process(&f, BASE, 16, Vec::new()).await;

        let payouts = authored(&f).await;
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].3, "r2,bid1: Expired order");
        let core = f.pipeline.core.lock().await;
        let entry = core.registry.values().next().unwrap();
        assert_eq!(entry.transaction.timestamp, 150);
        assert_eq!(entry.transaction.amount, 200);
    }

    #[tokio::test]
    async fn test_expiry_on_exact_height_uses_current_timestamp() {
        let f = fixture(|_| {});
        process(
            &f,
            BASE,
            5,
            vec![inbound("bid1", "w1", BASE, 200, "beta,limit,2,wB", 5)],
        )
        .await;
        process(&f, BASE, 15, Vec::new()).await;

        let core = f.pipeline.core.lock().await;
        let entry = core.registry.values().next().unwrap();
        assert_eq!(entry.transaction.timestamp, 150);
        assert_eq!(core.book.bid_count(), 0);
    }

    #[tokio::test]
    async fn test_close_refunds_remaining_plus_closer_amount() {
        let f = fixture(|_| {});
        process(
            &f,
            BASE,
            1,
            vec![inbound("bid1", "w1", BASE, 200, "beta,limit,2,wB", 1)],
        )
        .await;
        process(
            &f,
            BASE,
            2,
            vec![inbound("close1", "w1", BASE, 5, "beta,close,bid1", 2)],
        )
        .await;

        let payouts = authored(&f).await;
        assert_eq!(payouts.len(), 1);
        assert_eq!(
            payouts[0],
            (
                BASE.to_string(),
                "w1".to_string(),
                205,
                "r3,bid1,close1: Closed order".to_string()
            )
        );
        let core = f.pipeline.core.lock().await;
        assert_eq!(core.book.bid_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_finality_with_disable_refunds_captured_book() {
        let f = fixture(|params| {
            params
                .get_mut(&ChainId::new(BASE))
                .unwrap()
                .dex_disabled_from_height = Some(150);
        });

        // An open bid below the disable height is captured at height 100.
        process(
            &f,
            BASE,
            99,
            vec![inbound("bid1", "w1", BASE, 200, "beta,limit,0.5,wB", 99)],
        )
        .await;
        process(&f, BASE, 100, Vec::new()).await;
        {
            let core = f.pipeline.core.lock().await;
            let snap = core.last_snapshot.as_ref().unwrap();
            assert_eq!(snap.order_book.bid_limit_orders.len(), 1);
        }

        // Height 200: the prior snapshot covers (100, 200], which contains
        // the disable height; the captured book is refunded.
        process(&f, BASE, 200, Vec::new()).await;

        let payouts = authored(&f).await;
        // The bid expired at 109 on the way, so the r2 comes first.
        let disable: Vec<_> = payouts.iter().filter(|p| p.3.starts_with("r6")).collect();
        assert_eq!(disable.len(), 1);
        assert_eq!(disable[0].3, "r6,bid1: DEX has been disabled");
        assert!(f
            .snapshot_dir
            .path()
            .join("backups/snapshot-100.json")
            .exists());
    }

    #[tokio::test]
    async fn test_outbound_observation_clears_registry() {
        let f = fixture(|_| {});
        process(
            &f,
            BASE,
            1,
            vec![inbound("bad1", "w1", BASE, 50, "gamma,limit,2,w", 1)],
        )
        .await;
        let id = {
            let core = f.pipeline.core.lock().await;
            let id = core.registry.values().next().unwrap().transaction.id.clone();
            id
        };

        let confirmation = Transfer {
            id,
            sender: wallet_address(BASE),
            recipient: "w1".to_string(),
            amount: 50,
            memo: "r1,bad1: Invalid target chain".to_string(),
            height: 2,
            timestamp: 20,
            signatures: Vec::new(),
        };
        f.base_ledger
            .push_block(
                BlockHeader {
                    height: 2,
                    timestamp: 20,
                },
                Vec::new(),
                vec![confirmation],
            )
            .await;
        f.pipeline.process_block(&ctx(BASE, 2)).await.unwrap();

        assert!(f.pipeline.core.lock().await.registry.is_empty());
    }

    #[tokio::test]
    async fn test_dividend_job_enqueued_on_boundary() {
        let mut f = fixture(|params| {
            let p = params.get_mut(&ChainId::new(BASE)).unwrap();
            p.dividend_height_interval = 100;
            p.dividend_height_offset = 10;
            p.dividend_start_height = 100;
        });

        // height 110: shifted = 100, not past the start height.
        process(&f, BASE, 110, Vec::new()).await;
        assert!(f._dividend_rx.try_recv().is_err());

        // height 210: shifted = 200, past start and on the interval.
        process(&f, BASE, 210, Vec::new()).await;
        let job = f._dividend_rx.try_recv().unwrap();
        assert_eq!(job.chain.as_str(), BASE);
        assert_eq!(job.to_height, 200);

        process(&f, BASE, 211, Vec::new()).await;
        assert!(f._dividend_rx.try_recv().is_err());
    }
}
