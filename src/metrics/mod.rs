//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Blocks processed per chain
//! - Intent classification
//! - Payouts authored and transactions submitted
//! - Signature acceptance and fork recoveries

use crate::error::NodeResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "crossbook_blocks_processed_total",
        "Blocks run through the pipeline",
        &["chain"]
    )
    .unwrap();

    pub static ref SAFE_HEIGHT: GaugeVec = register_gauge_vec!(
        "crossbook_safe_height",
        "Last processed safe height per chain",
        &["chain"]
    )
    .unwrap();

    pub static ref INTENTS_PARSED: CounterVec = register_counter_vec!(
        "crossbook_intents_parsed_total",
        "Inbound transfers classified, by intent kind",
        &["chain", "kind"]
    )
    .unwrap();

    pub static ref PAYOUTS_AUTHORED: CounterVec = register_counter_vec!(
        "crossbook_payouts_authored_total",
        "Outgoing multisig transactions authored, by memo code",
        &["chain", "code"]
    )
    .unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "crossbook_transactions_submitted_total",
        "Quorum transactions posted to a ledger",
        &["chain"]
    )
    .unwrap();

    pub static ref SIGNATURES_ACCEPTED: CounterVec = register_counter_vec!(
        "crossbook_signatures_accepted_total",
        "Peer signatures accepted into pending transfers",
        &[]
    )
    .unwrap();

    pub static ref SIGNATURES_REJECTED: CounterVec = register_counter_vec!(
        "crossbook_signatures_rejected_total",
        "Peer signatures dropped as unknown, duplicate, or invalid",
        &[]
    )
    .unwrap();

    pub static ref FORK_RECOVERIES: CounterVec = register_counter_vec!(
        "crossbook_fork_recoveries_total",
        "Fork recoveries performed by the interleaver",
        &[]
    )
    .unwrap();

    pub static ref SNAPSHOTS_WRITTEN: CounterVec = register_counter_vec!(
        "crossbook_snapshots_written_total",
        "Order book snapshots persisted",
        &[]
    )
    .unwrap();

    pub static ref BOOK_DEPTH: GaugeVec = register_gauge_vec!(
        "crossbook_book_depth",
        "Open orders per side",
        &["side"]
    )
    .unwrap();

    pub static ref PENDING_TRANSFERS: GaugeVec = register_gauge_vec!(
        "crossbook_pending_transfers",
        "Pending multisig transfers awaiting quorum",
        &[]
    )
    .unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> NodeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(crate::error::NodeError::SnapshotIo)?;
        axum::serve(listener, app)
            .await
            .map_err(crate::error::NodeError::SnapshotIo)?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_block_processed(chain: &str, height: u64) {
    BLOCKS_PROCESSED.with_label_values(&[chain]).inc();
    SAFE_HEIGHT.with_label_values(&[chain]).set(height as f64);
}

pub fn record_intent(chain: &str, kind: &str) {
    INTENTS_PARSED.with_label_values(&[chain, kind]).inc();
}

pub fn record_payout_authored(chain: &str, memo: &str) {
    let code = memo.split(',').next().unwrap_or("unknown");
    PAYOUTS_AUTHORED.with_label_values(&[chain, code]).inc();
}

pub fn record_transaction_submitted(chain: &str) {
    TX_SUBMITTED.with_label_values(&[chain]).inc();
}

pub fn record_signature_accepted() {
    SIGNATURES_ACCEPTED.with_label_values(&[]).inc();
}

pub fn record_signature_rejected() {
    SIGNATURES_REJECTED.with_label_values(&[]).inc();
}

pub fn record_fork_recovery() {
    FORK_RECOVERIES.with_label_values(&[]).inc();
}

pub fn record_snapshot_written() {
    SNAPSHOTS_WRITTEN.with_label_values(&[]).inc();
}

pub fn record_book_depth(bids: usize, asks: usize) {
    BOOK_DEPTH.with_label_values(&["bid"]).set(bids as f64);
    BOOK_DEPTH.with_label_values(&["ask"]).set(asks as f64);
}

pub fn record_pending_transfers(count: usize) {
    PENDING_TRANSFERS.with_label_values(&[]).set(count as f64);
}
