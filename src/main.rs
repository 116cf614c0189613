//! Crossbook - federated cross-chain DEX coordinator node
//!
//! The node observes two ledgers, interprets specially-encoded inbound
//! transfers as trading intents, matches them through a price-time limit
//! order book, and cooperates with peer federation members to produce
//! outgoing multisignature payouts that settle trades, refunds, expiries,
//! closures, and periodic member dividends.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

mod api;
mod book;
mod config;
mod dividend;
mod error;
mod intent;
mod interleave;
mod ledger;
mod metrics;
mod p2p;
mod pipeline;
mod registry;
mod signing;
mod snapshot;
mod state;

use config::Settings;
use dividend::{default_dividend_fn, DividendChainParams, DividendProcessor};
use intent::{IntentParser, ParserChainParams};
use interleave::{watch_chain, BlockInterleaver, ForkWatcher, InterleaverChainParams};
use ledger::{ChainId, LedgerClient, MemoryLedger, MultisigWalletInfo};
use p2p::{MemoryBus, P2pBus};
use pipeline::{Pipeline, PipelineChainParams};
use signing::{
    signing_key_from_passphrase, ChainWallet, CoordinatorConfig, SignatureCoordinator,
};
use snapshot::SnapshotStore;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Crossbook node v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    let base = settings.base_chain_id();
    let quote = settings.quote_chain_id();
    info!("Serving market {}/{}", base, quote);

    // Ledger clients and per-chain wallets. The embedded in-memory ledger
    // backs the dev node; a deployment wires protocol-specific clients at
    // this boundary.
    let mut ledgers: HashMap<ChainId, Arc<dyn LedgerClient>> = HashMap::new();
    let mut wallets = HashMap::new();
    let mut wallet_info = HashMap::new();
    for (name, chain_config) in &settings.chains {
        let chain = ChainId::new(name.clone());

        let member_passphrase = resolve_passphrase(
            &chain_config.passphrase,
            &chain_config.encrypted_passphrase,
        )?;
        let shared_passphrase = resolve_passphrase(
            &chain_config.shared_passphrase,
            &chain_config.encrypted_shared_passphrase,
        )?;
        let member = signing_key_from_passphrase(&member_passphrase);
        let shared = signing_key_from_passphrase(&shared_passphrase);

        let memory = MemoryLedger::new(chain.clone());
        memory
            .set_wallet_info(MultisigWalletInfo {
                members: [signing::public_key_hex(&member)].into(),
                member_count: 1,
                required_signature_count: 1,
            })
            .await;
        let client: Arc<dyn LedgerClient> = memory;
        info!(
            "Opened ledger view for chain {} (module {}) at {}",
            name, chain_config.module_alias, chain_config.database
        );

        let info = client
            .multisig_wallet_info(&chain_config.wallet_address)
            .await
            .with_context(|| format!("Failed to load multisig wallet info for {}", name))?;
        info!(
            "Chain {} multisig: {} members, {} required",
            name, info.member_count, info.required_signature_count
        );

        wallets.insert(
            chain.clone(),
            ChainWallet::new(
                chain.clone(),
                chain_config.wallet_address.clone(),
                shared,
                member,
                info.clone(),
            ),
        );
        wallet_info.insert(chain.clone(), info);
        ledgers.insert(chain, client);
    }

    // Core state, restored from the latest persisted snapshot if present.
    let core = state::shared_state();
    let snapshots = Arc::new(SnapshotStore::new(
        settings.snapshot.order_book_snapshot_file_path.clone(),
        settings.snapshot.order_book_snapshot_backup_dir_path.clone(),
        settings.snapshot.order_book_snapshot_backup_max_count,
    ));
    let mut initial_heights: HashMap<ChainId, u64> = HashMap::new();
    let mut initial_timestamp = 0;
    let restored = match snapshots.load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Snapshot load failed; starting with an empty book: {}", e);
            None
        }
    };
    if let Some(snapshot) = restored {
        let base_height = snapshot.base_height(&base);
        {
            let mut locked = core.lock().await;
            locked.book.set_snapshot(snapshot.order_book.clone());
            locked.last_snapshot = Some(snapshot.clone());
        }
        for (chain, height) in &snapshot.chain_heights {
            initial_heights.insert(chain.clone(), *height);
        }
        if let Ok(Some(header)) = ledgers[&base].block_at_height(base_height).await {
            initial_timestamp = header.timestamp;
        }
        info!("Restored order book snapshot at base height {}", base_height);
    }

    // Signature coordination over the P2P bus.
    let channel = p2p::signature_channel(
        "crossbook",
        &settings.chain(&base).wallet_address,
        &settings.chain(&quote).wallet_address,
    );
    let bus: Arc<dyn P2pBus> = Arc::new(MemoryBus::new());
    let rebroadcast_windows = settings
        .chains
        .iter()
        .map(|(name, c)| {
            (
                ChainId::new(name.clone()),
                (c.rebroadcast_after_height, c.rebroadcast_until_height),
            )
        })
        .collect();
    let coordinator = Arc::new(SignatureCoordinator::new(
        core.clone(),
        ledgers.clone(),
        bus.clone(),
        wallets,
        CoordinatorConfig {
            channel: channel.clone(),
            signature_broadcast_delay: Duration::from_millis(
                settings.node.signature_broadcast_delay,
            ),
            transaction_submit_delay: Duration::from_millis(
                settings.node.transaction_submit_delay,
            ),
            rebroadcast_windows,
            passive: settings.node.passive_mode,
        },
    ));
    if settings.node.passive_mode {
        info!("Passive mode: observing only, no outgoing transactions");
    }

    // Dividend queue and processor.
    let (dividend_tx, dividend_rx) = mpsc::channel(64);
    let dividend_params = settings
        .chains
        .iter()
        .map(|(name, c)| {
            (
                ChainId::new(name.clone()),
                DividendChainParams {
                    wallet_address: c.wallet_address.clone(),
                    dividend_height_interval: c.dividend_height_interval,
                    dividend_rate: c.dividend_rate,
                    exchange_fee_rate: c.exchange_fee_rate,
                },
            )
        })
        .collect();
    let dividend_handle = tokio::spawn(
        DividendProcessor::new(
            dividend_rx,
            ledgers.clone(),
            coordinator.clone(),
            dividend_params,
            wallet_info,
            default_dividend_fn(),
        )
        .run(),
    );

    // Pipeline and block interleaver.
    let parser_params: HashMap<ChainId, ParserChainParams> = settings
        .chains
        .iter()
        .map(|(name, c)| {
            (
                ChainId::new(name.clone()),
                ParserChainParams {
                    min_order_amount: c.min_order_amount,
                    exchange_fee_base: c.exchange_fee_base,
                    dex_disabled_from_height: c.dex_disabled_from_height,
                    dex_moved_to_address: c.dex_moved_to_address.clone(),
                },
            )
        })
        .collect();
    let pipeline_params: HashMap<ChainId, PipelineChainParams> = settings
        .chains
        .iter()
        .map(|(name, c)| {
            (
                ChainId::new(name.clone()),
                PipelineChainParams {
                    wallet_address: c.wallet_address.clone(),
                    order_height_expiry: c.order_height_expiry,
                    exchange_fee_base: c.exchange_fee_base,
                    exchange_fee_rate: c.exchange_fee_rate,
                    dividend_start_height: c.dividend_start_height,
                    dividend_height_interval: c.dividend_height_interval,
                    dividend_height_offset: c.dividend_height_offset,
                    dex_disabled_from_height: c.dex_disabled_from_height,
                    dex_moved_to_address: c.dex_moved_to_address.clone(),
                },
            )
        })
        .collect();
    let interleaver_params: HashMap<ChainId, InterleaverChainParams> = settings
        .chains
        .iter()
        .map(|(name, c)| {
            (
                ChainId::new(name.clone()),
                InterleaverChainParams {
                    required_confirmations: c.required_confirmations,
                    read_max_blocks: c.read_max_blocks,
                },
            )
        })
        .collect();

    let pipeline = Pipeline::new(
        core.clone(),
        coordinator.clone(),
        ledgers.clone(),
        IntentParser::new(base.clone(), quote.clone(), parser_params),
        snapshots,
        dividend_tx,
        base.clone(),
        pipeline_params,
        settings.snapshot.order_book_snapshot_finality,
    );

    let fork = Arc::new(ForkWatcher::new(ledgers.keys().cloned()));
    let mut fork_handles = Vec::new();
    for client in ledgers.values() {
        fork_handles.push(tokio::spawn(watch_chain(fork.clone(), client.clone())));
    }

    let mut interleaver = BlockInterleaver::new(
        core.clone(),
        pipeline,
        ledgers.clone(),
        fork,
        base.clone(),
        interleaver_params,
        Duration::from_millis(settings.node.read_blocks_interval),
        initial_heights,
        initial_timestamp,
    );
    let interleaver_shutdown = interleaver.shutdown_handle();
    let interleaver_handle = tokio::spawn(async move {
        if let Err(e) = interleaver.run().await {
            error!("Block interleaver error: {}", e);
        }
    });

    // Peer signature handler.
    let signature_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        let mut rx = bus.subscribe_signatures();
        let channel = channel.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok((event_channel, event)) => {
                        if event_channel == channel {
                            coordinator.on_peer_signature(event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Signature handler lagged {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    // Registry expiry sweeper.
    let expiry_handle = tokio::spawn({
        let core = core.clone();
        let max_age = settings.node.multisig_expiry;
        let check_interval = settings.node.multisig_expiry_check_interval.max(1);
        async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(check_interval));
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis() as u64;
                let expired = { core.lock().await.registry.expire(now, max_age) };
                for entry in expired {
                    warn!(
                        "Pending transfer {} expired before reaching quorum",
                        entry.transaction.id
                    );
                }
            }
        }
    });

    // API server.
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let core = core.clone();
        let base = base.clone();
        let quote = quote.clone();
        async move {
            if let Err(e) = api::run_server(api_config, core, base, quote).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Metrics server.
    let metrics_handle = if settings.metrics.enabled {
        let server = metrics::MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Crossbook node is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal.
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    *interleaver_shutdown.write().await = true;

    // Abort background tasks; pending submit tasks drain with the runtime.
    interleaver_handle.abort();
    signature_handle.abort();
    expiry_handle.abort();
    dividend_handle.abort();
    api_handle.abort();
    for handle in fork_handles {
        handle.abort();
    }
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Crossbook node stopped");
    Ok(())
}

fn resolve_passphrase(clear: &Option<String>, encrypted: &Option<String>) -> Result<String> {
    if let Some(clear) = clear {
        return Ok(clear.clone());
    }
    let encrypted = encrypted
        .as_ref()
        .context("validated configuration carries a passphrase")?;
    let password = std::env::var(config::KEY_PASSWORD_ENV)
        .with_context(|| format!("{} is required for encrypted passphrases", config::KEY_PASSWORD_ENV))?;
    Ok(signing::decrypt_passphrase(encrypted, &password)?)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crossbook=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
