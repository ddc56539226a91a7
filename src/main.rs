mod config;
mod domain;
mod error;
mod exchange;
mod fees;
mod logger;
mod orders;
mod pricing;
mod rpc;
mod session;
mod settings;
mod submit;

use anyhow::Result;
use solana_sdk::signature::{read_keypair_file, Signer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{Action, Config};
use crate::domain::TradeIntent;
use crate::error::TradeError;
use crate::exchange::drift::DriftExchange;
use crate::exchange::Exchange;
use crate::fees::{DlobFeeFeed, FeeFeed, FeeOracle, FeeOracleConfig, FeeSource, RpcFeeFeed};
use crate::rpc::RpcPool;
use crate::session::TradingSession;
use crate::settings::{FileKvStore, SettingsProvider};
use crate::submit::{Backoff, BackoffKind, RetryPolicy, TransactionSubmitter};

#[tokio::main]
async fn main() {
    // Load local .env if present (no-op in prod/systemd envs)
    let _ = dotenvy::dotenv();

    logger::init_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "trade.failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cfg = Config::from_env()?;
    info!(
        endpoints = cfg.rpc_endpoints.len(),
        routing = ?cfg.rpc_routing,
        market_index = cfg.market_index,
        direction = %cfg.direction,
        dry_run = cfg.dry_run,
        "boot"
    );

    let wallet = read_keypair_file(&cfg.keypair_path)
        .map(Arc::new)
        .map_err(|e| TradeError::Configuration(format!("KEYPAIR_PATH {}: {e}", cfg.keypair_path)))?;

    let rpc = Arc::new(
        RpcPool::new(&cfg.rpc_endpoints, cfg.rpc_routing).map_err(|e| TradeError::Configuration(e.to_string()))?,
    );
    for endpoint in rpc.endpoints() {
        info!(name = %endpoint.name, wss = ?endpoint.wss_url, "rpc.endpoint");
    }

    let exchange: Arc<dyn Exchange> = Arc::new(DriftExchange::new(
        rpc.clone(),
        wallet.pubkey(),
        cfg.sub_account_id,
        cfg.dlob_url.clone(),
    )?);
    info!(authority = %exchange.authority(), sub_account_id = cfg.sub_account_id, "exchange.ready");

    let feed: Arc<dyn FeeFeed> = match cfg.fee_source {
        FeeSource::Dlob => Arc::new(DlobFeeFeed::new(cfg.dlob_url.clone(), cfg.market_index)),
        FeeSource::Rpc => Arc::new(RpcFeeFeed::new(rpc.clone())),
    };
    let fees = Arc::new(FeeOracle::new(
        feed,
        FeeOracleConfig {
            level: cfg.fee_level,
            multiplier: cfg.fee_multiplier,
            max_micro_lamports: cfg.fee_max_micro_lamports,
            interval: Duration::from_millis(cfg.fee_interval_ms),
        },
    ));
    let fee_task = fees.setup().await?;

    let retry = RetryPolicy {
        max_attempts: cfg.submit_max_attempts,
        delay: Duration::from_millis(cfg.submit_retry_delay_ms),
        backoff: match cfg.submit_backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max_delay: Duration::from_millis(cfg.submit_max_delay_ms),
                jitter: true,
            },
        },
    };
    let submitter = TransactionSubmitter::new(rpc.clone(), wallet.clone(), fees.state(), retry)
        .with_compute_unit_limit(cfg.compute_unit_limit)
        .with_dry_run(cfg.dry_run);

    let settings = SettingsProvider::new(Arc::new(FileKvStore::new(&cfg.settings_store_path)));

    let session = TradingSession::new(wallet, exchange, settings, fees, submitter)
        .with_balance_override(cfg.balance_override_usdc);

    let result = dispatch(&cfg, &session).await;
    fee_task.abort();
    result
}

async fn dispatch(cfg: &Config, session: &TradingSession) -> Result<()> {
    match cfg.action {
        Action::OpenTrade => {
            let intent = TradeIntent {
                direction: cfg.direction,
                market_index: cfg.market_index,
            };
            let receipt = session.open_trade(intent).await?;
            info!(
                signature = %receipt.signature,
                entry = receipt.plan.adjusted_price,
                size = receipt.plan.position_size,
                take_profit = receipt.plan.take_profit_price,
                stop_loss = receipt.plan.stop_loss_price,
                stop_loss_trigger = receipt.plan.stop_loss_trigger,
                "trade.submitted"
            );
        }
        Action::Position => match session.get_position(cfg.market_index).await? {
            Some(p) => info!(
                market_index = p.market_index,
                direction = ?p.direction(),
                size = p.base_size(),
                entry_price = ?p.entry_price(),
                open_orders = p.open_orders,
                "position.open"
            ),
            None => info!(market_index = cfg.market_index, "position.none"),
        },
        Action::CancelAll => {
            let signature = session.cancel_all_orders(cfg.market_index).await?;
            info!(market_index = cfg.market_index, signature = ?signature, "orders.cancelled");
        }
        Action::UpdateSettings => {
            let settings = session.settings().update(cfg.settings_update).await?;
            info!(?settings, "settings.updated");
        }
    }
    Ok(())
}
