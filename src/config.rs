use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{Direction, RiskSettingsUpdate};
use crate::error::{TradeError, TradeResult};
use crate::fees::{FeeSource, PriorityFeeLevel};
use crate::rpc::RoutingPolicy;
use crate::submit::BackoffKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcEndpointConfig {
    pub http_url: String,
    pub wss_url: Option<String>,
}

/// What the binary does on this run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenTrade,
    Position,
    CancelAll,
    UpdateSettings,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" | "open_trade" => Ok(Self::OpenTrade),
            "position" => Ok(Self::Position),
            "cancel" | "cancel_all" => Ok(Self::CancelAll),
            "settings" | "update_settings" => Ok(Self::UpdateSettings),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub action: Action,

    // RPC
    pub rpc_endpoints: Vec<RpcEndpointConfig>,
    pub rpc_routing: RoutingPolicy,

    // Exchange
    pub dlob_url: String,
    pub sub_account_id: u16,
    pub market_index: u16,
    pub direction: Direction,
    pub balance_override_usdc: Option<f64>,

    // Settings store
    pub settings_store_path: String,
    pub settings_update: RiskSettingsUpdate,

    // Priority fees
    pub fee_source: FeeSource,
    pub fee_level: PriorityFeeLevel,
    pub fee_multiplier: f64,
    pub fee_max_micro_lamports: u64,
    pub fee_interval_ms: u64,
    pub compute_unit_limit: Option<u32>,

    // Submission
    pub submit_max_attempts: u32,
    pub submit_retry_delay_ms: u64,
    pub submit_backoff: BackoffKind,
    pub submit_max_delay_ms: u64,

    // Runtime
    pub dry_run: bool,

    // Keys
    pub keypair_path: String,
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|s| s.trim().to_lowercase()) {
        None => default,
        Some(v) if v.is_empty() => default,
        Some(v) if v == "1" || v == "true" || v == "yes" || v == "y" || v == "on" => true,
        Some(v) if v == "0" || v == "false" || v == "no" || v == "n" || v == "off" => false,
        Some(_) => default,
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Unset means `None`; set but unparsable is a configuration failure.
fn env_parse<T>(key: &str) -> TradeResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| TradeError::Configuration(format!("{key}={raw}: {e}"))),
    }
}

fn env_required(key: &str) -> TradeResult<String> {
    env_opt(key).ok_or_else(|| TradeError::Configuration(format!("{key} is required")))
}

impl Config {
    pub fn from_env() -> TradeResult<Self> {
        let action = env_parse("TRADE_ACTION")?.unwrap_or(Action::OpenTrade);

        // RPC: primary is mandatory, two more are optional
        let mut rpc_endpoints = vec![RpcEndpointConfig {
            http_url: env_required("RPC_HTTP_URL")?,
            wss_url: env_opt("RPC_WSS_URL"),
        }];
        for n in 2..=3 {
            if let Some(http_url) = env_opt(&format!("RPC_HTTP_URL_{n}")) {
                rpc_endpoints.push(RpcEndpointConfig {
                    http_url,
                    wss_url: env_opt(&format!("RPC_WSS_URL_{n}")),
                });
            }
        }
        let rpc_routing = env_parse("RPC_ROUTING")?.unwrap_or(RoutingPolicy::Failover);

        // Exchange
        let dlob_url = env_opt("DLOB_URL").unwrap_or_else(|| "https://dlob.drift.trade".to_string());
        let sub_account_id = env_parse("DRIFT_SUB_ACCOUNT_ID")?.unwrap_or(0);
        let market_index = env_parse("MARKET_INDEX")?.unwrap_or(0);
        let direction = env_parse("TRADE_DIRECTION")?.unwrap_or(Direction::Long);
        let balance_override_usdc: Option<f64> = env_parse("TRADE_BALANCE_USDC")?;
        if matches!(balance_override_usdc, Some(b) if b <= 0.0) {
            return Err(TradeError::Configuration("TRADE_BALANCE_USDC must be positive".into()));
        }

        let settings_store_path =
            env_opt("SETTINGS_STORE_PATH").unwrap_or_else(|| "./trading_settings.json".to_string());
        let settings_update = RiskSettingsUpdate {
            leverage_multiplier: env_parse("SET_LEVERAGE_MULTIPLIER")?,
            take_profit_percentage: env_parse("SET_TAKE_PROFIT_PERCENTAGE")?,
            stop_loss_percentage: env_parse("SET_STOP_LOSS_PERCENTAGE")?,
        };

        // Priority fees
        let fee_source = env_parse("PRIORITY_FEE_SOURCE")?.unwrap_or(FeeSource::Dlob);
        let fee_level = env_parse("PRIORITY_FEE_LEVEL")?.unwrap_or(PriorityFeeLevel::High);
        let fee_multiplier = env_parse::<f64>("PRIORITY_FEE_MULTIPLIER")?.unwrap_or(1.0);
        let fee_max_micro_lamports = env_parse("PRIORITY_FEE_MAX_MICRO_LAMPORTS")?.unwrap_or(1_000_000);
        let fee_interval_ms = env_parse("PRIORITY_FEE_INTERVAL_MS")?.unwrap_or(5_000);
        let compute_unit_limit = env_parse("COMPUTE_UNIT_LIMIT")?;
        if fee_multiplier < 0.0 {
            return Err(TradeError::Configuration("PRIORITY_FEE_MULTIPLIER cannot be negative".into()));
        }
        if fee_interval_ms == 0 {
            return Err(TradeError::Configuration("PRIORITY_FEE_INTERVAL_MS must be > 0".into()));
        }

        // Submission
        let submit_max_attempts = env_parse("SUBMIT_MAX_ATTEMPTS")?.unwrap_or(3);
        let submit_retry_delay_ms = env_parse("SUBMIT_RETRY_DELAY_MS")?.unwrap_or(100);
        let submit_backoff = env_parse("SUBMIT_BACKOFF")?.unwrap_or(BackoffKind::Fixed);
        let submit_max_delay_ms = env_parse("SUBMIT_MAX_DELAY_MS")?.unwrap_or(2_000);
        if submit_max_attempts == 0 {
            return Err(TradeError::Configuration("SUBMIT_MAX_ATTEMPTS must be >= 1".into()));
        }

        let dry_run = env_bool("DRY_RUN", false);

        let keypair_path = env_required("KEYPAIR_PATH")?;

        Ok(Self {
            action,
            rpc_endpoints,
            rpc_routing,
            dlob_url,
            sub_account_id,
            market_index,
            direction,
            balance_override_usdc,
            settings_store_path,
            settings_update,
            fee_source,
            fee_level,
            fee_multiplier,
            fee_max_micro_lamports,
            fee_interval_ms,
            compute_unit_limit,
            submit_max_attempts,
            submit_retry_delay_ms,
            submit_backoff,
            submit_max_delay_ms,
            dry_run,
            keypair_path,
        })
    }
}
