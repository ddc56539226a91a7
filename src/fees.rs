use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{TradeError, TradeResult};
use crate::rpc::RpcPool;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityFeeLevel {
    Min,
    Low,
    Medium,
    High,
    VeryHigh,
    UnsafeMax,
}

impl FromStr for PriorityFeeLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "min" => Ok(Self::Min),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "very_high" | "veryhigh" => Ok(Self::VeryHigh),
            "unsafe_max" | "unsafemax" | "max" => Ok(Self::UnsafeMax),
            other => Err(format!("unknown priority fee level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeeSource {
    Dlob,
    Rpc,
}

impl FromStr for FeeSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dlob" => Ok(Self::Dlob),
            "rpc" => Ok(Self::Rpc),
            other => Err(format!("unknown priority fee source: {other}")),
        }
    }
}

/// Recommended fees in micro-lamports per compute unit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimates {
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub medium: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub very_high: f64,
    #[serde(default)]
    pub unsafe_max: f64,
}

impl FeeEstimates {
    pub fn level(&self, level: PriorityFeeLevel) -> f64 {
        match level {
            PriorityFeeLevel::Min => self.min,
            PriorityFeeLevel::Low => self.low,
            PriorityFeeLevel::Medium => self.medium,
            PriorityFeeLevel::High => self.high,
            PriorityFeeLevel::VeryHigh => self.very_high,
            PriorityFeeLevel::UnsafeMax => self.unsafe_max,
        }
    }
}

#[async_trait]
pub trait FeeFeed: Send + Sync {
    /// Establishes the subscription. Failure here is fatal to setup.
    async fn connect(&self) -> Result<()>;
    async fn load(&self) -> Result<FeeEstimates>;
}

/// DLOB server `batchPriorityFees` endpoint.
pub struct DlobFeeFeed {
    base_url: String,
    market_index: u16,
    http: Client,
}

impl DlobFeeFeed {
    pub fn new(base_url: String, market_index: u16) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            market_index,
            http: Client::new(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/batchPriorityFees?marketType=perp&marketIndex={}",
            self.base_url, self.market_index
        )
    }
}

#[async_trait]
impl FeeFeed for DlobFeeFeed {
    /// HTTP polling has no subscription to open; a first request stands in
    /// for one so a dead endpoint fails setup.
    async fn connect(&self) -> Result<()> {
        reqwest::Url::parse(&self.url()).map_err(|e| anyhow!("invalid fee feed url: {e}"))?;
        self.load().await.map(|_| ())
    }

    async fn load(&self) -> Result<FeeEstimates> {
        let resp = self
            .http
            .get(self.url())
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        let batch: Vec<FeeEstimates> = resp.json().await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty priority fee batch"))
    }
}

/// Percentiles over `getRecentPrioritizationFees`.
pub struct RpcFeeFeed {
    rpc: Arc<RpcPool>,
}

impl RpcFeeFeed {
    pub fn new(rpc: Arc<RpcPool>) -> Self {
        Self { rpc }
    }
}

pub fn estimates_from_samples(mut samples: Vec<u64>) -> FeeEstimates {
    if samples.is_empty() {
        return FeeEstimates::default();
    }
    samples.sort_unstable();
    let pct = |p: f64| {
        let idx = ((samples.len() - 1) as f64 * p).round() as usize;
        samples[idx] as f64
    };
    FeeEstimates {
        min: pct(0.0),
        low: pct(0.25),
        medium: pct(0.5),
        high: pct(0.75),
        very_high: pct(0.95),
        unsafe_max: pct(1.0),
    }
}

#[async_trait]
impl FeeFeed for RpcFeeFeed {
    async fn connect(&self) -> Result<()> {
        self.rpc.with_failover("getHealth", |c| c.get_health()).await
    }

    async fn load(&self) -> Result<FeeEstimates> {
        let fees = self
            .rpc
            .with_failover("getRecentPrioritizationFees", |c| c.get_recent_prioritization_fees(&[]))
            .await?;
        Ok(estimates_from_samples(
            fees.iter().map(|f| f.prioritization_fee).collect(),
        ))
    }
}

/// Active compute-unit price shared with the submission path.
#[derive(Clone, Default, Debug)]
pub struct PriorityFeeState {
    micro_lamports: Arc<AtomicU64>,
}

impl PriorityFeeState {
    pub fn new(initial: u64) -> Self {
        Self { micro_lamports: Arc::new(AtomicU64::new(initial)) }
    }

    pub fn current(&self) -> u64 {
        self.micro_lamports.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, v: u64) {
        self.micro_lamports.store(v, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeeOracleConfig {
    pub level: PriorityFeeLevel,
    pub multiplier: f64,
    pub max_micro_lamports: u64,
    pub interval: Duration,
}

impl Default for FeeOracleConfig {
    fn default() -> Self {
        Self {
            level: PriorityFeeLevel::High,
            multiplier: 1.0,
            max_micro_lamports: 1_000_000,
            interval: Duration::from_millis(5_000),
        }
    }
}

pub struct FeeOracle {
    feed: Arc<dyn FeeFeed>,
    cfg: FeeOracleConfig,
    state: PriorityFeeState,
}

impl FeeOracle {
    pub fn new(feed: Arc<dyn FeeFeed>, cfg: FeeOracleConfig) -> Self {
        Self {
            feed,
            cfg,
            state: PriorityFeeState::new(0),
        }
    }

    pub fn state(&self) -> PriorityFeeState {
        self.state.clone()
    }

    pub fn compute_fee(&self, estimates: &FeeEstimates) -> u64 {
        let raw = (estimates.level(self.cfg.level) * self.cfg.multiplier).floor();
        if !raw.is_finite() || raw <= 0.0 {
            return 0;
        }
        (raw as u64).min(self.cfg.max_micro_lamports)
    }

    /// Connects the feed, performs the initial load and starts the polling task.
    pub async fn setup(self: &Arc<Self>) -> TradeResult<JoinHandle<()>> {
        self.feed
            .connect()
            .await
            .map_err(|e| TradeError::Feed(e.to_string()))?;
        self.refresh().await;

        let oracle = Arc::clone(self);
        let period = self.cfg.interval;
        info!(interval_ms = period.as_millis() as u64, level = ?self.cfg.level, "fees.setup");
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately; initial load already happened
            ticker.tick().await;
            loop {
                ticker.tick().await;
                oracle.refresh().await;
            }
        }))
    }

    /// Never fails: on error the previous fee stays in effect.
    pub async fn refresh(&self) -> u64 {
        match self.feed.load().await {
            Ok(estimates) => {
                let fee = self.compute_fee(&estimates);
                self.state.set(fee);
                debug!(fee_micro_lamports = fee, "fees.refresh");
                fee
            }
            Err(e) => {
                let kept = self.state.current();
                warn!(error = %e, kept_micro_lamports = kept, "fees.refresh.failed");
                kept
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedFeed {
        connect_ok: bool,
        loads: Mutex<Vec<Result<FeeEstimates>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedFeed {
        fn new(loads: Vec<Result<FeeEstimates>>) -> Self {
            Self { connect_ok: true, loads: Mutex::new(loads), calls: Mutex::new(0) }
        }
    }

    #[async_trait]
    impl FeeFeed for ScriptedFeed {
        async fn connect(&self) -> Result<()> {
            if self.connect_ok {
                Ok(())
            } else {
                Err(anyhow!("subscribe refused"))
            }
        }

        async fn load(&self) -> Result<FeeEstimates> {
            *self.calls.lock().unwrap() += 1;
            let mut loads = self.loads.lock().unwrap();
            if loads.is_empty() {
                return Err(anyhow!("feed exhausted"));
            }
            loads.remove(0)
        }
    }

    fn high(v: f64) -> FeeEstimates {
        FeeEstimates { high: v, ..Default::default() }
    }

    fn oracle(feed: ScriptedFeed, multiplier: f64) -> Arc<FeeOracle> {
        Arc::new(FeeOracle::new(
            Arc::new(feed),
            FeeOracleConfig { multiplier, ..Default::default() },
        ))
    }

    #[tokio::test]
    async fn refresh_applies_multiplier_and_floors() {
        let o = oracle(ScriptedFeed::new(vec![Ok(high(1_001.0))]), 1.5);
        assert_eq!(o.refresh().await, 1_501);
        assert_eq!(o.state().current(), 1_501);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_fee() {
        let o = oracle(
            ScriptedFeed::new(vec![Ok(high(2_000.0)), Err(anyhow!("502 bad gateway"))]),
            1.0,
        );
        assert_eq!(o.refresh().await, 2_000);
        assert_eq!(o.refresh().await, 2_000);
        assert_eq!(o.state().current(), 2_000);
    }

    #[tokio::test]
    async fn fee_is_clamped_to_max() {
        let o = Arc::new(FeeOracle::new(
            Arc::new(ScriptedFeed::new(vec![Ok(high(9e9))])),
            FeeOracleConfig { max_micro_lamports: 50_000, ..Default::default() },
        ));
        assert_eq!(o.refresh().await, 50_000);
    }

    #[tokio::test]
    async fn setup_fails_when_subscription_fails() {
        let feed = ScriptedFeed { connect_ok: false, ..ScriptedFeed::new(vec![]) };
        let o = oracle(feed, 1.0);
        assert!(matches!(o.setup().await, Err(TradeError::Feed(_))));
    }

    #[tokio::test]
    async fn setup_fails_when_dlob_is_unreachable() {
        let feed = DlobFeeFeed::new("http://127.0.0.1:1/".into(), 0);
        assert!(feed.connect().await.is_err());
        let o = Arc::new(FeeOracle::new(Arc::new(feed), FeeOracleConfig::default()));
        assert!(matches!(o.setup().await, Err(TradeError::Feed(_))));
    }

    #[tokio::test]
    async fn setup_performs_initial_load() {
        let o = oracle(ScriptedFeed::new(vec![Ok(high(777.0))]), 1.0);
        let handle = o.setup().await.unwrap();
        assert_eq!(o.state().current(), 777);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_task_reloads_every_interval() {
        let feed = Arc::new(ScriptedFeed::new(vec![Ok(high(100.0)), Ok(high(200.0)), Ok(high(300.0))]));
        let o = Arc::new(FeeOracle::new(feed.clone(), FeeOracleConfig::default()));
        let handle = o.setup().await.unwrap();
        assert_eq!(*feed.calls.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(*feed.calls.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(5_200)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*feed.calls.lock().unwrap(), 3);
        assert_eq!(o.state().current(), 300);
        handle.abort();
    }

    #[test]
    fn percentiles_from_rpc_samples() {
        let e = estimates_from_samples((1..=101).collect());
        assert_eq!(e.min, 1.0);
        assert_eq!(e.medium, 51.0);
        assert_eq!(e.high, 76.0);
        assert_eq!(e.unsafe_max, 101.0);
        assert_eq!(estimates_from_samples(vec![]), FeeEstimates::default());
    }

    #[test]
    fn dlob_payload_parses() {
        let raw = r#"[{"min":1,"low":10,"medium":100,"high":1000.5,"veryHigh":5000,"unsafeMax":9000,"marketType":"perp","marketIndex":0}]"#;
        let batch: Vec<FeeEstimates> = serde_json::from_str(raw).unwrap();
        assert_eq!(batch[0].level(PriorityFeeLevel::High), 1000.5);
        assert_eq!(batch[0].level(PriorityFeeLevel::VeryHigh), 5000.0);
    }
}
