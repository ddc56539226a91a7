use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig};
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{TradeError, TradeResult};
use crate::fees::PriorityFeeState;
use crate::rpc::RpcPool;

/// Max serialized transaction size accepted by the network.
pub const PACKET_DATA_SIZE: usize = 1232;

pub const DRY_RUN_SIGNATURE: &str = "DRY_RUN";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" | "exp" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    /// `delay * 2^(n-1)` after the n-th failure, capped at `max_delay`;
    /// with `jitter` the wait is drawn uniformly from `[0, capped]`.
    Exponential { max_delay: Duration, jitter: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Wait after the `failed_attempt`-th failure (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay, jitter } => {
                let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
                let capped = self.delay.saturating_mul(factor).min(max_delay);
                if jitter && !capped.is_zero() {
                    let ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
                    Duration::from_millis(ms)
                } else {
                    capped
                }
            }
        }
    }
}

/// Network side of submission.
#[async_trait]
pub trait TransactionSender: Send + Sync {
    /// Latest finalized blockhash and its last valid block height.
    async fn latest_blockhash(&self) -> Result<(Hash, u64)>;
    async fn send(&self, tx: &Transaction) -> Result<Signature>;
    async fn simulate(&self, tx: &Transaction) -> Result<()>;
}

#[async_trait]
impl TransactionSender for RpcPool {
    async fn latest_blockhash(&self) -> Result<(Hash, u64)> {
        self.with_failover("getLatestBlockhash", |c| {
            c.get_latest_blockhash_with_commitment(CommitmentConfig::finalized())
        })
        .await
    }

    async fn send(&self, tx: &Transaction) -> Result<Signature> {
        self.with_failover("sendTransaction", |c| {
            c.send_transaction_with_config(
                tx,
                RpcSendTransactionConfig {
                    skip_preflight: true,
                    preflight_commitment: Some(CommitmentLevel::Finalized),
                    ..RpcSendTransactionConfig::default()
                },
            )
        })
        .await
    }

    async fn simulate(&self, tx: &Transaction) -> Result<()> {
        let sim = self
            .with_failover("simulateTransaction", |c| {
                c.simulate_transaction_with_config(
                    tx,
                    RpcSimulateTransactionConfig {
                        sig_verify: true,
                        commitment: Some(CommitmentConfig::finalized()),
                        ..RpcSimulateTransactionConfig::default()
                    },
                )
            })
            .await?;
        if let Some(err) = sim.value.err {
            return Err(anyhow!("simulateTransaction failed: {err:?} logs={:?}", sim.value.logs));
        }
        Ok(())
    }
}

pub struct TransactionSubmitter {
    sender: Arc<dyn TransactionSender>,
    payer: Arc<Keypair>,
    fees: PriorityFeeState,
    compute_unit_limit: Option<u32>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl TransactionSubmitter {
    pub fn new(
        sender: Arc<dyn TransactionSender>,
        payer: Arc<Keypair>,
        fees: PriorityFeeState,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sender,
            payer,
            fees,
            compute_unit_limit: None,
            retry,
            dry_run: false,
        }
    }

    pub fn with_compute_unit_limit(mut self, limit: Option<u32>) -> Self {
        self.compute_unit_limit = limit;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Compute budget instructions: optional unit limit, then the unit price when `fee > 0`.
    fn budget_instructions(&self, fee: u64) -> Vec<Instruction> {
        let mut ixs = Vec::with_capacity(2);
        if let Some(limit) = self.compute_unit_limit {
            ixs.push(ComputeBudgetInstruction::set_compute_unit_limit(limit));
        }
        if fee > 0 {
            ixs.push(ComputeBudgetInstruction::set_compute_unit_price(fee));
        }
        ixs
    }

    pub async fn submit(&self, instructions: &[Instruction]) -> TradeResult<String> {
        self.submit_with(instructions, &self.retry).await
    }

    /// Signs `instructions` as one transaction against a freshly fetched
    /// blockhash on every attempt and returns the signature of the first
    /// accepted attempt.
    pub async fn submit_with(&self, instructions: &[Instruction], retry: &RetryPolicy) -> TradeResult<String> {
        let max_attempts = retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.attempt(instructions, attempt).await {
                Ok(sig) => return Ok(sig),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable(e)) => {
                    if attempt >= max_attempts {
                        warn!(attempt, error = %e, "submit.failed");
                        return Err(TradeError::SubmissionFailed {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    let wait = retry.delay_after(attempt);
                    warn!(attempt, max_attempts, wait_ms = wait.as_millis() as u64, error = %e, "submit.retry");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, instructions: &[Instruction], attempt: u32) -> Result<String, AttemptError> {
        let (blockhash, last_valid_block_height) = self
            .sender
            .latest_blockhash()
            .await
            .map_err(AttemptError::Retryable)?;

        // read per attempt
        let priority_fee = self.fees.current();
        let mut ixs = self.budget_instructions(priority_fee);
        ixs.extend_from_slice(instructions);

        let payer = self.payer.pubkey();
        let tx = Transaction::new_signed_with_payer(&ixs, Some(&payer), &[&*self.payer], blockhash);

        let size = bincode::serialized_size(&tx)
            .map_err(|e| AttemptError::Fatal(TradeError::SubmissionFailed { attempts: attempt, message: e.to_string() }))?
            as usize;
        if size > PACKET_DATA_SIZE {
            return Err(AttemptError::Fatal(TradeError::TransactionTooLarge { size, limit: PACKET_DATA_SIZE }));
        }

        if self.dry_run {
            self.sender.simulate(&tx).await.map_err(AttemptError::Retryable)?;
            info!(attempt, size, instructions = ixs.len(), "submit.dry_run.simulated");
            return Ok(DRY_RUN_SIGNATURE.to_string());
        }

        let sig = self.sender.send(&tx).await.map_err(AttemptError::Retryable)?;
        info!(
            attempt,
            %sig,
            %blockhash,
            last_valid_block_height,
            size,
            priority_fee,
            "submit.sent"
        );
        Ok(sig.to_string())
    }
}

enum AttemptError {
    Retryable(anyhow::Error),
    Fatal(TradeError),
}
