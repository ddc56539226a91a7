use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use std::sync::Arc;
use tracing::{error, info};

use crate::domain::{PricingPlan, TradeIntent};
use crate::error::{TradeError, TradeResult};
use crate::exchange::{Exchange, PerpPosition};
use crate::fees::FeeOracle;
use crate::orders::{build_bundle, OrderBundle, ProtectionSlots, SlotAllocator};
use crate::pricing::compute_pricing_plan;
use crate::settings::SettingsProvider;
use crate::submit::{RetryPolicy, TransactionSubmitter};

#[derive(Debug, Clone)]
pub struct TradeReceipt {
    pub signature: String,
    pub plan: PricingPlan,
    pub bundle: OrderBundle,
}

/// Everything one trade needs, passed explicitly instead of living in globals.
pub struct TradingSession {
    wallet: Arc<Keypair>,
    exchange: Arc<dyn Exchange>,
    settings: SettingsProvider,
    fees: Arc<FeeOracle>,
    submitter: TransactionSubmitter,
    balance_override: Option<f64>,
}

impl TradingSession {
    pub fn new(
        wallet: Arc<Keypair>,
        exchange: Arc<dyn Exchange>,
        settings: SettingsProvider,
        fees: Arc<FeeOracle>,
        submitter: TransactionSubmitter,
    ) -> Self {
        Self {
            wallet,
            exchange,
            settings,
            fees,
            submitter,
            balance_override: None,
        }
    }

    pub fn with_balance_override(mut self, balance: Option<f64>) -> Self {
        self.balance_override = balance;
        self
    }

    pub fn wallet(&self) -> Pubkey {
        self.wallet.pubkey()
    }

    pub fn settings(&self) -> &SettingsProvider {
        &self.settings
    }

    /// Places entry, take-profit and stop-loss as one transaction.
    pub async fn open_trade(&self, intent: TradeIntent) -> TradeResult<TradeReceipt> {
        info!(direction = %intent.direction, market_index = intent.market_index, wallet = %self.wallet(), "session.open_trade");

        let settings = self.settings.fetch().await;
        let fee = self.fees.refresh().await;

        let account = self.exchange.account_state().await.map_err(|e| {
            error!(error = %e, "session.account_state.failed");
            TradeError::query(e)
        })?;
        let balance = self.balance_override.unwrap_or(account.quote_balance);

        let plan = compute_pricing_plan(self.exchange.as_ref(), intent, balance, &settings).await?;

        let mut slots = SlotAllocator::from_account(&account);
        let bundle = build_bundle(&plan, ProtectionSlots::allocate(&mut slots)?);

        let instructions = self
            .exchange
            .place_order_instructions(&account, &bundle.legs())
            .await
            .map_err(TradeError::query)?;

        let signature = self.submitter.submit(&instructions).await.map_err(|e| {
            error!(error = %e, "session.open_trade.failed");
            e
        })?;
        info!(
            %signature,
            balance,
            priority_fee = fee,
            take_profit_slot = bundle.take_profit.user_order_id,
            stop_loss_slot = bundle.stop_loss.user_order_id,
            "session.open_trade.submitted"
        );
        Ok(TradeReceipt { signature, plan, bundle })
    }

    /// First open position on the market, if any.
    pub async fn get_position(&self, market_index: u16) -> TradeResult<Option<PerpPosition>> {
        let account = self.exchange.account_state().await.map_err(|e| {
            error!(market_index, error = %e, "session.get_position.failed");
            TradeError::query(e)
        })?;
        let position = account.position(market_index);
        info!(market_index, ?position, "session.get_position");
        Ok(position)
    }

    /// Cancels every open order on the market. Returns `None` when there was
    /// nothing to cancel.
    pub async fn cancel_all_orders(&self, market_index: u16) -> TradeResult<Option<String>> {
        let result = self.cancel_all_orders_inner(market_index).await;
        match &result {
            Ok(Some(sig)) => info!(market_index, %sig, "session.cancel_all_orders"),
            Ok(None) => info!(market_index, "session.cancel_all_orders.nothing_open"),
            Err(e) => error!(market_index, error = %e, "session.cancel_all_orders.failed"),
        }
        result
    }

    async fn cancel_all_orders_inner(&self, market_index: u16) -> TradeResult<Option<String>> {
        let account = self.exchange.account_state().await.map_err(TradeError::query)?;
        if account.perp_orders(market_index).next().is_none() {
            return Ok(None);
        }
        let ix = self
            .exchange
            .cancel_orders_instruction(&account, market_index)
            .await
            .map_err(TradeError::query)?;
        let sig = self
            .submitter
            .submit_with(&[ix], &RetryPolicy::single_attempt())
            .await
            .map_err(|e| match e {
                TradeError::SubmissionFailed { message, .. } => TradeError::Query(message),
                other => other,
            })?;
        Ok(Some(sig))
    }
}
