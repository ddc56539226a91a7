pub mod drift;

use anyhow::Result;
use async_trait::async_trait;
use borsh::BorshSerialize;
use solana_sdk::{instruction::Instruction, pubkey::Pubkey};

use crate::domain::{Direction, MarketSnapshot};

/// Quote prices are integers scaled by this.
pub const PRICE_PRECISION: f64 = 1_000_000.0;
/// Base asset amounts are integers scaled by this.
pub const BASE_PRECISION: f64 = 1_000_000_000.0;

pub fn price_to_native(price: f64) -> u64 {
    (price * PRICE_PRECISION).round().max(0.0) as u64
}

pub fn base_to_native(size: f64) -> u64 {
    (size * BASE_PRECISION).round().max(0.0) as u64
}

// Full on-chain variant set; the encoded tag is the declaration index.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize)]
pub enum OrderType {
    Market,
    Limit,
    TriggerMarket,
    TriggerLimit,
    Oracle,
}

// Full on-chain variant set; the encoded tag is the declaration index.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize)]
pub enum MarketType {
    Spot,
    Perp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize)]
pub enum PositionDirection {
    Long,
    Short,
}

impl From<Direction> for PositionDirection {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Long => PositionDirection::Long,
            Direction::Short => PositionDirection::Short,
        }
    }
}

// Full on-chain variant set; the encoded tag is the declaration index.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize)]
pub enum PostOnly {
    None,
    MustPostOnly,
    TryPostOnly,
    Slide,
}

// Full on-chain variant set; the encoded tag is the declaration index.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize)]
pub enum TriggerCondition {
    Above,
    Below,
    TriggeredAbove,
    TriggeredBelow,
}

/// Field order is the on-chain encoding order.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize)]
pub struct OrderParams {
    pub order_type: OrderType,
    pub market_type: MarketType,
    pub direction: PositionDirection,
    pub user_order_id: u8,
    pub base_asset_amount: u64,
    pub price: u64,
    pub market_index: u16,
    pub reduce_only: bool,
    pub post_only: PostOnly,
    pub bit_flags: u8,
    pub max_ts: Option<i64>,
    pub trigger_price: Option<u64>,
    pub trigger_condition: TriggerCondition,
    pub oracle_price_offset: Option<i32>,
    pub auction_duration: Option<u8>,
    pub auction_start_price: Option<i64>,
    pub auction_end_price: Option<i64>,
}

impl OrderParams {
    pub fn limit(market_index: u16, direction: PositionDirection, base_asset_amount: u64, price: u64) -> Self {
        Self {
            order_type: OrderType::Limit,
            market_type: MarketType::Perp,
            direction,
            user_order_id: 0,
            base_asset_amount,
            price,
            market_index,
            reduce_only: false,
            post_only: PostOnly::None,
            bit_flags: 0,
            max_ts: None,
            trigger_price: None,
            trigger_condition: TriggerCondition::Above,
            oracle_price_offset: None,
            auction_duration: None,
            auction_start_price: None,
            auction_end_price: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerpPosition {
    pub market_index: u16,
    /// Signed; negative is short.
    pub base_asset_amount: i64,
    pub quote_entry_amount: i64,
    pub open_orders: u8,
}

impl PerpPosition {
    pub fn is_open(&self) -> bool {
        self.base_asset_amount != 0
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.base_asset_amount {
            0 => None,
            b if b > 0 => Some(Direction::Long),
            _ => Some(Direction::Short),
        }
    }

    pub fn base_size(&self) -> f64 {
        self.base_asset_amount.unsigned_abs() as f64 / BASE_PRECISION
    }

    pub fn entry_price(&self) -> Option<f64> {
        if !self.is_open() {
            return None;
        }
        let quote = self.quote_entry_amount.unsigned_abs() as f64 / PRICE_PRECISION;
        Some(quote / self.base_size())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOrder {
    pub order_id: u32,
    pub market_index: u16,
    pub market_type: MarketType,
    pub user_order_id: u8,
}

/// Spot slot with a non-zero balance or resting orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotPosition {
    pub market_index: u16,
    pub scaled_balance: u64,
    pub is_deposit: bool,
    pub open_orders: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountState {
    /// Deposited quote collateral in human units.
    pub quote_balance: f64,
    pub spot_positions: Vec<SpotPosition>,
    /// Perp slots that hold base or resting orders.
    pub positions: Vec<PerpPosition>,
    pub open_orders: Vec<OpenOrder>,
}

impl AccountState {
    pub fn position(&self, market_index: u16) -> Option<PerpPosition> {
        self.positions
            .iter()
            .find(|p| p.market_index == market_index && p.is_open())
            .copied()
    }

    pub fn perp_orders(&self, market_index: u16) -> impl Iterator<Item = &OpenOrder> {
        self.open_orders
            .iter()
            .filter(move |o| o.market_type == MarketType::Perp && o.market_index == market_index)
    }
}

/// Contract consumed from the exchange platform.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn authority(&self) -> Pubkey;

    /// Fresh top of book for a perp market; never served from cache.
    async fn order_book(&self, market_index: u16) -> Result<MarketSnapshot>;

    /// Fresh account state; never served from cache.
    async fn account_state(&self) -> Result<AccountState>;

    /// One instruction per order, in input order. `account` is the state the
    /// orders were sized against; every market it touches is referenced.
    async fn place_order_instructions(&self, account: &AccountState, orders: &[OrderParams]) -> Result<Vec<Instruction>>;

    async fn cancel_orders_instruction(&self, account: &AccountState, market_index: u16) -> Result<Instruction>;
}
