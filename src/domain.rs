use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short. Profit offsets are multiplied by this.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => f.write_str("long"),
            Direction::Short => f.write_str("short"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" | "bid" => Ok(Direction::Long),
            "short" | "sell" | "ask" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TradeIntent {
    pub direction: Direction,
    /// Perp market index on the exchange.
    pub market_index: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskSettings {
    pub leverage_multiplier: f64,
    pub take_profit_percentage: f64,
    pub stop_loss_percentage: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            leverage_multiplier: 8.0,
            take_profit_percentage: 0.0018,
            stop_loss_percentage: 0.022,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskSettingsUpdate {
    pub leverage_multiplier: Option<f64>,
    pub take_profit_percentage: Option<f64>,
    pub stop_loss_percentage: Option<f64>,
}

/// Top of book. Either side is `None` when the book has no levels there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSnapshot {
    pub market_index: u16,
    pub best_ask: Option<f64>,
    pub best_bid: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingPlan {
    pub direction: Direction,
    pub market_index: u16,
    pub current_price: f64,
    /// Entry limit price including slippage.
    pub adjusted_price: f64,
    pub position_size: f64,
    pub native_lot_size: u64,
    pub take_profit_price: f64,
    pub take_profit_trigger: f64,
    pub stop_loss_price: f64,
    pub stop_loss_trigger: f64,
}
