use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("config error: {0}")]
    Configuration(String),

    #[error("priority fee feed error: {0}")]
    Feed(String),

    #[error("settings store error: {0}")]
    SettingsStore(String),

    #[error("transaction submission failed after {attempts} attempt(s): {message}")]
    SubmissionFailed { attempts: u32, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("order book for market {market_index} has no {side}")]
    EmptyOrderBook { market_index: u16, side: &'static str },

    #[error("order book for market {market_index} is crossed (ask {ask} < bid {bid})")]
    CrossedOrderBook { market_index: u16, ask: f64, bid: f64 },

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("position size {size} is below the minimum tradable size")]
    PositionTooSmall { size: f64 },

    #[error("no free trigger order slot on the account")]
    NoFreeOrderSlot,

    #[error("transaction too large: {size} bytes (limit {limit})")]
    TransactionTooLarge { size: usize, limit: usize },
}

pub type TradeResult<T> = Result<T, TradeError>;

impl TradeError {
    pub fn query(err: impl std::fmt::Display) -> Self {
        Self::Query(err.to_string())
    }
}
