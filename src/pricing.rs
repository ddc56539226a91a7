use tracing::info;

use crate::domain::{Direction, MarketSnapshot, PricingPlan, RiskSettings, TradeIntent};
use crate::error::{TradeError, TradeResult};
use crate::exchange::{base_to_native, Exchange};

/// Marketable-limit offset applied against the trader (0.005%).
pub const SLIPPAGE_TOLERANCE: f64 = 0.00005;
/// Take-profit fires its limit order halfway to the target.
pub const TAKE_PROFIT_TRIGGER_FRACTION: f64 = 0.5;
/// Stop-loss fires its limit order at 90% of the way to the stop.
pub const STOP_LOSS_TRIGGER_FRACTION: f64 = 0.9;

/// Truncates (toward zero) to one decimal place.
pub fn truncate_one_decimal(x: f64) -> f64 {
    (x * 10.0).trunc() / 10.0
}

/// Price the order would cross against: best ask when buying, best bid when selling.
pub fn current_price(direction: Direction, book: &MarketSnapshot) -> TradeResult<f64> {
    let (ask, bid) = match (book.best_ask, book.best_bid) {
        (Some(a), Some(b)) => (a, b),
        (None, _) => return Err(TradeError::EmptyOrderBook { market_index: book.market_index, side: "asks" }),
        (_, None) => return Err(TradeError::EmptyOrderBook { market_index: book.market_index, side: "bids" }),
    };
    if ask < bid {
        return Err(TradeError::CrossedOrderBook { market_index: book.market_index, ask, bid });
    }
    let price = match direction {
        Direction::Long => ask,
        Direction::Short => bid,
    };
    if !price.is_finite() || price <= 0.0 {
        return Err(TradeError::InvalidPrice(price));
    }
    Ok(price)
}

pub fn adjusted_price(direction: Direction, current: f64) -> f64 {
    current * (1.0 + direction.sign() * SLIPPAGE_TOLERANCE)
}

pub fn position_size(balance: f64, leverage_multiplier: f64, current: f64) -> f64 {
    truncate_one_decimal(balance * leverage_multiplier / current)
}

/// Returns (take_profit_price, take_profit_trigger, stop_loss_price, stop_loss_trigger).
pub fn protection_prices(direction: Direction, entry: f64, settings: &RiskSettings) -> (f64, f64, f64, f64) {
    let sign = direction.sign();
    let take_profit = entry * (1.0 + sign * settings.take_profit_percentage);
    let stop_loss = entry * (1.0 - sign * settings.stop_loss_percentage);
    let take_profit_trigger = entry + (take_profit - entry) * TAKE_PROFIT_TRIGGER_FRACTION;
    let stop_loss_trigger = entry + (stop_loss - entry) * STOP_LOSS_TRIGGER_FRACTION;
    (take_profit, take_profit_trigger, stop_loss, stop_loss_trigger)
}

/// Pure part of the calculator: everything after the book has been read.
pub fn plan_from_snapshot(
    intent: TradeIntent,
    book: &MarketSnapshot,
    balance: f64,
    settings: &RiskSettings,
) -> TradeResult<PricingPlan> {
    let current = current_price(intent.direction, book)?;
    let adjusted = adjusted_price(intent.direction, current);
    let size = position_size(balance, settings.leverage_multiplier, current);
    if !size.is_finite() || size <= 0.0 {
        return Err(TradeError::PositionTooSmall { size });
    }
    let (take_profit_price, take_profit_trigger, stop_loss_price, stop_loss_trigger) =
        protection_prices(intent.direction, adjusted, settings);

    Ok(PricingPlan {
        direction: intent.direction,
        market_index: intent.market_index,
        current_price: current,
        adjusted_price: adjusted,
        position_size: size,
        native_lot_size: base_to_native(size),
        take_profit_price,
        take_profit_trigger,
        stop_loss_price,
        stop_loss_trigger,
    })
}

/// Forces a fresh order-book read, then sizes and prices the trade.
pub async fn compute_pricing_plan(
    exchange: &dyn Exchange,
    intent: TradeIntent,
    balance: f64,
    settings: &RiskSettings,
) -> TradeResult<PricingPlan> {
    let book = exchange
        .order_book(intent.market_index)
        .await
        .map_err(TradeError::query)?;
    let plan = plan_from_snapshot(intent, &book, balance, settings)?;
    info!(
        direction = %plan.direction,
        market_index = plan.market_index,
        current_price = plan.current_price,
        entry = plan.adjusted_price,
        size = plan.position_size,
        take_profit = plan.take_profit_price,
        stop_loss = plan.stop_loss_price,
        "pricing.plan"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "expected {b}, got {a} (tol {tol})");
    }

    fn book(ask: f64, bid: f64) -> MarketSnapshot {
        MarketSnapshot { market_index: 0, best_ask: Some(ask), best_bid: Some(bid) }
    }

    fn intent(direction: Direction) -> TradeIntent {
        TradeIntent { direction, market_index: 0 }
    }

    #[test]
    fn buy_crosses_ask_with_slippage() {
        let current = current_price(Direction::Long, &book(101.0, 99.0)).unwrap();
        assert_eq!(current, 101.0);
        assert_close(adjusted_price(Direction::Long, current), 101.00505, 1e-9);
    }

    #[test]
    fn sell_crosses_bid_with_slippage() {
        let current = current_price(Direction::Short, &book(101.0, 99.0)).unwrap();
        assert_eq!(current, 99.0);
        assert_close(adjusted_price(Direction::Short, current), 98.99505, 1e-9);
    }

    #[test]
    fn size_from_leverage() {
        assert_eq!(position_size(1000.0, 8.0, 100.0), 80.0);
        // truncated, not rounded
        assert_eq!(position_size(1000.0, 8.0, 101.0), 79.2);
        assert_eq!(position_size(10.0, 1.0, 150.0), 0.0);
    }

    #[test]
    fn protection_is_directional() {
        let settings = RiskSettings::default();
        for direction in [Direction::Long, Direction::Short] {
            for price in [0.5, 99.0, 101.0, 64_000.0] {
                let plan = plan_from_snapshot(intent(direction), &book(price, price), 1e9, &settings).unwrap();
                let entry = plan.adjusted_price;
                match direction {
                    Direction::Long => {
                        assert!(plan.take_profit_price > entry && entry > plan.stop_loss_price);
                        assert!(plan.take_profit_trigger > entry && plan.take_profit_trigger < plan.take_profit_price);
                        assert!(plan.stop_loss_trigger < entry && plan.stop_loss_trigger > plan.stop_loss_price);
                    }
                    Direction::Short => {
                        assert!(plan.take_profit_price < entry && entry < plan.stop_loss_price);
                        assert!(plan.take_profit_trigger < entry && plan.take_profit_trigger > plan.take_profit_price);
                        assert!(plan.stop_loss_trigger > entry && plan.stop_loss_trigger < plan.stop_loss_price);
                    }
                }
            }
        }
    }

    #[test]
    fn take_profit_trigger_is_midpoint() {
        let settings = RiskSettings::default();
        for direction in [Direction::Long, Direction::Short] {
            let plan = plan_from_snapshot(intent(direction), &book(101.0, 99.0), 1000.0, &settings).unwrap();
            let entry = plan.adjusted_price;
            assert_close(plan.take_profit_trigger, entry + (plan.take_profit_price - entry) / 2.0, 1e-9);
            assert_close(plan.take_profit_trigger, (entry + plan.take_profit_price) / 2.0, 1e-9);
        }
    }

    #[test]
    fn stop_loss_trigger_at_ninety_percent() {
        let settings = RiskSettings::default();
        for direction in [Direction::Long, Direction::Short] {
            let plan = plan_from_snapshot(intent(direction), &book(101.0, 99.0), 1000.0, &settings).unwrap();
            let entry = plan.adjusted_price;
            let full = (plan.stop_loss_price - entry).abs();
            let to_trigger = (plan.stop_loss_trigger - entry).abs();
            assert_close(to_trigger / full, 0.9, 1e-9);
        }
    }

    #[test]
    fn long_plan_values() {
        let settings = RiskSettings::default();
        let plan = plan_from_snapshot(intent(Direction::Long), &book(100.0, 99.9), 1000.0, &settings).unwrap();
        assert_eq!(plan.current_price, 100.0);
        assert_close(plan.adjusted_price, 100.005, 1e-9);
        assert_eq!(plan.position_size, 80.0);
        assert_eq!(plan.native_lot_size, 80_000_000_000);
        assert_close(plan.take_profit_price, 100.005 * 1.0018, 1e-9);
        assert_close(plan.stop_loss_price, 100.005 * 0.978, 1e-9);
    }

    #[test]
    fn empty_or_crossed_book_fails_fast() {
        let settings = RiskSettings::default();
        let no_asks = MarketSnapshot { market_index: 4, best_ask: None, best_bid: Some(1.0) };
        assert!(matches!(
            plan_from_snapshot(intent(Direction::Long), &no_asks, 1000.0, &settings),
            Err(TradeError::EmptyOrderBook { market_index: 4, side: "asks" })
        ));
        let no_bids = MarketSnapshot { market_index: 4, best_ask: Some(1.0), best_bid: None };
        assert!(matches!(
            plan_from_snapshot(intent(Direction::Short), &no_bids, 1000.0, &settings),
            Err(TradeError::EmptyOrderBook { side: "bids", .. })
        ));
        assert!(matches!(
            plan_from_snapshot(intent(Direction::Long), &book(98.0, 99.0), 1000.0, &settings),
            Err(TradeError::CrossedOrderBook { .. })
        ));
        // locked is not crossed
        assert!(plan_from_snapshot(intent(Direction::Long), &book(100.0, 100.0), 1000.0, &settings).is_ok());
        assert!(matches!(
            plan_from_snapshot(intent(Direction::Long), &book(0.0, 0.0), 1000.0, &settings),
            Err(TradeError::InvalidPrice(_))
        ));
    }

    #[test]
    fn dust_balance_is_rejected() {
        let settings = RiskSettings::default();
        assert!(matches!(
            plan_from_snapshot(intent(Direction::Long), &book(150.0, 149.0), 1.0, &settings),
            Err(TradeError::PositionTooSmall { .. })
        ));
    }
}
