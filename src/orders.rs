use std::collections::BTreeSet;

use crate::domain::PricingPlan;
use crate::error::{TradeError, TradeResult};
use crate::exchange::{
    price_to_native, AccountState, OrderParams, OrderType, PositionDirection, TriggerCondition,
};

/// Hands out user order ids ("trigger order slots") that no open order on the
/// account is using. Id 0 means "unassigned" to the exchange and is never issued.
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    in_use: BTreeSet<u8>,
}

impl SlotAllocator {
    pub fn from_account(state: &AccountState) -> Self {
        Self {
            in_use: state
                .open_orders
                .iter()
                .map(|o| o.user_order_id)
                .filter(|id| *id != 0)
                .collect(),
        }
    }

    pub fn allocate(&mut self) -> TradeResult<u8> {
        let slot = (1..=u8::MAX)
            .find(|id| !self.in_use.contains(id))
            .ok_or(TradeError::NoFreeOrderSlot)?;
        self.in_use.insert(slot);
        Ok(slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionSlots {
    pub take_profit: u8,
    pub stop_loss: u8,
}

impl ProtectionSlots {
    pub fn allocate(allocator: &mut SlotAllocator) -> TradeResult<Self> {
        Ok(Self {
            take_profit: allocator.allocate()?,
            stop_loss: allocator.allocate()?,
        })
    }
}

/// Entry, take-profit and stop-loss legs, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBundle {
    pub main: OrderParams,
    pub take_profit: OrderParams,
    pub stop_loss: OrderParams,
}

impl OrderBundle {
    pub fn legs(&self) -> [OrderParams; 3] {
        [self.main.clone(), self.take_profit.clone(), self.stop_loss.clone()]
    }
}

pub fn main_order(plan: &PricingPlan) -> OrderParams {
    OrderParams::limit(
        plan.market_index,
        plan.direction.into(),
        plan.native_lot_size,
        price_to_native(plan.adjusted_price),
    )
}

/// Resting reduce-only limit at the take-profit price. The computed
/// take-profit trigger is not used by this leg.
pub fn take_profit_order(plan: &PricingPlan, slot: u8) -> OrderParams {
    OrderParams {
        user_order_id: slot,
        reduce_only: true,
        ..OrderParams::limit(
            plan.market_index,
            plan.direction.opposite().into(),
            plan.native_lot_size,
            price_to_native(plan.take_profit_price),
        )
    }
}

/// Reduce-only trigger limit: a long's stop fires when price falls to the
/// trigger, a short's when it rises to it.
pub fn stop_loss_order(plan: &PricingPlan, slot: u8) -> OrderParams {
    let exit: PositionDirection = plan.direction.opposite().into();
    let trigger_condition = match exit {
        PositionDirection::Short => TriggerCondition::Below,
        PositionDirection::Long => TriggerCondition::Above,
    };
    OrderParams {
        order_type: OrderType::TriggerLimit,
        user_order_id: slot,
        reduce_only: true,
        trigger_price: Some(price_to_native(plan.stop_loss_trigger)),
        trigger_condition,
        ..OrderParams::limit(
            plan.market_index,
            exit,
            plan.native_lot_size,
            price_to_native(plan.stop_loss_price),
        )
    }
}

pub fn build_bundle(plan: &PricingPlan, slots: ProtectionSlots) -> OrderBundle {
    OrderBundle {
        main: main_order(plan),
        take_profit: take_profit_order(plan, slots.take_profit),
        stop_loss: stop_loss_order(plan, slots.stop_loss),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, MarketSnapshot, RiskSettings, TradeIntent};
    use crate::exchange::{MarketType, OpenOrder};
    use crate::pricing::plan_from_snapshot;

    fn plan(direction: Direction) -> PricingPlan {
        let book = MarketSnapshot { market_index: 1, best_ask: Some(101.0), best_bid: Some(99.0) };
        plan_from_snapshot(
            TradeIntent { direction, market_index: 1 },
            &book,
            1000.0,
            &RiskSettings::default(),
        )
        .unwrap()
    }

    fn order(user_order_id: u8) -> OpenOrder {
        OpenOrder { order_id: 9, market_index: 1, market_type: MarketType::Perp, user_order_id }
    }

    #[test]
    fn allocator_skips_slots_in_use() {
        let state = AccountState {
            open_orders: vec![order(1), order(3), order(0)],
            ..Default::default()
        };
        let mut alloc = SlotAllocator::from_account(&state);
        let slots = ProtectionSlots::allocate(&mut alloc).unwrap();
        assert_eq!(slots, ProtectionSlots { take_profit: 2, stop_loss: 4 });
    }

    #[test]
    fn allocator_exhausts() {
        let state = AccountState {
            open_orders: (1..=254).map(order).collect(),
            ..Default::default()
        };
        let mut alloc = SlotAllocator::from_account(&state);
        assert_eq!(alloc.allocate().unwrap(), 255);
        assert!(matches!(alloc.allocate(), Err(TradeError::NoFreeOrderSlot)));
    }

    #[test]
    fn long_bundle_legs() {
        let p = plan(Direction::Long);
        let b = build_bundle(&p, ProtectionSlots { take_profit: 1, stop_loss: 2 });

        assert_eq!(b.main.order_type, OrderType::Limit);
        assert_eq!(b.main.direction, PositionDirection::Long);
        assert!(!b.main.reduce_only);
        assert_eq!(b.main.price, price_to_native(p.adjusted_price));
        assert_eq!(b.main.base_asset_amount, p.native_lot_size);
        assert_eq!(b.main.market_index, 1);

        assert_eq!(b.take_profit.order_type, OrderType::Limit);
        assert_eq!(b.take_profit.direction, PositionDirection::Short);
        assert!(b.take_profit.reduce_only);
        assert_eq!(b.take_profit.price, price_to_native(p.take_profit_price));
        assert_eq!(b.take_profit.trigger_price, None);
        assert_eq!(b.take_profit.user_order_id, 1);

        assert_eq!(b.stop_loss.order_type, OrderType::TriggerLimit);
        assert_eq!(b.stop_loss.direction, PositionDirection::Short);
        assert!(b.stop_loss.reduce_only);
        assert_eq!(b.stop_loss.price, price_to_native(p.stop_loss_price));
        assert_eq!(b.stop_loss.trigger_price, Some(price_to_native(p.stop_loss_trigger)));
        assert_eq!(b.stop_loss.trigger_condition, TriggerCondition::Below);
        assert_eq!(b.stop_loss.user_order_id, 2);
    }

    #[test]
    fn short_bundle_inverts_sides_and_trigger() {
        let p = plan(Direction::Short);
        let b = build_bundle(&p, ProtectionSlots { take_profit: 5, stop_loss: 6 });
        assert_eq!(b.main.direction, PositionDirection::Short);
        assert_eq!(b.take_profit.direction, PositionDirection::Long);
        assert_eq!(b.stop_loss.direction, PositionDirection::Long);
        assert_eq!(b.stop_loss.trigger_condition, TriggerCondition::Above);
        assert!(b.stop_loss.price > b.main.price);
        assert!(b.take_profit.price < b.main.price);
    }

    #[test]
    fn legs_are_in_submission_order() {
        let b = build_bundle(&plan(Direction::Long), ProtectionSlots { take_profit: 1, stop_loss: 2 });
        let legs = b.legs();
        assert_eq!(legs[0], b.main);
        assert_eq!(legs[1], b.take_profit);
        assert_eq!(legs[2], b.stop_loss);
    }
}
