//! The Polymarket fee curve and fee-aware order sizing.
//!
//! `fee = trade_value * 0.25 * (p * (1 - p))^2`, clamped to `p in [0.01, 0.99]`.
//! Kept as a pure function so sizing, placement-time estimation, and
//! resolution-time settlement all go through the same formula.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const FEE_RATE: Decimal = dec!(0.25);
const MIN_PRICE: Decimal = dec!(0.01);
const MAX_PRICE: Decimal = dec!(0.99);
const MIN_FEE_PRECISION: Decimal = dec!(0.0001);

/// `fee_mult(p) = 0.25 * (p * (1 - p))^2`. Maximum at p=0.5, zero at the endpoints.
pub fn fee_multiplier(price: Decimal) -> Decimal {
    let p = price.clamp(MIN_PRICE, MAX_PRICE);
    let spread = p * (Decimal::ONE - p);
    FEE_RATE * spread * spread
}

/// Fee owed on a trade of `trade_value` dollars executed at `price`.
/// Returns 0 for out-of-range prices or non-positive trade values; rounds
/// anything below the minimum fee precision down to zero.
pub fn polymarket_fee(price: Decimal, trade_value: Decimal) -> Decimal {
    if price <= Decimal::ZERO || price >= Decimal::ONE || trade_value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let fee = fee_multiplier(price) * trade_value;
    if fee < MIN_FEE_PRECISION {
        Decimal::ZERO
    } else {
        fee.max(Decimal::ZERO)
    }
}

/// `kelly_amount = principal * kelly_fraction * kelly_scale`.
pub fn kelly_amount(principal: Decimal, kelly_fraction: Decimal, kelly_scale: Decimal) -> Decimal {
    principal * kelly_fraction * kelly_scale
}

/// Result of sizing an order to deliver a target dollar exposure net of fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSizing {
    pub order_size: Decimal,
    pub order_value: Decimal,
    pub estimated_fee: Decimal,
}

/// Converts a target dollar amount into a whole-share order size that
/// survives the fee curve, respecting `dollar_bet_limit` and a minimum
/// order value of $1. Returns `None` if no valid size exists (the
/// minimum order value would exceed the bet limit).
pub fn order_size_with_fees(
    amount_invested: Decimal,
    order_price: Decimal,
    dollar_bet_limit: Decimal,
) -> Option<OrderSizing> {
    const MIN_ORDER_VALUE: Decimal = dec!(1.0);

    if order_price <= Decimal::ZERO || amount_invested <= Decimal::ZERO {
        return None;
    }

    let fee_mult = fee_multiplier(order_price);
    let desired_shares_after_fee = amount_invested / order_price;
    let mut shares_to_order = desired_shares_after_fee / (Decimal::ONE - fee_mult);

    let mut order_value = shares_to_order * order_price;
    if order_value > dollar_bet_limit {
        shares_to_order = dollar_bet_limit / order_price;
        order_value = shares_to_order * order_price;
    }

    let mut order_size = shares_to_order.ceil();
    let mut final_value = order_size * order_price;

    if final_value < MIN_ORDER_VALUE {
        let bumped = (MIN_ORDER_VALUE / order_price).ceil();
        let bumped_value = bumped * order_price;
        if bumped_value > dollar_bet_limit {
            return None;
        }
        order_size = bumped;
        final_value = bumped_value;
    }

    let estimated_fee = polymarket_fee(order_price, final_value);

    Some(OrderSizing {
        order_size,
        order_value: final_value,
        estimated_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_zero_at_endpoints() {
        assert_eq!(polymarket_fee(dec!(0.0), dec!(100)), Decimal::ZERO);
        assert_eq!(polymarket_fee(dec!(1.0), dec!(100)), Decimal::ZERO);
    }

    #[test]
    fn fee_symmetric_around_half() {
        let low = polymarket_fee(dec!(0.3), dec!(100));
        let high = polymarket_fee(dec!(0.7), dec!(100));
        assert_eq!(low, high);
    }

    #[test]
    fn fee_positive_inside_range() {
        let fee = polymarket_fee(dec!(0.52), dec!(100));
        assert!(fee > Decimal::ZERO);
    }

    #[test]
    fn fee_clamps_extreme_prices() {
        // p=0.001 clamps to 0.01 internally in fee_multiplier, but
        // polymarket_fee itself rejects p outside (0,1) at the trade-value
        // guard, so this exercises the clamp used at sizing time instead.
        let mult_low = fee_multiplier(dec!(0.001));
        let mult_floor = fee_multiplier(dec!(0.01));
        assert_eq!(mult_low, mult_floor);
    }

    #[test]
    fn sizing_matches_worked_example() {
        // S1: amount_invested = 25 (kelly), order_price = 0.52, bet_limit = 50
        let sizing = order_size_with_fees(dec!(25), dec!(0.52), dec!(50)).unwrap();
        let fee_mult = fee_multiplier(dec!(0.52));
        let desired = dec!(25) / dec!(0.52);
        let expected_shares = (desired / (Decimal::ONE - fee_mult)).ceil();
        assert_eq!(sizing.order_size, expected_shares);
        assert!(sizing.order_value <= dec!(50));
    }

    #[test]
    fn sizing_bumps_to_minimum_order_value() {
        // A tiny amount_invested should bump up to the $1 minimum order value.
        let sizing = order_size_with_fees(dec!(0.05), dec!(0.50), dec!(50)).unwrap();
        assert!(sizing.order_value >= dec!(1.0));
    }

    #[test]
    fn sizing_rejects_when_minimum_exceeds_bet_limit() {
        let sizing = order_size_with_fees(dec!(0.01), dec!(0.99), dec!(0.50));
        assert!(sizing.is_none());
    }

    #[test]
    fn kelly_amount_is_simple_product() {
        assert_eq!(
            kelly_amount(dec!(100), dec!(0.25), dec!(1)),
            dec!(25)
        );
    }
}
