//! Limit-Buy strategy (spec §4.5.2): pre-place dual YES/NO limit bids
//! early in a market, cancel the loser when one fills, exit at a fixed
//! sell price, then convert to aggressive limit-sells near resolution.
//!
//! Ported from `trade_limit_buy_strategy.py`'s open/cancel-if-stalled/
//! late-exit logic, reusing `crate::orders::late_exit_price` for the
//! shared re-pricing clamp.

use rust_decimal::Decimal;

use crate::config::LimitBuyConfig;
use crate::orderbook::Side;
use crate::orders::late_exit_price;

/// A market is eligible for the dual open once there's enough runway
/// left before resolution.
pub fn eligible_for_open(minutes_until_resolution: Option<i64>, config: &LimitBuyConfig) -> bool {
    minutes_until_resolution
        .map(|minutes| minutes >= config.min_minutes_before_resolution)
        .unwrap_or(false)
}

/// The two simultaneous opening orders: YES at `yes_buy_price`, NO at
/// `no_buy_price`, both sized `order_size`.
#[derive(Debug, Clone, Copy)]
pub struct DualOpen {
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub size: Decimal,
}

pub fn dual_open(config: &LimitBuyConfig) -> DualOpen {
    DualOpen {
        yes_price: config.yes_buy_price,
        no_price: config.no_buy_price,
        size: config.order_size,
    }
}

/// Whether both standing buys should be cancelled because neither
/// filled and the market is running out of runway.
pub fn should_cancel_stalled(
    minutes_until_resolution: Option<i64>,
    config: &LimitBuyConfig,
    yes_filled: bool,
    no_filled: bool,
) -> bool {
    if yes_filled || no_filled {
        return false;
    }
    minutes_until_resolution
        .map(|minutes| minutes <= config.cancel_threshold_minutes)
        .unwrap_or(true)
}

/// Which sibling side to cancel once one side fills.
pub fn sibling_side(filled_side: Side) -> Side {
    match filled_side {
        Side::Yes => Side::No,
        Side::No => Side::Yes,
    }
}

/// Whether the standing profit-take sell should be converted to an
/// aggressive limit-sell near resolution.
pub fn needs_late_exit(minutes_until_resolution: Option<i64>, config: &LimitBuyConfig) -> bool {
    minutes_until_resolution
        .map(|minutes| minutes <= config.cancel_threshold_minutes)
        .unwrap_or(true)
}

/// New aggressive limit-sell price for the late-exit conversion.
pub fn late_exit_sell_price(best_bid: Decimal, config: &LimitBuyConfig) -> (Decimal, bool) {
    late_exit_price(best_bid, config.best_bid_margin, config.sell_price_lower_bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> LimitBuyConfig {
        LimitBuyConfig {
            yes_buy_price: dec!(0.40),
            no_buy_price: dec!(0.40),
            sell_price: dec!(0.60),
            order_size: dec!(20),
            min_minutes_before_resolution: 10,
            cancel_threshold_minutes: 2,
            kelly_fraction: dec!(0.5),
            kelly_scale_factor: dec!(1.0),
            market_type: crate::config::MarketSchedule::FifteenMinute,
            initial_principal: dec!(100),
            dollar_bet_limit: dec!(20),
            best_bid_margin: dec!(0.02),
            sell_price_lower_bound: dec!(0.01),
            orderbook_poll_interval: 5,
            order_status_check_interval: 10,
        }
    }

    #[test]
    fn eligible_for_open_requires_minimum_runway() {
        let cfg = config();
        assert!(eligible_for_open(Some(10), &cfg));
        assert!(!eligible_for_open(Some(9), &cfg));
        assert!(!eligible_for_open(None, &cfg));
    }

    #[test]
    fn stalled_cancel_skips_once_either_side_filled() {
        let cfg = config();
        assert!(!should_cancel_stalled(Some(1), &cfg, true, false));
        assert!(should_cancel_stalled(Some(1), &cfg, false, false));
        assert!(should_cancel_stalled(None, &cfg, false, false));
    }

    #[test]
    fn sibling_side_flips() {
        assert_eq!(sibling_side(Side::Yes), Side::No);
        assert_eq!(sibling_side(Side::No), Side::Yes);
    }

    #[test]
    fn late_exit_triggers_at_cancel_threshold() {
        let cfg = config();
        assert!(needs_late_exit(Some(2), &cfg));
        assert!(!needs_late_exit(Some(3), &cfg));
    }

    #[test]
    fn late_exit_price_uses_shared_clamp() {
        let cfg = config();
        let (price, forced) = late_exit_sell_price(dec!(0.5), &cfg);
        assert_eq!(price, dec!(0.48));
        assert!(!forced);
    }
}
