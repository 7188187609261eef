//! Threshold strategy (spec §4.5.1): buy when an ask crosses
//! `buy_threshold`, exit at a fixed profit-take price with a
//! stop-loss monitor.
//!
//! Ported from `trade_threshold_strategy.py`'s trigger/size/exit logic,
//! reusing `crate::orderbook::check_threshold` for the YES-first
//! book scan and `crate::fees` for fee-aware sizing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::ThresholdConfig;
use crate::fees::{self, OrderSizing};
use crate::orderbook::{check_threshold, Book, Side};
use crate::strategy::THRESHOLD_PROFIT_TAKE_PRICE;

/// How long a recently-"filled"-flagged sell is revalidated against
/// the exchange before being trusted.
const RECENT_FILL_REVALIDATION_WINDOW: ChronoDuration = ChronoDuration::minutes(2);

/// First side whose ask crosses `threshold` (YES checked first) *and*
/// satisfies the `upper_threshold` ceiling gate.
pub fn evaluate_trigger(
    yes_book: &Book,
    no_book: &Book,
    config: &ThresholdConfig,
) -> Option<(Side, Decimal)> {
    let (side, ask) = check_threshold(yes_book, no_book, config.threshold)?;
    if ask <= config.upper_threshold {
        Some((side, ask))
    } else {
        None
    }
}

/// The limit price actually placed: fixed regardless of the observed
/// trigger ask, per spec (the trigger price is informational only).
pub fn limit_price(config: &ThresholdConfig) -> Decimal {
    (config.threshold + config.margin)
        .min(config.upper_threshold)
        .min(dec!(0.99))
}

/// Kelly-sized, fee-aware order for the given order price and principal.
pub fn size_order(principal: Decimal, config: &ThresholdConfig, order_price: Decimal) -> Option<OrderSizing> {
    let kelly_amount = fees::kelly_amount(principal, config.kelly_fraction, config.kelly_scale_factor);
    let amount_invested = kelly_amount.min(config.dollar_bet_limit);
    fees::order_size_with_fees(amount_invested, order_price, config.dollar_bet_limit)
}

/// Fail-closed minutes gate: `None` (unknown minutes, or no configured
/// cap skipped entirely) behaves per spec — unset cap means no gate,
/// but unknown minutes-until-resolution always fails closed.
pub fn within_resolution_window(minutes_until_resolution: Option<i64>, max_minutes: Option<i64>) -> bool {
    match (max_minutes, minutes_until_resolution) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(max), Some(minutes)) => minutes <= max,
    }
}

/// Stop-loss trigger: best_bid has fallen below `sell_threshold`.
pub fn stoploss_triggered(best_bid: Option<Decimal>, sell_threshold: Decimal) -> bool {
    best_bid.map(|bid| bid < sell_threshold).unwrap_or(false)
}

/// Stop-loss sell price, floored at `0.01`.
pub fn stoploss_sell_price(sell_threshold: Decimal, sell_margin: Decimal) -> Decimal {
    (sell_threshold - sell_margin).max(dec!(0.01))
}

/// Whether the stop-loss monitor is active at all for this config.
pub fn stoploss_enabled(config: &ThresholdConfig) -> bool {
    config.threshold_sell > Decimal::ZERO
}

/// A sell locally marked "filled" less than the revalidation window
/// ago, on a still-unresolved market, must be re-checked against the
/// exchange before the stop-loss monitor trusts it.
pub fn needs_fill_revalidation(flagged_filled_at: DateTime<Utc>, market_resolved: bool, now: DateTime<Utc>) -> bool {
    !market_resolved && now.signed_duration_since(flagged_filled_at) < RECENT_FILL_REVALIDATION_WINDOW
}

pub fn profit_take_price() -> Decimal {
    THRESHOLD_PROFIT_TAKE_PRICE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ThresholdConfig {
        ThresholdConfig {
            threshold: dec!(0.50),
            upper_threshold: dec!(0.70),
            margin: dec!(0.02),
            threshold_sell: dec!(0.30),
            margin_sell: dec!(0.02),
            kelly_fraction: dec!(0.5),
            kelly_scale_factor: dec!(1.0),
            market_type: crate::config::MarketSchedule::FifteenMinute,
            initial_principal: dec!(100),
            dollar_bet_limit: dec!(20),
            max_minutes_before_resolution: None,
            orderbook_poll_interval: 5,
            order_status_check_interval: 10,
            use_websocket_order_status: false,
            use_websocket_orderbook: false,
            websocket_reconnect_delay: 1,
            websocket_health_check_timeout: 14,
        }
    }

    fn book(asks: &[(Decimal, Decimal)]) -> Book {
        Book {
            bids: vec![],
            asks: asks.to_vec(),
        }
    }

    #[test]
    fn trigger_respects_upper_threshold_ceiling() {
        let cfg = config();
        let yes = book(&[(dec!(0.80), dec!(10))]);
        let no = book(&[]);
        assert_eq!(evaluate_trigger(&yes, &no, &cfg), None);
    }

    #[test]
    fn trigger_fires_within_band() {
        let cfg = config();
        let yes = book(&[(dec!(0.55), dec!(10))]);
        let no = book(&[]);
        assert_eq!(evaluate_trigger(&yes, &no, &cfg), Some((Side::Yes, dec!(0.55))));
    }

    #[test]
    fn limit_price_is_fixed_not_observed_ask() {
        let cfg = config();
        assert_eq!(limit_price(&cfg), dec!(0.52));
    }

    #[test]
    fn resolution_window_fails_closed_on_unknown_minutes() {
        assert!(within_resolution_window(Some(5), Some(10)));
        assert!(!within_resolution_window(None, Some(10)));
        assert!(within_resolution_window(None, None));
    }

    #[test]
    fn stoploss_sell_price_floors_at_one_cent() {
        assert_eq!(stoploss_sell_price(dec!(0.02), dec!(0.05)), dec!(0.01));
    }

    #[test]
    fn revalidation_window_is_two_minutes() {
        let now = Utc::now();
        let flagged = now - ChronoDuration::seconds(90);
        assert!(needs_fill_revalidation(flagged, false, now));

        let stale = now - ChronoDuration::minutes(3);
        assert!(!needs_fill_revalidation(stale, false, now));
        assert!(!needs_fill_revalidation(flagged, true, now));
    }
}
