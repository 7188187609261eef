//! Resolution Engine (C7): detects market-end, reconciles the final
//! sell-order state, computes fee-adjusted PnL and the winning side,
//! and updates the persisted bankroll.
//!
//! PnL formulas ported bit-for-bit from
//! `original_source/agents/trading/utils/market_resolution_helpers.py`
//! (`calculate_payout_for_filled_sell`/`_unfilled_sell`/`_partial_fill`,
//! `calculate_roi`) onto `rust_decimal::Decimal` via `crate::fees`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::fees::polymarket_fee;
use crate::store::{OrderSide, OrderStatus, Trade};

pub const RESOLUTION_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const FINAL_RECONCILE_WAIT: Duration = Duration::from_secs(5);
pub const FINAL_RECONCILE_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const FINAL_RECONCILE_MAX_RETRIES: u32 = 10;

/// How long past a market's end time the resolution engine waits for
/// Gamma to report a winner before force-resolving as a loss, ported
/// from `cleanup_stale_positions`'s 1-hour grace window.
pub const FORCE_EXPIRE_GRACE: Duration = Duration::from_secs(3600);

/// Single-trade classification of how the exit order finally settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellOutcome {
    Filled,
    Partial,
    UnfilledOrCancelled,
}

pub fn classify_sell_outcome(status: &str, filled: Decimal, total: Decimal, still_live: bool) -> SellOutcome {
    if crate::gateway::is_order_filled(status, filled, total) {
        SellOutcome::Filled
    } else if filled > Decimal::ZERO && filled < total && still_live {
        SellOutcome::Partial
    } else {
        SellOutcome::UnfilledOrCancelled
    }
}

/// `winning_side == order_side` when known; otherwise fall back to
/// `outcome_price > 0.5`.
pub fn bet_won(order_side: OrderSide, winning_side: Option<OrderSide>, outcome_price: Decimal) -> bool {
    match winning_side {
        Some(winner) => winner == order_side,
        None => outcome_price > Decimal::new(5, 1),
    }
}

fn roi(net_payout: Decimal, dollars_spent: Decimal, buy_fee: Decimal) -> Decimal {
    let total_cost = dollars_spent + buy_fee;
    if total_cost <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        net_payout / total_cost
    }
}

/// PnL outcome of a resolved trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pnl {
    pub bet_won: bool,
    pub payout: Decimal,
    pub net_payout: Decimal,
    pub roi: Decimal,
}

/// Sell fully filled: use the actual proceeds, no resolution-side estimate needed.
pub fn pnl_for_filled_sell(
    sell_dollars_received: Decimal,
    sell_fee: Decimal,
    dollars_spent: Decimal,
    buy_fee: Decimal,
    order_side: OrderSide,
    winning_side: Option<OrderSide>,
    outcome_price: Decimal,
) -> Pnl {
    let payout = sell_dollars_received;
    let net_payout = sell_dollars_received - sell_fee - dollars_spent - buy_fee;
    Pnl {
        bet_won: bet_won(order_side, winning_side, outcome_price),
        payout,
        net_payout,
        roi: roi(net_payout, dollars_spent, buy_fee),
    }
}

/// Sell never filled or was cancelled: value the shares at resolution
/// (lost -> worthless; won -> claim at outcome_price, ~$1).
pub fn pnl_for_unfilled_sell(
    outcome_price: Decimal,
    filled_shares: Decimal,
    order_side: OrderSide,
    dollars_spent: Decimal,
    buy_fee: Decimal,
    winning_side: Option<OrderSide>,
) -> Pnl {
    let won = bet_won(order_side, winning_side, outcome_price);
    if !won {
        let net_payout = -(dollars_spent + buy_fee);
        return Pnl {
            bet_won: false,
            payout: Decimal::ZERO,
            net_payout,
            roi: roi(net_payout, dollars_spent, buy_fee),
        };
    }

    let payout = outcome_price * filled_shares;
    let estimated_sell_fee = polymarket_fee(Decimal::ONE, payout);
    let net_payout = payout - estimated_sell_fee - dollars_spent - buy_fee;
    Pnl {
        bet_won: true,
        payout,
        net_payout,
        roi: roi(net_payout, dollars_spent, buy_fee),
    }
}

/// Sell partially filled: actual proceeds on the sold portion, plus
/// resolution-time valuation of the unsold remainder.
#[allow(clippy::too_many_arguments)]
pub fn pnl_for_partial_fill(
    sell_dollars_received: Decimal,
    sell_fee: Decimal,
    filled_shares: Decimal,
    sell_shares_filled: Decimal,
    outcome_price: Decimal,
    order_side: OrderSide,
    dollars_spent: Decimal,
    buy_fee: Decimal,
    winning_side: Option<OrderSide>,
) -> Pnl {
    let remaining_shares = filled_shares - sell_shares_filled;
    let won = bet_won(order_side, winning_side, outcome_price);

    let (remaining_value, remaining_fee) = if won {
        let value = outcome_price * remaining_shares;
        (value, polymarket_fee(outcome_price, value))
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    };

    let payout = sell_dollars_received + remaining_value;
    let total_sell_fee = sell_fee + remaining_fee;
    let net_payout = payout - total_sell_fee - dollars_spent - buy_fee;

    Pnl {
        bet_won: won,
        payout,
        net_payout,
        roi: roi(net_payout, dollars_spent, buy_fee),
    }
}

/// Single-source-of-truth principal update: always computed from
/// `trade.principal_before + net_payout`, never from the running
/// in-memory total, which only exists to heal drift after restarts.
pub fn next_principal(principal_before: Decimal, net_payout: Decimal) -> Decimal {
    principal_before + net_payout
}

/// Logs and prefers the computed principal when the in-memory running
/// total has drifted from it by more than a cent.
pub fn reconcile_in_memory_principal(in_memory: Decimal, computed: Decimal) -> Decimal {
    if (in_memory - computed).abs() > Decimal::new(1, 2) {
        warn!(%in_memory, %computed, "in-memory principal drifted from computed value, trusting computed");
    }
    computed
}

/// Dispatches to the PnL formula matching how the trade's sell order (if
/// any) settled, and turns a Gamma resolution winner into the held
/// side's outcome price (winner claims $1/share, loser claims $0).
pub fn resolve_trade_pnl(trade: &Trade, winning_side: OrderSide) -> Pnl {
    let outcome_price = if winning_side == trade.order_side { Decimal::ONE } else { Decimal::ZERO };
    let buy_fee = trade.buy_fee.unwrap_or(Decimal::ZERO);
    let dollars_spent = trade.buy_dollars_spent.unwrap_or(Decimal::ZERO);
    let filled_shares = trade.buy_filled_shares.unwrap_or(Decimal::ZERO);

    match trade.sell_status {
        Some(OrderStatus::Filled) => pnl_for_filled_sell(
            trade.sell_dollars_received.unwrap_or(Decimal::ZERO),
            trade.sell_fee.unwrap_or(Decimal::ZERO),
            dollars_spent,
            buy_fee,
            trade.order_side,
            Some(winning_side),
            outcome_price,
        ),
        Some(OrderStatus::Partial) => pnl_for_partial_fill(
            trade.sell_dollars_received.unwrap_or(Decimal::ZERO),
            trade.sell_fee.unwrap_or(Decimal::ZERO),
            filled_shares,
            trade.sell_shares_filled.unwrap_or(Decimal::ZERO),
            outcome_price,
            trade.order_side,
            dollars_spent,
            buy_fee,
            Some(winning_side),
        ),
        _ => pnl_for_unfilled_sell(
            outcome_price,
            filled_shares,
            trade.order_side,
            dollars_spent,
            buy_fee,
            Some(winning_side),
        ),
    }
}

/// Whether a market has run long enough past its end time that the
/// resolution engine should stop waiting on it and force-expire it.
pub fn should_force_expire(end_time: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    now.signed_duration_since(end_time)
        .to_std()
        .map(|elapsed| elapsed >= grace)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bet_won_prefers_winning_side_over_price() {
        assert!(bet_won(OrderSide::Yes, Some(OrderSide::Yes), dec!(0.2)));
        assert!(!bet_won(OrderSide::Yes, Some(OrderSide::No), dec!(0.9)));
        assert!(bet_won(OrderSide::Yes, None, dec!(0.9)));
        assert!(!bet_won(OrderSide::Yes, None, dec!(0.1)));
    }

    #[test]
    fn filled_sell_uses_actual_proceeds() {
        let pnl = pnl_for_filled_sell(
            dec!(19.5),
            dec!(0.1),
            dec!(15),
            dec!(0.2),
            OrderSide::Yes,
            Some(OrderSide::Yes),
            dec!(1.0),
        );
        assert_eq!(pnl.payout, dec!(19.5));
        assert_eq!(pnl.net_payout, dec!(19.5) - dec!(0.1) - dec!(15) - dec!(0.2));
    }

    #[test]
    fn unfilled_sell_losing_bet_loses_full_stake() {
        let pnl = pnl_for_unfilled_sell(dec!(0.0), dec!(30), OrderSide::Yes, dec!(15), dec!(0.2), Some(OrderSide::No));
        assert!(!pnl.bet_won);
        assert_eq!(pnl.payout, Decimal::ZERO);
        assert_eq!(pnl.net_payout, -(dec!(15) + dec!(0.2)));
    }

    #[test]
    fn unfilled_sell_winning_bet_claims_at_outcome_price() {
        let pnl = pnl_for_unfilled_sell(dec!(1.0), dec!(30), OrderSide::Yes, dec!(15), dec!(0.2), Some(OrderSide::Yes));
        assert!(pnl.bet_won);
        assert_eq!(pnl.payout, dec!(30));
        assert!(pnl.net_payout < dec!(30));
    }

    #[test]
    fn partial_fill_combines_proceeds_and_remainder_value() {
        let pnl = pnl_for_partial_fill(
            dec!(10),
            dec!(0.05),
            dec!(30),
            dec!(15),
            dec!(1.0),
            OrderSide::Yes,
            dec!(15),
            dec!(0.2),
            Some(OrderSide::Yes),
        );
        assert!(pnl.bet_won);
        assert_eq!(pnl.payout, dec!(10) + dec!(15));
    }

    #[test]
    fn roi_guards_zero_denominator() {
        assert_eq!(roi(dec!(10), Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn principal_update_is_exact_sum_not_running_total() {
        assert_eq!(next_principal(dec!(100), dec!(-5.25)), dec!(94.75));
    }

    #[test]
    fn reconciliation_always_trusts_computed_value() {
        assert_eq!(reconcile_in_memory_principal(dec!(90), dec!(94.75)), dec!(94.75));
        assert_eq!(reconcile_in_memory_principal(dec!(94.75), dec!(94.75)), dec!(94.75));
    }

    #[test]
    fn resolve_trade_pnl_dispatches_on_sell_status() {
        use uuid::Uuid;

        let base = Trade {
            trade_id: Uuid::new_v4(),
            deployment_id: "d".into(),
            market_id: "m".into(),
            slug: "s".into(),
            token_id: "t".into(),
            order_side: OrderSide::Yes,
            buy_order_id: Some("buy-1".into()),
            buy_price: dec!(0.5),
            buy_size_ordered: dec!(20),
            buy_status: OrderStatus::Filled,
            buy_filled_shares: Some(dec!(20)),
            buy_fill_price: Some(dec!(0.5)),
            buy_dollars_spent: Some(dec!(10)),
            buy_fee: Some(dec!(0.1)),
            order_placed_at: Utc::now(),
            order_filled_at: Some(Utc::now()),
            sell_order_id: None,
            sell_price: None,
            sell_size: None,
            sell_status: None,
            sell_shares_filled: None,
            sell_dollars_received: None,
            sell_fee: None,
            sell_order_placed_at: None,
            sell_order_filled_at: None,
            outcome_price: None,
            winning_side: None,
            payout: None,
            net_payout: None,
            roi: None,
            is_win: None,
            principal_before: dec!(100),
            principal_after: None,
            market_resolved_at: None,
            error_message: None,
        };
        // Never sold: values at outcome_price like `pnl_for_unfilled_sell`.
        let unfilled = resolve_trade_pnl(&base, OrderSide::Yes);
        assert!(unfilled.bet_won);
        assert_eq!(unfilled.payout, dec!(20));

        // Fully sold: uses actual proceeds like `pnl_for_filled_sell`.
        let mut filled = base.clone();
        filled.sell_status = Some(OrderStatus::Filled);
        filled.sell_dollars_received = Some(dec!(19));
        filled.sell_fee = Some(dec!(0.05));
        let pnl = resolve_trade_pnl(&filled, OrderSide::Yes);
        assert_eq!(pnl.payout, dec!(19));

        // Lost bet with no sell: total stake is gone.
        let lost = resolve_trade_pnl(&base, OrderSide::No);
        assert!(!lost.bet_won);
        assert_eq!(lost.payout, Decimal::ZERO);
    }

    #[test]
    fn sell_outcome_classification() {
        assert_eq!(
            classify_sell_outcome("filled", dec!(10), dec!(10), false),
            SellOutcome::Filled
        );
        assert_eq!(
            classify_sell_outcome("open", dec!(5), dec!(10), true),
            SellOutcome::Partial
        );
        assert_eq!(
            classify_sell_outcome("cancelled", dec!(0), dec!(10), false),
            SellOutcome::UnfilledOrCancelled
        );
    }
}
