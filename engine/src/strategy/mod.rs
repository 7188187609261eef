//! Strategy Kernel (C6): decides when to open a position, at what
//! price and size, how to exit, when to re-price, and when to cancel.
//!
//! Two variants share the gating/sizing primitives in this module;
//! `threshold` and `limit_buy` add the strategy-specific trigger and
//! exit rules on top.

pub mod limit_buy;
pub mod threshold;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Minimum principal required before any new position can be opened.
pub const MIN_BET_SIZE: Decimal = dec!(1);

/// Fixed profit-take price for the Threshold strategy. Ported from the
/// `0.99` constant used throughout the original trading script.
/// TODO: make configurable once a strategy needs something other than 0.99.
pub const THRESHOLD_PROFIT_TAKE_PRICE: Decimal = dec!(0.99);

/// Shared pre-trade gates (spec §4.5.1 steps 1-5, reused by both
/// strategies): capital serialization, minimum principal, market
/// freshness and duplicate-bet checks. Strategy-specific price/timing
/// gates live in each strategy's own module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateFailure {
    OpenPositionExists,
    PrincipalTooLow,
    InsufficientBalance,
    AlreadyBetOnMarket,
    MarketInactive,
}

pub fn check_capital_serialization(has_open_buy: bool, has_open_sell: bool) -> Result<(), GateFailure> {
    if has_open_buy || has_open_sell {
        Err(GateFailure::OpenPositionExists)
    } else {
        Ok(())
    }
}

pub fn check_principal(principal: Decimal) -> Result<(), GateFailure> {
    if principal >= MIN_BET_SIZE {
        Ok(())
    } else {
        Err(GateFailure::PrincipalTooLow)
    }
}

pub fn check_balance(wallet_balance: Decimal, amount_invested: Decimal) -> Result<(), GateFailure> {
    if wallet_balance >= amount_invested {
        Ok(())
    } else {
        Err(GateFailure::InsufficientBalance)
    }
}

pub fn check_not_already_bet(already_bet: bool) -> Result<(), GateFailure> {
    if already_bet {
        Err(GateFailure::AlreadyBetOnMarket)
    } else {
        Ok(())
    }
}

pub fn check_market_active(active: bool) -> Result<(), GateFailure> {
    if active {
        Ok(())
    } else {
        Err(GateFailure::MarketInactive)
    }
}

/// In-memory reservation set preventing YES and NO from both
/// triggering a buy on the same slug within one monitoring pass.
#[derive(Debug, Default)]
pub struct BetReservations {
    reserved: std::collections::HashSet<String>,
}

impl BetReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the slug; returns false if it was already reserved.
    pub fn reserve(&mut self, slug: &str) -> bool {
        self.reserved.insert(slug.to_string())
    }

    pub fn release(&mut self, slug: &str) {
        self.reserved.remove(slug);
    }

    pub fn is_reserved(&self, slug: &str) -> bool {
        self.reserved.contains(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capital_serialization_blocks_on_either_side() {
        assert!(check_capital_serialization(false, false).is_ok());
        assert_eq!(
            check_capital_serialization(true, false),
            Err(GateFailure::OpenPositionExists)
        );
        assert_eq!(
            check_capital_serialization(false, true),
            Err(GateFailure::OpenPositionExists)
        );
    }

    #[test]
    fn principal_gate_at_minimum_bet_size() {
        assert!(check_principal(dec!(1)).is_ok());
        assert_eq!(check_principal(dec!(0.99)), Err(GateFailure::PrincipalTooLow));
    }

    #[test]
    fn reservations_prevent_double_trigger() {
        let mut reservations = BetReservations::new();
        assert!(reservations.reserve("slug-1"));
        assert!(!reservations.reserve("slug-1"));
        reservations.release("slug-1");
        assert!(reservations.reserve("slug-1"));
    }
}
