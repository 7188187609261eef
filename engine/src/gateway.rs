//! Exchange Gateway (C1): the interface the core consumes. This is the
//! one component spec.md deliberately leaves external — only its
//! interface is specified (§6). Generalized from
//! `trade-executor/src/clob_ops.rs`'s `ClobOperations` mockable
//! async-trait pattern to the full §6 surface, with `PolymarketGateway`
//! as the concrete implementation over `common::exchange`.

use std::sync::Mutex;

use async_trait::async_trait;
use common::exchange::{self, CachedAuth, RawFill, RawOrderStatus};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl From<OrderSide> for exchange::Side {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => exchange::Side::Buy,
            OrderSide::Sell => exchange::Side::Sell,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient transport error: {0}")]
    Transient(String),
    #[error("terminal placement error: {0}")]
    Terminal(String),
    #[error("order not found")]
    NotFound,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
}

/// Normalized order status: field-name synonyms the exchange returns
/// (`size_matched`/`filledAmount`, `original_size`/`totalAmount`, ...)
/// are absorbed once, here, rather than leaking past this boundary
/// (spec §9 "Dynamic-typed API responses").
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: String,
    pub status: String,
    pub filled_amount: Decimal,
    pub total_amount: Decimal,
    pub market: String,
    pub asset_id: String,
}

impl OrderInfo {
    pub fn is_filled(&self) -> bool {
        is_order_filled(&self.status, self.filled_amount, self.total_amount)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.status.as_str(),
            "cancelled" | "canceled"
        )
    }

    pub fn is_partial_fill(&self) -> bool {
        matches!(self.status.as_str(), "open" | "live" | "partial")
            && self.filled_amount > Decimal::ZERO
            && self.filled_amount < self.total_amount
    }
}

/// Status-based or amount-based fill detection, ported from
/// `original_source/agents/trading/utils/order_status_helpers.py::is_order_filled`.
pub fn is_order_filled(status: &str, filled_amount: Decimal, total_amount: Decimal) -> bool {
    let status_says_filled = matches!(status, "filled" | "complete" | "matched");
    let amounts_say_filled =
        filled_amount > Decimal::ZERO && total_amount > Decimal::ZERO && filled_amount >= total_amount;
    status_says_filled || amounts_say_filled
}

#[derive(Debug, Clone)]
pub struct Fill {
    pub id: String,
    pub taker_order_id: String,
    pub maker_order_ids: Vec<String>,
    pub size: Decimal,
    pub price: Decimal,
    pub status: String,
}

/// Thin contract over the exchange: place/cancel/query orders, fetch
/// trade history and balances. Mockable so the order lifecycle manager
/// and strategy kernel are unit-tested without chain/network access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn execute_order(
        &self,
        token_id: &str,
        price: Decimal,
        size: Decimal,
        side: OrderSide,
    ) -> Result<PlacedOrder, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool, GatewayError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo, GatewayError>;

    async fn get_open_orders(&self) -> Result<Vec<OrderInfo>, GatewayError>;

    async fn get_trades(&self) -> Result<Vec<Fill>, GatewayError>;

    async fn get_polymarket_balance(&self) -> Result<Decimal, GatewayError>;

    async fn get_conditional_token_balance(&self, token_id: &str) -> Result<Decimal, GatewayError>;

    async fn ensure_conditional_token_allowances(&self) -> Result<bool, GatewayError>;
}

/// Live Polymarket implementation, backed by `common::exchange`'s
/// cached-signer order placement.
pub struct PolymarketGateway {
    auth: Mutex<Option<CachedAuth>>,
}

impl PolymarketGateway {
    pub fn new() -> Self {
        Self {
            auth: Mutex::new(None),
        }
    }
}

impl Default for PolymarketGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn raw_to_order_info(raw: RawOrderStatus) -> OrderInfo {
    OrderInfo {
        order_id: raw.order_id,
        status: raw.status,
        filled_amount: raw.size_matched,
        total_amount: raw.original_size,
        market: raw.market,
        asset_id: raw.asset_id,
    }
}

fn raw_to_fill(raw: RawFill) -> Fill {
    Fill {
        id: raw.id,
        taker_order_id: raw.taker_order_id,
        maker_order_ids: raw.maker_order_ids,
        size: raw.size,
        price: raw.price,
        status: raw.status,
    }
}

#[async_trait]
impl ExchangeGateway for PolymarketGateway {
    async fn execute_order(
        &self,
        token_id: &str,
        price: Decimal,
        size: Decimal,
        side: OrderSide,
    ) -> Result<PlacedOrder, GatewayError> {
        // `std::sync::Mutex` guards are not held across an `.await`; take
        // the cached auth out, use it, and put it back.
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::place_limit_order(&mut guard, token_id, size, price, side.into()).await;
        *self.auth.lock().unwrap() = guard;

        result
            .map(|order_id| PlacedOrder { order_id })
            .map_err(|e| classify_placement_error(&e.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::cancel_order(&mut guard, order_id).await;
        *self.auth.lock().unwrap() = guard;

        match result {
            Ok(()) => Ok(true),
            Err(e) => Err(GatewayError::Transient(e.to_string())),
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::get_order(&mut guard, order_id).await;
        *self.auth.lock().unwrap() = guard;

        result
            .map(raw_to_order_info)
            .map_err(|_| GatewayError::NotFound)
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderInfo>, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::get_open_orders(&mut guard).await;
        *self.auth.lock().unwrap() = guard;

        result
            .map(|orders| orders.into_iter().map(raw_to_order_info).collect())
            .map_err(|e| GatewayError::Transient(e.to_string()))
    }

    async fn get_trades(&self) -> Result<Vec<Fill>, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::get_trades(&mut guard).await;
        *self.auth.lock().unwrap() = guard;

        result
            .map(|fills| fills.into_iter().map(raw_to_fill).collect())
            .map_err(|e| GatewayError::Transient(e.to_string()))
    }

    async fn get_polymarket_balance(&self) -> Result<Decimal, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::get_polymarket_balance(&mut guard).await;
        *self.auth.lock().unwrap() = guard;
        result.map_err(|e| GatewayError::Transient(e.to_string()))
    }

    async fn get_conditional_token_balance(&self, token_id: &str) -> Result<Decimal, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::get_conditional_token_balance(&mut guard, token_id).await;
        *self.auth.lock().unwrap() = guard;
        result.map_err(|e| GatewayError::Transient(e.to_string()))
    }

    async fn ensure_conditional_token_allowances(&self) -> Result<bool, GatewayError> {
        let mut guard = { std::mem::take(&mut *self.auth.lock().unwrap()) };
        let result = exchange::ensure_conditional_token_allowances(&mut guard).await;
        *self.auth.lock().unwrap() = guard;
        result.map_err(|e| GatewayError::Transient(e.to_string()))
    }
}

/// Minimum-size and malformed-param errors are terminal; everything
/// else from the placement path is treated as transient (spec §7).
fn classify_placement_error(message: &str) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("minimum") || lower.contains("malformed") || lower.contains("invalid") {
        GatewayError::Terminal(message.to_string())
    } else {
        GatewayError::Transient(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn is_order_filled_by_status() {
        assert!(is_order_filled("filled", dec!(0), dec!(0)));
        assert!(is_order_filled("matched", dec!(0), dec!(0)));
        assert!(!is_order_filled("open", dec!(0), dec!(10)));
    }

    #[test]
    fn is_order_filled_by_amount() {
        assert!(is_order_filled("open", dec!(10), dec!(10)));
        assert!(!is_order_filled("open", dec!(5), dec!(10)));
        assert!(!is_order_filled("open", dec!(0), dec!(0)));
    }

    #[test]
    fn order_info_partial_fill_detection() {
        let info = OrderInfo {
            order_id: "1".into(),
            status: "open".into(),
            filled_amount: dec!(3),
            total_amount: dec!(10),
            market: "m".into(),
            asset_id: "a".into(),
        };
        assert!(info.is_partial_fill());
        assert!(!info.is_filled());
    }

    #[test]
    fn classify_terminal_vs_transient() {
        assert!(matches!(
            classify_placement_error("minimum order size not met"),
            GatewayError::Terminal(_)
        ));
        assert!(matches!(
            classify_placement_error("connection reset"),
            GatewayError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn mock_gateway_can_stub_a_fill() {
        let mut mock = MockExchangeGateway::new();
        mock.expect_get_order().returning(|id| {
            Ok(OrderInfo {
                order_id: id.to_string(),
                status: "filled".into(),
                filled_amount: dec!(10),
                total_amount: dec!(10),
                market: "m".into(),
                asset_id: "a".into(),
            })
        });

        let info = mock.get_order("order-1").await.unwrap();
        assert!(info.is_filled());
    }
}
