//! Polymarket CLOB authentication and order execution.
//!
//! Caches the signer/authenticated client pair and exposes the raw
//! order-placement, cancellation, and status-query primitives the
//! exchange gateway is built on.

use std::str::FromStr;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use polymarket_client_sdk::clob::types::{
    AssetType, BalanceAllowanceRequestBuilder, OrderStatusType as SdkOrderStatus,
    OrdersRequestBuilder, Side as SdkSide, SignatureType, TradesRequestBuilder,
};
use polymarket_client_sdk::clob::{Client as ClobClient, Config as ClobConfig};
use polymarket_client_sdk::POLYGON;
use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::{debug, info};

const CLOB_HOST: &str = "https://clob.polymarket.com";
const ORDER_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl From<Side> for SdkSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => SdkSide::Buy,
            Side::Sell => SdkSide::Sell,
        }
    }
}

/// Cached authentication state for Polymarket CLOB.
pub struct CachedAuth {
    pub client: polymarket_client_sdk::clob::Client<
        polymarket_client_sdk::auth::state::Authenticated<polymarket_client_sdk::auth::Normal>,
    >,
    pub signer: PrivateKeySigner,
    pub authenticated_at: DateTime<Utc>,
}

/// Ensure we have a valid authenticated CLOB client, authenticating on first use.
pub async fn ensure_authenticated(cached_auth: &mut Option<CachedAuth>) -> Result<&CachedAuth> {
    if cached_auth.is_some() {
        debug!("using cached authentication");
        return Ok(cached_auth.as_ref().unwrap());
    }

    info!("authenticating with Polymarket CLOB");

    let private_key = std::env::var("WALLET_PRIVATE_KEY")
        .context("missing WALLET_PRIVATE_KEY environment variable")?;
    let private_key = if private_key.starts_with("0x") {
        private_key
    } else {
        format!("0x{}", private_key)
    };

    let signer = PrivateKeySigner::from_str(&private_key)
        .context("invalid private key format")?
        .with_chain_id(Some(POLYGON));

    let proxy_wallet = std::env::var("POLYMARKET_WALLET_ADDRESS").ok();
    let signature_type = if proxy_wallet.is_some() {
        SignatureType::GnosisSafe
    } else {
        SignatureType::Eoa
    };

    let mut auth_builder = ClobClient::new(CLOB_HOST, ClobConfig::default())?
        .authentication_builder(&signer)
        .signature_type(signature_type);

    if let Some(ref proxy) = proxy_wallet {
        let funder_address: alloy::primitives::Address =
            proxy.parse().context("invalid proxy wallet address")?;
        auth_builder = auth_builder.funder(funder_address);
    }

    let client = auth_builder
        .authenticate()
        .await
        .context("failed to authenticate with Polymarket")?;

    info!("authentication successful");

    *cached_auth = Some(CachedAuth {
        client,
        signer,
        authenticated_at: Utc::now(),
    });

    Ok(cached_auth.as_ref().unwrap())
}

/// Place a GTC limit order. Returns the exchange order id on success.
pub async fn place_limit_order(
    cached_auth: &mut Option<CachedAuth>,
    token_id: &str,
    size: Decimal,
    price: Decimal,
    side: Side,
) -> Result<String> {
    let auth = ensure_authenticated(cached_auth).await?;

    let price = price.normalize();
    let size = size.round_dp(2);

    let order = timeout(
        Duration::from_secs(ORDER_TIMEOUT_SECS),
        auth.client
            .limit_order()
            .token_id(token_id)
            .size(size)
            .price(price)
            .side(side.into())
            .build(),
    )
    .await
    .context("order building timed out")?
    .context("failed to build order")?;

    let signed = timeout(
        Duration::from_secs(ORDER_TIMEOUT_SECS),
        auth.client.sign(&auth.signer, order),
    )
    .await
    .context("order signing timed out")?
    .context("failed to sign order")?;

    let result = timeout(
        Duration::from_secs(ORDER_TIMEOUT_SECS),
        auth.client.post_order(signed),
    )
    .await
    .context("order posting timed out")?
    .context("failed to post order")?;

    if let Some(order) = result.first() {
        let has_error = order
            .error_msg
            .as_ref()
            .map(|e| !e.is_empty())
            .unwrap_or(false);
        if !order.order_id.is_empty() && !has_error {
            info!(order_id = %order.order_id, %token_id, "order placed");
            Ok(order.order_id.clone())
        } else if let Some(ref error) = order.error_msg {
            Err(anyhow::anyhow!("order rejected: {}", error))
        } else {
            Err(anyhow::anyhow!("order failed with unknown error"))
        }
    } else {
        Err(anyhow::anyhow!("no order response received"))
    }
}

/// Cancel an order on Polymarket.
pub async fn cancel_order(cached_auth: &mut Option<CachedAuth>, order_id: &str) -> Result<()> {
    let auth = ensure_authenticated(cached_auth).await?;

    timeout(Duration::from_secs(10), auth.client.cancel_order(order_id))
        .await
        .context("order cancellation timed out")?
        .context("failed to cancel order")?;

    Ok(())
}

/// Raw order status as reported by `get_order`, before synonym normalization.
#[derive(Debug, Clone)]
pub struct RawOrderStatus {
    pub order_id: String,
    pub status: String,
    pub size_matched: Decimal,
    pub original_size: Decimal,
    pub market: String,
    pub asset_id: String,
}

/// Query a single order's status.
pub async fn get_order(
    cached_auth: &mut Option<CachedAuth>,
    order_id: &str,
) -> Result<RawOrderStatus> {
    let auth = ensure_authenticated(cached_auth).await?;

    let order = timeout(Duration::from_secs(10), auth.client.order(order_id))
        .await
        .context("get_order timed out")?
        .context("failed to fetch order")?;

    Ok(RawOrderStatus {
        order_id: order.id.clone(),
        status: sdk_status_to_string(&order.status),
        size_matched: order.size_matched,
        original_size: order.original_size,
        market: order.market,
        asset_id: order.asset_id,
    })
}

/// List this wallet's currently-open orders.
pub async fn get_open_orders(cached_auth: &mut Option<CachedAuth>) -> Result<Vec<RawOrderStatus>> {
    let auth = ensure_authenticated(cached_auth).await?;

    let orders_request = OrdersRequestBuilder::default()
        .build()
        .context("failed to build orders request")?;
    let orders = timeout(
        Duration::from_secs(10),
        auth.client.orders(&orders_request, None),
    )
    .await
    .context("get_orders timed out")?
    .context("failed to fetch open orders")?;

    Ok(orders
        .data
        .into_iter()
        .map(|order| RawOrderStatus {
            order_id: order.id.clone(),
            status: sdk_status_to_string(&order.status),
            size_matched: order.size_matched,
            original_size: order.original_size,
            market: order.market,
            asset_id: order.asset_id,
        })
        .collect())
}

/// A single trade-history fill entry.
#[derive(Debug, Clone)]
pub struct RawFill {
    pub id: String,
    pub taker_order_id: String,
    pub maker_order_ids: Vec<String>,
    pub size: Decimal,
    pub price: Decimal,
    pub status: String,
}

/// Fetch recent trade-history fills for this wallet.
pub async fn get_trades(cached_auth: &mut Option<CachedAuth>) -> Result<Vec<RawFill>> {
    let auth = ensure_authenticated(cached_auth).await?;

    let trades_request = TradesRequestBuilder::default()
        .build()
        .context("failed to build trades request")?;
    let trades = timeout(
        Duration::from_secs(10),
        auth.client.trades(&trades_request, None),
    )
    .await
    .context("get_trades timed out")?
    .context("failed to fetch trade history")?;

    Ok(trades
        .data
        .into_iter()
        .map(|t| RawFill {
            id: t.id,
            taker_order_id: t.taker_order_id,
            maker_order_ids: t.maker_orders.into_iter().map(|m| m.order_id).collect(),
            size: t.size,
            price: t.price,
            status: t.status.to_string(),
        })
        .collect())
}

/// USDC balance available for trading.
pub async fn get_polymarket_balance(cached_auth: &mut Option<CachedAuth>) -> Result<Decimal> {
    let auth = ensure_authenticated(cached_auth).await?;
    let balance_request = BalanceAllowanceRequestBuilder::default()
        .asset_type(AssetType::Collateral)
        .build()
        .context("failed to build balance request")?;
    let balance = timeout(
        Duration::from_secs(10),
        auth.client.balance_allowance(&balance_request),
    )
    .await
    .context("balance lookup timed out")?
    .context("failed to fetch balance")?;
    Ok(balance.balance)
}

/// Conditional-token (share) balance for a given outcome token.
pub async fn get_conditional_token_balance(
    cached_auth: &mut Option<CachedAuth>,
    token_id: &str,
) -> Result<Decimal> {
    let auth = ensure_authenticated(cached_auth).await?;
    let balance_request = BalanceAllowanceRequestBuilder::default()
        .asset_type(AssetType::Conditional)
        .token_id(token_id.to_string())
        .build()
        .context("failed to build balance request")?;
    let balance = timeout(
        Duration::from_secs(10),
        auth.client.balance_allowance(&balance_request),
    )
    .await
    .context("conditional token balance lookup timed out")?
    .context("failed to fetch conditional token balance")?;
    Ok(balance.balance)
}

/// Ensure transfer-approval allowances are set for conditional token trading.
pub async fn ensure_conditional_token_allowances(cached_auth: &mut Option<CachedAuth>) -> Result<bool> {
    let auth = ensure_authenticated(cached_auth).await?;
    let updated = timeout(
        Duration::from_secs(30),
        auth.client.update_balance_allowance(),
    )
    .await
    .context("allowance update timed out")?
    .context("failed to update allowances")?;
    Ok(updated)
}

fn sdk_status_to_string(status: &SdkOrderStatus) -> String {
    format!("{:?}", status).to_lowercase()
}
