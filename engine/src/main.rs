//! Entry point: loads strategy config and infra config, wires up the
//! store, catalog, order-book view, exchange gateway, and scheduler,
//! then runs the strategy/reconciler/resolution tasks until shutdown.
//!
//! CLI shape and startup sequence grounded on
//! `misprice-trader/src/main.rs` (clap derive `Args`, `tracing_subscriber`
//! init, `dotenvy::dotenv()` then `Config::from_env()`/`Database::connect()`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::gamma::GammaClient;
use common::{Config, Database};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod catalog;
mod config;
mod fees;
mod gateway;
mod orderbook;
mod orders;
mod resolution;
mod scheduler;
mod store;
mod strategy;

/// Polymarket's CLOB REST host, used for the HTTP order-book fallback.
/// Distinct from `common::Config::gamma_api_url`, which points at the
/// Gamma markets/catalog API rather than the order-book API.
const CLOB_BOOK_HOST: &str = "https://clob.polymarket.com";

use catalog::MarketCatalog;
use config::{LimitBuyConfig, StrategyConfig, ThresholdConfig};
use gateway::{ExchangeGateway, PolymarketGateway};
use orderbook::{BookCache, OrderbookView};
use scheduler::{Scheduler, RESOLUTION_POLL_INTERVAL};
use store::{NewTrade, OrderStatus, TradeStore};

#[derive(Parser, Debug)]
#[command(name = "engine")]
#[command(about = "Autonomous live trading engine for short-lived binary prediction markets")]
struct Args {
    /// Path to the strategy configuration JSON file.
    #[arg(long)]
    config: PathBuf,

    /// Identifier distinguishing this deployment's trades in the store.
    #[arg(long, default_value = "default")]
    deployment_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!(config = %args.config.display(), deployment_id = %args.deployment_id, "starting engine");

    let strategy_config = StrategyConfig::load(&args.config).context("failed to load strategy config")?;

    dotenvy::dotenv().ok();
    let infra_config = Config::from_env().context("failed to load infra config")?;
    let db = Database::connect(&infra_config).await.context("failed to connect to database")?;

    let store = Arc::new(TradeStore::new(db.pool().clone()));
    store.migrate().await.context("failed to run trade store migration")?;

    let gamma = Arc::new(GammaClient::new(&infra_config));
    let catalog = Arc::new(MarketCatalog::new(gamma.clone(), strategy_config.market_schedule()));

    let book_cache = BookCache::new();
    let orderbook_view = Arc::new(OrderbookView::new(book_cache, format!("{CLOB_BOOK_HOST}/book")));

    let gateway: Arc<PolymarketGateway> = Arc::new(PolymarketGateway::new());

    match gateway.ensure_conditional_token_allowances().await {
        Ok(already_set) => info!(already_set, "conditional token allowances verified"),
        Err(e) => warn!(error = %e, "conditional token allowance check failed, continuing anyway"),
    }

    let principal = store
        .latest_principal(&args.deployment_id)
        .await
        .context("failed to load latest principal")?
        .unwrap_or_else(|| strategy_config.initial_principal());

    info!(%principal, "resolved starting principal");

    let principal = Arc::new(RwLock::new(principal));

    let mut scheduler = Scheduler::new();

    let exit_price: Decimal = match &strategy_config {
        StrategyConfig::Threshold(_) => strategy::threshold::profit_take_price(),
        StrategyConfig::LimitBuy(c) => c.sell_price,
    };

    match &strategy_config {
        StrategyConfig::Threshold(cfg) => {
            let cfg = Arc::new(cfg.clone());
            register_threshold_strategy(
                &mut scheduler,
                cfg.clone(),
                args.deployment_id.clone(),
                catalog.clone(),
                orderbook_view.clone(),
                gateway.clone(),
                store.clone(),
                principal.clone(),
            );
            register_stoploss_monitor(
                &mut scheduler,
                args.deployment_id.clone(),
                cfg,
                orderbook_view.clone(),
                gateway.clone(),
                store.clone(),
            );
        }
        StrategyConfig::LimitBuy(cfg) => {
            let cfg = Arc::new(cfg.clone());
            register_limit_buy_strategy(
                &mut scheduler,
                cfg.clone(),
                args.deployment_id.clone(),
                catalog.clone(),
                gateway.clone(),
                store.clone(),
                principal.clone(),
            );
            register_limit_buy_monitor(
                &mut scheduler,
                args.deployment_id.clone(),
                cfg,
                catalog.clone(),
                orderbook_view.clone(),
                gateway.clone(),
                store.clone(),
            );
        }
    }

    register_order_reconciler(
        &mut scheduler,
        args.deployment_id.clone(),
        gateway.clone(),
        store.clone(),
        exit_price,
    );

    register_resolution_poller(
        &mut scheduler,
        args.deployment_id.clone(),
        catalog.clone(),
        gamma.clone(),
        gateway.clone(),
        store.clone(),
        principal.clone(),
    );

    scheduler.run().await
}

fn side_to_store(side: orderbook::Side) -> store::OrderSide {
    match side {
        orderbook::Side::Yes => store::OrderSide::Yes,
        orderbook::Side::No => store::OrderSide::No,
    }
}

/// Threshold strategy loop (spec §4.5.1): watches every currently-running
/// market for a trigger, sizes and places a buy, and records the trade.
/// Fill detection, sell placement, and resolution happen in the shared
/// reconciler/resolution tasks below, not here.
fn register_threshold_strategy(
    scheduler: &mut Scheduler,
    config: Arc<ThresholdConfig>,
    deployment_id: String,
    catalog: Arc<MarketCatalog>,
    orderbook_view: Arc<OrderbookView>,
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
    principal: Arc<RwLock<Decimal>>,
) {
    let interval = Duration::from_secs(config.orderbook_poll_interval);
    scheduler.register("threshold-strategy", move || {
        let config = config.clone();
        let deployment_id = deployment_id.clone();
        let catalog = catalog.clone();
        let orderbook_view = orderbook_view.clone();
        let gateway = gateway.clone();
        let store = store.clone();
        let principal = principal.clone();
        // Built once per task start/restart; a restart just forgets
        // in-flight reservations the DB's `has_bet_on_market` re-check
        // would have caught anyway.
        let reservations: Arc<RwLock<strategy::BetReservations>> = Arc::new(RwLock::new(strategy::BetReservations::new()));
        scheduler::interval_task(interval, move || {
            let config = config.clone();
            let deployment_id = deployment_id.clone();
            let catalog = catalog.clone();
            let orderbook_view = orderbook_view.clone();
            let gateway = gateway.clone();
            let store = store.clone();
            let principal = principal.clone();
            let reservations = reservations.clone();
            async move {
                threshold_tick(
                    &catalog,
                    &orderbook_view,
                    &gateway,
                    &store,
                    &principal,
                    &config,
                    &deployment_id,
                    &reservations,
                )
                .await
            }
        })
    });
}

/// Book depth, in price levels, below which the weighted-mid diagnostic
/// is worth logging alongside the scan-based best_ask.
const THIN_BOOK_LEVELS: usize = 3;

async fn threshold_tick(
    catalog: &MarketCatalog,
    orderbook_view: &OrderbookView,
    gateway: &PolymarketGateway,
    store: &TradeStore,
    principal: &RwLock<Decimal>,
    config: &ThresholdConfig,
    deployment_id: &str,
    reservations: &RwLock<strategy::BetReservations>,
) -> Result<()> {
    let now = Utc::now();

    // Gate 1 (spec §4.5.1, P9): capital is serialized across the whole
    // deployment, not per market — no new buy while any buy or sell is
    // outstanding anywhere.
    let has_open_buy = !store.open_buys(deployment_id).await?.is_empty();
    let has_open_sell = !store.open_sells(deployment_id).await?.is_empty();
    if strategy::check_capital_serialization(has_open_buy, has_open_sell).is_err() {
        return Ok(());
    }

    let markets = catalog.list_currently_running().await?;

    for market in markets {
        if store.has_bet_on_market(&market.slug).await? || reservations.read().await.is_reserved(&market.slug) {
            continue;
        }

        let minutes = catalog::minutes_until_resolution(&market, now);
        if !strategy::threshold::within_resolution_window(minutes, config.max_minutes_before_resolution) {
            continue;
        }

        let yes_book = match orderbook_view.fetch_book(&market.yes_token_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(slug = %market.slug, error = %e, "yes book fetch failed");
                continue;
            }
        };
        let no_book = match orderbook_view.fetch_book(&market.no_token_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(slug = %market.slug, error = %e, "no book fetch failed");
                continue;
            }
        };

        if yes_book.asks.len() < THIN_BOOK_LEVELS || no_book.asks.len() < THIN_BOOK_LEVELS {
            if let Some(wmp) = yes_book.weighted_mid_price(5).or_else(|| no_book.weighted_mid_price(5)) {
                debug!(slug = %market.slug, weighted_mid = %wmp, "thin top-of-book");
            }
        }

        let Some((side, trigger_ask)) = strategy::threshold::evaluate_trigger(&yes_book, &no_book, config) else {
            continue;
        };

        let principal_now = *principal.read().await;
        if strategy::check_principal(principal_now).is_err() {
            continue;
        }

        let order_price = strategy::threshold::limit_price(config);
        let Some(sizing) = strategy::threshold::size_order(principal_now, config, order_price) else {
            continue;
        };

        // Gate 3: wallet cash balance must cover the order value.
        let wallet_balance = match gateway.get_polymarket_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(slug = %market.slug, error = %e, "balance check failed, skipping trigger");
                continue;
            }
        };
        if strategy::check_balance(wallet_balance, sizing.order_value).is_err() {
            warn!(slug = %market.slug, %wallet_balance, order_value = %sizing.order_value, "insufficient balance, skipping trigger");
            continue;
        }

        // Re-check right before placing to close the check-then-act race
        // (spec §4.5.1 gate 4 is checked twice).
        if store.has_bet_on_market(&market.slug).await? {
            continue;
        }

        // Reservation against double-buy: reserve the slug before placing
        // so a concurrent pass over the same market can't both trigger.
        if !reservations.write().await.reserve(&market.slug) {
            continue;
        }

        let token_id = match side {
            orderbook::Side::Yes => market.yes_token_id.clone(),
            orderbook::Side::No => market.no_token_id.clone(),
        };

        info!(slug = %market.slug, %trigger_ask, %order_price, shares = %sizing.order_size, "threshold trigger fired");

        let trade_id = store
            .create_trade(NewTrade {
                deployment_id: deployment_id.to_string(),
                market_id: market.market_id.clone(),
                slug: market.slug.clone(),
                token_id: token_id.clone(),
                order_side: side_to_store(side),
                buy_price: order_price,
                buy_size_ordered: sizing.order_size,
                principal_before: principal_now,
            })
            .await?;

        match orders::place_buy(gateway, &token_id, order_price, sizing.order_size).await {
            Ok(order_id) => {
                store.record_buy_placement(trade_id, &order_id, OrderStatus::Open).await?;
            }
            Err(e) => {
                warn!(%trade_id, error = %e, "buy placement failed");
                store.mark_buy_status(trade_id, OrderStatus::Failed, Some(&e.to_string())).await?;
                reservations.write().await.release(&market.slug);
            }
        }
    }

    Ok(())
}

/// Limit-Buy strategy loop (spec §4.5.2): opens a dual YES/NO bid once a
/// market has enough runway left. The sibling-cancel-on-fill and missing-
/// sell placement are handled by the shared reconciler below, since both
/// strategies' trades flow through the same `Trade` lifecycle.
fn register_limit_buy_strategy(
    scheduler: &mut Scheduler,
    config: Arc<LimitBuyConfig>,
    deployment_id: String,
    catalog: Arc<MarketCatalog>,
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
    principal: Arc<RwLock<Decimal>>,
) {
    let interval = Duration::from_secs(config.orderbook_poll_interval);
    scheduler.register("limit-buy-strategy", move || {
        let config = config.clone();
        let deployment_id = deployment_id.clone();
        let catalog = catalog.clone();
        let gateway = gateway.clone();
        let store = store.clone();
        let principal = principal.clone();
        scheduler::interval_task(interval, move || {
            let config = config.clone();
            let deployment_id = deployment_id.clone();
            let catalog = catalog.clone();
            let gateway = gateway.clone();
            let store = store.clone();
            let principal = principal.clone();
            async move { limit_buy_tick(&catalog, &gateway, &store, &principal, &config, &deployment_id).await }
        })
    });
}

async fn limit_buy_tick(
    catalog: &MarketCatalog,
    gateway: &PolymarketGateway,
    store: &TradeStore,
    principal: &RwLock<Decimal>,
    config: &LimitBuyConfig,
    deployment_id: &str,
) -> Result<()> {
    let now = Utc::now();
    let markets = catalog.list_currently_running().await?;

    for market in markets {
        if store.has_bet_on_market(&market.slug).await? {
            continue;
        }

        let minutes = catalog::minutes_until_resolution(&market, now);
        if !strategy::limit_buy::eligible_for_open(minutes, config) {
            continue;
        }

        let principal_now = *principal.read().await;
        if strategy::check_principal(principal_now).is_err() {
            continue;
        }

        if store.has_bet_on_market(&market.slug).await? {
            continue;
        }

        let open = strategy::limit_buy::dual_open(config);
        info!(slug = %market.slug, yes_price = %open.yes_price, no_price = %open.no_price, "limit-buy dual open");

        let yes_trade_id = store
            .create_trade(NewTrade {
                deployment_id: deployment_id.to_string(),
                market_id: market.market_id.clone(),
                slug: market.slug.clone(),
                token_id: market.yes_token_id.clone(),
                order_side: store::OrderSide::Yes,
                buy_price: open.yes_price,
                buy_size_ordered: open.size,
                principal_before: principal_now,
            })
            .await?;
        let no_trade_id = store
            .create_trade(NewTrade {
                deployment_id: deployment_id.to_string(),
                market_id: market.market_id.clone(),
                slug: market.slug.clone(),
                token_id: market.no_token_id.clone(),
                order_side: store::OrderSide::No,
                buy_price: open.no_price,
                buy_size_ordered: open.size,
                principal_before: principal_now,
            })
            .await?;

        match orders::place_buy(gateway, &market.yes_token_id, open.yes_price, open.size).await {
            Ok(order_id) => store.record_buy_placement(yes_trade_id, &order_id, OrderStatus::Open).await?,
            Err(e) => store.mark_buy_status(yes_trade_id, OrderStatus::Failed, Some(&e.to_string())).await?,
        }
        match orders::place_buy(gateway, &market.no_token_id, open.no_price, open.size).await {
            Ok(order_id) => store.record_buy_placement(no_trade_id, &order_id, OrderStatus::Open).await?,
            Err(e) => store.mark_buy_status(no_trade_id, OrderStatus::Failed, Some(&e.to_string())).await?,
        }
    }

    Ok(())
}

/// Stop-loss monitor (spec §4.5.1): for every threshold trade with a
/// standing sell, watches the held token's best bid against
/// `threshold_sell` and converts the profit-take sell into a stop-loss
/// sell once it's breached, re-pricing down every
/// `orders::STOPLOSS_REPRICE_AFTER` up to `orders::MAX_STOPLOSS_REPRICES`
/// times. Registered only when `strategy::threshold::stoploss_enabled`.
fn register_stoploss_monitor(
    scheduler: &mut Scheduler,
    deployment_id: String,
    config: Arc<ThresholdConfig>,
    orderbook_view: Arc<OrderbookView>,
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
) {
    if !strategy::threshold::stoploss_enabled(&config) {
        info!("stop-loss disabled (threshold_sell = 0), monitor not started");
        return;
    }

    scheduler.register("stoploss-monitor", move || {
        let deployment_id = deployment_id.clone();
        let config = config.clone();
        let orderbook_view = orderbook_view.clone();
        let gateway = gateway.clone();
        let store = store.clone();
        let reprices: Arc<RwLock<HashMap<Uuid, u32>>> = Arc::new(RwLock::new(HashMap::new()));
        scheduler::interval_task(orders::STOPLOSS_REPRICE_AFTER, move || {
            let deployment_id = deployment_id.clone();
            let config = config.clone();
            let orderbook_view = orderbook_view.clone();
            let gateway = gateway.clone();
            let store = store.clone();
            let reprices = reprices.clone();
            async move { stoploss_tick(&orderbook_view, &gateway, &store, &config, &deployment_id, &reprices).await }
        })
    });
}

async fn stoploss_tick(
    orderbook_view: &OrderbookView,
    gateway: &PolymarketGateway,
    store: &TradeStore,
    config: &ThresholdConfig,
    deployment_id: &str,
    reprices: &RwLock<HashMap<Uuid, u32>>,
) -> Result<()> {
    let now = Utc::now();
    for trade in store.recently_filled_sells(deployment_id).await? {
        let (Some(sell_order_id), Some(filled_at)) = (trade.sell_order_id.clone(), trade.sell_order_filled_at) else {
            continue;
        };
        if !strategy::threshold::needs_fill_revalidation(filled_at, false, now) {
            continue;
        }
        match gateway.get_order(&sell_order_id).await {
            Ok(info) if !info.is_filled() && !info.is_cancelled() => {
                warn!(trade_id = %trade.trade_id, "recently-filled sell still live on exchange, reverting to open");
                store.mark_sell_status(trade.trade_id, OrderStatus::Open).await?;
            }
            Ok(_) => {}
            Err(e) => warn!(trade_id = %trade.trade_id, error = %e, "fill revalidation poll failed"),
        }
    }

    for trade in store.open_sells(deployment_id).await? {
        let (Some(sell_price), Some(sell_order_id), Some(placed_at), Some(sell_size)) =
            (trade.sell_price, trade.sell_order_id.clone(), trade.sell_order_placed_at, trade.sell_size)
        else {
            continue;
        };

        let book = match orderbook_view.fetch_book(&trade.token_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(trade_id = %trade.trade_id, error = %e, "stop-loss book fetch failed");
                continue;
            }
        };
        let best_bid = book.best_bid();

        if sell_price == strategy::threshold::profit_take_price() {
            if !strategy::threshold::stoploss_triggered(best_bid, config.threshold_sell) {
                continue;
            }
            let new_price = strategy::threshold::stoploss_sell_price(config.threshold_sell, config.margin_sell);
            info!(trade_id = %trade.trade_id, %new_price, "stop-loss triggered, converting profit-take sell");
            let _ = gateway.cancel_order(&sell_order_id).await;
            match orders::place_sell_verified(gateway, &trade.token_id, new_price, sell_size).await {
                Ok(order_id) => {
                    store.update_sell_order(trade.trade_id, &order_id, new_price, sell_size, OrderStatus::Open).await?;
                    reprices.write().await.insert(trade.trade_id, 0);
                }
                Err(e) => warn!(trade_id = %trade.trade_id, error = %e, "stop-loss sell placement failed"),
            }
        } else {
            if !orders::stoploss_reprice_due(placed_at, Utc::now()) {
                continue;
            }
            let count = *reprices.read().await.get(&trade.trade_id).unwrap_or(&0);
            if !orders::can_reprice(count) {
                continue;
            }
            let new_price = orders::stoploss_reprice_price(sell_price, config.margin_sell);
            info!(trade_id = %trade.trade_id, %new_price, reprice_number = count + 1, "re-pricing stop-loss sell");
            let _ = gateway.cancel_order(&sell_order_id).await;
            match orders::place_sell_verified(gateway, &trade.token_id, new_price, sell_size).await {
                Ok(order_id) => {
                    store.update_sell_order(trade.trade_id, &order_id, new_price, sell_size, OrderStatus::Open).await?;
                    reprices.write().await.insert(trade.trade_id, count + 1);
                }
                Err(e) => warn!(trade_id = %trade.trade_id, error = %e, "stop-loss re-price failed"),
            }
        }
    }

    Ok(())
}

/// Limit-Buy monitor (spec §4.5.2): cancels both standing buys once a
/// market runs out of runway with neither side filled, and converts a
/// filled side's profit-take sell into an aggressive limit-sell once
/// resolution is close.
fn register_limit_buy_monitor(
    scheduler: &mut Scheduler,
    deployment_id: String,
    config: Arc<LimitBuyConfig>,
    catalog: Arc<MarketCatalog>,
    orderbook_view: Arc<OrderbookView>,
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
) {
    let interval = Duration::from_secs(config.orderbook_poll_interval);
    scheduler.register("limit-buy-monitor", move || {
        let deployment_id = deployment_id.clone();
        let config = config.clone();
        let catalog = catalog.clone();
        let orderbook_view = orderbook_view.clone();
        let gateway = gateway.clone();
        let store = store.clone();
        scheduler::interval_task(interval, move || {
            let deployment_id = deployment_id.clone();
            let config = config.clone();
            let catalog = catalog.clone();
            let orderbook_view = orderbook_view.clone();
            let gateway = gateway.clone();
            let store = store.clone();
            async move { limit_buy_monitor_tick(&catalog, &orderbook_view, &gateway, &store, &config, &deployment_id).await }
        })
    });
}

async fn limit_buy_monitor_tick(
    catalog: &MarketCatalog,
    orderbook_view: &OrderbookView,
    gateway: &PolymarketGateway,
    store: &TradeStore,
    config: &LimitBuyConfig,
    deployment_id: &str,
) -> Result<()> {
    let now = Utc::now();

    let mut seen_slugs = std::collections::HashSet::new();
    for trade in store.open_buys(deployment_id).await? {
        if !seen_slugs.insert(trade.slug.clone()) {
            continue;
        }

        let siblings = store.trades_by_deployment_and_market(deployment_id, &trade.slug).await?;
        let yes_filled = siblings
            .iter()
            .any(|t| t.order_side == store::OrderSide::Yes && matches!(t.buy_status, OrderStatus::Filled | OrderStatus::Partial));
        let no_filled = siblings
            .iter()
            .any(|t| t.order_side == store::OrderSide::No && matches!(t.buy_status, OrderStatus::Filled | OrderStatus::Partial));

        let minutes = match catalog.by_slug(&trade.slug).await {
            Ok(Some(market)) => catalog::minutes_until_resolution(&market, now),
            Ok(None) => None,
            Err(e) => {
                warn!(slug = %trade.slug, error = %e, "catalog lookup failed during stalled-cancel check");
                None
            }
        };

        if strategy::limit_buy::should_cancel_stalled(minutes, config, yes_filled, no_filled) {
            for sibling in &siblings {
                if !matches!(sibling.buy_status, OrderStatus::Open | OrderStatus::Partial) {
                    continue;
                }
                if let Some(order_id) = &sibling.buy_order_id {
                    let _ = gateway.cancel_order(order_id).await;
                }
                store
                    .mark_buy_status(sibling.trade_id, OrderStatus::Cancelled, Some("cancel-if-stalled: no runway left"))
                    .await?;
            }
            info!(slug = %trade.slug, "limit-buy cancel-if-stalled fired");
        }
    }

    for trade in store.open_sells(deployment_id).await? {
        let Some(sell_price) = trade.sell_price else { continue };
        if sell_price != config.sell_price {
            continue;
        }
        let Some(sell_order_id) = trade.sell_order_id.clone() else { continue };
        let Some(sell_size) = trade.sell_size else { continue };

        let minutes = match catalog.by_slug(&trade.slug).await {
            Ok(Some(market)) => catalog::minutes_until_resolution(&market, now),
            _ => None,
        };
        if !strategy::limit_buy::needs_late_exit(minutes, config) {
            continue;
        }

        let book = match orderbook_view.fetch_book(&trade.token_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(trade_id = %trade.trade_id, error = %e, "late-exit book fetch failed");
                continue;
            }
        };
        let Some(best_bid) = book.best_bid() else { continue };
        let (new_price, forced) = strategy::limit_buy::late_exit_sell_price(best_bid, config);
        if forced {
            warn!(trade_id = %trade.trade_id, "late-exit price forced to the configured floor");
        }

        let _ = gateway.cancel_order(&sell_order_id).await;
        match orders::place_sell_verified(gateway, &trade.token_id, new_price, sell_size).await {
            Ok(order_id) => {
                store.update_sell_order(trade.trade_id, &order_id, new_price, sell_size, OrderStatus::Open).await?;
                info!(trade_id = %trade.trade_id, %new_price, "converted to late-exit sell");
            }
            Err(e) => warn!(trade_id = %trade.trade_id, error = %e, "late-exit sell placement failed"),
        }
    }

    Ok(())
}

/// Shared reconciler (spec §4.4): folds `get_order` status polls into
/// buy/sell fill updates, cancels stale zero-fill buys, cancels a
/// dual-open sibling once the other side fills, and re-invokes sell
/// placement for any buy that filled without a recorded sell.
fn register_order_reconciler(
    scheduler: &mut Scheduler,
    deployment_id: String,
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
    exit_price: Decimal,
) {
    scheduler.register("order-reconciler", move || {
        let deployment_id = deployment_id.clone();
        let gateway = gateway.clone();
        let store = store.clone();
        // Built once per task start/restart, then shared across every
        // tick via the cloned `Arc` below — a fresh map on restart just
        // means one extra stale-open check cycle, not a bug.
        let stale_open_checks: Arc<RwLock<HashMap<Uuid, u32>>> = Arc::new(RwLock::new(HashMap::new()));
        scheduler::interval_task(Duration::from_secs(2), move || {
            let deployment_id = deployment_id.clone();
            let gateway = gateway.clone();
            let store = store.clone();
            let stale_open_checks = stale_open_checks.clone();
            async move {
                order_reconciler_tick(&gateway, &store, &deployment_id, &stale_open_checks, exit_price).await
            }
        })
    });
}

async fn order_reconciler_tick(
    gateway: &Arc<PolymarketGateway>,
    store: &Arc<TradeStore>,
    deployment_id: &str,
    stale_open_checks: &RwLock<HashMap<Uuid, u32>>,
    exit_price: Decimal,
) -> Result<()> {
    for trade in store.open_buys(deployment_id).await? {
        let Some(order_id) = trade.buy_order_id.clone() else { continue };
        match gateway.get_order(&order_id).await {
            Ok(info) if info.is_filled() => {
                let dollars_spent = info.filled_amount * trade.buy_price;
                let fee = fees::polymarket_fee(trade.buy_price, dollars_spent);
                store
                    .update_buy_fill(trade.trade_id, info.filled_amount, trade.buy_price, dollars_spent, fee, OrderStatus::Filled, &order_id)
                    .await?;
                orders::log_fill_detected(&order_id, info.filled_amount, trade.buy_price);
                stale_open_checks.write().await.remove(&trade.trade_id);
                cancel_filled_sibling(gateway, store, deployment_id, &trade).await;
            }
            Ok(info) if info.is_partial_fill() => {
                let dollars_spent = info.filled_amount * trade.buy_price;
                let fee = fees::polymarket_fee(trade.buy_price, dollars_spent);
                store
                    .update_buy_fill(trade.trade_id, info.filled_amount, trade.buy_price, dollars_spent, fee, OrderStatus::Partial, &order_id)
                    .await?;
            }
            Ok(info) if info.is_cancelled() => {
                store.mark_buy_status(trade.trade_id, OrderStatus::Cancelled, None).await?;
                stale_open_checks.write().await.remove(&trade.trade_id);
            }
            Ok(_) => {
                let mut checks = stale_open_checks.write().await;
                let count = checks.entry(trade.trade_id).or_insert(0);
                *count += 1;
                if orders::should_cancel_stale(*count, Decimal::ZERO) {
                    let _ = gateway.cancel_order(&order_id).await;
                    store
                        .mark_buy_status(trade.trade_id, OrderStatus::Cancelled, Some("stale open order cancelled"))
                        .await?;
                    checks.remove(&trade.trade_id);
                }
            }
            Err(e) => warn!(trade_id = %trade.trade_id, error = %e, "buy status poll failed"),
        }
    }

    for trade in store.open_sells(deployment_id).await? {
        let Some(order_id) = trade.sell_order_id.clone() else { continue };
        let sell_price = trade.sell_price.unwrap_or(Decimal::ZERO);
        match gateway.get_order(&order_id).await {
            Ok(info) if info.is_filled() => {
                let dollars_received = info.filled_amount * sell_price;
                let fee = fees::polymarket_fee(sell_price, dollars_received);
                store.update_sell_fill(trade.trade_id, OrderStatus::Filled, info.filled_amount, dollars_received, fee).await?;
            }
            Ok(info) if info.is_partial_fill() => {
                let dollars_received = info.filled_amount * sell_price;
                let fee = fees::polymarket_fee(sell_price, dollars_received);
                store.update_sell_fill(trade.trade_id, OrderStatus::Partial, info.filled_amount, dollars_received, fee).await?;
            }
            Ok(info) if info.is_cancelled() => {
                store.mark_sell_status(trade.trade_id, OrderStatus::Cancelled).await?;
            }
            Ok(_) => {}
            Err(e) => warn!(trade_id = %trade.trade_id, error = %e, "sell status poll failed"),
        }
    }

    for trade in store.filled_without_sell(deployment_id).await? {
        let Some(filled_shares) = trade.buy_filled_shares else { continue };
        let balance = gateway
            .get_conditional_token_balance(&trade.token_id)
            .await
            .unwrap_or(filled_shares);
        let size = orders::floor_sell_size(balance, filled_shares);

        info!(trade_id = %trade.trade_id, %exit_price, %size, "placing missing sell order");
        spawn_missing_sell(gateway.clone(), store.clone(), trade.trade_id, trade.token_id.clone(), exit_price, size);
    }

    Ok(())
}

/// Once the buy confirming a dual-open fill is recorded, cancel the
/// still-open sibling side on the same market (spec §4.5.2).
async fn cancel_filled_sibling(gateway: &Arc<PolymarketGateway>, store: &Arc<TradeStore>, deployment_id: &str, filled: &store::Trade) {
    let siblings = match store.trades_by_deployment_and_market(deployment_id, &filled.slug).await {
        Ok(t) => t,
        Err(e) => {
            warn!(slug = %filled.slug, error = %e, "failed to look up dual-open sibling");
            return;
        }
    };

    for sibling in siblings {
        if sibling.trade_id == filled.trade_id || sibling.order_side == filled.order_side {
            continue;
        }
        if !matches!(sibling.buy_status, OrderStatus::Open | OrderStatus::Partial) {
            continue;
        }
        if let Some(order_id) = &sibling.buy_order_id {
            let _ = gateway.cancel_order(order_id).await;
        }
        if let Err(e) = store.mark_buy_status(sibling.trade_id, OrderStatus::Cancelled, Some("sibling side filled")).await {
            warn!(trade_id = %sibling.trade_id, error = %e, "failed to cancel dual-open sibling");
        }
    }
}

/// Places the missing SELL via the full retry ladder in the background,
/// since it can sleep for minutes; the reconciler tick must not block on it.
fn spawn_missing_sell(
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
    trade_id: Uuid,
    token_id: String,
    price: Decimal,
    size: Decimal,
) {
    tokio::spawn(async move {
        match orders::place_sell_with_retries(gateway.as_ref(), &token_id, price, size).await {
            Ok(order_id) => {
                if let Err(e) = store.update_sell_order(trade_id, &order_id, price, size, OrderStatus::Open).await {
                    warn!(%trade_id, error = %e, "failed to record sell order");
                }
            }
            Err(e) => {
                warn!(%trade_id, error = %e, "sell placement exhausted retries");
                let _ = store
                    .mark_buy_status(trade_id, OrderStatus::Filled, Some(&format!("sell placement failed: {e}")))
                    .await;
            }
        }
    });
}

/// Resolution poller (spec §4.6): once Gamma reports a winner for a
/// trade's market, computes PnL and updates the bankroll. Markets Gamma
/// hasn't flagged resolved yet are force-expired as a loss once they're
/// well past their end time, so a stuck trade can't block the ledger
/// forever (spec's force-expire edge case).
fn register_resolution_poller(
    scheduler: &mut Scheduler,
    deployment_id: String,
    catalog: Arc<MarketCatalog>,
    gamma: Arc<GammaClient>,
    gateway: Arc<PolymarketGateway>,
    store: Arc<TradeStore>,
    principal: Arc<RwLock<Decimal>>,
) {
    scheduler.register("resolution-poller", move || {
        let deployment_id = deployment_id.clone();
        let catalog = catalog.clone();
        let gamma = gamma.clone();
        let gateway = gateway.clone();
        let store = store.clone();
        let principal = principal.clone();
        scheduler::interval_task(RESOLUTION_POLL_INTERVAL, move || {
            let deployment_id = deployment_id.clone();
            let catalog = catalog.clone();
            let gamma = gamma.clone();
            let gateway = gateway.clone();
            let store = store.clone();
            let principal = principal.clone();
            async move { resolution_poller_tick(&catalog, &gamma, &gateway, &store, &principal, &deployment_id).await }
        })
    });
}

/// Final sell-order reconciliation (spec §4.6, critical): once a market
/// resolves, the routine reconciler's last-seen `sell_status` may already
/// be stale, so re-poll the exchange directly before trusting it for PnL.
/// Mutates `trade` in place and persists the reconciled status so the
/// caller's `resolve_trade_pnl` sees accurate sell fields.
async fn reconcile_final_sell(gateway: &PolymarketGateway, store: &TradeStore, trade: &mut store::Trade) {
    if !matches!(trade.sell_status, Some(OrderStatus::Open) | Some(OrderStatus::Partial)) {
        return;
    }
    let Some(sell_order_id) = trade.sell_order_id.clone() else { return };

    tokio::time::sleep(resolution::FINAL_RECONCILE_WAIT).await;

    let mut outcome = resolution::SellOutcome::UnfilledOrCancelled;
    let mut last_info: Option<gateway::OrderInfo> = None;

    for attempt in 0..resolution::FINAL_RECONCILE_MAX_RETRIES {
        match gateway.get_order(&sell_order_id).await {
            Ok(info) => {
                let still_live = !info.is_filled() && !info.is_cancelled();
                outcome = resolution::classify_sell_outcome(&info.status, info.filled_amount, info.total_amount, still_live);
                let done = !still_live || outcome != resolution::SellOutcome::UnfilledOrCancelled;
                last_info = Some(info);
                if done {
                    break;
                }
            }
            Err(e) => warn!(trade_id = %trade.trade_id, attempt, error = %e, "final sell reconciliation poll failed"),
        }
        if attempt + 1 < resolution::FINAL_RECONCILE_MAX_RETRIES {
            tokio::time::sleep(resolution::FINAL_RECONCILE_RETRY_INTERVAL).await;
        }
    }

    match outcome {
        resolution::SellOutcome::Filled | resolution::SellOutcome::Partial => {
            let Some(info) = last_info else { return };
            let status = if outcome == resolution::SellOutcome::Filled { OrderStatus::Filled } else { OrderStatus::Partial };
            let sell_price = trade.sell_price.unwrap_or(Decimal::ZERO);
            let dollars_received = info.filled_amount * sell_price;
            let fee = fees::polymarket_fee(sell_price, dollars_received);
            if let Err(e) = store.update_sell_fill(trade.trade_id, status, info.filled_amount, dollars_received, fee).await {
                warn!(trade_id = %trade.trade_id, error = %e, "failed to persist final sell reconciliation");
            }
            trade.sell_status = Some(status);
            trade.sell_shares_filled = Some(info.filled_amount);
            trade.sell_dollars_received = Some(dollars_received);
            trade.sell_fee = Some(fee);
        }
        resolution::SellOutcome::UnfilledOrCancelled => {
            // Still live (or unreachable) after exhausting retries: verify
            // ownership via market/asset_id before cancelling, then treat
            // it as cancelled for PnL purposes either way.
            if let Some(info) = &last_info {
                if info.market == trade.market_id && info.asset_id == trade.token_id {
                    let _ = gateway.cancel_order(&sell_order_id).await;
                }
            } else {
                let _ = gateway.cancel_order(&sell_order_id).await;
            }
            if let Err(e) = store.mark_sell_status(trade.trade_id, OrderStatus::Cancelled).await {
                warn!(trade_id = %trade.trade_id, error = %e, "failed to persist final sell cancellation");
            }
            trade.sell_status = Some(OrderStatus::Cancelled);
        }
    }
}

fn gamma_winner_to_store_side(winner: &str) -> Option<store::OrderSide> {
    match winner {
        "YES" => Some(store::OrderSide::Yes),
        "NO" => Some(store::OrderSide::No),
        _ => None,
    }
}

async fn resolution_poller_tick(
    catalog: &MarketCatalog,
    gamma: &GammaClient,
    gateway: &PolymarketGateway,
    store: &TradeStore,
    principal: &RwLock<Decimal>,
    deployment_id: &str,
) -> Result<()> {
    let unresolved = store.unresolved(deployment_id).await?;
    let now = Utc::now();

    for mut trade in unresolved {
        let winning_side = match gamma.fetch_market_resolution(&trade.token_id).await {
            Ok(Some(winner)) => match gamma_winner_to_store_side(&winner) {
                Some(side) => Some(side),
                None => {
                    warn!(slug = %trade.slug, %winner, "unrecognized resolution winner");
                    None
                }
            },
            Ok(None) => match catalog.by_slug(&trade.slug).await {
                Ok(Some(market)) if resolution::should_force_expire(market.end_time, now, resolution::FORCE_EXPIRE_GRACE) => {
                    warn!(slug = %trade.slug, "market unresolved well past end time, force-expiring as a loss");
                    Some(opposite_side(trade.order_side))
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(slug = %trade.slug, error = %e, "catalog lookup failed during resolution poll");
                    None
                }
            },
            Err(e) => {
                warn!(slug = %trade.slug, error = %e, "gamma resolution lookup failed");
                None
            }
        };

        let Some(winning_side) = winning_side else { continue };

        reconcile_final_sell(gateway, store, &mut trade).await;

        let pnl = resolution::resolve_trade_pnl(&trade, winning_side);
        let principal_after = resolution::next_principal(trade.principal_before, pnl.net_payout);
        let outcome_price = if winning_side == trade.order_side { Decimal::ONE } else { Decimal::ZERO };

        store
            .update_resolution(trade.trade_id, outcome_price, pnl.payout, pnl.net_payout, pnl.roi, pnl.bet_won, principal_after, winning_side)
            .await?;

        let mut current = principal.write().await;
        *current = resolution::reconcile_in_memory_principal(*current + pnl.net_payout, principal_after);

        info!(slug = %trade.slug, bet_won = pnl.bet_won, net_payout = %pnl.net_payout, principal = %principal_after, "trade resolved");
    }

    Ok(())
}

fn opposite_side(side: store::OrderSide) -> store::OrderSide {
    match side {
        store::OrderSide::Yes => store::OrderSide::No,
        store::OrderSide::No => store::OrderSide::Yes,
    }
}
