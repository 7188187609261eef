//! Shared library for the Polymarket trading engine.
//!
//! Provides:
//! - Configuration loading from `.env`
//! - Database connection pooling
//! - Gamma-style market catalog client
//! - CLOB order-book WebSocket client
//! - Polymarket CLOB authentication and order execution

pub mod clob;
pub mod config;
pub mod db;
pub mod exchange;
pub mod gamma;
pub mod models;

pub use clob::{BookMessage, ClobClient, ClobMessage, PriceChange, PriceChangeMessage, PriceLevel};
pub use config::Config;
pub use db::Database;
pub use exchange::{CachedAuth, RawFill, RawOrderStatus, Side};
pub use gamma::{GammaClient, GammaMarket, MarketType, ParsedMarket};
pub use models::Market;
