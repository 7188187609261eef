//! Strategy configuration loaded from the `--config <path>` JSON file.
//!
//! This is distinct from `common::config::Config`, which carries
//! connection strings (database, Gamma, CLOB WS) from the environment.
//! This file carries the trading parameters: thresholds, sizing, and
//! per-strategy knobs, validated the way
//! `original_source/agents/trading/config_loader.py`'s `TradingConfig`
//! validates them.

use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketSchedule {
    #[serde(rename = "15m")]
    FifteenMinute,
    #[serde(rename = "1h")]
    OneHour,
}

/// Strategy-specific trading configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    Threshold(ThresholdConfig),
    LimitBuy(LimitBuyConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    pub threshold: Decimal,
    pub upper_threshold: Decimal,
    pub margin: Decimal,
    pub threshold_sell: Decimal,
    pub margin_sell: Decimal,
    pub kelly_fraction: Decimal,
    pub kelly_scale_factor: Decimal,
    pub market_type: MarketSchedule,
    pub initial_principal: Decimal,
    pub dollar_bet_limit: Decimal,

    pub max_minutes_before_resolution: Option<i64>,
    #[serde(default = "default_orderbook_poll_interval")]
    pub orderbook_poll_interval: u64,
    #[serde(default = "default_order_status_check_interval")]
    pub order_status_check_interval: u64,
    #[serde(default)]
    pub use_websocket_order_status: bool,
    #[serde(default)]
    pub use_websocket_orderbook: bool,
    #[serde(default = "default_websocket_reconnect_delay")]
    pub websocket_reconnect_delay: u64,
    #[serde(default = "default_websocket_health_check_timeout")]
    pub websocket_health_check_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitBuyConfig {
    pub yes_buy_price: Decimal,
    pub no_buy_price: Decimal,
    pub sell_price: Decimal,
    pub order_size: Decimal,
    pub min_minutes_before_resolution: i64,
    pub cancel_threshold_minutes: i64,
    pub kelly_fraction: Decimal,
    pub kelly_scale_factor: Decimal,
    pub market_type: MarketSchedule,
    pub initial_principal: Decimal,
    pub dollar_bet_limit: Decimal,

    #[serde(default = "default_best_bid_margin")]
    pub best_bid_margin: Decimal,
    #[serde(default = "default_sell_price_lower_bound")]
    pub sell_price_lower_bound: Decimal,
    #[serde(default = "default_orderbook_poll_interval")]
    pub orderbook_poll_interval: u64,
    #[serde(default = "default_order_status_check_interval")]
    pub order_status_check_interval: u64,
}

fn default_orderbook_poll_interval() -> u64 {
    5
}
fn default_order_status_check_interval() -> u64 {
    10
}
fn default_websocket_reconnect_delay() -> u64 {
    1
}
fn default_websocket_health_check_timeout() -> u64 {
    14
}
fn default_best_bid_margin() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.02)
}
fn default_sell_price_lower_bound() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.01)
}

fn in_price_range(d: Decimal) -> bool {
    use rust_decimal_macros::dec;
    d >= dec!(0.01) && d <= dec!(0.99)
}

impl StrategyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: StrategyConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        use rust_decimal_macros::dec;

        match self {
            StrategyConfig::Threshold(c) => {
                if !(c.threshold > dec!(0.0) && c.threshold <= dec!(1.0)) {
                    return Err(ConfigError::Validation("threshold must be in (0,1]".into()));
                }
                if !(c.upper_threshold > dec!(0.0) && c.upper_threshold <= dec!(1.0)) {
                    return Err(ConfigError::Validation(
                        "upper_threshold must be in (0,1]".into(),
                    ));
                }
                if c.upper_threshold <= c.threshold {
                    return Err(ConfigError::Validation(
                        "upper_threshold must exceed threshold".into(),
                    ));
                }
                if c.margin < dec!(0.0) {
                    return Err(ConfigError::Validation("margin must be >= 0".into()));
                }
                if !(c.threshold_sell >= dec!(0.0) && c.threshold_sell <= dec!(1.0)) {
                    return Err(ConfigError::Validation(
                        "threshold_sell must be in [0,1]".into(),
                    ));
                }
                if c.margin_sell < dec!(0.0) {
                    return Err(ConfigError::Validation("margin_sell must be >= 0".into()));
                }
                if !in_price_range(c.threshold) {
                    return Err(ConfigError::Validation("threshold must be in (0.01,0.99)".into()));
                }
                if !in_price_range(c.upper_threshold) {
                    return Err(ConfigError::Validation(
                        "upper_threshold must be in (0.01,0.99)".into(),
                    ));
                }
                if c.threshold_sell != dec!(0.0) && !in_price_range(c.threshold_sell) {
                    return Err(ConfigError::Validation(
                        "threshold_sell must be 0 (stop-loss disabled) or in (0.01,0.99)".into(),
                    ));
                }
                let resolved_buy_price = (c.threshold + c.margin).min(c.upper_threshold).min(dec!(0.99));
                if !in_price_range(resolved_buy_price) {
                    return Err(ConfigError::Validation(
                        "threshold + margin must resolve to a price in (0.01,0.99)".into(),
                    ));
                }
                if c.threshold_sell != dec!(0.0) {
                    let resolved_stoploss_price = (c.threshold_sell - c.margin_sell).max(dec!(0.01));
                    if !in_price_range(resolved_stoploss_price) {
                        return Err(ConfigError::Validation(
                            "threshold_sell - margin_sell must resolve to a price in (0.01,0.99)".into(),
                        ));
                    }
                }
                if !(c.kelly_fraction >= dec!(0.0) && c.kelly_fraction <= dec!(1.0)) {
                    return Err(ConfigError::Validation(
                        "kelly_fraction must be in [0,1]".into(),
                    ));
                }
                if c.kelly_scale_factor <= dec!(0.0) {
                    return Err(ConfigError::Validation(
                        "kelly_scale_factor must be > 0".into(),
                    ));
                }
                if c.initial_principal <= dec!(0.0) {
                    return Err(ConfigError::Validation(
                        "initial_principal must be > 0".into(),
                    ));
                }
                if c.dollar_bet_limit <= dec!(0.0) {
                    return Err(ConfigError::Validation(
                        "dollar_bet_limit must be > 0".into(),
                    ));
                }
            }
            StrategyConfig::LimitBuy(c) => {
                for (name, price) in [
                    ("yes_buy_price", c.yes_buy_price),
                    ("no_buy_price", c.no_buy_price),
                    ("sell_price", c.sell_price),
                ] {
                    if !in_price_range(price) {
                        return Err(ConfigError::Validation(format!(
                            "{name} must be in (0.01,0.99)"
                        )));
                    }
                }
                if c.order_size <= dec!(0.0) {
                    return Err(ConfigError::Validation("order_size must be > 0".into()));
                }
                if c.min_minutes_before_resolution <= 0 {
                    return Err(ConfigError::Validation(
                        "min_minutes_before_resolution must be > 0".into(),
                    ));
                }
                if c.cancel_threshold_minutes <= 0 {
                    return Err(ConfigError::Validation(
                        "cancel_threshold_minutes must be > 0".into(),
                    ));
                }
                if !(c.kelly_fraction >= dec!(0.0) && c.kelly_fraction <= dec!(1.0)) {
                    return Err(ConfigError::Validation(
                        "kelly_fraction must be in [0,1]".into(),
                    ));
                }
                if c.kelly_scale_factor <= dec!(0.0) {
                    return Err(ConfigError::Validation(
                        "kelly_scale_factor must be > 0".into(),
                    ));
                }
                if c.initial_principal <= dec!(0.0) {
                    return Err(ConfigError::Validation(
                        "initial_principal must be > 0".into(),
                    ));
                }
                if c.dollar_bet_limit <= dec!(0.0) {
                    return Err(ConfigError::Validation(
                        "dollar_bet_limit must be > 0".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn market_schedule(&self) -> MarketSchedule {
        match self {
            StrategyConfig::Threshold(c) => c.market_type,
            StrategyConfig::LimitBuy(c) => c.market_type,
        }
    }

    pub fn initial_principal(&self) -> Decimal {
        match self {
            StrategyConfig::Threshold(c) => c.initial_principal,
            StrategyConfig::LimitBuy(c) => c.initial_principal,
        }
    }

    pub fn orderbook_poll_interval(&self) -> u64 {
        match self {
            StrategyConfig::Threshold(c) => c.orderbook_poll_interval,
            StrategyConfig::LimitBuy(c) => c.orderbook_poll_interval,
        }
    }

    pub fn order_status_check_interval(&self) -> u64 {
        match self {
            StrategyConfig::Threshold(c) => c.order_status_check_interval,
            StrategyConfig::LimitBuy(c) => c.order_status_check_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_threshold() -> ThresholdConfig {
        ThresholdConfig {
            threshold: dec!(0.50),
            upper_threshold: dec!(0.60),
            margin: dec!(0.02),
            threshold_sell: dec!(0.40),
            margin_sell: dec!(0.02),
            kelly_fraction: dec!(0.25),
            kelly_scale_factor: dec!(1.0),
            market_type: MarketSchedule::FifteenMinute,
            initial_principal: dec!(100),
            dollar_bet_limit: dec!(50),
            max_minutes_before_resolution: None,
            orderbook_poll_interval: 5,
            order_status_check_interval: 10,
            use_websocket_order_status: false,
            use_websocket_orderbook: false,
            websocket_reconnect_delay: 1,
            websocket_health_check_timeout: 14,
        }
    }

    #[test]
    fn valid_threshold_config_passes() {
        let cfg = StrategyConfig::Threshold(sample_threshold());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn upper_threshold_must_exceed_threshold() {
        let mut t = sample_threshold();
        t.upper_threshold = t.threshold;
        let cfg = StrategyConfig::Threshold(t);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn kelly_fraction_out_of_range_rejected() {
        let mut t = sample_threshold();
        t.kelly_fraction = dec!(1.5);
        let cfg = StrategyConfig::Threshold(t);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_tagged_json() {
        let json = r#"{
            "strategy": "threshold",
            "threshold": 0.5,
            "upper_threshold": 0.6,
            "margin": 0.02,
            "threshold_sell": 0.4,
            "margin_sell": 0.02,
            "kelly_fraction": 0.25,
            "kelly_scale_factor": 1.0,
            "market_type": "15m",
            "initial_principal": 100,
            "dollar_bet_limit": 50
        }"#;
        let cfg: StrategyConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_ok());
    }
}
