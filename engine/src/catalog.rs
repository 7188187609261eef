//! Market Catalog (C4): enumerates currently-running markets for a
//! given schedule and extracts the two outcome-token identifiers.
//!
//! Backed by `common::gamma::GammaClient`. Cached for 30s per slug
//! (spec §4.3) so the book-monitor and strategy loops don't hammer the
//! catalog endpoint every tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::gamma::{GammaClient, GammaError};
use tokio::sync::RwLock;

use crate::config::MarketSchedule;

const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Market {
    pub market_id: String,
    pub slug: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
}

impl Market {
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        let started = self.start_time.map(|s| s <= now).unwrap_or(true);
        started && now < self.end_time
    }
}

struct CachedList {
    markets: Vec<Market>,
    fetched_at: DateTime<Utc>,
}

pub struct MarketCatalog {
    gamma: Arc<GammaClient>,
    schedule: MarketSchedule,
    cache: RwLock<Option<CachedList>>,
}

impl MarketCatalog {
    pub fn new(gamma: Arc<GammaClient>, schedule: MarketSchedule) -> Self {
        Self {
            gamma,
            schedule,
            cache: RwLock::new(None),
        }
    }

    fn schedule_tag(&self) -> &'static str {
        match self.schedule {
            MarketSchedule::FifteenMinute => "15m",
            MarketSchedule::OneHour => "1h",
        }
    }

    pub async fn list_currently_running(&self) -> Result<Vec<Market>, GammaError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                let age = Utc::now().signed_duration_since(cached.fetched_at);
                if age.to_std().unwrap_or(Duration::MAX) < CACHE_TTL {
                    return Ok(cached.markets.clone());
                }
            }
        }

        let parsed = self.gamma.fetch_supported_markets().await?;
        let tag = self.schedule_tag();
        let now = Utc::now();

        let markets: Vec<Market> = parsed
            .into_iter()
            .filter(|m| m.timeframe == tag && m.end_time > now)
            .map(|m| Market {
                market_id: m.condition_id,
                slug: m.name,
                yes_token_id: m.yes_token_id,
                no_token_id: m.no_token_id,
                start_time: None,
                end_time: m.end_time,
            })
            .collect();

        let mut cache = self.cache.write().await;
        *cache = Some(CachedList {
            markets: markets.clone(),
            fetched_at: now,
        });

        Ok(markets)
    }

    pub async fn by_slug(&self, slug: &str) -> Result<Option<Market>, GammaError> {
        let markets = self.list_currently_running().await?;
        Ok(markets.into_iter().find(|m| m.slug == slug))
    }
}

/// `(end_time - now)` in minutes, or `None` if unknown. Per spec §4.3,
/// callers must fail closed on `None` rather than assume unlimited time.
pub fn minutes_until_resolution(market: &Market, now: DateTime<Utc>) -> Option<i64> {
    let delta = market.end_time.signed_duration_since(now);
    Some(delta.num_minutes())
}

#[allow(dead_code)]
fn index_by_slug(markets: &[Market]) -> HashMap<&str, &Market> {
    markets.iter().map(|m| (m.slug.as_str(), m)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn market(end_in_minutes: i64) -> Market {
        Market {
            market_id: "cond".into(),
            slug: "slug".into(),
            yes_token_id: "y".into(),
            no_token_id: "n".into(),
            start_time: None,
            end_time: Utc::now() + ChronoDuration::minutes(end_in_minutes),
        }
    }

    #[test]
    fn market_is_active_before_end_time() {
        let m = market(10);
        assert!(m.active(Utc::now()));
    }

    #[test]
    fn market_is_inactive_after_end_time() {
        let m = market(-1);
        assert!(!m.active(Utc::now()));
    }

    #[test]
    fn minutes_until_resolution_is_positive_for_future_end() {
        let m = market(15);
        let mins = minutes_until_resolution(&m, Utc::now()).unwrap();
        assert!(mins >= 14 && mins <= 15);
    }
}
