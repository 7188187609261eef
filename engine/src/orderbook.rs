//! Order-Book View (C3): per-token best-bid/best-ask backed by a
//! stream cache with an on-demand HTTP fallback.
//!
//! Grounded on `common::clob`'s `BookMessage` (which re-scans price
//! levels rather than trusting sort order, per spec P10) and
//! `original_source/agents/trading/orderbook_helper.py`'s
//! WS-then-HTTP fallback and `check_threshold_triggered` YES-first
//! tie-break.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const STALE_AFTER: Duration = Duration::from_secs(30);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OrderbookError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no book available for token")]
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct Book {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

impl Book {
    /// Highest bid price, re-scanning every level (never trusts sort order).
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|(p, _)| *p).max()
    }

    /// Lowest ask price, re-scanning every level.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|(p, _)| *p).min()
    }

    /// Volume-weighted mid across the top `depth_levels` bid/ask entries
    /// as recorded. Diagnostic only: thin top-of-book levels can make
    /// `best_bid`/`best_ask` misleading, but this never substitutes for
    /// them in a trading decision.
    pub fn weighted_mid_price(&self, depth_levels: usize) -> Option<Decimal> {
        let weighted_side = |levels: &[(Decimal, Decimal)]| -> Option<Decimal> {
            let mut value = Decimal::ZERO;
            let mut size = Decimal::ZERO;
            for (price, level_size) in levels.iter().take(depth_levels) {
                value += price * level_size;
                size += level_size;
            }
            (size > Decimal::ZERO).then_some(value / size)
        };

        let weighted_bid = weighted_side(&self.bids)?;
        let weighted_ask = weighted_side(&self.asks)?;
        Some((weighted_bid + weighted_ask) / Decimal::TWO)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    book: Book,
    last_update: DateTime<Utc>,
    update_count: u64,
    last_best_bid: Option<Decimal>,
    last_best_ask: Option<Decimal>,
}

/// Thread-safe book cache, written by the stream subscriber task and
/// read by the book-monitor and strategy kernel.
#[derive(Clone, Default)]
pub struct BookCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl BookCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the stream subscriber on every book/price_change event.
    /// Logs only on a >1% price move or every 20th update, to avoid
    /// flooding logs on quiet markets.
    pub async fn update(&self, token_id: &str, book: Book) {
        let mut entries = self.entries.write().await;
        let best_bid = book.best_bid();
        let best_ask = book.best_ask();

        let entry = entries.entry(token_id.to_string()).or_insert(CacheEntry {
            book: Book::default(),
            last_update: Utc::now(),
            update_count: 0,
            last_best_bid: None,
            last_best_ask: None,
        });

        let moved_significantly = match (entry.last_best_ask, best_ask) {
            (Some(prev), Some(next)) if prev > Decimal::ZERO => {
                ((next - prev) / prev).abs() > Decimal::new(1, 2)
            }
            _ => true,
        };

        entry.book = book;
        entry.last_update = Utc::now();
        entry.update_count += 1;
        entry.last_best_bid = best_bid;
        entry.last_best_ask = best_ask;

        if moved_significantly || entry.update_count % 20 == 0 {
            debug!(%token_id, ?best_bid, ?best_ask, "book updated");
        }
    }

    async fn cached(&self, token_id: &str) -> Option<Book> {
        let entries = self.entries.read().await;
        let entry = entries.get(token_id)?;
        let age = Utc::now().signed_duration_since(entry.last_update);
        if age.to_std().unwrap_or(Duration::MAX) > STALE_AFTER {
            return None;
        }
        Some(entry.book.clone())
    }
}

/// Fetches books: stream cache first, falling back to a synchronous
/// HTTP request when the cache is stale or cold.
pub struct OrderbookView {
    cache: BookCache,
    http: reqwest::Client,
    book_endpoint: String,
}

impl OrderbookView {
    pub fn new(cache: BookCache, book_endpoint: impl Into<String>) -> Self {
        Self {
            cache,
            http: reqwest::Client::new(),
            book_endpoint: book_endpoint.into(),
        }
    }

    pub async fn fetch_book(&self, token_id: &str) -> Result<Book, OrderbookError> {
        if let Some(book) = self.cache.cached(token_id).await {
            return Ok(book);
        }

        debug!(%token_id, "stream cache stale or cold, falling back to HTTP");
        self.fetch_book_http(token_id).await
    }

    async fn fetch_book_http(&self, token_id: &str) -> Result<Book, OrderbookError> {
        #[derive(serde::Deserialize)]
        struct RawLevel {
            price: String,
            size: String,
        }
        #[derive(serde::Deserialize)]
        struct RawBook {
            #[serde(default)]
            bids: Vec<RawLevel>,
            #[serde(default)]
            asks: Vec<RawLevel>,
        }

        let response = self
            .http
            .get(&self.book_endpoint)
            .query(&[("token_id", token_id)])
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;

        let raw: RawBook = response.json().await?;
        let parse = |levels: Vec<RawLevel>| -> Vec<(Decimal, Decimal)> {
            levels
                .into_iter()
                .filter_map(|l| {
                    let price = l.price.parse().ok()?;
                    let size = l.size.parse().ok()?;
                    Some((price, size))
                })
                .collect()
        };

        Ok(Book {
            bids: parse(raw.bids),
            asks: parse(raw.asks),
        })
    }
}

/// Which side to bet on, returned by `check_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Yes,
    No,
}

/// First side (YES checked first, deterministic tie-break) whose
/// best_ask >= threshold. `None` if neither side crosses.
pub fn check_threshold(yes_book: &Book, no_book: &Book, threshold: Decimal) -> Option<(Side, Decimal)> {
    if let Some(ask) = yes_book.best_ask() {
        if ask >= threshold {
            return Some((Side::Yes, ask));
        }
    }
    if let Some(ask) = no_book.best_ask() {
        if ask >= threshold {
            return Some((Side::No, ask));
        }
    }
    None
}

pub fn warn_if_stale_assumed_absent(token_id: &str) {
    warn!(%token_id, "book treated as absent: stale beyond 30s freshness window");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> Book {
        Book {
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        }
    }

    #[test]
    fn best_bid_scans_regardless_of_order() {
        let b = book(
            &[(dec!(0.40), dec!(10)), (dec!(0.55), dec!(5)), (dec!(0.10), dec!(1))],
            &[],
        );
        assert_eq!(b.best_bid(), Some(dec!(0.55)));
    }

    #[test]
    fn best_ask_scans_regardless_of_order() {
        let b = book(
            &[],
            &[(dec!(0.60), dec!(10)), (dec!(0.51), dec!(5)), (dec!(0.90), dec!(1))],
        );
        assert_eq!(b.best_ask(), Some(dec!(0.51)));
    }

    #[test]
    fn check_threshold_prefers_yes() {
        let yes = book(&[], &[(dec!(0.51), dec!(10))]);
        let no = book(&[], &[(dec!(0.55), dec!(10))]);
        assert_eq!(check_threshold(&yes, &no, dec!(0.50)), Some((Side::Yes, dec!(0.51))));
    }

    #[test]
    fn check_threshold_falls_through_to_no() {
        let yes = book(&[], &[(dec!(0.40), dec!(10))]);
        let no = book(&[], &[(dec!(0.55), dec!(10))]);
        assert_eq!(check_threshold(&yes, &no, dec!(0.50)), Some((Side::No, dec!(0.55))));
    }

    #[test]
    fn check_threshold_none_when_neither_crosses() {
        let yes = book(&[], &[(dec!(0.40), dec!(10))]);
        let no = book(&[], &[(dec!(0.30), dec!(10))]);
        assert_eq!(check_threshold(&yes, &no, dec!(0.50)), None);
    }

    #[test]
    fn weighted_mid_price_averages_top_levels_by_size() {
        let b = book(
            &[(dec!(0.40), dec!(10)), (dec!(0.50), dec!(30))],
            &[(dec!(0.60), dec!(30)), (dec!(0.70), dec!(10))],
        );
        // weighted bid = (0.40*10 + 0.50*30) / 40 = 0.475
        // weighted ask = (0.60*30 + 0.70*10) / 40 = 0.625
        assert_eq!(b.weighted_mid_price(5), Some(dec!(0.55)));
    }

    #[test]
    fn weighted_mid_price_none_without_both_sides() {
        let b = book(&[(dec!(0.40), dec!(10))], &[]);
        assert_eq!(b.weighted_mid_price(5), None);
    }

    #[tokio::test]
    async fn cache_returns_none_once_stale() {
        let cache = BookCache::new();
        cache.update("tok", book(&[(dec!(0.5), dec!(1))], &[])).await;
        {
            let mut entries = cache.entries.write().await;
            let entry = entries.get_mut("tok").unwrap();
            entry.last_update = Utc::now() - chrono::Duration::seconds(31);
        }
        assert!(cache.cached("tok").await.is_none());
    }
}
