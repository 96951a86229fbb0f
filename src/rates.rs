//! Exchange rate provider with short-lived caching.
//!
//! USD prices for the supported assets come from a pluggable [`PriceFeed`]
//! and are served from a cache for a fixed TTL (30 seconds by default). The
//! cache is an owned, injectable component rather than ambient static state,
//! so tests can substitute a deterministic feed and TTL.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::types::Asset;

/// Errors raised by rate lookup and conversion.
#[derive(thiserror::Error, Debug)]
pub enum RateError {
    /// The feed has no positive USD rate for one side of the conversion.
    #[error("Unsupported conversion pair: {from} -> {to}")]
    UnsupportedPair { from: Asset, to: Asset },
    /// The upstream price feed could not be reached or returned garbage.
    #[error("Price feed unavailable: {0}")]
    FeedUnavailable(String),
}

/// USD prices for the supported assets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRates {
    pub xlm_to_usd: Decimal,
    pub usdc_to_usd: Decimal,
}

impl ExchangeRates {
    pub fn rate(&self, asset: Asset) -> Decimal {
        match asset {
            Asset::Xlm => self.xlm_to_usd,
            Asset::Usdc => self.usdc_to_usd,
        }
    }
}

/// Source of USD prices. The production deployment would back this with an
/// external market-data API; the ledger treats it as a collaborator.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn fetch(&self) -> Result<ExchangeRates, RateError>;
}

/// Fixed-price feed standing in for a live market-data source.
#[derive(Debug, Clone)]
pub struct FixedPriceFeed {
    rates: ExchangeRates,
}

impl FixedPriceFeed {
    pub fn new(xlm_to_usd: Decimal, usdc_to_usd: Decimal) -> Self {
        FixedPriceFeed {
            rates: ExchangeRates {
                xlm_to_usd,
                usdc_to_usd,
            },
        }
    }
}

impl Default for FixedPriceFeed {
    fn default() -> Self {
        // $0.10 per XLM, $1.00 per USDC
        FixedPriceFeed::new(Decimal::new(10, 2), Decimal::ONE)
    }
}

#[async_trait]
impl PriceFeed for FixedPriceFeed {
    async fn fetch(&self) -> Result<ExchangeRates, RateError> {
        Ok(self.rates)
    }
}

/// Caching front for a [`PriceFeed`].
///
/// A fetched rate table is served for `ttl`; the first caller past the
/// window repopulates the cache. The refresh job calls [`RateCache::refresh`]
/// on its own interval, so API callers almost always hit the cache.
pub struct RateCache {
    feed: Box<dyn PriceFeed>,
    ttl: Duration,
    slot: Mutex<Option<(Instant, ExchangeRates)>>,
}

impl RateCache {
    pub fn new(feed: Box<dyn PriceFeed>, ttl: Duration) -> Self {
        RateCache {
            feed,
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Current rates, served from cache within the TTL window.
    pub async fn rates(&self) -> Result<ExchangeRates, RateError> {
        let mut slot = self.slot.lock().await;
        if let Some((fetched_at, rates)) = *slot
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(rates);
        }
        let rates = self.feed.fetch().await?;
        *slot = Some((Instant::now(), rates));
        Ok(rates)
    }

    /// Unconditionally repopulates the cache. Cache overwrite is naturally
    /// idempotent, which is all the refresh job needs.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self) -> Result<ExchangeRates, RateError> {
        let rates = self.feed.fetch().await?;
        let mut slot = self.slot.lock().await;
        *slot = Some((Instant::now(), rates));
        Ok(rates)
    }

    /// Converts `amount` of `from` into `to`, routing through USD.
    ///
    /// Identity conversion returns the input unchanged without touching the
    /// rate table.
    pub async fn convert(
        &self,
        from: Asset,
        to: Asset,
        amount: Decimal,
    ) -> Result<Decimal, RateError> {
        if from == to {
            return Ok(amount);
        }
        let rates = self.rates().await?;
        let from_rate = rates.rate(from);
        let to_rate = rates.rate(to);
        if from_rate <= Decimal::ZERO || to_rate <= Decimal::ZERO {
            return Err(RateError::UnsupportedPair { from, to });
        }
        Ok((amount * from_rate / to_rate).round_dp(7))
    }

    /// Converts a USD amount into asset units at the current rate.
    pub async fn usd_to_asset(&self, asset: Asset, usd: Decimal) -> Result<Decimal, RateError> {
        let rates = self.rates().await?;
        let rate = rates.rate(asset);
        if rate <= Decimal::ZERO {
            return Err(RateError::UnsupportedPair {
                from: asset,
                to: asset,
            });
        }
        Ok((usd / rate).round_dp(7))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        calls: Arc<AtomicUsize>,
        rates: ExchangeRates,
    }

    impl CountingFeed {
        fn boxed(calls: Arc<AtomicUsize>, xlm: Decimal, usdc: Decimal) -> Box<Self> {
            Box::new(CountingFeed {
                calls,
                rates: ExchangeRates {
                    xlm_to_usd: xlm,
                    usdc_to_usd: usdc,
                },
            })
        }
    }

    #[async_trait]
    impl PriceFeed for CountingFeed {
        async fn fetch(&self) -> Result<ExchangeRates, RateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rates)
        }
    }

    fn cache_with(feed: Box<dyn PriceFeed>) -> RateCache {
        RateCache::new(feed, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_calls_from_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(CountingFeed::boxed(calls.clone(), dec!(0.10), dec!(1.00)));
        cache.rates().await.unwrap();
        cache.rates().await.unwrap();
        cache.rates().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_xlm_to_usdc_conversion_routes_through_usd() {
        let cache = cache_with(Box::new(FixedPriceFeed::new(dec!(0.10), dec!(1.00))));
        let out = cache
            .convert(Asset::Xlm, Asset::Usdc, dec!(100))
            .await
            .unwrap();
        assert_eq!(out, dec!(10.0));
    }

    #[tokio::test]
    async fn test_identity_conversion_returns_input() {
        let cache = cache_with(Box::new(FixedPriceFeed::new(dec!(0.10), dec!(1.00))));
        let out = cache
            .convert(Asset::Usdc, Asset::Usdc, dec!(42.5))
            .await
            .unwrap();
        assert_eq!(out, dec!(42.5));
    }

    #[tokio::test]
    async fn test_missing_rate_is_unsupported_pair() {
        let cache = cache_with(Box::new(FixedPriceFeed::new(dec!(0), dec!(1.00))));
        let err = cache
            .convert(Asset::Xlm, Asset::Usdc, dec!(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RateError::UnsupportedPair { .. }));
    }

    #[tokio::test]
    async fn test_usd_to_asset_at_ten_cents() {
        let cache = cache_with(Box::new(FixedPriceFeed::new(dec!(0.10), dec!(1.00))));
        let out = cache.usd_to_asset(Asset::Xlm, dec!(10.00)).await.unwrap();
        assert_eq!(out, dec!(100));
    }
}
