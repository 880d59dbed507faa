//! Polymarket market data
//!
//! - `MarketWindow`: the active 15-minute up/down market and its live prices
//! - `MarketDataProvider`: async seam for windows, token history, candles and resolutions
//! - `CachedMarketData`: TTL cache over candles shared by every bot in the swarm
//! - Settlement price inference for force-settled windows

pub mod labeling;
pub mod market_state;

pub use labeling::settlement_price;
pub use market_state::MarketWindow;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::{CandleSet, PricePoint};

/// Read side of the market, shared by all bots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// The window currently trading, if any
    async fn current_window(&self) -> Result<Option<MarketWindow>>;

    /// Recent price points of an outcome token, oldest first
    async fn token_price_history(&self, token_id: &str) -> Result<Vec<PricePoint>>;

    /// Underlying-asset candles for the six analysis timeframes
    async fn candles(&self) -> Result<CandleSet>;

    /// Official settlement price of a token once its market resolved
    async fn resolution(&self, condition_id: &str, token_id: &str) -> Result<Option<f64>>;
}

/// Candle cache in front of another provider
///
/// Candles are identical for every bot, so one fetch per TTL serves the swarm.
/// The lock is held across the refresh so concurrent callers share it.
pub struct CachedMarketData {
    inner: Arc<dyn MarketDataProvider>,
    ttl: Duration,
    candles: Mutex<Option<(Instant, CandleSet)>>,
}

impl CachedMarketData {
    pub fn new(inner: Arc<dyn MarketDataProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            candles: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MarketDataProvider for CachedMarketData {
    async fn current_window(&self) -> Result<Option<MarketWindow>> {
        self.inner.current_window().await
    }

    async fn token_price_history(&self, token_id: &str) -> Result<Vec<PricePoint>> {
        self.inner.token_price_history(token_id).await
    }

    async fn candles(&self) -> Result<CandleSet> {
        let mut cached = self.candles.lock().await;
        if let Some((fetched_at, set)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(set.clone());
            }
        }

        let fresh = self.inner.candles().await?;
        tracing::debug!(timeframes = fresh.len(), "Candle cache refreshed");
        *cached = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    async fn resolution(&self, condition_id: &str, token_id: &str) -> Result<Option<f64>> {
        self.inner.resolution(condition_id, token_id).await
    }
}
