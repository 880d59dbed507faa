//! Scripted market data and executors shared by the integration tests

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use polyswarm::clob::{ExecutorFactory, OrderExecutor, OrderHandle, OrderRequest, OrderStatus, StatusReport};
use polyswarm::error::ExecutionError;
use polyswarm::persistence::{BotRecord, MemoryPersistence, Persistence};
use polyswarm::polymarket::{MarketDataProvider, MarketWindow};
use polyswarm::risk::RiskState;
use polyswarm::strategy::LikelihoodRecord;
use polyswarm::types::{BotId, Candle, CandleSet, PricePoint, Timeframe, Trade, TradingMode};

pub fn window_open() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

pub fn make_window(condition_id: &str, open: DateTime<Utc>, up_price: f64) -> MarketWindow {
    MarketWindow {
        condition_id: condition_id.to_string(),
        up_token_id: format!("{}-up", condition_id),
        down_token_id: format!("{}-down", condition_id),
        open_time: open,
        close_time: open + Duration::minutes(15),
        slug: Some(format!("btc-updown-15m-{}", open.timestamp())),
        up_price,
        down_price: 1.0 - up_price,
    }
}

/// 1m candles on a steady ramp; enough history for every 1m EMA
pub fn trending_candles(step: f64) -> CandleSet {
    let candles: Vec<Candle> = (0..40)
        .map(|i| {
            let close = 100.0 + step * i as f64;
            Candle {
                open_time: 1_717_416_000_000 + i as i64 * 60_000,
                open: close,
                high: close * 1.001,
                low: close * 0.999,
                close,
                volume: 100.0,
            }
        })
        .collect();
    let mut set = BTreeMap::new();
    set.insert(Timeframe::Min1, candles);
    set
}

#[derive(Debug, Clone, Default)]
pub struct MarketScript {
    pub window: Option<MarketWindow>,
    pub history: Vec<PricePoint>,
    pub candles: CandleSet,
    pub resolution: Option<f64>,
    pub fail: bool,
}

/// Market data provider driven by a mutable script
#[derive(Default)]
pub struct ScriptedMarket {
    script: Mutex<MarketScript>,
}

impl ScriptedMarket {
    pub fn new(script: MarketScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut MarketScript)) {
        f(&mut self.script.lock().unwrap());
    }

    fn snapshot(&self) -> MarketScript {
        self.script.lock().unwrap().clone()
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedMarket {
    async fn current_window(&self) -> Result<Option<MarketWindow>> {
        let script = self.snapshot();
        if script.fail {
            bail!("market feed unavailable");
        }
        Ok(script.window)
    }

    async fn token_price_history(&self, _token_id: &str) -> Result<Vec<PricePoint>> {
        Ok(self.snapshot().history)
    }

    async fn candles(&self) -> Result<CandleSet> {
        Ok(self.snapshot().candles)
    }

    async fn resolution(&self, _condition_id: &str, _token_id: &str) -> Result<Option<f64>> {
        Ok(self.snapshot().resolution)
    }
}

/// Executor whose placements always fail
#[derive(Default)]
pub struct RejectingExecutor {
    pub placements: AtomicU32,
}

#[async_trait]
impl OrderExecutor for RejectingExecutor {
    async fn place(&self, _request: &OrderRequest) -> Result<OrderHandle, ExecutionError> {
        self.placements.fetch_add(1, Ordering::SeqCst);
        Err(ExecutionError::Placement("insufficient allowance".to_string()))
    }

    async fn get_status(&self, _handle: &OrderHandle) -> Result<StatusReport, ExecutionError> {
        Err(ExecutionError::StatusLookup("no such order".to_string()))
    }

    async fn cancel(&self, _handle: &OrderHandle) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Hands out one shared executor to every bot
pub struct SharedExecutorFactory(pub Arc<dyn OrderExecutor>);

impl ExecutorFactory for SharedExecutorFactory {
    fn create(&self, _bot_id: BotId, _mode: TradingMode) -> Result<Arc<dyn OrderExecutor>> {
        Ok(self.0.clone())
    }
}

/// Executor that fills every order at its request unless a status is queued
#[derive(Default)]
pub struct ScriptedExecutor {
    placed: Mutex<Vec<OrderRequest>>,
    statuses: Mutex<VecDeque<StatusReport>>,
    /// Every lookup answers `unknown`
    pub stuck: AtomicBool,
}

impl ScriptedExecutor {
    /// Answer the next status lookup with `report`
    pub fn push_status(&self, report: StatusReport) {
        self.statuses.lock().unwrap().push_back(report);
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderExecutor for ScriptedExecutor {
    async fn place(&self, request: &OrderRequest) -> Result<OrderHandle, ExecutionError> {
        let mut placed = self.placed.lock().unwrap();
        placed.push(request.clone());
        Ok(OrderHandle::new(format!("ord-{}", placed.len())))
    }

    async fn get_status(&self, _handle: &OrderHandle) -> Result<StatusReport, ExecutionError> {
        if self.stuck.load(Ordering::SeqCst) {
            return Ok(StatusReport::new(OrderStatus::Unknown));
        }
        let queued = self.statuses.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| StatusReport::new(OrderStatus::Filled)))
    }

    async fn cancel(&self, _handle: &OrderHandle) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// In-memory store whose trade log can be switched to failing
#[derive(Default)]
pub struct FlakyPersistence {
    inner: MemoryPersistence,
    pub fail_trades: AtomicBool,
}

impl FlakyPersistence {
    pub async fn trades(&self, bot_id: BotId) -> Vec<Trade> {
        self.inner.trades(bot_id).await
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn upsert_likelihood(&self, record: &LikelihoodRecord) -> Result<()> {
        self.inner.upsert_likelihood(record).await
    }

    async fn load_likelihoods(&self, bot_id: BotId) -> Result<Vec<LikelihoodRecord>> {
        self.inner.load_likelihoods(bot_id).await
    }

    async fn append_trade(&self, trade: &Trade) -> Result<()> {
        if self.fail_trades.load(Ordering::SeqCst) {
            bail!("trade log is read-only");
        }
        self.inner.append_trade(trade).await
    }

    async fn recent_outcomes(&self, bot_id: BotId, limit: usize) -> Result<Vec<bool>> {
        self.inner.recent_outcomes(bot_id, limit).await
    }

    async fn load_risk_state(&self, bot_id: BotId) -> Result<Option<RiskState>> {
        self.inner.load_risk_state(bot_id).await
    }

    async fn save_risk_state(&self, state: &RiskState) -> Result<()> {
        self.inner.save_risk_state(state).await
    }

    async fn load_bot_record(&self, bot_id: BotId) -> Result<Option<BotRecord>> {
        self.inner.load_bot_record(bot_id).await
    }

    async fn save_bot_record(&self, record: &BotRecord) -> Result<()> {
        self.inner.save_bot_record(record).await
    }

    async fn list_bot_records(&self) -> Result<Vec<BotRecord>> {
        self.inner.list_bot_records().await
    }
}
