//! Trading Loop - Per-bot orchestrator
//!
//! One task per bot multiplexes two intervals:
//! - Slow (`poll_interval_seconds`): window rotation, signals, Bayesian gate, risk, entry
//! - Fast (`fast_poll_ms`): exit engine on the open position
//!
//! All per-bot state (risk counters, likelihood table, position) is owned by the
//! `BotInstance` and only touched from its task. Shutdown is observed between ticks,
//! so order work in flight always completes.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::clob::{OrderExecutor, OrderIntent, OrderLifecycleManager, OrderOutcome, OrderRequest};
use crate::config::{BotConfig, ConfigProfile, SwarmConfig};
use crate::error::{OrderError, TickError};
use crate::persistence::Persistence;
use crate::polymarket::{settlement_price, MarketDataProvider, MarketWindow};
use crate::risk::exits::{ExitContext, ExitDecision, ExitEngine, ExitReason, Position};
use crate::risk::{EntryCandidate, RiskManager, RiskState};
use crate::strategy::{
    compute_pressure, BayesianGate, CompositeSignal, EvidenceCategory, LikelihoodTable, PressureReading,
    SignalCombiner,
};
use crate::types::{BotId, BotStatus, Trade, TradeResult, TradingMode};

/// Fired exactly once per settled position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEvent {
    pub bot_id: BotId,
    pub trade: Trade,
}

/// Everything observable about a bot after a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSnapshot {
    pub bot_id: BotId,
    pub name: String,
    pub status: BotStatus,
    pub mode: TradingMode,
    pub window: Option<MarketWindow>,
    pub signal: Option<CompositeSignal>,
    pub risk: Option<RiskState>,
    pub position: Option<Position>,
    pub last_exit: Option<ExitDecision>,
    /// Why the last entry was refused
    pub last_block: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BotSnapshot {
    /// Snapshot of a bot with no task running
    pub fn idle(bot_id: BotId, name: impl Into<String>, mode: TradingMode, now: DateTime<Utc>) -> Self {
        Self {
            bot_id,
            name: name.into(),
            status: BotStatus::Stopped,
            mode,
            window: None,
            signal: None,
            risk: None,
            position: None,
            last_exit: None,
            last_block: None,
            last_error: None,
            updated_at: now,
        }
    }
}

/// Collaborators a bot is built from
#[derive(Clone)]
pub struct BotDeps {
    pub market: Arc<dyn MarketDataProvider>,
    pub persistence: Arc<dyn Persistence>,
    pub executor: Arc<dyn OrderExecutor>,
    pub resolutions: broadcast::Sender<ResolutionEvent>,
}

/// Context kept while an order is outstanding so a late fill can be booked
#[derive(Debug, Clone)]
enum PendingIntent {
    Entry {
        conviction: f64,
        evidence: (EvidenceCategory, EvidenceCategory),
        window: MarketWindow,
    },
    Exit(ExitDecision),
}

/// Archive write that failed and is retried on the next slow tick
#[derive(Debug, Clone, PartialEq)]
enum UnsavedWrite {
    Trade(Trade),
    /// Latest record of this evidence pair
    Likelihood(EvidenceCategory, EvidenceCategory),
    Risk,
}

impl UnsavedWrite {
    fn label(&self) -> &'static str {
        match self {
            UnsavedWrite::Trade(_) => "trade",
            UnsavedWrite::Likelihood(..) => "likelihood",
            UnsavedWrite::Risk => "risk_state",
        }
    }
}

/// Remainder below this many shares counts as fully sold
const DUST_SHARES: f64 = 1e-6;

/// Exponential backoff with up to 20% jitter
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let bounded = base_ms.saturating_mul(1u64 << exp).min(max_ms);
    let jitter_cap = bounded / 5;
    let jitter = if jitter_cap > 0 {
        rand::thread_rng().gen_range(0..=jitter_cap)
    } else {
        0
    };
    Duration::from_millis(bounded.saturating_add(jitter).min(max_ms.max(base_ms)))
}

pub struct BotInstance {
    bot_id: BotId,
    name: String,
    /// Mode the executor was built for; a profile change applies on restart
    mode: TradingMode,
    profile: Arc<RwLock<ConfigProfile>>,
    config: BotConfig,
    deps: BotDeps,

    combiner: SignalCombiner,
    gate: BayesianGate,
    risk_manager: RiskManager,
    exit_engine: ExitEngine,
    orders: OrderLifecycleManager,

    likelihoods: LikelihoodTable,
    risk: RiskState,
    window: Option<MarketWindow>,
    position: Option<Position>,
    signal: Option<CompositeSignal>,
    pressure: Option<PressureReading>,
    pending: Option<PendingIntent>,
    /// Exit to place again when the last exit order did not sell everything
    exit_retry: Option<ExitDecision>,
    unsaved: Vec<UnsavedWrite>,

    last_exit: Option<ExitDecision>,
    last_block: Option<String>,
    last_error: Option<String>,
    persisted_status: Option<BotStatus>,
    snapshots: Arc<watch::Sender<BotSnapshot>>,
}

impl BotInstance {
    /// Build a bot from its profile and persisted state
    pub async fn load(
        bot_id: BotId,
        name: impl Into<String>,
        profile: Arc<RwLock<ConfigProfile>>,
        deps: BotDeps,
        snapshots: Arc<watch::Sender<BotSnapshot>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        let config = read_profile(&profile);
        let mode = config.mode;

        let risk = deps
            .persistence
            .load_risk_state(bot_id)
            .await
            .context("Failed to load risk state")?
            .unwrap_or_else(|| RiskState::new(bot_id, now));
        let records = deps
            .persistence
            .load_likelihoods(bot_id)
            .await
            .context("Failed to load likelihood records")?;
        let outcomes = deps
            .persistence
            .recent_outcomes(bot_id, config.bayesian.rolling_window)
            .await
            .context("Failed to load recent outcomes")?;
        let likelihoods = LikelihoodTable::restore(bot_id, config.bayesian.rolling_window, records, &outcomes);

        tracing::info!(
            bot_id = bot_id,
            mode = ?mode,
            evidence_pairs = likelihoods.len(),
            resolved_trades = likelihoods.total_trades(),
            daily_pnl = risk.daily_pnl,
            "Bot state loaded"
        );

        let orders = OrderLifecycleManager::new(deps.executor.clone(), config.trading.clone(), mode.is_dry_run());
        Ok(Self {
            bot_id,
            name: name.into(),
            mode,
            profile,
            combiner: SignalCombiner::new(config.signal.clone(), config.risk.min_signal_confidence),
            gate: BayesianGate::new(config.bayesian.clone()),
            risk_manager: RiskManager::new(config.risk.clone()),
            exit_engine: ExitEngine::new(config.exit.clone()),
            orders,
            config,
            deps,
            likelihoods,
            risk,
            window: None,
            position: None,
            signal: None,
            pressure: None,
            pending: None,
            exit_retry: None,
            unsaved: Vec::new(),
            last_exit: None,
            last_block: None,
            last_error: None,
            persisted_status: None,
            snapshots,
        })
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk
    }

    pub fn likelihoods(&self) -> &LikelihoodTable {
        &self.likelihoods
    }

    /// (fast, slow) loop periods
    pub fn cadence(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.config.trading.fast_poll_ms.max(1)),
            Duration::from_secs(self.config.trading.poll_interval_seconds.max(1)),
        )
    }

    pub fn status(&self, now: DateTime<Utc>) -> BotStatus {
        if self.risk.in_cooldown(now) {
            BotStatus::Cooldown
        } else if self.mode.is_dry_run() {
            BotStatus::DryRun
        } else {
            BotStatus::Running
        }
    }

    pub fn snapshot(&self, status: BotStatus, now: DateTime<Utc>) -> BotSnapshot {
        BotSnapshot {
            bot_id: self.bot_id,
            name: self.name.clone(),
            status,
            mode: self.mode,
            window: self.window.clone(),
            signal: self.signal.clone(),
            risk: Some(self.risk.clone()),
            position: self.position.clone(),
            last_exit: self.last_exit.clone(),
            last_block: self.last_block.clone(),
            last_error: self.last_error.clone(),
            updated_at: now,
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        self.snapshots.send_replace(self.snapshot(self.status(now), now));
    }

    /// Pick up profile edits made through the swarm
    fn reload_config(&mut self) {
        let config = read_profile(&self.profile);
        if config == self.config {
            return;
        }
        if config.mode != self.mode {
            tracing::warn!(
                bot_id = self.bot_id,
                running = ?self.mode,
                requested = ?config.mode,
                "Trading mode change takes effect on restart"
            );
        }

        self.combiner = SignalCombiner::new(config.signal.clone(), config.risk.min_signal_confidence);
        self.gate = BayesianGate::new(config.bayesian.clone());
        self.risk_manager = RiskManager::new(config.risk.clone());
        self.exit_engine = ExitEngine::new(config.exit.clone());
        self.orders.update_config(config.trading.clone(), self.mode.is_dry_run());
        self.likelihoods.set_rolling_window(config.bayesian.rolling_window);
        self.config = config;
        tracing::info!(bot_id = self.bot_id, "🔄 Config reloaded");
    }

    /// Executor readiness; failure here is unrecoverable
    pub async fn start(&mut self, now: DateTime<Utc>) -> Result<(), TickError> {
        self.orders
            .ensure_ready()
            .await
            .map_err(|e| TickError::Fatal(format!("executor not ready: {}", e)))?;
        self.last_error = None;
        self.sync_status(now).await;
        self.publish(now);
        tracing::info!(bot_id = self.bot_id, name = %self.name, mode = ?self.mode, "🚀 Bot started");
        Ok(())
    }

    /// Signals, gate, risk and entry
    pub async fn slow_tick(&mut self, now: DateTime<Utc>) -> Result<(), TickError> {
        self.reload_config();
        if self.risk_manager.refresh(&mut self.risk, now) {
            self.save_risk().await?;
        }
        self.reconcile_orders(now).await?;
        self.flush_unsaved().await?;

        let window = self
            .deps
            .market
            .current_window()
            .await
            .context("Failed to fetch current window")?;
        let Some(window) = window else {
            tracing::debug!(bot_id = self.bot_id, "No active market window");
            self.window = None;
            self.finish_tick(now).await;
            return Ok(());
        };
        self.observe_window(window.clone(), now).await?;

        let history = self
            .deps
            .market
            .token_price_history(&window.up_token_id)
            .await
            .context("Failed to fetch token price history")?;
        let candles = self.deps.market.candles().await.context("Failed to fetch candles")?;

        let mut signal = self.combiner.compute(&history, &candles, now);
        self.pressure = Some(compute_pressure(&candles, &self.config.signal));
        if self.position.is_none() {
            let gate = self.gate.evaluate(&self.likelihoods, signal.l1_evidence, signal.l2_evidence);
            signal.apply_gate(gate);
        }
        self.signal = Some(signal.clone());

        if self.position.is_none() && self.pending.is_none() && signal.should_trade {
            self.try_enter(&window, &signal, now).await?;
        }

        self.finish_tick(now).await;
        Ok(())
    }

    /// Exit engine on the open position
    pub async fn fast_tick(&mut self, now: DateTime<Utc>) -> Result<(), TickError> {
        self.reload_config();
        self.reconcile_orders(now).await?;

        let Some(position) = self.position.as_ref() else {
            return Ok(());
        };
        let condition_id = position.condition_id.clone();
        let side = position.side;
        let last_price = position.current_price;

        let window = self
            .deps
            .market
            .current_window()
            .await
            .context("Failed to fetch current window")?;
        let price = match window {
            Some(w) if w.condition_id == condition_id => {
                let price = w.price_for(side);
                self.window = Some(w);
                price
            }
            _ => last_price,
        };

        let ctx = ExitContext {
            now,
            current_price: price,
            pressure: self.pressure.map(|p| p.pressure),
            composite_score: self.signal.as_ref().map(|s| s.composite_score),
        };
        let decision = match self.position.as_mut() {
            Some(position) => self.exit_engine.evaluate(position, &ctx),
            None => None,
        };
        let decision = match decision {
            Some(decision) => {
                self.exit_retry = None;
                Some(decision)
            }
            None => self.exit_retry.take().map(|mut retry| {
                retry.price = price;
                retry.decided_at = now;
                retry
            }),
        };

        if let Some(decision) = decision {
            self.execute_exit(decision, now).await?;
        }
        self.finish_tick(now).await;
        Ok(())
    }

    /// Track rotation; a position left in a superseded window is settled
    async fn observe_window(&mut self, window: MarketWindow, now: DateTime<Utc>) -> Result<(), TickError> {
        let rotated = self.risk_manager.on_window(&mut self.risk, &window.condition_id, now);
        if rotated {
            tracing::info!(
                bot_id = self.bot_id,
                condition_id = %window.condition_id,
                slug = window.slug.as_deref().unwrap_or(""),
                close_time = %window.close_time,
                "🪟 New market window"
            );
            self.signal = None;
            self.save_risk().await?;

            let stale = self
                .position
                .as_ref()
                .filter(|p| p.condition_id != window.condition_id)
                .map(|p| self.exit_engine.force_close(p, now, format!("window {} rotated out", p.condition_id)));
            if let Some(decision) = stale {
                self.execute_exit(decision, now).await?;
            }
        }
        self.window = Some(window);
        Ok(())
    }

    async fn try_enter(
        &mut self,
        window: &MarketWindow,
        signal: &CompositeSignal,
        now: DateTime<Utc>,
    ) -> Result<(), TickError> {
        let Some(side) = signal.recommended_side else {
            return Ok(());
        };
        let entry_price = window.price_for(side);
        let candidate = EntryCandidate {
            composite_confidence: signal.composite_confidence,
            entry_price,
            seconds_to_close: window.seconds_remaining(now),
        };

        let size = match self.risk_manager.evaluate_entry(&self.risk, &candidate, now) {
            Ok(size) => size,
            Err(block) => {
                tracing::debug!(
                    bot_id = self.bot_id,
                    reason = block.code(),
                    detail = %block,
                    "Entry blocked by risk"
                );
                self.last_block = Some(block.to_string());
                return Ok(());
            }
        };
        self.last_block = None;

        let limit = (entry_price + self.config.trading.price_offset).clamp(0.01, 0.99);
        let request = OrderRequest {
            side,
            token_id: window.token_for(side).to_string(),
            price: limit,
            size: size / limit,
            style: self.orders.entry_style(signal.composite_score),
            intent: OrderIntent::Entry,
        };
        tracing::info!(
            bot_id = self.bot_id,
            condition_id = %window.condition_id,
            side = %side,
            price = limit,
            size_usdc = size,
            score = signal.composite_score,
            confidence = signal.composite_confidence,
            "📈 Entering position"
        );

        let intent = PendingIntent::Entry {
            conviction: signal.composite_confidence,
            evidence: (signal.l1_evidence, signal.l2_evidence),
            window: window.clone(),
        };
        match self.orders.execute(request).await {
            Ok(outcome) => self.book_fill(outcome, intent, now).await,
            Err(err) => self.order_failed(err, intent),
        }
    }

    async fn execute_exit(&mut self, decision: ExitDecision, now: DateTime<Utc>) -> Result<(), TickError> {
        let Some(position) = self.position.as_ref() else {
            return Ok(());
        };

        if decision.reason == ExitReason::MarketClose {
            let resolution = match self
                .deps
                .market
                .resolution(&position.condition_id, &position.token_id)
                .await
            {
                Ok(resolution) => resolution,
                Err(err) => {
                    tracing::warn!(bot_id = self.bot_id, error = %err, "Resolution lookup failed, settling from last price");
                    None
                }
            };
            let price = settlement_price(resolution, position.current_price);
            return self.close_position(price, decision, now).await;
        }

        let request = OrderRequest {
            side: position.side,
            token_id: position.token_id.clone(),
            price: (decision.price - self.config.trading.price_offset).clamp(0.01, 0.99),
            size: position.shares,
            style: self.orders.exit_style(),
            intent: OrderIntent::Exit,
        };
        tracing::info!(
            bot_id = self.bot_id,
            condition_id = %position.condition_id,
            reason = %decision.reason,
            detail = %decision.detail,
            price = decision.price,
            shares = position.shares,
            unrealized_pnl = position.unrealized_pnl(),
            "📉 Exiting position"
        );

        match self.orders.execute(request).await {
            Ok(outcome) => self.book_fill(outcome, PendingIntent::Exit(decision), now).await,
            Err(err) => {
                tracing::warn!(
                    bot_id = self.bot_id,
                    reason = %decision.reason,
                    error = %err,
                    "Exit order failed, position stays open"
                );
                if !matches!(err, OrderError::Outstanding { .. }) {
                    self.exit_retry = Some(decision.clone());
                }
                self.order_failed(err, PendingIntent::Exit(decision))
            }
        }
    }

    /// Apply a filled order to the position
    async fn book_fill(&mut self, outcome: OrderOutcome, intent: PendingIntent, now: DateTime<Utc>) -> Result<(), TickError> {
        match intent {
            PendingIntent::Entry {
                conviction,
                evidence,
                window,
            } => {
                if self.position.is_some() {
                    tracing::warn!(bot_id = self.bot_id, handle = %outcome.handle, "Entry fill with a position already open, ignoring");
                    return Ok(());
                }
                let position = Position::open(
                    self.bot_id,
                    outcome.request.side,
                    outcome.request.token_id.clone(),
                    window.condition_id.clone(),
                    outcome.fill_price,
                    outcome.fill_notional(),
                    now,
                    window.close_time,
                    conviction,
                    evidence,
                    self.mode.is_dry_run(),
                );
                tracing::info!(
                    bot_id = self.bot_id,
                    condition_id = %position.condition_id,
                    side = %position.side,
                    entry_price = position.entry_price,
                    shares = position.shares,
                    conviction = conviction,
                    "✅ Position opened"
                );
                self.risk_manager.record_entry(&mut self.risk, now);
                self.position = Some(position);
                self.save_risk().await
            }
            PendingIntent::Exit(decision) => {
                let held = self.position.as_ref().map_or(0.0, |p| p.shares);
                if held - outcome.fill_size > DUST_SHARES {
                    self.book_partial_exit(&outcome, decision);
                    Ok(())
                } else {
                    self.close_position(outcome.fill_price, decision, now).await
                }
            }
        }
    }

    /// Sold part of the position; the rest stays open and the exit is placed again
    fn book_partial_exit(&mut self, outcome: &OrderOutcome, decision: ExitDecision) {
        let Some(position) = self.position.as_mut() else {
            return;
        };
        let pnl = position.reduce(outcome.fill_size, outcome.fill_price);
        tracing::warn!(
            bot_id = self.bot_id,
            condition_id = %position.condition_id,
            handle = %outcome.handle,
            reason = %decision.reason,
            sold = outcome.fill_size,
            remaining = position.shares,
            fill_price = outcome.fill_price,
            pnl = pnl,
            "⚠️ Exit partially filled, remainder stays open"
        );
        self.exit_retry = Some(decision);
    }

    fn order_failed(&mut self, err: OrderError, intent: PendingIntent) -> Result<(), TickError> {
        match err {
            OrderError::Outstanding { .. } => {
                self.pending = Some(intent);
                if self.orders.consecutive_errors() > 0 {
                    self.last_error = Some(err.to_string());
                }
                Ok(())
            }
            OrderError::Unfilled { .. } | OrderError::Terminal { .. } => {
                tracing::info!(bot_id = self.bot_id, error = %err, "Order not filled");
                Ok(())
            }
            OrderError::Execution(_) | OrderError::Halt { .. } => Err(err.into()),
        }
    }

    /// Book a late fill or drop a dead outstanding order
    async fn reconcile_orders(&mut self, now: DateTime<Utc>) -> Result<(), TickError> {
        if !self.orders.has_outstanding() {
            return Ok(());
        }
        match self.orders.reconcile().await {
            Ok(Some(outcome)) => match self.pending.take() {
                Some(intent) => self.book_fill(outcome, intent, now).await,
                None => {
                    tracing::warn!(bot_id = self.bot_id, handle = %outcome.handle, "Late fill with no recorded intent");
                    Ok(())
                }
            },
            Ok(None) => {
                self.pending = None;
                Ok(())
            }
            Err(OrderError::Outstanding { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Archive the position and feed the outcome back into risk and likelihoods
    async fn close_position(&mut self, exit_price: f64, decision: ExitDecision, now: DateTime<Utc>) -> Result<(), TickError> {
        let Some(position) = self.position.take() else {
            return Ok(());
        };

        self.exit_retry = None;

        // Earlier partial sales are folded in at their own prices
        let shares = position.total_shares();
        let pnl = position.realized_pnl + position.shares * (exit_price - position.entry_price);
        let exit_price = if position.sold_shares > 0.0 && shares > 0.0 {
            position.entry_price + pnl / shares
        } else {
            exit_price
        };
        let result = TradeResult::from_pnl(pnl);
        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id: self.bot_id,
            condition_id: position.condition_id.clone(),
            token_id: position.token_id.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size + position.sold_shares * position.entry_price,
            shares,
            pnl,
            result,
            entry_time: position.entry_time,
            exit_time: now,
            exit_reason: decision.reason,
            exit_detail: decision.detail.clone(),
            entry_conviction: position.entry_conviction,
            l1_evidence: position.l1_evidence,
            l2_evidence: position.l2_evidence,
            peak_price: position.peak_price,
            trough_price: position.trough_price,
            dry_run: position.dry_run,
        };

        let cooldown_started = self.risk_manager.record_resolution(&mut self.risk, pnl, now);
        self.likelihoods.record_outcome(
            position.l1_evidence,
            position.l2_evidence,
            result == TradeResult::Win,
            now,
        );

        tracing::info!(
            bot_id = self.bot_id,
            condition_id = %trade.condition_id,
            side = %trade.side,
            reason = %decision.reason,
            entry_price = trade.entry_price,
            exit_price = exit_price,
            pnl = pnl,
            result = %result,
            daily_pnl = self.risk.daily_pnl,
            cooldown_started = cooldown_started,
            "💰 Position closed"
        );

        let _ = self.deps.resolutions.send(ResolutionEvent {
            bot_id: self.bot_id,
            trade: trade.clone(),
        });
        self.last_exit = Some(decision);

        self.queue_write(UnsavedWrite::Trade(trade));
        self.queue_write(UnsavedWrite::Likelihood(position.l1_evidence, position.l2_evidence));
        self.queue_write(UnsavedWrite::Risk);
        self.flush_unsaved().await
    }

    fn queue_write(&mut self, write: UnsavedWrite) {
        if !self.unsaved.contains(&write) {
            self.unsaved.push(write);
        }
    }

    /// Attempt every queued archive write; failures stay queued
    async fn flush_unsaved(&mut self) -> Result<(), TickError> {
        if self.unsaved.is_empty() {
            return Ok(());
        }
        let mut failed = Vec::new();
        let mut first_error = None;
        for write in std::mem::take(&mut self.unsaved) {
            if let Err(err) = self.write(&write).await {
                tracing::warn!(
                    bot_id = self.bot_id,
                    write = write.label(),
                    error = %format!("{:#}", err),
                    "Archive write failed, will retry"
                );
                first_error.get_or_insert(err);
                failed.push(write);
            }
        }
        self.unsaved = failed;
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn write(&self, write: &UnsavedWrite) -> anyhow::Result<()> {
        let persistence = &self.deps.persistence;
        match write {
            UnsavedWrite::Trade(trade) => persistence.append_trade(trade).await.context("Failed to append trade"),
            UnsavedWrite::Likelihood(l1, l2) => match self.likelihoods.get(*l1, *l2) {
                Some(record) => persistence
                    .upsert_likelihood(record)
                    .await
                    .context("Failed to save likelihood record"),
                None => Ok(()),
            },
            UnsavedWrite::Risk => persistence
                .save_risk_state(&self.risk)
                .await
                .context("Failed to save risk state"),
        }
    }

    async fn save_risk(&self) -> Result<(), TickError> {
        self.deps
            .persistence
            .save_risk_state(&self.risk)
            .await
            .context("Failed to save risk state")?;
        Ok(())
    }

    async fn finish_tick(&mut self, now: DateTime<Utc>) {
        self.sync_status(now).await;
        self.publish(now);
    }

    /// Persist status transitions (running ↔ cooldown) on the bot record
    async fn sync_status(&mut self, now: DateTime<Utc>) {
        let status = self.status(now);
        if self.persisted_status == Some(status) {
            return;
        }
        if self.persist_status(status, None).await {
            self.persisted_status = Some(status);
        }
    }

    async fn persist_status(&self, status: BotStatus, error: Option<String>) -> bool {
        let persistence = &self.deps.persistence;
        let result = async {
            if let Some(mut record) = persistence.load_bot_record(self.bot_id).await? {
                record.status = status;
                record.last_error = error;
                persistence.save_bot_record(&record).await?;
            }
            anyhow::Ok(())
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(bot_id = self.bot_id, status = %status, error = %err, "Failed to persist bot status");
                false
            }
        }
    }

    fn note_transient(&mut self, err: &anyhow::Error, now: DateTime<Utc>) {
        self.last_error = Some(format!("{:#}", err));
        self.publish(now);
    }

    /// Terminal failure: persist error status and publish it
    async fn fail(&mut self, reason: String, now: DateTime<Utc>) {
        tracing::error!(bot_id = self.bot_id, reason = %reason, "❌ Bot halted");
        self.last_error = Some(reason.clone());
        self.persist_status(BotStatus::Error, Some(reason)).await;
        self.persisted_status = Some(BotStatus::Error);
        self.snapshots.send_replace(self.snapshot(BotStatus::Error, now));
    }

    async fn stopped(&mut self, now: DateTime<Utc>) {
        self.persist_status(BotStatus::Stopped, None).await;
        self.persisted_status = Some(BotStatus::Stopped);
        self.snapshots.send_replace(self.snapshot(BotStatus::Stopped, now));
        tracing::info!(bot_id = self.bot_id, "Bot stopped");
    }
}

fn read_profile(profile: &RwLock<ConfigProfile>) -> BotConfig {
    match profile.read() {
        Ok(guard) => guard.effective(),
        Err(poisoned) => poisoned.into_inner().effective(),
    }
}

/// How a bot task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotExit {
    Stopped,
    Failed(String),
}

enum Tick {
    Fast,
    Slow,
}

/// Drive a bot until shutdown or a fatal error
pub async fn run_bot(mut bot: BotInstance, mut shutdown: watch::Receiver<bool>, swarm: SwarmConfig) -> BotExit {
    if let Err(err) = bot.start(Utc::now()).await {
        let reason = match err {
            TickError::Fatal(reason) => reason,
            TickError::Transient(err) => format!("{:#}", err),
        };
        bot.fail(reason.clone(), Utc::now()).await;
        return BotExit::Failed(reason);
    }

    let mut cadence = bot.cadence();
    let (mut fast, mut slow) = intervals(cadence);
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let tick = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = slow.tick() => Tick::Slow,
            _ = fast.tick() => Tick::Fast,
        };

        let now = Utc::now();
        let result = match tick {
            Tick::Slow => bot.slow_tick(now).await,
            Tick::Fast => bot.fast_tick(now).await,
        };

        match result {
            Ok(()) => failures = 0,
            Err(TickError::Fatal(reason)) => {
                bot.fail(reason.clone(), Utc::now()).await;
                return BotExit::Failed(reason);
            }
            Err(TickError::Transient(err)) => {
                failures = failures.saturating_add(1);
                let delay = backoff_delay(failures, swarm.backoff_base_ms, swarm.backoff_max_ms);
                tracing::warn!(
                    bot_id = bot.bot_id(),
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{:#}", err),
                    "Tick failed, backing off"
                );
                bot.note_transient(&err, Utc::now());
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if bot.cadence() != cadence {
            cadence = bot.cadence();
            (fast, slow) = intervals(cadence);
        }
    }

    bot.stopped(Utc::now()).await;
    BotExit::Stopped
}

fn intervals((fast, slow): (Duration, Duration)) -> (tokio::time::Interval, tokio::time::Interval) {
    let mut fast = tokio::time::interval(fast);
    fast.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut slow = tokio::time::interval(slow);
    slow.set_missed_tick_behavior(MissedTickBehavior::Skip);
    (fast, slow)
}
