//! CLOB Order Lifecycle
//!
//! Places orders through a pluggable `OrderExecutor` and verifies fills:
//! - Resting vs immediate-or-cancel style selection
//! - Status polling on a fixed interval with a retry budget
//! - Cancel and final check when the budget runs out
//! - At most one outstanding order; an order in unknown state blocks new placements
//!   until it is reconciled, and halts the bot if it stays unresolved for another
//!   full poll budget
//! - Consecutive failure counting with a halt threshold
//! - Dry run fills instantly at the requested price

pub mod types;

pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TradingConfig;
use crate::error::{ExecutionError, OrderError};
use crate::types::{BotId, TradingMode};

/// Exchange access for one bot
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Credentials, allowances, connectivity
    async fn ensure_ready(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn place(&self, request: &OrderRequest) -> Result<OrderHandle, ExecutionError>;

    async fn get_status(&self, handle: &OrderHandle) -> Result<StatusReport, ExecutionError>;

    async fn cancel(&self, handle: &OrderHandle) -> Result<(), ExecutionError>;
}

/// Builds the executor a bot trades through
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, bot_id: BotId, mode: TradingMode) -> anyhow::Result<Arc<dyn OrderExecutor>>;
}

/// Order still live on the exchange after its poll budget
#[derive(Debug, Clone, PartialEq)]
struct PendingOrder {
    request: OrderRequest,
    handle: OrderHandle,
    polls: u32,
    /// Unresolved reconcile attempts
    reconciles: u32,
}

/// Per-bot order placement and fill verification
pub struct OrderLifecycleManager {
    executor: Arc<dyn OrderExecutor>,
    config: TradingConfig,
    dry_run: bool,
    pending: Option<PendingOrder>,
    consecutive_errors: u32,
}

impl OrderLifecycleManager {
    pub fn new(executor: Arc<dyn OrderExecutor>, config: TradingConfig, dry_run: bool) -> Self {
        Self {
            executor,
            config,
            dry_run,
            pending: None,
            consecutive_errors: 0,
        }
    }

    /// Hot config reload; counters and the outstanding order survive
    pub fn update_config(&mut self, config: TradingConfig, dry_run: bool) {
        self.config = config;
        self.dry_run = dry_run;
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn has_outstanding(&self) -> bool {
        self.pending.is_some()
    }

    /// Style for an entry given the composite score
    pub fn entry_style(&self, composite_score: f64) -> OrderStyle {
        if self.config.aggressive_for_strong_signals
            && composite_score.abs() > self.config.strong_signal_threshold
        {
            OrderStyle::ImmediateOrCancel
        } else {
            self.config.order_style
        }
    }

    pub fn exit_style(&self) -> OrderStyle {
        self.config.exit_order_style
    }

    pub async fn ensure_ready(&self) -> Result<(), ExecutionError> {
        if self.dry_run {
            return Ok(());
        }
        self.executor.ensure_ready().await
    }

    /// Place an order and wait for it to resolve
    pub async fn execute(&mut self, request: OrderRequest) -> Result<OrderOutcome, OrderError> {
        if let Some(pending) = &self.pending {
            return Err(OrderError::Outstanding {
                handle: pending.handle.clone(),
            });
        }

        if self.dry_run {
            let handle = OrderHandle::new(format!("dry-{}", uuid::Uuid::new_v4()));
            tracing::info!(
                handle = %handle,
                token_id = %request.token_id,
                intent = %request.intent,
                price = request.price,
                size = request.size,
                "🧪 [DRY_RUN] Simulated fill"
            );
            let report = StatusReport::filled(request.price, request.size);
            return Ok(OrderOutcome::from_report(request, handle, &report, 0, 0));
        }

        let started = tokio::time::Instant::now();
        let handle = match self.executor.place(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(
                    token_id = %request.token_id,
                    intent = %request.intent,
                    error = %err,
                    "Order placement failed"
                );
                return Err(self.register_failure(OrderError::Execution(err)));
            }
        };
        tracing::info!(
            handle = %handle,
            token_id = %request.token_id,
            intent = %request.intent,
            style = %request.style,
            price = request.price,
            size = request.size,
            "Order placed"
        );

        let interval = Duration::from_millis(self.config.order_poll_interval_ms);
        let budget = self.config.max_order_retries;

        for poll in 1..=budget {
            tokio::time::sleep(interval).await;
            match self.executor.get_status(&handle).await {
                Ok(report) if report.status.is_fill() => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    return Ok(self.filled(request, handle, &report, poll, elapsed));
                }
                Ok(report) if report.status.is_dead() => {
                    return Err(self.dead(handle, report.status));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(handle = %handle, poll = poll, error = %err, "Status lookup failed, treating as open");
                }
            }
        }

        tracing::info!(handle = %handle, polls = budget, "Poll budget exhausted, cancelling");
        if let Err(err) = self.executor.cancel(&handle).await {
            tracing::warn!(handle = %handle, error = %err, "Cancel failed");
        }

        match self.executor.get_status(&handle).await {
            Ok(report) if report.status.is_fill() => {
                let elapsed = started.elapsed().as_millis() as u64;
                Ok(self.filled(request, handle, &report, budget, elapsed))
            }
            Ok(report) if report.status == OrderStatus::Rejected => Err(self.dead(handle, report.status)),
            Ok(report) if report.status == OrderStatus::Cancelled => {
                self.consecutive_errors = 0;
                Err(OrderError::Unfilled { handle, polls: budget })
            }
            other => {
                let status = other.map(|r| r.status).unwrap_or(OrderStatus::Unknown);
                tracing::warn!(
                    handle = %handle,
                    status = %status,
                    "⚠️ Order state unresolved after cancel, holding as outstanding"
                );
                self.pending = Some(PendingOrder {
                    request,
                    handle: handle.clone(),
                    polls: budget,
                    reconciles: 0,
                });
                Err(self.register_failure(OrderError::Outstanding { handle }))
            }
        }
    }

    /// Re-check an outstanding order. A late fill is returned so the caller can book it.
    ///
    /// An order still unresolved after `max_order_retries` reconcile attempts is a halt:
    /// its shares can no longer be accounted for.
    pub async fn reconcile(&mut self) -> Result<Option<OrderOutcome>, OrderError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(None);
        };

        let report = match self.executor.get_status(&pending.handle).await {
            Ok(report) => report,
            Err(err) => {
                tracing::debug!(handle = %pending.handle, error = %err, "Reconcile lookup failed");
                StatusReport::new(OrderStatus::Unknown)
            }
        };

        if report.status.is_fill() {
            tracing::info!(handle = %pending.handle, status = %report.status, "Outstanding order filled late");
            let PendingOrder { request, handle, polls, .. } = pending;
            return Ok(Some(self.filled(request, handle, &report, polls, 0)));
        }

        if report.status.is_dead() {
            tracing::info!(handle = %pending.handle, status = %report.status, "Outstanding order closed unfilled");
            self.consecutive_errors = 0;
            return Ok(None);
        }

        if report.status == OrderStatus::Open {
            if let Err(err) = self.executor.cancel(&pending.handle).await {
                tracing::debug!(handle = %pending.handle, error = %err, "Cancel of outstanding order failed");
            }
        }
        pending.reconciles += 1;
        let handle = pending.handle.clone();
        let attempts = pending.reconciles;
        self.pending = Some(pending);

        if attempts >= self.config.max_order_retries.max(1) {
            tracing::error!(
                handle = %handle,
                status = %report.status,
                attempts = attempts,
                "Outstanding order never resolved"
            );
            return Err(OrderError::Halt {
                consecutive_errors: self.consecutive_errors,
                last: format!("order {} unresolved after {} reconcile attempts", handle, attempts),
            });
        }
        Err(OrderError::Outstanding { handle })
    }

    fn filled(
        &mut self,
        request: OrderRequest,
        handle: OrderHandle,
        report: &StatusReport,
        retries: u32,
        elapsed_ms: u64,
    ) -> OrderOutcome {
        self.consecutive_errors = 0;
        let outcome = OrderOutcome::from_report(request, handle, report, retries, elapsed_ms);
        tracing::info!(
            handle = %outcome.handle,
            status = %outcome.status,
            fill_price = outcome.fill_price,
            fill_size = outcome.fill_size,
            retries = outcome.retries,
            slippage = outcome.slippage,
            "✅ Order filled"
        );
        outcome
    }

    fn dead(&mut self, handle: OrderHandle, status: OrderStatus) -> OrderError {
        tracing::warn!(handle = %handle, status = %status, "❌ Order ended without fill");
        let err = OrderError::Terminal { handle, status };
        if status == OrderStatus::Rejected {
            self.register_failure(err)
        } else {
            err
        }
    }

    fn register_failure(&mut self, err: OrderError) -> OrderError {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.config.max_consecutive_order_errors {
            tracing::error!(
                consecutive_errors = self.consecutive_errors,
                last = %err,
                "Execution error limit reached"
            );
            return OrderError::Halt {
                consecutive_errors: self.consecutive_errors,
                last: err.to_string(),
            };
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn config() -> TradingConfig {
        TradingConfig {
            order_poll_interval_ms: 1000,
            max_order_retries: 3,
            max_consecutive_order_errors: 2,
            ..TradingConfig::default()
        }
    }

    fn entry() -> OrderRequest {
        OrderRequest {
            side: Side::Up,
            token_id: "tok-up".to_string(),
            price: 0.51,
            size: 5.88,
            style: OrderStyle::Resting,
            intent: OrderIntent::Entry,
        }
    }

    fn manager(mock: MockOrderExecutor) -> OrderLifecycleManager {
        OrderLifecycleManager::new(Arc::new(mock), config(), false)
    }

    #[tokio::test]
    async fn test_dry_run_fills_without_executor() {
        let mut mock = MockOrderExecutor::new();
        mock.expect_place().never();
        let mut mgr = OrderLifecycleManager::new(Arc::new(mock), config(), true);

        let outcome = mgr.execute(entry()).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Filled);
        assert_eq!(outcome.fill_price, 0.51);
        assert_eq!(outcome.retries, 0);
        assert_eq!(outcome.slippage, 0.0);
        assert!(outcome.handle.as_str().starts_with("dry-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_after_polls() {
        let mut mock = MockOrderExecutor::new();
        let mut seq = Sequence::new();
        mock.expect_place()
            .times(1)
            .returning(|_| Ok(OrderHandle::new("ord-1")));
        mock.expect_get_status()
            .with(eq(OrderHandle::new("ord-1")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(StatusReport::new(OrderStatus::Open)));
        mock.expect_get_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(StatusReport::filled(0.52, 5.88)));

        let mut mgr = manager(mock);
        let outcome = mgr.execute(entry()).await.unwrap();
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.time_to_fill_ms, 2000);
        assert!((outcome.slippage - 0.01).abs() < 1e-12);
        assert_eq!(mgr.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_is_terminal() {
        let mut mock = MockOrderExecutor::new();
        mock.expect_place().returning(|_| Ok(OrderHandle::new("ord-2")));
        mock.expect_get_status()
            .returning(|_| Ok(StatusReport::new(OrderStatus::Rejected)));

        let mut mgr = manager(mock);
        let err = mgr.execute(entry()).await.unwrap_err();
        assert!(matches!(err, OrderError::Terminal { status: OrderStatus::Rejected, .. }));
        assert_eq!(mgr.consecutive_errors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_cancels_and_reports_unfilled() {
        let mut mock = MockOrderExecutor::new();
        let mut seq = Sequence::new();
        mock.expect_place().returning(|_| Ok(OrderHandle::new("ord-3")));
        mock.expect_get_status()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Ok(StatusReport::new(OrderStatus::Open)));
        mock.expect_cancel().times(1).returning(|_| Ok(()));
        mock.expect_get_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(StatusReport::new(OrderStatus::Cancelled)));

        let mut mgr = manager(mock);
        let err = mgr.execute(entry()).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::Unfilled {
                handle: OrderHandle::new("ord-3"),
                polls: 3
            }
        );
        assert!(!mgr.has_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_status_never_places_second_order() {
        let mut mock = MockOrderExecutor::new();
        mock.expect_place()
            .times(1)
            .returning(|_| Ok(OrderHandle::new("ord-4")));
        mock.expect_get_status()
            .returning(|_| Err(ExecutionError::StatusLookup("timeout".to_string())));
        mock.expect_cancel()
            .returning(|_| Err(ExecutionError::Cancel("timeout".to_string())));

        let mut mgr = manager(mock);
        let first = mgr.execute(entry()).await.unwrap_err();
        assert!(matches!(first, OrderError::Outstanding { .. }));
        assert!(mgr.has_outstanding());

        let second = mgr.execute(entry()).await.unwrap_err();
        assert_eq!(
            second,
            OrderError::Outstanding {
                handle: OrderHandle::new("ord-4")
            }
        );

        assert!(mgr.reconcile().await.is_err());
        assert!(mgr.has_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_order_halts_after_reconcile_budget() {
        let mut mock = MockOrderExecutor::new();
        mock.expect_place()
            .times(1)
            .returning(|_| Ok(OrderHandle::new("ord-6")));
        mock.expect_get_status()
            .returning(|_| Err(ExecutionError::StatusLookup("timeout".to_string())));
        mock.expect_cancel()
            .returning(|_| Err(ExecutionError::Cancel("timeout".to_string())));

        let mut mgr = manager(mock);
        assert!(matches!(mgr.execute(entry()).await, Err(OrderError::Outstanding { .. })));

        // Budget of 3: two unresolved checks are tolerated, the third halts
        for _ in 0..2 {
            assert!(matches!(mgr.reconcile().await, Err(OrderError::Outstanding { .. })));
        }
        let err = mgr.reconcile().await.unwrap_err();
        assert!(err.is_halt(), "got {:?}", err);
        assert!(err.to_string().contains("ord-6"));
        assert!(mgr.has_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_books_late_fill() {
        let mut mock = MockOrderExecutor::new();
        let mut seq = Sequence::new();
        mock.expect_place().times(1).returning(|_| Ok(OrderHandle::new("ord-5")));
        mock.expect_get_status()
            .times(4)
            .in_sequence(&mut seq)
            .returning(|_| Ok(StatusReport::new(OrderStatus::Unknown)));
        mock.expect_cancel().returning(|_| Ok(()));
        mock.expect_get_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(StatusReport::filled(0.51, 5.88)));

        let mut mgr = manager(mock);
        assert!(mgr.execute(entry()).await.is_err());
        let late = mgr.reconcile().await.unwrap().unwrap();
        assert_eq!(late.handle, OrderHandle::new("ord-5"));
        assert_eq!(late.request.intent, OrderIntent::Entry);
        assert!(!mgr.has_outstanding());
        assert_eq!(mgr.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_consecutive_failures_halt() {
        let mut mock = MockOrderExecutor::new();
        mock.expect_place()
            .times(2)
            .returning(|_| Err(ExecutionError::Placement("insufficient balance".to_string())));

        let mut mgr = manager(mock);
        let first = mgr.execute(entry()).await.unwrap_err();
        assert!(matches!(first, OrderError::Execution(_)));
        let second = mgr.execute(entry()).await.unwrap_err();
        assert!(second.is_halt());
        assert_eq!(mgr.consecutive_errors(), 2);
    }

    #[test]
    fn test_strong_signal_upgrades_to_ioc() {
        let mgr = manager(MockOrderExecutor::new());
        assert_eq!(mgr.entry_style(0.5), OrderStyle::Resting);
        assert_eq!(mgr.entry_style(-0.85), OrderStyle::ImmediateOrCancel);
        assert_eq!(mgr.exit_style(), OrderStyle::ImmediateOrCancel);

        let mut quiet = manager(MockOrderExecutor::new());
        quiet.update_config(
            TradingConfig {
                aggressive_for_strong_signals: false,
                ..TradingConfig::default()
            },
            false,
        );
        assert_eq!(quiet.entry_style(0.95), OrderStyle::Resting);
    }
}
