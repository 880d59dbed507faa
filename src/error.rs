//! Error types for execution, the trading loop and swarm commands.
//!
//! Component code returns these typed errors; I/O and config boundaries use
//! `anyhow::Result` with context.

use thiserror::Error;

use crate::clob::types::{OrderHandle, OrderStatus};
use crate::types::BotId;

/// Failure reported by an order execution provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The provider refused or failed to accept the order.
    #[error("order placement failed: {0}")]
    Placement(String),

    /// Status lookup failed (timeout, rate limit, malformed response).
    #[error("status lookup failed: {0}")]
    StatusLookup(String),

    /// Cancel request failed.
    #[error("cancel failed: {0}")]
    Cancel(String),

    /// Provider is not usable (missing credentials, unreachable).
    #[error("executor not ready: {0}")]
    NotReady(String),
}

/// Outcome of a failed order lifecycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    /// The order reached a terminal failure status.
    #[error("order {handle} ended {status}")]
    Terminal {
        handle: OrderHandle,
        status: OrderStatus,
    },

    /// Poll budget exhausted and the order was cancelled unfilled.
    #[error("order {handle} unfilled after {polls} polls")]
    Unfilled { handle: OrderHandle, polls: u32 },

    /// A previous order is still outstanding with unknown status.
    #[error("order {handle} still outstanding, not placing another")]
    Outstanding { handle: OrderHandle },

    /// Provider failure before any order existed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Consecutive failures reached the configured limit; the bot must halt.
    #[error("halting after {consecutive_errors} consecutive execution errors: {last}")]
    Halt {
        consecutive_errors: u32,
        last: String,
    },
}

impl OrderError {
    pub fn is_halt(&self) -> bool {
        matches!(self, OrderError::Halt { .. })
    }
}

/// Error returned by one trading-loop tick.
#[derive(Error, Debug)]
pub enum TickError {
    /// Retried with bounded backoff; never changes the bot status.
    #[error("transient: {0:#}")]
    Transient(#[from] anyhow::Error),

    /// Moves the bot to a persisted terminal error status.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<OrderError> for TickError {
    fn from(err: OrderError) -> Self {
        if err.is_halt() {
            TickError::Fatal(err.to_string())
        } else {
            TickError::Transient(anyhow::Error::new(err))
        }
    }
}

/// Errors from swarm commands.
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("unknown bot {0}")]
    UnknownBot(BotId),

    #[error("bot {0} already registered")]
    AlreadyRegistered(BotId),

    #[error("invalid config for bot {bot_id}: {reason}")]
    InvalidConfig { bot_id: BotId, reason: String },

    #[error("bot {0} is still stopping")]
    Stopping(BotId),

    #[error("bot {bot_id} failed to start: {reason}")]
    StartFailed { bot_id: BotId, reason: String },

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}
