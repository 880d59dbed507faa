//! polyswarm
//!
//! Decision core for a swarm of bots trading Polymarket 15-minute up/down markets.
//!
//! Each bot runs two layers of technical analysis (the outcome token's own price
//! series and multi-timeframe candles of the underlying), gates entries through a
//! per-bot Bayesian likelihood table, applies risk limits and manages the open
//! position with a time-phased exit engine. Market data, order execution and
//! persistence sit behind traits so the same core runs live, dry or under test.

pub mod clob;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod logging;
pub mod persistence;
pub mod polymarket;
pub mod risk;
pub mod strategy;
pub mod swarm;
pub mod types;

pub use config::{AppConfig, BotConfig, ConfigProfile};
pub use engine::{BotSnapshot, ResolutionEvent};
pub use error::{ExecutionError, OrderError, SwarmError, TickError};
pub use swarm::Swarm;
