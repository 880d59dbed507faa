use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// One 15-minute up/down market
///
/// Identity is fixed at discovery; the two prices are refreshed by the provider
/// every time the window is fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketWindow {
    pub condition_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    #[serde(default)]
    pub slug: Option<String>,
    pub up_price: f64,
    pub down_price: f64,
}

impl MarketWindow {
    pub fn token_for(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token_id,
            Side::Down => &self.down_token_id,
        }
    }

    pub fn price_for(&self, side: Side) -> f64 {
        match side {
            Side::Up => self.up_price,
            Side::Down => self.down_price,
        }
    }

    /// Side whose token this is, if it belongs to the window
    pub fn side_of(&self, token_id: &str) -> Option<Side> {
        if token_id == self.up_token_id {
            Some(Side::Up)
        } else if token_id == self.down_token_id {
            Some(Side::Down)
        } else {
            None
        }
    }

    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.close_time - now).num_milliseconds() as f64 / 1000.0
    }

    pub fn seconds_elapsed(&self, now: DateTime<Utc>) -> f64 {
        (now - self.open_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.close_time
    }
}
