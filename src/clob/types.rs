//! CLOB Types - Order requests, handles and fill reports

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Side;

/// How an order meets the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStyle {
    /// Maker / post-only, rests until filled or cancelled
    Resting,
    /// Taker, fills what it can immediately
    ImmediateOrCancel,
}

impl Default for OrderStyle {
    fn default() -> Self {
        OrderStyle::Resting
    }
}

impl fmt::Display for OrderStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStyle::Resting => write!(f, "RESTING"),
            OrderStyle::ImmediateOrCancel => write!(f, "IOC"),
        }
    }
}

/// Exchange-reported order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Partial,
    Cancelled,
    Rejected,
    /// Exchange could not say; treated as still open
    Unknown,
}

impl OrderStatus {
    /// Filled or partially filled
    pub fn is_fill(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Partial)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "OPEN"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Partial => write!(f, "PARTIAL"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Opening or closing a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIntent {
    /// Buy the outcome token
    Entry,
    /// Sell it back
    Exit,
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderIntent::Entry => write!(f, "ENTRY"),
            OrderIntent::Exit => write!(f, "EXIT"),
        }
    }
}

/// Exchange order id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderHandle(String);

impl OrderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order to place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Outcome the token pays on
    pub side: Side,
    pub token_id: String,
    /// Limit price (0.01 to 0.99)
    pub price: f64,
    /// Shares
    pub size: f64,
    pub style: OrderStyle,
    pub intent: OrderIntent,
}

impl OrderRequest {
    /// USDC value at the limit price
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// Result of a status lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: OrderStatus,
    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub fill_size: Option<f64>,
}

impl StatusReport {
    pub fn new(status: OrderStatus) -> Self {
        Self {
            status,
            fill_price: None,
            fill_size: None,
        }
    }

    pub fn filled(price: f64, size: f64) -> Self {
        Self {
            status: OrderStatus::Filled,
            fill_price: Some(price),
            fill_size: Some(size),
        }
    }
}

/// Settled order: request plus what the exchange did with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub request: OrderRequest,
    pub handle: OrderHandle,
    pub status: OrderStatus,
    pub fill_price: f64,
    pub fill_size: f64,
    /// Status polls spent before the fill
    pub retries: u32,
    pub time_to_fill_ms: u64,
    /// Adverse price difference vs the limit (positive = worse)
    pub slippage: f64,
}

impl OrderOutcome {
    pub fn from_report(
        request: OrderRequest,
        handle: OrderHandle,
        report: &StatusReport,
        retries: u32,
        time_to_fill_ms: u64,
    ) -> Self {
        let fill_price = report.fill_price.unwrap_or(request.price);
        let fill_size = report.fill_size.unwrap_or(request.size);
        let slippage = match request.intent {
            OrderIntent::Entry => fill_price - request.price,
            OrderIntent::Exit => request.price - fill_price,
        };
        Self {
            request,
            handle,
            status: report.status,
            fill_price,
            fill_size,
            retries,
            time_to_fill_ms,
            slippage,
        }
    }

    /// USDC actually exchanged
    pub fn fill_notional(&self) -> f64 {
        self.fill_price * self.fill_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(intent: OrderIntent) -> OrderRequest {
        OrderRequest {
            side: Side::Up,
            token_id: "tok".to_string(),
            price: 0.50,
            size: 6.0,
            style: OrderStyle::Resting,
            intent,
        }
    }

    #[test]
    fn test_slippage_is_adverse_positive() {
        let entry = OrderOutcome::from_report(
            request(OrderIntent::Entry),
            OrderHandle::new("a"),
            &StatusReport::filled(0.52, 6.0),
            2,
            2000,
        );
        assert!((entry.slippage - 0.02).abs() < 1e-12);

        let exit = OrderOutcome::from_report(
            request(OrderIntent::Exit),
            OrderHandle::new("b"),
            &StatusReport::filled(0.48, 6.0),
            0,
            0,
        );
        assert!((exit.slippage - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_partial_report_defaults_to_request() {
        let outcome = OrderOutcome::from_report(
            request(OrderIntent::Entry),
            OrderHandle::new("c"),
            &StatusReport::new(OrderStatus::Partial),
            1,
            1000,
        );
        assert_eq!(outcome.fill_price, 0.50);
        assert_eq!(outcome.fill_size, 6.0);
        assert!((outcome.fill_notional() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&OrderStatus::Partial).unwrap(), "\"partial\"");
        assert_eq!(
            serde_json::from_str::<OrderStyle>("\"immediate_or_cancel\"").unwrap(),
            OrderStyle::ImmediateOrCancel
        );
        assert!(OrderStatus::Rejected.is_dead());
        assert!(!OrderStatus::Unknown.is_fill());
    }
}
