/// Token prices at or beyond these marks are treated as decided
const DECIDED_HIGH: f64 = 0.90;
const DECIDED_LOW: f64 = 0.10;

/// Price a token settles at when its window closes.
///
/// Uses the official resolution when available, otherwise snaps a decided last price
/// to 0 or 1 and falls back to the last price as-is.
pub fn settlement_price(resolution: Option<f64>, last_price: f64) -> f64 {
    if let Some(price) = resolution {
        return price.clamp(0.0, 1.0);
    }
    if last_price >= DECIDED_HIGH {
        1.0
    } else if last_price <= DECIDED_LOW {
        0.0
    } else {
        last_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_prefers_resolution() {
        assert_eq!(settlement_price(Some(1.0), 0.40), 1.0);
        assert_eq!(settlement_price(Some(0.0), 0.95), 0.0);
    }

    #[test]
    fn test_settlement_snaps_decided_prices() {
        assert_eq!(settlement_price(None, 0.93), 1.0);
        assert_eq!(settlement_price(None, 0.04), 0.0);
        assert_eq!(settlement_price(None, 0.55), 0.55);
    }
}
