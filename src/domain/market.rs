//! Market data and ledger record types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Parse a timestamp as RFC 3339, `YYYY-MM-DD HH:MM:SS` (assumed UTC), or a
/// bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// One OHLCV sample for a symbol at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Execution price for orders generated on this bar. The high/low midpoint
    /// is used instead of the close to reduce look-ahead bias.
    pub fn execution_price(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a strategy emitted an order intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reason {
    pub code: String,
    pub message: String,
}

impl Reason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Reason {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// An execution intent emitted by a strategy. Carries no quantity or price;
/// the coordinator owns sizing and pricing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOrder {
    pub symbol: String,
    pub side: Side,
    pub reason: Reason,
}

/// A priced, sized execution intent. `id` is assigned by the ledger on
/// acceptance and is monotonically increasing within one ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: Option<i64>,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub time: DateTime<Utc>,
    pub strategy_name: String,
    pub reason: Reason,
    pub fee: f64,
}

/// An immutable record of one executed order. Created exactly once per order
/// accepted by the ledger, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub order: Order,
    pub executed_at: DateTime<Utc>,
    pub executed_qty: f64,
    pub executed_price: f64,
    pub fee: f64,
    pub pnl: f64,
}

/// Current holding of one symbol within one ledger.
///
/// Stored as aggregate in/out totals; average entry/exit price and realized
/// PnL are derived. A position with `quantity == 0` does not exist as a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub total_in_quantity: f64,
    pub total_in_amount: f64,
    pub total_in_fee: f64,
    pub total_out_quantity: f64,
    pub total_out_amount: f64,
    pub total_out_fee: f64,
    pub open_time: Option<DateTime<Utc>>,
    pub strategy_name: String,
}

impl Position {
    /// The zero-value position for a symbol with no holdings.
    pub fn empty(symbol: impl Into<String>) -> Self {
        Position {
            symbol: symbol.into(),
            quantity: 0.0,
            total_in_quantity: 0.0,
            total_in_amount: 0.0,
            total_in_fee: 0.0,
            total_out_quantity: 0.0,
            total_out_amount: 0.0,
            total_out_fee: 0.0,
            open_time: None,
            strategy_name: String::new(),
        }
    }

    pub fn average_entry_price(&self) -> f64 {
        if self.total_in_quantity > 0.0 {
            self.total_in_amount / self.total_in_quantity
        } else {
            0.0
        }
    }

    pub fn average_exit_price(&self) -> f64 {
        if self.total_out_quantity > 0.0 {
            self.total_out_amount / self.total_out_quantity
        } else {
            0.0
        }
    }

    /// Realized PnL over everything sold out of this position so far:
    /// proceeds net of exit fees, minus the entry cost (and entry fees)
    /// apportioned to the sold quantity.
    pub fn realized_pnl(&self) -> f64 {
        if self.total_out_quantity <= 0.0 {
            return 0.0;
        }
        let entry_cost = self.total_out_quantity * self.average_entry_price();
        let entry_fee_share = if self.total_in_quantity > 0.0 {
            self.total_in_fee * (self.total_out_quantity / self.total_in_quantity)
        } else {
            0.0
        };
        (self.total_out_amount - self.total_out_fee) - (entry_cost + entry_fee_share)
    }

    pub fn is_open(&self) -> bool {
        self.quantity > 0.0
    }
}

/// Result of the ledger processing one order.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub order: Order,
    pub trade: Trade,
    /// Snapshot of the position after this order was applied.
    pub position: Position,
    pub is_new_position: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap()
    }

    #[test]
    fn execution_price_is_high_low_midpoint() {
        let bar = Bar {
            symbol: "AAPL".into(),
            time: t0(),
            open: 101.0,
            high: 110.0,
            low: 90.0,
            close: 108.0,
            volume: 1000.0,
        };
        assert_eq!(bar.execution_price(), 100.0);
    }

    #[test]
    fn side_round_trips_through_str() {
        assert_eq!(Side::parse(Side::Buy.as_str()), Some(Side::Buy));
        assert_eq!(Side::parse(Side::Sell.as_str()), Some(Side::Sell));
        assert_eq!(Side::parse("HOLD"), None);
    }

    #[test]
    fn empty_position_is_zero_valued() {
        let pos = Position::empty("AAPL");
        assert_eq!(pos.quantity, 0.0);
        assert_eq!(pos.average_entry_price(), 0.0);
        assert_eq!(pos.average_exit_price(), 0.0);
        assert_eq!(pos.realized_pnl(), 0.0);
        assert!(!pos.is_open());
        assert!(pos.open_time.is_none());
    }

    #[test]
    fn average_entry_price_from_aggregates() {
        let mut pos = Position::empty("AAPL");
        pos.total_in_quantity = 300.0;
        pos.total_in_amount = 100.0 * 100.0 + 90.0 * 100.0 + 80.0 * 100.0;
        pos.quantity = 300.0;
        assert_eq!(pos.average_entry_price(), 90.0);
    }

    #[test]
    fn realized_pnl_apportions_entry_fee() {
        // Bought 100 @ 10 with 2.0 entry fee, sold 50 @ 12 with 1.0 exit fee.
        let mut pos = Position::empty("AAPL");
        pos.total_in_quantity = 100.0;
        pos.total_in_amount = 1000.0;
        pos.total_in_fee = 2.0;
        pos.total_out_quantity = 50.0;
        pos.total_out_amount = 600.0;
        pos.total_out_fee = 1.0;
        pos.quantity = 50.0;

        // (600 - 1) - (50*10 + 2*0.5) = 599 - 501 = 98
        assert!((pos.realized_pnl() - 98.0).abs() < f64::EPSILON);
    }
}
