//! Market data access port trait.

use crate::domain::error::EngineError;
use crate::domain::market::Bar;
use chrono::{DateTime, Utc};

/// Lazy stream of bars in ascending time order. Each call to
/// [`DataSource::read_all`] produces a fresh iterator, so replay can be
/// restarted any number of times over the same source.
pub type BarIter = Box<dyn Iterator<Item = Result<Bar, EngineError>> + Send>;

/// Resampling bucket width for [`DataSource::get_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleInterval {
    seconds: i64,
}

impl ResampleInterval {
    pub fn from_seconds(seconds: i64) -> Option<ResampleInterval> {
        if seconds > 0 {
            Some(ResampleInterval { seconds })
        } else {
            None
        }
    }

    /// Parse intervals like "30s", "5m", "1h", "1d".
    pub fn parse(s: &str) -> Option<ResampleInterval> {
        let s = s.trim();
        let (digits, unit) = s.split_at(s.len().checked_sub(1)?);
        let n: i64 = digits.parse().ok()?;
        let seconds = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3600,
            "d" => n * 86_400,
            _ => return None,
        };
        ResampleInterval::from_seconds(seconds)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }
}

/// Read access to one replayable market data set.
pub trait DataSource: Send + Sync {
    /// Stream every bar within `[start, end]`, ascending by time. `None`
    /// bounds are open.
    fn read_all(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<BarIter, EngineError>;

    /// Bars within `[start, end]` resampled into `interval` buckets per
    /// symbol: first open, max high, min low, last close, summed volume.
    fn get_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: ResampleInterval,
    ) -> Result<Vec<Bar>, EngineError>;

    /// The most recent bar for `symbol`, if any.
    fn read_last(&self, symbol: &str) -> Result<Option<Bar>, EngineError>;

    /// Number of bars within `[start, end]`. `None` bounds are open, so
    /// `count(None, None)` is the size of the whole source.
    fn count(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, EngineError>;

    /// Run an arbitrary read-only query against the backing store, binding
    /// `params` positionally.
    fn execute_sql(&self, query: &str, params: &[SqlValue]) -> Result<SqlTable, EngineError>;
}

/// One cell from [`DataSource::execute_sql`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// A generic result set from [`DataSource::execute_sql`].
#[derive(Debug, Clone, PartialEq)]
pub struct SqlTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parse() {
        assert_eq!(ResampleInterval::parse("30s").unwrap().seconds(), 30);
        assert_eq!(ResampleInterval::parse("5m").unwrap().seconds(), 300);
        assert_eq!(ResampleInterval::parse("1h").unwrap().seconds(), 3600);
        assert_eq!(ResampleInterval::parse("1d").unwrap().seconds(), 86_400);
        assert!(ResampleInterval::parse("0m").is_none());
        assert!(ResampleInterval::parse("5x").is_none());
        assert!(ResampleInterval::parse("").is_none());
    }
}
