//! CSV-backed market data adapter over in-memory SQLite.
//!
//! A CSV file (header `time,symbol,open,high,low,close,volume`) is loaded
//! into an in-memory database at construction. Replay reads are keyset
//! paginated so the full data set is never materialized at once, and each
//! [`DataSource::read_all`] call starts an independent pass.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use rusqlite::types::ValueRef;

use crate::domain::error::EngineError;
use crate::domain::market::{parse_timestamp as parse_time, Bar};
use crate::ports::data_port::{BarIter, DataSource, ResampleInterval, SqlTable, SqlValue};

const BATCH_SIZE: usize = 4096;

#[derive(Debug)]
pub struct SqliteDataAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteDataAdapter {
    /// Load a CSV file into a fresh in-memory database.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let adapter = Self::empty()?;
        adapter.ingest_csv(path.as_ref())?;
        Ok(adapter)
    }

    /// An empty in-memory source, for tests that insert bars directly.
    pub fn empty() -> Result<Self, EngineError> {
        let manager = SqliteConnectionManager::memory();
        // One connection: every pool handle must see the same in-memory db.
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let conn = pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS market_data (
                time INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (time, symbol)
            );
            CREATE INDEX IF NOT EXISTS idx_market_data_symbol_time
                ON market_data(symbol, time);",
        )
        .map_err(|e| EngineError::data_access(e.to_string()))?;
        drop(conn);

        Ok(Self { pool })
    }

    fn ingest_csv(&self, path: &Path) -> Result<(), EngineError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            EngineError::data_access(format!("{}: {e}", path.display()))
        })?;

        let headers = reader
            .headers()
            .map_err(|e| EngineError::data_access(e.to_string()))?
            .clone();
        let col = |name: &str| -> Result<usize, EngineError> {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                EngineError::data_access(format!(
                    "{}: missing column '{name}'",
                    path.display()
                ))
            })
        };
        let (c_time, c_symbol) = (col("time")?, col("symbol")?);
        let (c_open, c_high, c_low, c_close, c_volume) =
            (col("open")?, col("high")?, col("low")?, col("close")?, col("volume")?);

        let mut conn = self
            .pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        {
            let mut insert = tx
                .prepare(
                    "INSERT OR REPLACE INTO market_data
                     (time, symbol, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .map_err(|e| EngineError::data_access(e.to_string()))?;

            for (line, record) in reader.records().enumerate() {
                let record = record.map_err(|e| {
                    EngineError::data_access(format!("{}: {e}", path.display()))
                })?;
                let field = |idx: usize| record.get(idx).unwrap_or("").trim();

                let time = parse_time(field(c_time)).ok_or_else(|| {
                    EngineError::data_access(format!(
                        "{}: row {}: unparseable time '{}'",
                        path.display(),
                        line + 2,
                        field(c_time)
                    ))
                })?;
                let num = |idx: usize, name: &str| -> Result<f64, EngineError> {
                    field(idx).parse::<f64>().map_err(|_| {
                        EngineError::data_access(format!(
                            "{}: row {}: unparseable {name} '{}'",
                            path.display(),
                            line + 2,
                            field(idx)
                        ))
                    })
                };

                insert
                    .execute(params![
                        time.timestamp_millis(),
                        field(c_symbol),
                        num(c_open, "open")?,
                        num(c_high, "high")?,
                        num(c_low, "low")?,
                        num(c_close, "close")?,
                        num(c_volume, "volume")?,
                    ])
                    .map_err(|e| EngineError::data_access(e.to_string()))?;
            }
        }

        tx.commit()
            .map_err(|e| EngineError::data_access(e.to_string()))
    }

    /// Insert bars directly, bypassing CSV. Test support.
    pub fn insert_bars(&self, bars: &[Bar]) -> Result<(), EngineError> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO market_data
                 (time, symbol, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    bar.time.timestamp_millis(),
                    bar.symbol,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ],
            )
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| EngineError::data_access(e.to_string()))
    }

    fn fetch_batch(
        pool: &Pool<SqliteConnectionManager>,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        cursor: Option<&(i64, String)>,
    ) -> Result<Vec<Bar>, EngineError> {
        let conn = pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT time, symbol, open, high, low, close, volume
                 FROM market_data
                 WHERE (?1 IS NULL OR time >= ?1)
                   AND (?2 IS NULL OR time <= ?2)
                   AND (?3 IS NULL OR time > ?3 OR (time = ?3 AND symbol > ?4))
                 ORDER BY time ASC, symbol ASC
                 LIMIT ?5",
            )
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let (cur_time, cur_symbol) = match cursor {
            Some((t, s)) => (Some(*t), Some(s.clone())),
            None => (None, None),
        };

        let rows = stmt
            .query_map(
                params![start_ms, end_ms, cur_time, cur_symbol, BATCH_SIZE as i64],
                row_to_bar,
            )
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row.map_err(|e| EngineError::data_access(e.to_string()))?);
        }
        Ok(bars)
    }
}

fn row_to_bar(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bar> {
    let millis: i64 = row.get(0)?;
    let time = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Integer,
                format!("timestamp {millis} out of range").into(),
            )
        })?;
    Ok(Bar {
        time,
        symbol: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get(6)?,
    })
}

struct BatchCursor {
    pool: Pool<SqliteConnectionManager>,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    cursor: Option<(i64, String)>,
    buffered: VecDeque<Bar>,
    done: bool,
}

impl Iterator for BatchCursor {
    type Item = Result<Bar, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(bar) = self.buffered.pop_front() {
            return Some(Ok(bar));
        }
        if self.done {
            return None;
        }

        match SqliteDataAdapter::fetch_batch(
            &self.pool,
            self.start_ms,
            self.end_ms,
            self.cursor.as_ref(),
        ) {
            Ok(batch) => {
                if batch.len() < BATCH_SIZE {
                    self.done = true;
                }
                if let Some(last) = batch.last() {
                    self.cursor = Some((last.time.timestamp_millis(), last.symbol.clone()));
                }
                self.buffered = batch.into();
                self.buffered.pop_front().map(Ok)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl DataSource for SqliteDataAdapter {
    fn read_all(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<BarIter, EngineError> {
        Ok(Box::new(BatchCursor {
            pool: self.pool.clone(),
            start_ms: start.map(|t| t.timestamp_millis()),
            end_ms: end.map(|t| t.timestamp_millis()),
            cursor: None,
            buffered: VecDeque::new(),
            done: false,
        }))
    }

    fn get_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: ResampleInterval,
    ) -> Result<Vec<Bar>, EngineError> {
        let interval_ms = interval.seconds() * 1000;
        let start_ms = start.timestamp_millis();

        // (symbol, bucket index) -> aggregated bar. Input arrives in time
        // order, so first seen is the open and last seen is the close.
        let mut buckets: HashMap<(String, i64), Bar> = HashMap::new();
        for bar in self.read_all(Some(start), Some(end))? {
            let bar = bar?;
            let bucket = (bar.time.timestamp_millis() - start_ms) / interval_ms;
            let key = (bar.symbol.clone(), bucket);
            match buckets.get_mut(&key) {
                Some(agg) => {
                    agg.high = agg.high.max(bar.high);
                    agg.low = agg.low.min(bar.low);
                    agg.close = bar.close;
                    agg.volume += bar.volume;
                }
                None => {
                    let bucket_start = Utc
                        .timestamp_millis_opt(start_ms + bucket * interval_ms)
                        .single()
                        .ok_or_else(|| {
                            EngineError::data_access("resample bucket out of range")
                        })?;
                    buckets.insert(
                        key,
                        Bar {
                            time: bucket_start,
                            ..bar
                        },
                    );
                }
            }
        }

        let mut bars: Vec<Bar> = buckets.into_values().collect();
        bars.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.symbol.cmp(&b.symbol)));
        Ok(bars)
    }

    fn read_last(&self, symbol: &str) -> Result<Option<Bar>, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT time, symbol, open, high, low, close, volume
                 FROM market_data WHERE symbol = ?1
                 ORDER BY time DESC LIMIT 1",
            )
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let mut rows = stmt
            .query_map(params![symbol], row_to_bar)
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        match rows.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| EngineError::data_access(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn count(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM market_data
                 WHERE (?1 IS NULL OR time >= ?1)
                   AND (?2 IS NULL OR time <= ?2)",
                params![
                    start.map(|t| t.timestamp_millis()),
                    end.map(|t| t.timestamp_millis()),
                ],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        Ok(count as usize)
    }

    fn execute_sql(&self, query: &str, params: &[SqlValue]) -> Result<SqlTable, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let mut stmt = conn
            .prepare(query)
            .map_err(|e| EngineError::data_access(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let bound: Vec<rusqlite::types::Value> = params
            .iter()
            .map(|p| match p {
                SqlValue::Null => rusqlite::types::Value::Null,
                SqlValue::Integer(v) => rusqlite::types::Value::Integer(*v),
                SqlValue::Real(v) => rusqlite::types::Value::Real(*v),
                SqlValue::Text(v) => rusqlite::types::Value::Text(v.clone()),
            })
            .collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(bound))
            .map_err(|e| EngineError::data_access(e.to_string()))?;

        let mut table = SqlTable {
            columns,
            rows: Vec::new(),
        };
        while let Some(row) = rows
            .next()
            .map_err(|e| EngineError::data_access(e.to_string()))?
        {
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                let value = match row
                    .get_ref(i)
                    .map_err(|e| EngineError::data_access(e.to_string()))?
                {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(v) => SqlValue::Integer(v),
                    ValueRef::Real(v) => SqlValue::Real(v),
                    ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
                    ValueRef::Blob(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
                };
                cells.push(value);
            }
            table.rows.push(cells);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    fn bar(symbol: &str, minute: u32, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            time: t(minute),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    fn adapter_with(bars: &[Bar]) -> SqliteDataAdapter {
        let adapter = SqliteDataAdapter::empty().unwrap();
        adapter.insert_bars(bars).unwrap();
        adapter
    }

    #[test]
    fn from_csv_loads_and_counts() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "time,symbol,open,high,low,close,volume").unwrap();
        writeln!(
            file,
            "2024-03-01T09:00:00Z,AAPL,100.0,101.0,99.0,100.5,1000"
        )
        .unwrap();
        writeln!(
            file,
            "2024-03-01T09:01:00Z,AAPL,100.5,102.0,100.0,101.5,1500"
        )
        .unwrap();

        let adapter = SqliteDataAdapter::from_csv(file.path()).unwrap();
        assert_eq!(adapter.count(None, None).unwrap(), 2);

        let bars: Vec<Bar> = adapter
            .read_all(None, None)
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 100.5);
        assert_eq!(bars[1].close, 101.5);
    }

    #[test]
    fn from_csv_rejects_missing_column() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "time,symbol,open,high,low,close").unwrap();
        writeln!(file, "2024-03-01T09:00:00Z,AAPL,1,1,1,1").unwrap();
        let err = SqliteDataAdapter::from_csv(file.path()).unwrap_err();
        assert!(err.to_string().contains("volume"));
    }

    #[test]
    fn from_csv_rejects_bad_time() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "time,symbol,open,high,low,close,volume").unwrap();
        writeln!(file, "tuesday,AAPL,1,1,1,1,1").unwrap();
        let err = SqliteDataAdapter::from_csv(file.path()).unwrap_err();
        assert!(err.to_string().contains("time"));
    }

    #[test]
    fn read_all_is_time_ordered_regardless_of_insert_order() {
        let adapter = adapter_with(&[
            bar("AAPL", 5, 105.0),
            bar("AAPL", 1, 101.0),
            bar("AAPL", 3, 103.0),
        ]);
        let closes: Vec<f64> = adapter
            .read_all(None, None)
            .unwrap()
            .map(|b| b.unwrap().close)
            .collect();
        assert_eq!(closes, vec![101.0, 103.0, 105.0]);
    }

    #[test]
    fn read_all_applies_time_bounds() {
        let adapter = adapter_with(&[
            bar("AAPL", 1, 101.0),
            bar("AAPL", 2, 102.0),
            bar("AAPL", 3, 103.0),
            bar("AAPL", 4, 104.0),
        ]);
        let closes: Vec<f64> = adapter
            .read_all(Some(t(2)), Some(t(3)))
            .unwrap()
            .map(|b| b.unwrap().close)
            .collect();
        assert_eq!(closes, vec![102.0, 103.0]);
    }

    #[test]
    fn read_all_is_restartable() {
        let adapter = adapter_with(&[bar("AAPL", 1, 101.0), bar("AAPL", 2, 102.0)]);
        assert_eq!(adapter.read_all(None, None).unwrap().count(), 2);
        assert_eq!(adapter.read_all(None, None).unwrap().count(), 2);
    }

    #[test]
    fn read_last_returns_most_recent() {
        let adapter = adapter_with(&[
            bar("AAPL", 1, 101.0),
            bar("AAPL", 9, 109.0),
            bar("MSFT", 5, 305.0),
        ]);
        let last = adapter.read_last("AAPL").unwrap().unwrap();
        assert_eq!(last.close, 109.0);
        assert!(adapter.read_last("TSLA").unwrap().is_none());
    }

    #[test]
    fn get_range_resamples_per_symbol() {
        let adapter = adapter_with(&[
            bar("AAPL", 0, 100.0),
            bar("AAPL", 1, 102.0),
            bar("AAPL", 2, 101.0),
            bar("AAPL", 5, 110.0),
        ]);
        // 5-minute buckets starting at t(0).
        let resampled = adapter
            .get_range(t(0), t(9), ResampleInterval::parse("5m").unwrap())
            .unwrap();
        assert_eq!(resampled.len(), 2);

        let first = &resampled[0];
        assert_eq!(first.time, t(0));
        assert_eq!(first.open, 99.5);
        assert_eq!(first.close, 101.0);
        assert_eq!(first.high, 103.0);
        assert_eq!(first.low, 99.0);
        assert_eq!(first.volume, 300.0);

        assert_eq!(resampled[1].time, t(5));
        assert_eq!(resampled[1].close, 110.0);
    }

    #[test]
    fn count_respects_window_bounds() {
        let adapter = adapter_with(&[
            bar("AAPL", 0, 100.0),
            bar("AAPL", 1, 101.0),
            bar("AAPL", 2, 102.0),
            bar("AAPL", 3, 103.0),
        ]);
        assert_eq!(adapter.count(None, None).unwrap(), 4);
        assert_eq!(adapter.count(Some(t(1)), None).unwrap(), 3);
        assert_eq!(adapter.count(None, Some(t(1))).unwrap(), 2);
        assert_eq!(adapter.count(Some(t(1)), Some(t(2))).unwrap(), 2);
    }

    #[test]
    fn execute_sql_returns_typed_cells() {
        let adapter = adapter_with(&[bar("AAPL", 1, 101.0)]);
        let table = adapter
            .execute_sql("SELECT symbol, COUNT(*), AVG(close) FROM market_data", &[])
            .unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][0], SqlValue::Text("AAPL".into()));
        assert_eq!(table.rows[0][1], SqlValue::Integer(1));
        assert_eq!(table.rows[0][2], SqlValue::Real(101.0));
    }

    #[test]
    fn execute_sql_binds_parameters() {
        let adapter = adapter_with(&[
            bar("AAPL", 1, 101.0),
            bar("MSFT", 1, 301.0),
            bar("MSFT", 2, 302.0),
        ]);
        let table = adapter
            .execute_sql(
                "SELECT COUNT(*) FROM market_data WHERE symbol = ?1 AND close > ?2",
                &[SqlValue::Text("MSFT".into()), SqlValue::Real(301.0)],
            )
            .unwrap();
        assert_eq!(table.rows[0][0], SqlValue::Integer(1));
    }

    #[test]
    fn parse_time_formats() {
        assert!(parse_time("2024-03-01T09:00:00Z").is_some());
        assert!(parse_time("2024-03-01T09:00:00+10:00").is_some());
        assert!(parse_time("2024-03-01 09:00:00").is_some());
        assert!(parse_time("2024-03-01").is_some());
        assert!(parse_time("yesterday").is_none());
    }
}
