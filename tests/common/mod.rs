//! Shared helpers for integration tests.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{Duration, TimeZone, Utc};

/// Write one-minute bars for `symbol` to a CSV file, one bar per close.
/// Bars are shaped so the execution midpoint equals the close.
pub fn write_market_csv(path: &Path, symbol: &str, closes: &[f64]) {
    let start = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
    let mut file = fs::File::create(path).unwrap();
    writeln!(file, "time,symbol,open,high,low,close,volume").unwrap();
    for (i, close) in closes.iter().enumerate() {
        let time = start + Duration::minutes(i as i64);
        writeln!(
            file,
            "{},{symbol},{close},{high},{low},{close},1000",
            time.to_rfc3339(),
            high = close + 1.0,
            low = close - 1.0,
        )
        .unwrap();
    }
}

pub fn write_config(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
}

/// Closes that produce exactly one golden cross followed by one death cross
/// for a 2/4 SMA crossover.
pub fn cross_and_fade() -> Vec<f64> {
    vec![
        110.0, 108.0, 106.0, 104.0, 102.0, 100.0, 120.0, 140.0, 150.0, 150.0, 90.0, 60.0, 50.0,
    ]
}
