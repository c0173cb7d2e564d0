//! Per-symbol trade statistics.
//!
//! Computed after a replay finishes, from the ledger's trade history plus
//! the data source's final bar for marking open positions.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::domain::error::EngineError;
use crate::domain::ledger::PositionLedger;
use crate::domain::market::{Side, Trade};
use crate::ports::data_port::DataSource;

/// Closed-trade counts. A "trade" here is one sell execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TradeResult {
    pub total: usize,
    pub winning: usize,
    pub losing: usize,
}

impl TradeResult {
    /// Winning trades over total, 0.0 when no trades closed.
    pub fn win_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.winning as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradePnl {
    pub realized: f64,
    /// Open position marked at the data source's last close.
    pub unrealized: f64,
    /// Largest peak-to-trough drop of the cumulative realized PnL sequence.
    pub max_drawdown: f64,
    /// Best single closed trade, 0.0 when none closed.
    pub maximum_profit: f64,
    /// Worst single closed trade, 0.0 when none closed.
    pub maximum_loss: f64,
}

impl TradePnl {
    pub fn total(&self) -> f64 {
        self.realized + self.unrealized
    }
}

/// How long closed quantity was held, from position open to each sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldingTime {
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeStats {
    pub symbol: String,
    pub trades: TradeResult,
    pub pnl: TradePnl,
    /// `None` when no sell ever closed quantity.
    pub holding: Option<HoldingTime>,
    pub total_fees: f64,
    /// What buying at the first seen price and holding to the last would
    /// have returned with the same capital. `None` without price data.
    pub buy_and_hold_pnl: Option<f64>,
}

impl TradeStats {
    /// Compute stats for one symbol from its trades in execution order.
    /// `last_close` marks any open quantity; `initial_capital` feeds the
    /// buy-and-hold comparison.
    pub fn compute(
        symbol: &str,
        trades: &[Trade],
        last_close: Option<f64>,
        initial_capital: f64,
    ) -> TradeStats {
        let mut result = TradeResult::default();
        let mut realized = 0.0;
        let mut total_fees = 0.0;

        let mut cumulative = 0.0;
        let mut peak = 0.0f64;
        let mut max_drawdown = 0.0f64;
        let mut maximum_profit = 0.0f64;
        let mut maximum_loss = 0.0f64;

        let mut held_qty = 0.0;
        let mut held_amount = 0.0;
        let mut open_time: Option<DateTime<Utc>> = None;
        let mut holdings: Vec<Duration> = Vec::new();
        let mut first_price: Option<f64> = None;

        for trade in trades {
            total_fees += trade.fee;
            first_price.get_or_insert(trade.executed_price);

            match trade.order.side {
                Side::Buy => {
                    if held_qty == 0.0 {
                        open_time = Some(trade.executed_at);
                    }
                    held_qty += trade.executed_qty;
                    held_amount += trade.executed_qty * trade.executed_price;
                }
                Side::Sell => {
                    result.total += 1;
                    if trade.pnl > 0.0 {
                        result.winning += 1;
                    } else if trade.pnl < 0.0 {
                        result.losing += 1;
                    }
                    realized += trade.pnl;
                    maximum_profit = maximum_profit.max(trade.pnl);
                    maximum_loss = maximum_loss.min(trade.pnl);

                    cumulative += trade.pnl;
                    peak = peak.max(cumulative);
                    max_drawdown = max_drawdown.max(peak - cumulative);

                    if let Some(opened) = open_time {
                        holdings.push(trade.executed_at - opened);
                    }

                    let share = if held_qty > 0.0 {
                        trade.executed_qty / held_qty
                    } else {
                        0.0
                    };
                    held_amount -= held_amount * share;
                    held_qty -= trade.executed_qty;
                    if held_qty <= 0.0 {
                        held_qty = 0.0;
                        held_amount = 0.0;
                        open_time = None;
                    }
                }
            }
        }

        let unrealized = match (last_close, held_qty > 0.0) {
            (Some(close), true) => {
                let avg_entry = held_amount / held_qty;
                (close - avg_entry) * held_qty
            }
            _ => 0.0,
        };

        let holding = if holdings.is_empty() {
            None
        } else {
            let min = *holdings.iter().min().unwrap_or(&Duration::zero());
            let max = *holdings.iter().max().unwrap_or(&Duration::zero());
            let total_ms: i64 = holdings.iter().map(|d| d.num_milliseconds()).sum();
            let avg = Duration::milliseconds(total_ms / holdings.len() as i64);
            Some(HoldingTime { min, avg, max })
        };

        let buy_and_hold_pnl = match (first_price, last_close) {
            (Some(first), Some(last)) if first > 0.0 => {
                let shares = (initial_capital / first).floor();
                Some(shares * (last - first))
            }
            _ => None,
        };

        TradeStats {
            symbol: symbol.to_string(),
            trades: result,
            pnl: TradePnl {
                realized,
                unrealized,
                max_drawdown,
                maximum_profit,
                maximum_loss,
            },
            holding,
            total_fees,
            buy_and_hold_pnl,
        }
    }
}

/// Stats for every symbol the ledger touched, ordered by symbol.
pub fn compute_stats(
    ledger: &PositionLedger,
    data: &dyn DataSource,
    initial_capital: f64,
) -> Result<Vec<TradeStats>, EngineError> {
    let mut by_symbol: BTreeMap<String, Vec<Trade>> = BTreeMap::new();
    for trade in ledger.get_all_trades()? {
        by_symbol
            .entry(trade.order.symbol.clone())
            .or_default()
            .push(trade);
    }

    let mut stats = Vec::with_capacity(by_symbol.len());
    for (symbol, trades) in by_symbol {
        let last_close = data.read_last(&symbol)?.map(|bar| bar.close);
        stats.push(TradeStats::compute(
            &symbol,
            &trades,
            last_close,
            initial_capital,
        ));
    }
    Ok(stats)
}

/// Write `stats.csv` under `dir`, one row per symbol.
pub fn write_stats_csv(dir: &Path, stats: &[TradeStats]) -> Result<(), EngineError> {
    fs::create_dir_all(dir)?;
    let mut writer = csv::Writer::from_path(dir.join("stats.csv"))
        .map_err(|e| EngineError::ledger(e.to_string()))?;
    writer
        .write_record([
            "symbol",
            "total_trades",
            "winning_trades",
            "losing_trades",
            "win_rate",
            "realized_pnl",
            "unrealized_pnl",
            "total_pnl",
            "max_drawdown",
            "maximum_profit",
            "maximum_loss",
            "total_fees",
            "holding_min_secs",
            "holding_avg_secs",
            "holding_max_secs",
            "buy_and_hold_pnl",
        ])
        .map_err(|e| EngineError::ledger(e.to_string()))?;

    for s in stats {
        let (min_s, avg_s, max_s) = match &s.holding {
            Some(h) => (
                h.min.num_seconds().to_string(),
                h.avg.num_seconds().to_string(),
                h.max.num_seconds().to_string(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        writer
            .write_record([
                s.symbol.clone(),
                s.trades.total.to_string(),
                s.trades.winning.to_string(),
                s.trades.losing.to_string(),
                s.trades.win_rate().to_string(),
                s.pnl.realized.to_string(),
                s.pnl.unrealized.to_string(),
                s.pnl.total().to_string(),
                s.pnl.max_drawdown.to_string(),
                s.pnl.maximum_profit.to_string(),
                s.pnl.maximum_loss.to_string(),
                s.total_fees.to_string(),
                min_s,
                avg_s,
                max_s,
                s.buy_and_hold_pnl
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            ])
            .map_err(|e| EngineError::ledger(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| EngineError::ledger(e.to_string()))
}
