//! Transactional position ledger.
//!
//! Orders, trades, and positions for one run live in an in-memory SQLite
//! database. Each order is applied in its own transaction: the order row,
//! its trade row, and the position upsert (or delete, when a position is
//! fully closed) commit together or not at all. A slice of orders is not
//! atomic as a whole; a failure on order `k` leaves orders `1..k-1` applied
//! and reports them back to the caller.
//!
//! Accounting is weighted average cost. A position accumulates in/out
//! aggregates and the average entry price is `total_in_amount /
//! total_in_quantity`; sell PnL nets out the exit fee and the share of entry
//! fees apportioned to the sold quantity.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Transaction};

use crate::domain::error::EngineError;
use crate::domain::market::{Order, Position, Reason, Side, Trade, UpdateResult};

/// Error from [`PositionLedger::update`]. Carries the results of orders that
/// committed before the failing one, since those are permanent.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct LedgerUpdateError {
    pub completed: Vec<UpdateResult>,
    #[source]
    pub source: EngineError,
}

// Full closes compare accumulated f64 quantities, so exact zero is not
// guaranteed.
const QTY_EPSILON: f64 = 1e-9;

pub struct PositionLedger {
    pool: Pool<SqliteConnectionManager>,
    strategy_name: String,
}

impl PositionLedger {
    /// Create an empty ledger for one run of `strategy_name`.
    pub fn new(strategy_name: impl Into<String>) -> Result<PositionLedger, EngineError> {
        let manager = SqliteConnectionManager::memory();
        // One connection: every pool handle must see the same in-memory db.
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| EngineError::ledger(e.to_string()))?;

        let conn = pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                time INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                reason_message TEXT NOT NULL,
                fee REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                order_id INTEGER NOT NULL REFERENCES orders(id),
                executed_at INTEGER NOT NULL,
                executed_qty REAL NOT NULL,
                executed_price REAL NOT NULL,
                fee REAL NOT NULL,
                pnl REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                quantity REAL NOT NULL,
                total_in_quantity REAL NOT NULL,
                total_in_amount REAL NOT NULL,
                total_in_fee REAL NOT NULL,
                total_out_quantity REAL NOT NULL,
                total_out_amount REAL NOT NULL,
                total_out_fee REAL NOT NULL,
                open_time INTEGER NOT NULL,
                strategy TEXT NOT NULL
            );",
        )
        .map_err(|e| EngineError::ledger(e.to_string()))?;
        drop(conn);

        Ok(PositionLedger {
            pool,
            strategy_name: strategy_name.into(),
        })
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    /// Apply a slice of orders in sequence, one transaction per order.
    pub fn update(&self, orders: &[Order]) -> Result<Vec<UpdateResult>, LedgerUpdateError> {
        let mut completed = Vec::with_capacity(orders.len());
        for order in orders {
            match self.apply_one(order) {
                Ok(result) => completed.push(result),
                Err(source) => return Err(LedgerUpdateError { completed, source }),
            }
        }
        Ok(completed)
    }

    fn apply_one(&self, order: &Order) -> Result<UpdateResult, EngineError> {
        validate_order(order)?;

        let mut conn = self
            .pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::ledger(e.to_string()))?;

        let before = read_position(&tx, &order.symbol)?
            .unwrap_or_else(|| Position::empty(&order.symbol));

        let (after, pnl, is_new_position) = match order.side {
            Side::Buy => apply_buy(&before, order, &self.strategy_name),
            Side::Sell => apply_sell(&before, order)?,
        };

        let order_id = insert_order(&tx, order)?;
        let mut stored_order = order.clone();
        stored_order.id = Some(order_id);

        let trade = Trade {
            order: stored_order.clone(),
            executed_at: order.time,
            executed_qty: order.quantity,
            executed_price: order.price,
            fee: order.fee,
            pnl,
        };
        insert_trade(&tx, order_id, &trade)?;

        if after.quantity.abs() < QTY_EPSILON {
            tx.execute(
                "DELETE FROM positions WHERE symbol = ?1",
                params![order.symbol],
            )
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        } else {
            upsert_position(&tx, &after)?;
        }

        tx.commit()
            .map_err(|e| EngineError::ledger(e.to_string()))?;

        Ok(UpdateResult {
            order: stored_order,
            trade,
            position: after,
            is_new_position,
        })
    }

    /// Current position for `symbol`; zero-valued when nothing is held.
    pub fn get_position(&self, symbol: &str) -> Result<Position, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        Ok(read_position(&conn, symbol)?.unwrap_or_else(|| Position::empty(symbol)))
    }

    pub fn get_all_positions(&self) -> Result<Vec<Position>, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, quantity, total_in_quantity, total_in_amount,
                        total_in_fee, total_out_quantity, total_out_amount,
                        total_out_fee, open_time, strategy
                 FROM positions ORDER BY symbol",
            )
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_position)
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        collect_rows(rows)
    }

    pub fn get_all_orders(&self) -> Result<Vec<Order>, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, symbol, side, quantity, price, time, strategy,
                        reason_code, reason_message, fee
                 FROM orders ORDER BY id",
            )
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_order)
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        collect_rows(rows)
    }

    pub fn get_all_trades(&self) -> Result<Vec<Trade>, EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT o.id, o.symbol, o.side, o.quantity, o.price, o.time,
                        o.strategy, o.reason_code, o.reason_message, o.fee,
                        t.executed_at, t.executed_qty, t.executed_price, t.fee, t.pnl
                 FROM trades t JOIN orders o ON o.id = t.order_id
                 ORDER BY o.id",
            )
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let order = row_to_order(row)?;
                Ok(Trade {
                    order,
                    executed_at: millis_to_time(row.get(10)?)?,
                    executed_qty: row.get(11)?,
                    executed_price: row.get(12)?,
                    fee: row.get(13)?,
                    pnl: row.get(14)?,
                })
            })
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        collect_rows(rows)
    }

    /// Per-symbol statistics over this ledger's trade history, marking open
    /// positions against `data`'s last bar.
    pub fn get_stats(
        &self,
        data: &dyn crate::ports::data_port::DataSource,
        initial_capital: f64,
    ) -> Result<Vec<crate::domain::stats::TradeStats>, EngineError> {
        crate::domain::stats::compute_stats(self, data, initial_capital)
    }

    /// Export orders, trades, and open positions as CSV files under `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), EngineError> {
        fs::create_dir_all(dir)?;

        let mut orders = csv::Writer::from_path(dir.join("orders.csv"))
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        orders
            .write_record([
                "id", "symbol", "side", "quantity", "price", "time", "strategy",
                "reason_code", "reason_message", "fee",
            ])
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        for order in self.get_all_orders()? {
            orders
                .write_record([
                    order.id.map(|i| i.to_string()).unwrap_or_default(),
                    order.symbol.clone(),
                    order.side.to_string(),
                    order.quantity.to_string(),
                    order.price.to_string(),
                    order.time.to_rfc3339(),
                    order.strategy_name.clone(),
                    order.reason.code.clone(),
                    order.reason.message.clone(),
                    order.fee.to_string(),
                ])
                .map_err(|e| EngineError::ledger(e.to_string()))?;
        }
        orders
            .flush()
            .map_err(|e| EngineError::ledger(e.to_string()))?;

        let mut trades = csv::Writer::from_path(dir.join("trades.csv"))
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        trades
            .write_record([
                "order_id", "symbol", "side", "executed_at", "executed_qty",
                "executed_price", "fee", "pnl",
            ])
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        for trade in self.get_all_trades()? {
            trades
                .write_record([
                    trade.order.id.map(|i| i.to_string()).unwrap_or_default(),
                    trade.order.symbol.clone(),
                    trade.order.side.to_string(),
                    trade.executed_at.to_rfc3339(),
                    trade.executed_qty.to_string(),
                    trade.executed_price.to_string(),
                    trade.fee.to_string(),
                    trade.pnl.to_string(),
                ])
                .map_err(|e| EngineError::ledger(e.to_string()))?;
        }
        trades
            .flush()
            .map_err(|e| EngineError::ledger(e.to_string()))?;

        let mut positions = csv::Writer::from_path(dir.join("positions.csv"))
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        positions
            .write_record([
                "symbol", "quantity", "average_entry_price", "total_in_quantity",
                "total_in_amount", "total_in_fee", "total_out_quantity",
                "total_out_amount", "total_out_fee", "open_time", "strategy",
            ])
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        for position in self.get_all_positions()? {
            positions
                .write_record([
                    position.symbol.clone(),
                    position.quantity.to_string(),
                    position.average_entry_price().to_string(),
                    position.total_in_quantity.to_string(),
                    position.total_in_amount.to_string(),
                    position.total_in_fee.to_string(),
                    position.total_out_quantity.to_string(),
                    position.total_out_amount.to_string(),
                    position.total_out_fee.to_string(),
                    position
                        .open_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default(),
                    position.strategy_name.clone(),
                ])
                .map_err(|e| EngineError::ledger(e.to_string()))?;
        }
        positions
            .flush()
            .map_err(|e| EngineError::ledger(e.to_string()))
    }

    /// Drop all rows, leaving the schema in place.
    pub fn cleanup(&self) -> Result<(), EngineError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| EngineError::ledger(e.to_string()))?;
        conn.execute_batch("DELETE FROM trades; DELETE FROM orders; DELETE FROM positions;")
            .map_err(|e| EngineError::ledger(e.to_string()))
    }
}

fn validate_order(order: &Order) -> Result<(), EngineError> {
    if !order.quantity.is_finite() || order.quantity <= 0.0 {
        return Err(EngineError::OrderRejected {
            reason: format!(
                "{} {}: quantity {} must be positive",
                order.side, order.symbol, order.quantity
            ),
        });
    }
    if !order.price.is_finite() || order.price <= 0.0 {
        return Err(EngineError::OrderRejected {
            reason: format!(
                "{} {}: price {} must be positive",
                order.side, order.symbol, order.price
            ),
        });
    }
    if !order.fee.is_finite() || order.fee < 0.0 {
        return Err(EngineError::OrderRejected {
            reason: format!(
                "{} {}: fee {} must be non-negative",
                order.side, order.symbol, order.fee
            ),
        });
    }
    Ok(())
}

fn apply_buy(before: &Position, order: &Order, strategy_name: &str) -> (Position, f64, bool) {
    let is_new = !before.is_open();
    let mut after = before.clone();
    after.quantity += order.quantity;
    after.total_in_quantity += order.quantity;
    after.total_in_amount += order.quantity * order.price;
    after.total_in_fee += order.fee;
    if is_new {
        after.open_time = Some(order.time);
        after.strategy_name = strategy_name.to_string();
    }
    // Buys realize nothing.
    (after, 0.0, is_new)
}

fn apply_sell(before: &Position, order: &Order) -> Result<(Position, f64, bool), EngineError> {
    if order.quantity > before.quantity + QTY_EPSILON {
        return Err(EngineError::OrderRejected {
            reason: format!(
                "SELL {}: quantity {} exceeds held {}",
                order.symbol, order.quantity, before.quantity
            ),
        });
    }

    let proceeds = order.quantity * order.price - order.fee;
    let entry_cost = order.quantity * before.average_entry_price();
    let entry_fee_share = if before.total_in_quantity > 0.0 {
        before.total_in_fee * (order.quantity / before.total_in_quantity)
    } else {
        0.0
    };
    let pnl = proceeds - (entry_cost + entry_fee_share);

    let mut after = before.clone();
    after.quantity -= order.quantity;
    after.total_out_quantity += order.quantity;
    after.total_out_amount += order.quantity * order.price;
    after.total_out_fee += order.fee;

    Ok((after, pnl, false))
}

fn insert_order(tx: &Transaction<'_>, order: &Order) -> Result<i64, EngineError> {
    tx.execute(
        "INSERT INTO orders
         (symbol, side, quantity, price, time, strategy, reason_code, reason_message, fee)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            order.symbol,
            order.side.as_str(),
            order.quantity,
            order.price,
            order.time.timestamp_millis(),
            order.strategy_name,
            order.reason.code,
            order.reason.message,
            order.fee,
        ],
    )
    .map_err(|e| EngineError::ledger(e.to_string()))?;
    Ok(tx.last_insert_rowid())
}

fn insert_trade(tx: &Transaction<'_>, order_id: i64, trade: &Trade) -> Result<(), EngineError> {
    tx.execute(
        "INSERT INTO trades (order_id, executed_at, executed_qty, executed_price, fee, pnl)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            order_id,
            trade.executed_at.timestamp_millis(),
            trade.executed_qty,
            trade.executed_price,
            trade.fee,
            trade.pnl,
        ],
    )
    .map_err(|e| EngineError::ledger(e.to_string()))?;
    Ok(())
}

fn upsert_position(tx: &Transaction<'_>, position: &Position) -> Result<(), EngineError> {
    tx.execute(
        "INSERT OR REPLACE INTO positions
         (symbol, quantity, total_in_quantity, total_in_amount, total_in_fee,
          total_out_quantity, total_out_amount, total_out_fee, open_time, strategy)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            position.symbol,
            position.quantity,
            position.total_in_quantity,
            position.total_in_amount,
            position.total_in_fee,
            position.total_out_quantity,
            position.total_out_amount,
            position.total_out_fee,
            position
                .open_time
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
            position.strategy_name,
        ],
    )
    .map_err(|e| EngineError::ledger(e.to_string()))?;
    Ok(())
}

fn read_position(
    conn: &rusqlite::Connection,
    symbol: &str,
) -> Result<Option<Position>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT symbol, quantity, total_in_quantity, total_in_amount,
                    total_in_fee, total_out_quantity, total_out_amount,
                    total_out_fee, open_time, strategy
             FROM positions WHERE symbol = ?1",
        )
        .map_err(|e| EngineError::ledger(e.to_string()))?;
    let mut rows = stmt
        .query_map(params![symbol], row_to_position)
        .map_err(|e| EngineError::ledger(e.to_string()))?;
    match rows.next() {
        Some(row) => Ok(Some(
            row.map_err(|e| EngineError::ledger(e.to_string()))?,
        )),
        None => Ok(None),
    }
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let open_millis: i64 = row.get(8)?;
    Ok(Position {
        symbol: row.get(0)?,
        quantity: row.get(1)?,
        total_in_quantity: row.get(2)?,
        total_in_amount: row.get(3)?,
        total_in_fee: row.get(4)?,
        total_out_quantity: row.get(5)?,
        total_out_amount: row.get(6)?,
        total_out_fee: row.get(7)?,
        open_time: if open_millis > 0 {
            Some(millis_to_time(open_millis)?)
        } else {
            None
        },
        strategy_name: row.get(9)?,
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let side_str: String = row.get(2)?;
    let side = Side::parse(&side_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown side '{side_str}'").into(),
        )
    })?;
    Ok(Order {
        id: Some(row.get(0)?),
        symbol: row.get(1)?,
        side,
        quantity: row.get(3)?,
        price: row.get(4)?,
        time: millis_to_time(row.get(5)?)?,
        strategy_name: row.get(6)?,
        reason: Reason {
            code: row.get(7)?,
            message: row.get(8)?,
        },
        fee: row.get(9)?,
    })
}

fn millis_to_time(millis: i64) -> rusqlite::Result<chrono::DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp {millis} out of range").into(),
        )
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, EngineError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| EngineError::ledger(e.to_string()))?);
    }
    Ok(out)
}
