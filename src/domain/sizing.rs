//! Order sizing against available balance.

use crate::domain::commission::{CommissionModel, FeeInput};
use crate::domain::error::EngineError;
use crate::domain::market::Side;

/// Largest whole-share quantity whose cost including fees fits in `balance`.
///
/// Binary search over `[0, floor(balance / price)]`. Assumes the fee model is
/// non-decreasing in quantity over that range; a non-monotonic expression fee
/// may land below the true maximum but never above the balance.
pub fn max_quantity(
    balance: f64,
    price: f64,
    model: &CommissionModel,
    symbol: &str,
    side: Side,
) -> Result<i64, EngineError> {
    if price <= 0.0 || balance <= 0.0 {
        return Ok(0);
    }

    let mut low: i64 = 0;
    let mut high: i64 = (balance / price).floor() as i64;

    while low < high {
        // Bias toward the upper half so the loop terminates.
        let mid = low + (high - low + 1) / 2;
        let fee = model.calculate(&FeeInput {
            quantity: mid as f64,
            price,
            symbol,
            side,
        })?;
        if mid as f64 * price + fee <= balance {
            low = mid;
        } else {
            high = mid - 1;
        }
    }

    Ok(low)
}

/// Whole-share quantity purchasable with `fraction` of the balance.
pub fn quantity_by_balance_fraction(
    balance: f64,
    fraction: f64,
    price: f64,
    model: &CommissionModel,
    symbol: &str,
    side: Side,
) -> Result<i64, EngineError> {
    let fraction = fraction.clamp(0.0, 1.0);
    max_quantity(balance * fraction, price, model, symbol, side)
}
