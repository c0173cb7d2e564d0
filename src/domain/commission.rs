//! Commission fee models.
//!
//! The broker is chosen once at startup from configuration. Every order pays
//! a fee computed by the selected model before the ledger sees it.

use crate::domain::error::EngineError;
use crate::domain::fee_expr::FeeExpr;
use crate::domain::market::Side;

/// Per-order inputs a fee model may consult.
#[derive(Debug, Clone, Copy)]
pub struct FeeInput<'a> {
    pub quantity: f64,
    pub price: f64,
    pub symbol: &'a str,
    pub side: Side,
}

/// Broker selector as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broker {
    ZeroCommission,
    InteractiveBroker,
    Expression,
}

impl Broker {
    pub fn parse(s: &str) -> Option<Broker> {
        match s {
            "zero_commission" => Some(Broker::ZeroCommission),
            "interactive_broker" => Some(Broker::InteractiveBroker),
            "expression" => Some(Broker::Expression),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Broker::ZeroCommission => "zero_commission",
            Broker::InteractiveBroker => "interactive_broker",
            Broker::Expression => "expression",
        }
    }
}

/// A resolved fee model. Construction validates everything it needs, so
/// `calculate` can only fail for expression models at evaluation time.
#[derive(Debug, Clone)]
pub enum CommissionModel {
    /// No fees at all.
    Zero,
    /// US-stock tiered pricing: $0.005 per share with a $1.00 minimum.
    InteractiveBroker,
    /// User-supplied formula, compiled at startup.
    Expression(FeeExpr),
}

impl CommissionModel {
    /// Resolve a broker selector into a model. `expression` is required only
    /// when the broker is [`Broker::Expression`]; compile failures are
    /// configuration errors.
    pub fn resolve(broker: Broker, expression: Option<&str>) -> Result<CommissionModel, EngineError> {
        match broker {
            Broker::ZeroCommission => Ok(CommissionModel::Zero),
            Broker::InteractiveBroker => Ok(CommissionModel::InteractiveBroker),
            Broker::Expression => {
                let source = expression.ok_or_else(|| {
                    EngineError::configuration(
                        "broker 'expression' requires a commission_expression setting",
                    )
                })?;
                let expr = FeeExpr::compile(source).map_err(|e| {
                    EngineError::configuration(format!(
                        "invalid commission expression:\n{}",
                        e.display_with_context(source)
                    ))
                })?;
                Ok(CommissionModel::Expression(expr))
            }
        }
    }

    pub fn calculate(&self, input: &FeeInput<'_>) -> Result<f64, EngineError> {
        match self {
            CommissionModel::Zero => Ok(0.0),
            CommissionModel::InteractiveBroker => Ok((0.005 * input.quantity).max(1.0)),
            CommissionModel::Expression(expr) => expr.evaluate(input),
        }
    }
}
