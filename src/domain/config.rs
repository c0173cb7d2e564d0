//! Engine run configuration.
//!
//! One configuration file describes one way to run a backtest: starting
//! capital, fee model, optional replay window, and the parallelism bound.
//! Everything is validated at load time so a bad file fails before any run
//! starts.

use chrono::{DateTime, Utc};

use crate::domain::commission::{Broker, CommissionModel};
use crate::domain::error::EngineError;
use crate::domain::market::parse_timestamp;
use crate::ports::config_port::ConfigPort;

pub const ENGINE_SECTION: &str = "engine";
pub const STRATEGY_SECTION: &str = "strategy";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_capital: f64,
    pub broker: Broker,
    pub commission_expression: Option<String>,
    /// Inclusive replay window. `None` bounds are open.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Upper bound on concurrently executing runs. Zero means one worker
    /// per core.
    pub max_parallelism: usize,
}

impl EngineConfig {
    pub fn from_config(config: &dyn ConfigPort) -> Result<EngineConfig, EngineError> {
        let initial_capital = config.get_double(ENGINE_SECTION, "initial_capital", f64::NAN);
        if !initial_capital.is_finite() || initial_capital <= 0.0 {
            return Err(EngineError::configuration(
                "initial_capital must be a positive number",
            ));
        }

        let broker_name = config
            .get_string(ENGINE_SECTION, "broker")
            .unwrap_or_else(|| Broker::ZeroCommission.as_str().to_string());
        let broker = Broker::parse(&broker_name).ok_or_else(|| {
            EngineError::configuration(format!(
                "unknown broker '{broker_name}' (expected zero_commission, \
                 interactive_broker, or expression)"
            ))
        })?;

        let commission_expression = config.get_string(ENGINE_SECTION, "commission_expression");

        let parse_bound = |key: &str| -> Result<Option<DateTime<Utc>>, EngineError> {
            match config.get_string(ENGINE_SECTION, key) {
                Some(raw) => parse_timestamp(&raw)
                    .map(Some)
                    .ok_or_else(|| {
                        EngineError::configuration(format!("unparseable {key} '{raw}'"))
                    }),
                None => Ok(None),
            }
        };
        let start_time = parse_bound("start_time")?;
        let end_time = parse_bound("end_time")?;
        if let (Some(start), Some(end)) = (start_time, end_time) {
            if start > end {
                return Err(EngineError::configuration(
                    "start_time must not be after end_time",
                ));
            }
        }

        let max_parallelism = config.get_int(ENGINE_SECTION, "max_parallelism", 0);
        if max_parallelism < 0 {
            return Err(EngineError::configuration(
                "max_parallelism must not be negative",
            ));
        }

        Ok(EngineConfig {
            initial_capital,
            broker,
            commission_expression,
            start_time,
            end_time,
            max_parallelism: max_parallelism as usize,
        })
    }

    /// Build the fee model this configuration selects. Expression compile
    /// failures surface here, before any run starts.
    pub fn resolve_commission(&self) -> Result<CommissionModel, EngineError> {
        CommissionModel::resolve(self.broker, self.commission_expression.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use chrono::TimeZone;

    fn load(content: &str) -> Result<EngineConfig, EngineError> {
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        EngineConfig::from_config(&adapter)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load("[engine]\ninitial_capital = 10000\n").unwrap();
        assert_eq!(config.initial_capital, 10000.0);
        assert_eq!(config.broker, Broker::ZeroCommission);
        assert!(config.start_time.is_none());
        assert!(config.end_time.is_none());
        assert_eq!(config.max_parallelism, 0);
    }

    #[test]
    fn full_config_parses() {
        let config = load(
            "[engine]\n\
             initial_capital = 50000.5\n\
             broker = expression\n\
             commission_expression = max(1.0, 0.005 * quantity)\n\
             start_time = 2024-01-01\n\
             end_time = 2024-06-30T23:59:59Z\n\
             max_parallelism = 4\n",
        )
        .unwrap();
        assert_eq!(config.broker, Broker::Expression);
        assert_eq!(
            config.start_time.unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(config.max_parallelism, 4);
        assert!(config.resolve_commission().is_ok());
    }

    #[test]
    fn missing_capital_is_rejected() {
        assert!(load("[engine]\nbroker = zero_commission\n").is_err());
    }

    #[test]
    fn non_positive_capital_is_rejected() {
        assert!(load("[engine]\ninitial_capital = 0\n").is_err());
        assert!(load("[engine]\ninitial_capital = -100\n").is_err());
    }

    #[test]
    fn unknown_broker_is_rejected() {
        let err = load("[engine]\ninitial_capital = 1\nbroker = robinhood\n").unwrap_err();
        assert!(err.to_string().contains("robinhood"));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = load(
            "[engine]\ninitial_capital = 1\n\
             start_time = 2024-06-01\nend_time = 2024-01-01\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("start_time"));
    }

    #[test]
    fn bad_expression_fails_at_resolve() {
        let config = load(
            "[engine]\ninitial_capital = 1\nbroker = expression\n\
             commission_expression = 1 +\n",
        )
        .unwrap();
        assert!(config.resolve_commission().is_err());
    }
}
