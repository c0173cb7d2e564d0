//! Trading strategy port traits.

use crate::domain::error::EngineError;
use crate::domain::indicator::{IndicatorCache, IndicatorRegistry};
use crate::domain::market::{Bar, ExecuteOrder, Position};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataSource;

/// Per-bar view a strategy gets while processing.
pub struct StrategyContext<'a> {
    pub data: &'a dyn DataSource,
    pub indicators: &'a IndicatorRegistry,
    pub cache: &'a mut IndicatorCache,
    /// Snapshot of the current holding for the bar's symbol. Zero-valued
    /// when nothing is held.
    pub position: &'a Position,
}

/// A trading strategy. Stateful across bars within one run; each run gets its
/// own instance via [`StrategyFactory`].
pub trait TradingStrategy {
    fn name(&self) -> &str;

    /// Called once before the first bar with the run's configuration.
    fn initialize(&mut self, config: &dyn ConfigPort) -> Result<(), EngineError>;

    /// Called for every bar in ascending time order. Returned intents carry
    /// no quantity or price; the coordinator sizes and prices them.
    fn process_data(
        &mut self,
        bar: &Bar,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<Vec<ExecuteOrder>, EngineError>;
}

/// Creates a fresh strategy instance per run so concurrent runs never share
/// strategy state.
pub trait StrategyFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self) -> Box<dyn TradingStrategy>;
}
