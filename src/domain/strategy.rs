//! Built-in trading strategies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::domain::config::STRATEGY_SECTION;
use crate::domain::error::EngineError;
use crate::domain::market::{Bar, ExecuteOrder, Reason, Side};
use crate::ports::config_port::ConfigPort;
use crate::ports::strategy_port::{StrategyContext, StrategyFactory, TradingStrategy};

pub const SMA_CROSSOVER: &str = "sma-crossover";

/// Look up a built-in strategy factory by name.
pub fn factory_by_name(name: &str) -> Option<Arc<dyn StrategyFactory>> {
    match name {
        SMA_CROSSOVER => Some(Arc::new(SmaCrossoverFactory)),
        _ => None,
    }
}

pub fn builtin_names() -> Vec<&'static str> {
    vec![SMA_CROSSOVER]
}

#[derive(Default)]
struct SymbolState {
    fast: VecDeque<f64>,
    slow: VecDeque<f64>,
    fast_sum: f64,
    slow_sum: f64,
    /// Whether the fast mean was above the slow mean on the previous bar,
    /// once both windows were full.
    fast_above: Option<bool>,
}

/// Simple moving average crossover: buy when the fast mean crosses above the
/// slow mean, sell when it crosses back below. One instance per run; state
/// is keyed by symbol.
pub struct SmaCrossoverStrategy {
    fast_window: usize,
    slow_window: usize,
    state: HashMap<String, SymbolState>,
}

impl SmaCrossoverStrategy {
    pub fn new() -> Self {
        Self {
            fast_window: 5,
            slow_window: 20,
            state: HashMap::new(),
        }
    }
}

impl Default for SmaCrossoverStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingStrategy for SmaCrossoverStrategy {
    fn name(&self) -> &str {
        SMA_CROSSOVER
    }

    fn initialize(&mut self, config: &dyn ConfigPort) -> Result<(), EngineError> {
        let fast = config.get_int(STRATEGY_SECTION, "fast_window", 5);
        let slow = config.get_int(STRATEGY_SECTION, "slow_window", 20);
        if fast < 1 || slow < 1 {
            return Err(EngineError::configuration(
                "fast_window and slow_window must be at least 1",
            ));
        }
        if fast >= slow {
            return Err(EngineError::configuration(format!(
                "fast_window ({fast}) must be smaller than slow_window ({slow})"
            )));
        }
        self.fast_window = fast as usize;
        self.slow_window = slow as usize;
        self.state.clear();
        Ok(())
    }

    fn process_data(
        &mut self,
        bar: &Bar,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<Vec<ExecuteOrder>, EngineError> {
        let state = self.state.entry(bar.symbol.clone()).or_default();

        state.fast.push_back(bar.close);
        state.fast_sum += bar.close;
        if state.fast.len() > self.fast_window {
            state.fast_sum -= state.fast.pop_front().unwrap_or(0.0);
        }
        state.slow.push_back(bar.close);
        state.slow_sum += bar.close;
        if state.slow.len() > self.slow_window {
            state.slow_sum -= state.slow.pop_front().unwrap_or(0.0);
        }

        if state.slow.len() < self.slow_window {
            return Ok(Vec::new());
        }

        let fast_mean = state.fast_sum / state.fast.len() as f64;
        let slow_mean = state.slow_sum / state.slow.len() as f64;
        let fast_above = fast_mean > slow_mean;
        let previous = state.fast_above.replace(fast_above);

        let Some(previous) = previous else {
            return Ok(Vec::new());
        };
        if previous == fast_above {
            return Ok(Vec::new());
        }

        let mut intents = Vec::new();
        if fast_above && !ctx.position.is_open() {
            intents.push(ExecuteOrder {
                symbol: bar.symbol.clone(),
                side: Side::Buy,
                reason: Reason::new(
                    "golden-cross",
                    format!("fast sma {fast_mean:.4} crossed above slow sma {slow_mean:.4}"),
                ),
            });
        } else if !fast_above && ctx.position.is_open() {
            intents.push(ExecuteOrder {
                symbol: bar.symbol.clone(),
                side: Side::Sell,
                reason: Reason::new(
                    "death-cross",
                    format!("fast sma {fast_mean:.4} crossed below slow sma {slow_mean:.4}"),
                ),
            });
        }
        Ok(intents)
    }
}

pub struct SmaCrossoverFactory;

impl StrategyFactory for SmaCrossoverFactory {
    fn name(&self) -> &str {
        SMA_CROSSOVER
    }

    fn create(&self) -> Box<dyn TradingStrategy> {
        Box::new(SmaCrossoverStrategy::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use crate::adapters::sqlite_data_adapter::SqliteDataAdapter;
    use crate::domain::indicator::{IndicatorCache, IndicatorRegistry};
    use crate::domain::market::Position;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, close: f64) -> Bar {
        Bar {
            symbol: "AAPL".into(),
            time: Utc.with_ymd_and_hms(2024, 1, 2, 10, minute, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    fn init(content: &str) -> SmaCrossoverStrategy {
        let config = FileConfigAdapter::from_string(content).unwrap();
        let mut strategy = SmaCrossoverStrategy::new();
        strategy.initialize(&config).unwrap();
        strategy
    }

    fn feed(
        strategy: &mut SmaCrossoverStrategy,
        closes: &[f64],
        held: bool,
    ) -> Vec<Vec<ExecuteOrder>> {
        let data = SqliteDataAdapter::empty().unwrap();
        let registry = IndicatorRegistry::new();
        let mut cache = IndicatorCache::new();
        let mut position = Position::empty("AAPL");
        if held {
            position.quantity = 10.0;
        }

        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let mut ctx = StrategyContext {
                    data: &data,
                    indicators: &registry,
                    cache: &mut cache,
                    position: &position,
                };
                strategy
                    .process_data(&bar(i as u32, *close), &mut ctx)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn rejects_inverted_windows() {
        let config =
            FileConfigAdapter::from_string("[strategy]\nfast_window = 20\nslow_window = 5\n")
                .unwrap();
        let mut strategy = SmaCrossoverStrategy::new();
        assert!(strategy.initialize(&config).is_err());
    }

    #[test]
    fn silent_until_slow_window_fills() {
        let mut strategy = init("[strategy]\nfast_window = 2\nslow_window = 4\n");
        let signals = feed(&mut strategy, &[100.0, 101.0, 102.0], false);
        assert!(signals.iter().all(|s| s.is_empty()));
    }

    #[test]
    fn golden_cross_emits_buy() {
        let mut strategy = init("[strategy]\nfast_window = 2\nslow_window = 4\n");
        // Decline establishes fast below slow, then a rally crosses it above.
        let signals = feed(
            &mut strategy,
            &[110.0, 108.0, 106.0, 104.0, 102.0, 100.0, 120.0, 140.0],
            false,
        );
        let buys: Vec<&ExecuteOrder> = signals
            .iter()
            .flatten()
            .filter(|o| o.side == Side::Buy)
            .collect();
        assert_eq!(buys.len(), 1);
        assert_eq!(buys[0].reason.code, "golden-cross");
        assert_eq!(buys[0].symbol, "AAPL");
    }

    #[test]
    fn death_cross_emits_sell_only_when_holding() {
        let closes = [
            100.0, 102.0, 104.0, 106.0, 108.0, 110.0, 90.0, 70.0, 60.0,
        ];

        let mut holding = init("[strategy]\nfast_window = 2\nslow_window = 4\n");
        let signals = feed(&mut holding, &closes, true);
        let sells = signals
            .iter()
            .flatten()
            .filter(|o| o.side == Side::Sell)
            .count();
        assert_eq!(sells, 1);

        let mut flat = init("[strategy]\nfast_window = 2\nslow_window = 4\n");
        let signals = feed(&mut flat, &closes, false);
        assert!(signals.iter().flatten().all(|o| o.side != Side::Sell));
    }

    #[test]
    fn no_repeat_signal_without_a_new_cross() {
        let mut strategy = init("[strategy]\nfast_window = 2\nslow_window = 4\n");
        // After the cross, the fast mean stays above: one signal only.
        let signals = feed(
            &mut strategy,
            &[110.0, 108.0, 106.0, 104.0, 102.0, 120.0, 140.0, 160.0, 180.0],
            false,
        );
        assert_eq!(signals.iter().flatten().count(), 1);
    }

    #[test]
    fn factory_lookup() {
        assert!(factory_by_name(SMA_CROSSOVER).is_some());
        assert!(factory_by_name("momentum").is_none());
        assert_eq!(builtin_names(), vec![SMA_CROSSOVER]);
    }

    #[test]
    fn factory_creates_independent_instances() {
        let factory = SmaCrossoverFactory;
        let a = factory.create();
        let b = factory.create();
        assert_eq!(a.name(), b.name());
    }
}
