//! Concurrent run orchestration.
//!
//! A backtest session is the cartesian product of strategies, configuration
//! files, and data files. Each (strategy, config, data) triple is one run
//! with fully private state: its own ledger, balance, data source pass, and
//! strategy instance. Runs execute on a bounded thread pool; failures are
//! collected over a channel sized to the triple count and reported together
//! after every run has finished, so one bad run never takes down its
//! siblings.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::domain::commission::{CommissionModel, FeeInput};
use crate::domain::config::EngineConfig;
use crate::domain::error::{EngineError, RunFailure, RunLabel};
use crate::domain::indicator::{IndicatorCache, IndicatorRegistry};
use crate::domain::ledger::PositionLedger;
use crate::domain::market::{Bar, ExecuteOrder, Order, Side};
use crate::domain::sizing;
use crate::domain::stats;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataSource;
use crate::ports::progress_port::{NoopProgress, ProgressSink};
use crate::ports::strategy_port::{StrategyContext, StrategyFactory};

/// Builds a fresh data source per run so concurrent runs never share read
/// cursors or connections.
pub type DataSourceFactory =
    Arc<dyn Fn(&Path) -> Result<Box<dyn DataSource>, EngineError> + Send + Sync>;

/// One loaded and validated configuration file.
pub struct RunConfig {
    pub path: PathBuf,
    pub engine: EngineConfig,
    pub commission: CommissionModel,
    pub settings: Arc<dyn ConfigPort + Send + Sync>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("path", &self.path)
            .field("engine", &self.engine)
            .field("commission", &self.commission)
            .finish_non_exhaustive()
    }
}

/// Outcome of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub cancelled: usize,
}

enum RunOutcome {
    Completed,
    Cancelled,
}

pub struct RunCoordinator {
    strategies: Vec<Arc<dyn StrategyFactory>>,
    configs: Vec<Arc<RunConfig>>,
    data_paths: Vec<PathBuf>,
    results_dir: PathBuf,
    data_source_factory: Option<DataSourceFactory>,
    /// Built once, lent read-only to every run.
    registry: IndicatorRegistry,
    progress: Arc<dyn ProgressSink>,
    cancel: Arc<AtomicBool>,
    max_parallelism: Option<usize>,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            configs: Vec::new(),
            data_paths: Vec::new(),
            results_dir: PathBuf::from("results"),
            data_source_factory: None,
            registry: IndicatorRegistry::with_defaults(),
            progress: Arc::new(NoopProgress),
            cancel: Arc::new(AtomicBool::new(false)),
            max_parallelism: None,
        }
    }

    pub fn add_strategy(mut self, factory: Arc<dyn StrategyFactory>) -> Self {
        self.strategies.push(factory);
        self
    }

    pub fn add_config(mut self, config: RunConfig) -> Self {
        self.configs.push(Arc::new(config));
        self
    }

    pub fn set_data_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.data_paths = paths;
        self
    }

    pub fn set_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn set_data_source_factory(mut self, factory: DataSourceFactory) -> Self {
        self.data_source_factory = Some(factory);
        self
    }

    /// Replace the default indicator set shared by every run.
    pub fn set_indicator_registry(mut self, registry: IndicatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn set_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Override the worker bound from configuration.
    pub fn set_max_parallelism(mut self, workers: usize) -> Self {
        self.max_parallelism = Some(workers);
        self
    }

    /// Flag shared with the workers; set it to stop the session early.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn validate(&self) -> Result<&DataSourceFactory, EngineError> {
        if self.strategies.is_empty() {
            return Err(EngineError::configuration("no strategies to run"));
        }
        if self.configs.is_empty() {
            return Err(EngineError::configuration("no configuration files to run"));
        }
        if self.data_paths.is_empty() {
            return Err(EngineError::configuration("no data files to run"));
        }
        for path in &self.data_paths {
            if !path.is_file() {
                return Err(EngineError::configuration(format!(
                    "data file not found: {}",
                    path.display()
                )));
            }
        }
        self.data_source_factory
            .as_ref()
            .ok_or_else(|| EngineError::configuration("no data source factory installed"))
    }

    /// Effective worker bound: explicit override first, then the smallest
    /// non-zero bound any configuration asks for, else one per core.
    fn worker_bound(&self) -> usize {
        if let Some(workers) = self.max_parallelism {
            return workers.max(1);
        }
        self.configs
            .iter()
            .map(|c| c.engine.max_parallelism)
            .filter(|&w| w > 0)
            .min()
            .unwrap_or(0)
    }

    /// Execute every (strategy, config, data) triple and wait for all of
    /// them. Failed runs are reported together after the rest completed.
    pub fn run(&self) -> Result<RunSummary, EngineError> {
        let factory = self.validate()?;

        let mut tasks = Vec::new();
        for strategy in &self.strategies {
            for config in &self.configs {
                for data_path in &self.data_paths {
                    tasks.push((
                        Arc::clone(strategy),
                        Arc::clone(config),
                        data_path.clone(),
                    ));
                }
            }
        }

        info!(
            runs = tasks.len(),
            strategies = self.strategies.len(),
            configs = self.configs.len(),
            data_files = self.data_paths.len(),
            "starting backtest session"
        );

        let mut builder = rayon::ThreadPoolBuilder::new();
        if self.worker_bound() > 0 {
            builder = builder.num_threads(self.worker_bound());
        }
        let pool = builder
            .build()
            .map_err(|e| EngineError::configuration(e.to_string()))?;

        // Bounded to the triple count so no sender can ever block.
        let (failure_tx, failure_rx) = mpsc::sync_channel::<RunFailure>(tasks.len());
        let total = tasks.len();
        let completed = AtomicUsize::new(0);
        let cancelled = AtomicUsize::new(0);

        pool.scope(|scope| {
            for (strategy, config, data_path) in &tasks {
                let failure_tx = failure_tx.clone();
                let completed = &completed;
                let cancelled = &cancelled;
                scope.spawn(move |_| {
                    let label = RunLabel {
                        strategy: strategy.name().to_string(),
                        config_path: config.path.display().to_string(),
                        data_path: data_path.display().to_string(),
                    };

                    if self.cancel.load(Ordering::Relaxed) {
                        cancelled.fetch_add(1, Ordering::Relaxed);
                        self.progress.run_finished(&label, false);
                        return;
                    }

                    match self.execute_run(factory, strategy, config, data_path, &label) {
                        Ok(RunOutcome::Completed) => {
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(RunOutcome::Cancelled) => {
                            cancelled.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(source) => {
                            error!(run = %label, error = %source, "run failed");
                            // Channel capacity equals the task count, send
                            // cannot fail while the receiver is alive.
                            let _ = failure_tx.send(RunFailure { label, source });
                        }
                    }
                });
            }
        });
        drop(failure_tx);

        let failures: Vec<RunFailure> = failure_rx.into_iter().collect();
        let summary = RunSummary {
            total,
            completed: completed.into_inner(),
            cancelled: cancelled.into_inner(),
        };

        if failures.is_empty() {
            info!(
                total = summary.total,
                completed = summary.completed,
                cancelled = summary.cancelled,
                "backtest session finished"
            );
            Ok(summary)
        } else {
            Err(EngineError::RunsFailed(failures))
        }
    }

    fn execute_run(
        &self,
        factory: &DataSourceFactory,
        strategy_factory: &Arc<dyn StrategyFactory>,
        config: &Arc<RunConfig>,
        data_path: &Path,
        label: &RunLabel,
    ) -> Result<RunOutcome, EngineError> {
        let data = factory(data_path)?;
        let total_bars = data.count(config.engine.start_time, config.engine.end_time)?;
        self.progress.run_started(label, total_bars);
        debug!(run = %label, bars = total_bars, "run started");

        let mut strategy = strategy_factory.create();
        strategy.initialize(config.settings.as_ref())?;

        let ledger = PositionLedger::new(strategy.name())?;
        let mut cache = IndicatorCache::new();
        let mut balance = config.engine.initial_capital;

        let mut processed = 0usize;
        for bar in data.read_all(config.engine.start_time, config.engine.end_time)? {
            if self.cancel.load(Ordering::Relaxed) {
                self.progress.run_finished(label, false);
                return Ok(RunOutcome::Cancelled);
            }

            let bar = bar?;
            let position = ledger.get_position(&bar.symbol)?;

            let intents = {
                let mut ctx = StrategyContext {
                    data: data.as_ref(),
                    indicators: &self.registry,
                    cache: &mut cache,
                    position: &position,
                };
                strategy
                    .process_data(&bar, &mut ctx)
                    .map_err(|e| EngineError::Strategy {
                        strategy: strategy.name().to_string(),
                        reason: e.to_string(),
                    })?
            };

            for intent in intents {
                balance = self.execute_intent(&ledger, &config.commission, balance, &bar, &intent)?;
            }

            processed += 1;
            self.progress.run_advanced(label, processed);
        }

        let run_stats = ledger.get_stats(data.as_ref(), config.engine.initial_capital)?;
        let result_dir = self.result_dir(label, config);
        ledger.write(&result_dir)?;
        stats::write_stats_csv(&result_dir, &run_stats)?;
        ledger.cleanup()?;

        self.progress.run_finished(label, true);
        info!(run = %label, results = %result_dir.display(), "run completed");
        Ok(RunOutcome::Completed)
    }

    /// Size, price, and settle one intent. Returns the new cash balance.
    fn execute_intent(
        &self,
        ledger: &PositionLedger,
        commission: &CommissionModel,
        balance: f64,
        bar: &Bar,
        intent: &ExecuteOrder,
    ) -> Result<f64, EngineError> {
        let price = bar.execution_price();
        let held = ledger.get_position(&intent.symbol)?;

        let quantity = match intent.side {
            Side::Buy => {
                // One open position per symbol at a time.
                if held.is_open() {
                    return Ok(balance);
                }
                sizing::max_quantity(balance, price, commission, &intent.symbol, Side::Buy)? as f64
            }
            Side::Sell => {
                if !held.is_open() {
                    return Ok(balance);
                }
                held.quantity
            }
        };
        if quantity <= 0.0 {
            return Ok(balance);
        }

        let fee = commission.calculate(&FeeInput {
            quantity,
            price,
            symbol: &intent.symbol,
            side: intent.side,
        })?;

        let order = Order {
            id: None,
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity,
            price,
            time: bar.time,
            strategy_name: ledger.strategy_name().to_string(),
            reason: intent.reason.clone(),
            fee,
        };

        ledger.update(std::slice::from_ref(&order)).map_err(|e| e.source)?;

        Ok(match intent.side {
            Side::Buy => balance - (quantity * price + fee),
            Side::Sell => balance + (quantity * price - fee),
        })
    }

    /// `<results>/<strategy>/<config stem>[/<start>_<end>]/<data stem>`
    fn result_dir(&self, label: &RunLabel, config: &RunConfig) -> PathBuf {
        let stem = |path: &Path| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string())
        };

        let mut dir = self
            .results_dir
            .join(&label.strategy)
            .join(stem(&config.path));

        if config.engine.start_time.is_some() || config.engine.end_time.is_some() {
            let fmt = |t: Option<chrono::DateTime<chrono::Utc>>| {
                t.map(|t| t.format("%Y%m%dT%H%M%S").to_string())
                    .unwrap_or_else(|| "open".to_string())
            };
            dir = dir.join(format!(
                "{}_{}",
                fmt(config.engine.start_time),
                fmt(config.engine.end_time)
            ));
        }

        dir.join(stem(Path::new(&label.data_path)))
    }
}

impl Default for RunCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use crate::adapters::sqlite_data_adapter::SqliteDataAdapter;
    use crate::domain::strategy::SmaCrossoverFactory;

    fn run_config(content: &str) -> RunConfig {
        let settings = Arc::new(FileConfigAdapter::from_string(content).unwrap());
        let engine = EngineConfig::from_config(settings.as_ref()).unwrap();
        let commission = engine.resolve_commission().unwrap();
        RunConfig {
            path: PathBuf::from("test.ini"),
            engine,
            commission,
            settings,
        }
    }

    fn csv_factory() -> DataSourceFactory {
        Arc::new(|path: &Path| {
            Ok(Box::new(SqliteDataAdapter::from_csv(path)?) as Box<dyn DataSource>)
        })
    }

    #[test]
    fn run_requires_strategies_configs_and_data() {
        let coordinator = RunCoordinator::new().set_data_source_factory(csv_factory());
        assert!(coordinator.run().is_err());

        let coordinator = RunCoordinator::new()
            .add_strategy(Arc::new(SmaCrossoverFactory))
            .set_data_source_factory(csv_factory());
        assert!(coordinator.run().is_err());
    }

    #[test]
    fn run_rejects_missing_data_file() {
        let coordinator = RunCoordinator::new()
            .add_strategy(Arc::new(SmaCrossoverFactory))
            .add_config(run_config("[engine]\ninitial_capital = 10000\n"))
            .set_data_paths(vec![PathBuf::from("/nonexistent/data.csv")])
            .set_data_source_factory(csv_factory());
        let err = coordinator.run().unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn worker_bound_prefers_explicit_override() {
        let coordinator = RunCoordinator::new()
            .add_config(run_config(
                "[engine]\ninitial_capital = 1\nmax_parallelism = 8\n",
            ))
            .set_max_parallelism(2);
        assert_eq!(coordinator.worker_bound(), 2);
    }

    #[test]
    fn worker_bound_takes_smallest_config_bound() {
        let coordinator = RunCoordinator::new()
            .add_config(run_config(
                "[engine]\ninitial_capital = 1\nmax_parallelism = 8\n",
            ))
            .add_config(run_config(
                "[engine]\ninitial_capital = 1\nmax_parallelism = 3\n",
            ))
            .add_config(run_config("[engine]\ninitial_capital = 1\n"));
        assert_eq!(coordinator.worker_bound(), 3);
    }

    #[test]
    fn indicator_registry_is_built_once_and_replaceable() {
        use crate::domain::indicator::IndicatorKind;

        let coordinator = RunCoordinator::new();
        assert!(coordinator.registry.get(IndicatorKind::Ema).is_some());

        let mut custom = IndicatorRegistry::new();
        custom.register(Box::new(crate::domain::indicator::Rsi::new(7)));
        let coordinator = coordinator.set_indicator_registry(custom);
        assert!(coordinator.registry.get(IndicatorKind::Ema).is_none());
        assert!(coordinator.registry.get(IndicatorKind::Rsi).is_some());
    }

    #[test]
    fn balance_round_trips_through_buy_and_sell() {
        use crate::domain::ledger::PositionLedger;
        use crate::domain::market::{Bar, ExecuteOrder, Reason, Side};
        use chrono::TimeZone;

        let coordinator = RunCoordinator::new();
        let ledger = PositionLedger::new("test").unwrap();
        let commission = CommissionModel::Zero;

        let bar = |minute: u32, mid: f64| Bar {
            symbol: "AAPL".into(),
            time: chrono::Utc
                .with_ymd_and_hms(2024, 1, 2, 10, minute, 0)
                .unwrap(),
            open: mid,
            high: mid + 1.0,
            low: mid - 1.0,
            close: mid,
            volume: 100.0,
        };
        let intent = |side: Side| ExecuteOrder {
            symbol: "AAPL".into(),
            side,
            reason: Reason::default(),
        };

        // 1000 buys exactly 10 shares at the 100.0 midpoint.
        let balance = coordinator
            .execute_intent(&ledger, &commission, 1000.0, &bar(0, 100.0), &intent(Side::Buy))
            .unwrap();
        assert_eq!(balance, 0.0);
        assert_eq!(ledger.get_position("AAPL").unwrap().quantity, 10.0);

        // A second buy is skipped while the position is open.
        let balance = coordinator
            .execute_intent(&ledger, &commission, balance, &bar(1, 100.0), &intent(Side::Buy))
            .unwrap();
        assert_eq!(balance, 0.0);

        // Selling the full holding at 110 realizes 100.
        let balance = coordinator
            .execute_intent(&ledger, &commission, balance, &bar(2, 110.0), &intent(Side::Sell))
            .unwrap();
        assert_eq!(balance, 1100.0);

        let trades = ledger.get_all_trades().unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].pnl, 0.0);
        assert_eq!(trades[1].pnl, 100.0);

        // A sell with nothing held is skipped.
        let balance = coordinator
            .execute_intent(&ledger, &commission, balance, &bar(3, 110.0), &intent(Side::Sell))
            .unwrap();
        assert_eq!(balance, 1100.0);
    }

    #[test]
    fn result_dir_includes_window_when_bounded() {
        let coordinator = RunCoordinator::new().set_results_dir("/tmp/results");
        let label = RunLabel {
            strategy: "sma-crossover".into(),
            config_path: "configs/fast.ini".into(),
            data_path: "data/spy.csv".into(),
        };

        let unbounded = run_config("[engine]\ninitial_capital = 1\n");
        let dir = coordinator.result_dir(&label, &unbounded);
        assert_eq!(
            dir,
            PathBuf::from("/tmp/results/sma-crossover/test/spy")
        );

        let bounded = run_config(
            "[engine]\ninitial_capital = 1\n\
             start_time = 2024-01-01\nend_time = 2024-06-30\n",
        );
        let dir = coordinator.result_dir(&label, &bounded);
        assert_eq!(
            dir,
            PathBuf::from(
                "/tmp/results/sma-crossover/test/20240101T000000_20240630T000000/spy"
            )
        );
    }
}
