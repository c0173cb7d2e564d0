//! CLI definition and dispatch.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::sqlite_data_adapter::SqliteDataAdapter;
use crate::domain::config::EngineConfig;
use crate::domain::coordinator::{DataSourceFactory, RunConfig, RunCoordinator};
use crate::domain::error::EngineError;
use crate::domain::strategy::{builtin_names, factory_by_name};
use crate::ports::data_port::DataSource;

#[derive(Parser, Debug)]
#[command(name = "quantreplay", about = "Concurrent market data replay backtester")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every strategy x config x data combination
    Backtest {
        /// Built-in strategy name, repeatable
        #[arg(short, long = "strategy", required = true)]
        strategies: Vec<String>,
        /// Engine configuration file, repeatable
        #[arg(short, long = "config", required = true)]
        configs: Vec<PathBuf>,
        /// CSV data file or directory of CSV files, repeatable
        #[arg(short, long = "data", required = true)]
        data: Vec<PathBuf>,
        /// Directory for result exports
        #[arg(short, long, default_value = "results")]
        results: PathBuf,
        /// Override the worker thread bound from configuration
        #[arg(long)]
        max_parallelism: Option<usize>,
    },
    /// Check configuration files without running anything
    ValidateConfig {
        #[arg(required = true)]
        configs: Vec<PathBuf>,
    },
    /// List built-in strategies
    ListStrategies,
}

pub fn run(cli: Cli) -> ExitCode {
    init_tracing();

    match cli.command {
        Command::Backtest {
            strategies,
            configs,
            data,
            results,
            max_parallelism,
        } => run_backtest(&strategies, &configs, &data, &results, max_parallelism),
        Command::ValidateConfig { configs } => run_validate_config(&configs),
        Command::ListStrategies => {
            for name in builtin_names() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_backtest(
    strategies: &[String],
    configs: &[PathBuf],
    data: &[PathBuf],
    results: &Path,
    max_parallelism: Option<usize>,
) -> ExitCode {
    match build_and_run(strategies, configs, data, results, max_parallelism) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(&err)
        }
    }
}

fn build_and_run(
    strategies: &[String],
    configs: &[PathBuf],
    data: &[PathBuf],
    results: &Path,
    max_parallelism: Option<usize>,
) -> Result<(), EngineError> {
    let mut coordinator = RunCoordinator::new()
        .set_results_dir(results)
        .set_data_paths(expand_data_paths(data)?)
        .set_data_source_factory(csv_data_source_factory());

    for name in strategies {
        let factory = factory_by_name(name).ok_or_else(|| {
            EngineError::configuration(format!(
                "unknown strategy '{name}' (available: {})",
                builtin_names().join(", ")
            ))
        })?;
        coordinator = coordinator.add_strategy(factory);
    }

    for path in configs {
        coordinator = coordinator.add_config(load_run_config(path)?);
    }

    if let Some(workers) = max_parallelism {
        coordinator = coordinator.set_max_parallelism(workers);
    }

    let summary = coordinator.run()?;
    info!(
        total = summary.total,
        completed = summary.completed,
        cancelled = summary.cancelled,
        "all runs finished"
    );
    Ok(())
}

fn run_validate_config(configs: &[PathBuf]) -> ExitCode {
    for path in configs {
        match load_run_config(path) {
            Ok(_) => println!("{}: ok", path.display()),
            Err(err) => {
                eprintln!("{}: {err}", path.display());
                return ExitCode::from(&err);
            }
        }
    }
    ExitCode::SUCCESS
}

/// Load and fully validate one configuration file, including commission
/// expression compilation.
pub fn load_run_config(path: &Path) -> Result<RunConfig, EngineError> {
    let settings = FileConfigAdapter::from_file(path).map_err(|e| {
        EngineError::configuration(format!("{}: {e}", path.display()))
    })?;
    let settings = Arc::new(settings);
    let engine = EngineConfig::from_config(settings.as_ref())
        .map_err(|e| EngineError::configuration(format!("{}: {e}", path.display())))?;
    let commission = engine
        .resolve_commission()
        .map_err(|e| EngineError::configuration(format!("{}: {e}", path.display())))?;
    Ok(RunConfig {
        path: path.to_path_buf(),
        engine,
        commission,
        settings,
    })
}

/// Expand directories into their CSV files; plain files pass through.
pub fn expand_data_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, EngineError> {
    let mut expanded = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(path)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| {
                    p.is_file()
                        && p.extension()
                            .map(|e| e.eq_ignore_ascii_case("csv"))
                            .unwrap_or(false)
                })
                .collect();
            files.sort();
            if files.is_empty() {
                return Err(EngineError::configuration(format!(
                    "no CSV files in directory {}",
                    path.display()
                )));
            }
            expanded.extend(files);
        } else {
            expanded.push(path.clone());
        }
    }
    Ok(expanded)
}

fn csv_data_source_factory() -> DataSourceFactory {
    Arc::new(|path: &Path| {
        Ok(Box::new(SqliteDataAdapter::from_csv(path)?) as Box<dyn DataSource>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn expand_data_paths_collects_csv_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.csv", "notes.txt"] {
            let mut f = fs::File::create(dir.path().join(name)).unwrap();
            writeln!(f, "x").unwrap();
        }

        let expanded = expand_data_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(expanded.len(), 2);
        assert!(expanded[0].ends_with("a.csv"));
        assert!(expanded[1].ends_with("b.csv"));
    }

    #[test]
    fn expand_data_paths_rejects_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(expand_data_paths(&[dir.path().to_path_buf()]).is_err());
    }

    #[test]
    fn expand_data_paths_passes_files_through() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expanded = expand_data_paths(&[file.path().to_path_buf()]).unwrap();
        assert_eq!(expanded, vec![file.path().to_path_buf()]);
    }

    #[test]
    fn load_run_config_full_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[engine]\ninitial_capital = 10000\nbroker = interactive_broker\n"
        )
        .unwrap();
        let config = load_run_config(file.path()).unwrap();
        assert_eq!(config.engine.initial_capital, 10000.0);
    }

    #[test]
    fn load_run_config_reports_file_in_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[engine]\ninitial_capital = -5\n").unwrap();
        let err = load_run_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("initial_capital"));
    }

    #[test]
    fn cli_parses_backtest_command() {
        let cli = Cli::try_parse_from([
            "quantreplay",
            "backtest",
            "--strategy",
            "sma-crossover",
            "--config",
            "a.ini",
            "--data",
            "data.csv",
        ])
        .unwrap();
        match cli.command {
            Command::Backtest {
                strategies,
                configs,
                data,
                results,
                max_parallelism,
            } => {
                assert_eq!(strategies, vec!["sma-crossover"]);
                assert_eq!(configs, vec![PathBuf::from("a.ini")]);
                assert_eq!(data, vec![PathBuf::from("data.csv")]);
                assert_eq!(results, PathBuf::from("results"));
                assert!(max_parallelism.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
