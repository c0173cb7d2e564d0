//! Domain error types.
//!
//! Four failure classes with distinct blast radii: configuration errors fail
//! fast before any run starts; data-access, ledger, and strategy errors abort
//! only the run they occur in and are collected centrally by the coordinator.

/// A parse error with position information for commission expressions.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Identifies one (strategy, config, data) combination in error output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLabel {
    pub strategy: String,
    pub config_path: String,
    pub data_path: String,
}

impl std::fmt::Display for RunLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} / {}",
            self.strategy, self.config_path, self.data_path
        )
    }
}

/// One failed run: which triple, and why.
#[derive(Debug, thiserror::Error)]
#[error("run [{label}] failed: {source}")]
pub struct RunFailure {
    pub label: RunLabel,
    #[source]
    pub source: EngineError,
}

/// Top-level error type for quantreplay.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("invalid commission expression: {0}")]
    CommissionParse(#[from] ParseError),

    #[error("commission evaluation failed for order on {symbol}: {reason}")]
    CommissionEval { symbol: String, reason: String },

    #[error("data source error: {reason}")]
    DataAccess { reason: String },

    #[error("ledger error: {reason}")]
    Ledger { reason: String },

    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("strategy '{strategy}' error: {reason}")]
    Strategy { strategy: String, reason: String },

    #[error("{} run(s) failed:\n{}", .0.len(), format_failures(.0))]
    RunsFailed(Vec<RunFailure>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[RunFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl EngineError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        EngineError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn data_access(reason: impl Into<String>) -> Self {
        EngineError::DataAccess {
            reason: reason.into(),
        }
    }

    pub fn ledger(reason: impl Into<String>) -> Self {
        EngineError::Ledger {
            reason: reason.into(),
        }
    }
}

impl From<&EngineError> for std::process::ExitCode {
    fn from(err: &EngineError) -> Self {
        let code: u8 = match err {
            EngineError::Io(_) => 1,
            EngineError::Configuration { .. } | EngineError::CommissionParse(_) => 2,
            EngineError::DataAccess { .. } => 3,
            EngineError::Ledger { .. }
            | EngineError::OrderRejected { .. }
            | EngineError::CommissionEval { .. } => 4,
            EngineError::Strategy { .. } => 5,
            EngineError::RunsFailed(_) => 6,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display_with_context() {
        let err = ParseError {
            message: "unexpected ')'".into(),
            position: 4,
        };
        let shown = err.display_with_context("1 + )");
        assert!(shown.contains("1 + )"));
        assert!(shown.contains("    ^"));
        assert!(shown.contains("position 4"));
    }

    #[test]
    fn runs_failed_names_every_triple() {
        let failures = vec![
            RunFailure {
                label: RunLabel {
                    strategy: "sma-crossover".into(),
                    config_path: "a.ini".into(),
                    data_path: "spy.csv".into(),
                },
                source: EngineError::data_access("file missing"),
            },
            RunFailure {
                label: RunLabel {
                    strategy: "sma-crossover".into(),
                    config_path: "b.ini".into(),
                    data_path: "qqq.csv".into(),
                },
                source: EngineError::ledger("disk full"),
            },
        ];
        let err = EngineError::RunsFailed(failures);
        let msg = err.to_string();
        assert!(msg.contains("2 run(s) failed"));
        assert!(msg.contains("a.ini"));
        assert!(msg.contains("spy.csv"));
        assert!(msg.contains("b.ini"));
        assert!(msg.contains("qqq.csv"));
    }

    #[test]
    fn exit_code_mapping() {
        let err = EngineError::configuration("bad broker");
        let code: std::process::ExitCode = (&err).into();
        assert_eq!(format!("{:?}", code), format!("{:?}", std::process::ExitCode::from(2)));
    }
}
