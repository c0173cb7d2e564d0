//! Run progress reporting port.

use crate::domain::error::RunLabel;

/// Receives progress events from concurrent runs. Implementations must be
/// safe to call from multiple worker threads at once.
pub trait ProgressSink: Send + Sync {
    fn run_started(&self, label: &RunLabel, total_bars: usize);
    fn run_advanced(&self, label: &RunLabel, processed_bars: usize);
    fn run_finished(&self, label: &RunLabel, succeeded: bool);
}

/// Discards all progress events.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn run_started(&self, _label: &RunLabel, _total_bars: usize) {}
    fn run_advanced(&self, _label: &RunLabel, _processed_bars: usize) {}
    fn run_finished(&self, _label: &RunLabel, _succeeded: bool) {}
}
