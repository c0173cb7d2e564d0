//! Streaming technical indicators.
//!
//! Indicators are incremental: each bar advances a per-(kind, symbol) state
//! slot held in [`IndicatorCache`] and yields the current value. The registry
//! is built explicitly by the caller; there is no global instance, so
//! concurrent runs can hold independent registries and caches.

use std::collections::{HashMap, VecDeque};

use crate::domain::error::EngineError;
use crate::domain::market::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Ema,
    Rsi,
    Macd,
    BollingerBands,
    Atr,
    RangeFilter,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Ema => "ema",
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Macd => "macd",
            IndicatorKind::BollingerBands => "bollinger_bands",
            IndicatorKind::Atr => "atr",
            IndicatorKind::RangeFilter => "range_filter",
        }
    }
}

/// The value an indicator yields for one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Scalar(f64),
    Macd {
        macd: f64,
        signal: f64,
        histogram: f64,
    },
    Bands {
        upper: f64,
        middle: f64,
        lower: f64,
    },
    Filter {
        value: f64,
        upper: f64,
        lower: f64,
    },
}

impl IndicatorValue {
    /// The primary scalar of the value, for strategies that only need one
    /// number per bar.
    pub fn primary(&self) -> f64 {
        match self {
            IndicatorValue::Scalar(v) => *v,
            IndicatorValue::Macd { macd, .. } => *macd,
            IndicatorValue::Bands { middle, .. } => *middle,
            IndicatorValue::Filter { value, .. } => *value,
        }
    }
}

/// Per-(kind, symbol) incremental state. Tagged by indicator kind so a slot
/// can never be reinterpreted as state for a different indicator.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheSlot {
    Ema {
        value: f64,
    },
    Rsi {
        avg_gain: f64,
        avg_loss: f64,
        prev_close: f64,
    },
    Macd {
        fast_ema: f64,
        slow_ema: f64,
        signal_ema: f64,
    },
    BollingerBands {
        window: VecDeque<f64>,
    },
    Atr {
        value: f64,
        prev_close: f64,
    },
    RangeFilter {
        filter: f64,
        smooth_range: f64,
        prev_source: f64,
    },
}

impl CacheSlot {
    pub fn kind(&self) -> IndicatorKind {
        match self {
            CacheSlot::Ema { .. } => IndicatorKind::Ema,
            CacheSlot::Rsi { .. } => IndicatorKind::Rsi,
            CacheSlot::Macd { .. } => IndicatorKind::Macd,
            CacheSlot::BollingerBands { .. } => IndicatorKind::BollingerBands,
            CacheSlot::Atr { .. } => IndicatorKind::Atr,
            CacheSlot::RangeFilter { .. } => IndicatorKind::RangeFilter,
        }
    }
}

/// A streaming indicator. `advance` consumes the previous slot for this
/// (kind, symbol) and returns the successor state plus the current value.
pub trait Indicator: Send + Sync {
    fn kind(&self) -> IndicatorKind;

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError>;
}

/// Explicitly-built collection of indicators available to strategies.
#[derive(Default)]
pub struct IndicatorRegistry {
    indicators: HashMap<IndicatorKind, Box<dyn Indicator>>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in indicator at default parameters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(Ema::new(20)));
        registry.register(Box::new(Rsi::new(14)));
        registry.register(Box::new(Macd::new(12, 26, 9)));
        registry.register(Box::new(BollingerBands::new(20, 2.0)));
        registry.register(Box::new(Atr::new(14)));
        registry.register(Box::new(RangeFilter::new(14, 2.0)));
        registry
    }

    /// Register an indicator, replacing any existing one of the same kind.
    pub fn register(&mut self, indicator: Box<dyn Indicator>) {
        self.indicators.insert(indicator.kind(), indicator);
    }

    pub fn get(&self, kind: IndicatorKind) -> Option<&dyn Indicator> {
        self.indicators.get(&kind).map(|b| b.as_ref())
    }

    pub fn kinds(&self) -> Vec<IndicatorKind> {
        self.indicators.keys().copied().collect()
    }
}

/// Holds incremental indicator state per (kind, symbol) within one run.
#[derive(Default)]
pub struct IndicatorCache {
    slots: HashMap<(IndicatorKind, String), CacheSlot>,
}

impl IndicatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: IndicatorKind, symbol: &str) -> Option<&CacheSlot> {
        self.slots.get(&(kind, symbol.to_string()))
    }

    /// Feed one bar through `indicator`, updating the slot for the bar's
    /// symbol and returning the current value.
    pub fn advance(
        &mut self,
        indicator: &dyn Indicator,
        bar: &Bar,
    ) -> Result<IndicatorValue, EngineError> {
        let key = (indicator.kind(), bar.symbol.clone());
        let (next, value) = indicator.advance(self.slots.get(&key), bar)?;
        self.slots.insert(key, next);
        Ok(value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

fn ema_step(prev: f64, sample: f64, period: usize) -> f64 {
    let alpha = 2.0 / (period as f64 + 1.0);
    prev + alpha * (sample - prev)
}

fn check_period(period: usize) -> usize {
    period.max(1)
}

/// Exponential moving average of the close.
pub struct Ema {
    period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period: check_period(period),
        }
    }
}

impl Indicator for Ema {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::Ema
    }

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError> {
        let value = match prev {
            Some(CacheSlot::Ema { value }) => ema_step(*value, bar.close, self.period),
            _ => bar.close,
        };
        Ok((CacheSlot::Ema { value }, IndicatorValue::Scalar(value)))
    }
}

/// Relative strength index with Wilder smoothing. Yields 50 until a price
/// change has been observed.
pub struct Rsi {
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: check_period(period),
        }
    }
}

impl Indicator for Rsi {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::Rsi
    }

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError> {
        let (avg_gain, avg_loss) = match prev {
            Some(CacheSlot::Rsi {
                avg_gain,
                avg_loss,
                prev_close,
            }) => {
                let change = bar.close - prev_close;
                let gain = change.max(0.0);
                let loss = (-change).max(0.0);
                let alpha = 1.0 / self.period as f64;
                (
                    avg_gain + alpha * (gain - avg_gain),
                    avg_loss + alpha * (loss - avg_loss),
                )
            }
            _ => (0.0, 0.0),
        };

        let value = if avg_gain + avg_loss > 0.0 {
            100.0 * avg_gain / (avg_gain + avg_loss)
        } else {
            50.0
        };

        Ok((
            CacheSlot::Rsi {
                avg_gain,
                avg_loss,
                prev_close: bar.close,
            },
            IndicatorValue::Scalar(value),
        ))
    }
}

/// Moving average convergence/divergence over the close.
pub struct Macd {
    fast: usize,
    slow: usize,
    signal: usize,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: check_period(fast),
            slow: check_period(slow),
            signal: check_period(signal),
        }
    }
}

impl Indicator for Macd {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::Macd
    }

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError> {
        let (fast_ema, slow_ema, prev_signal) = match prev {
            Some(CacheSlot::Macd {
                fast_ema,
                slow_ema,
                signal_ema,
            }) => (
                ema_step(*fast_ema, bar.close, self.fast),
                ema_step(*slow_ema, bar.close, self.slow),
                Some(*signal_ema),
            ),
            _ => (bar.close, bar.close, None),
        };

        let macd = fast_ema - slow_ema;
        let signal_ema = match prev_signal {
            Some(prev) => ema_step(prev, macd, self.signal),
            None => macd,
        };

        Ok((
            CacheSlot::Macd {
                fast_ema,
                slow_ema,
                signal_ema,
            },
            IndicatorValue::Macd {
                macd,
                signal: signal_ema,
                histogram: macd - signal_ema,
            },
        ))
    }
}

/// Bollinger bands: simple moving average of the close with bands at
/// `k` population standard deviations.
pub struct BollingerBands {
    period: usize,
    k: f64,
}

impl BollingerBands {
    pub fn new(period: usize, k: f64) -> Self {
        Self {
            period: check_period(period),
            k,
        }
    }
}

impl Indicator for BollingerBands {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::BollingerBands
    }

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError> {
        let mut window = match prev {
            Some(CacheSlot::BollingerBands { window }) => window.clone(),
            _ => VecDeque::with_capacity(self.period),
        };
        window.push_back(bar.close);
        while window.len() > self.period {
            window.pop_front();
        }

        let n = window.len() as f64;
        let middle = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / n;
        let spread = self.k * variance.sqrt();

        Ok((
            CacheSlot::BollingerBands { window },
            IndicatorValue::Bands {
                upper: middle + spread,
                middle,
                lower: middle - spread,
            },
        ))
    }
}

/// Average true range with Wilder smoothing.
pub struct Atr {
    period: usize,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            period: check_period(period),
        }
    }
}

impl Indicator for Atr {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::Atr
    }

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError> {
        let value = match prev {
            Some(CacheSlot::Atr { value, prev_close }) => {
                let tr = (bar.high - bar.low)
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs());
                let alpha = 1.0 / self.period as f64;
                value + alpha * (tr - value)
            }
            _ => bar.high - bar.low,
        };

        Ok((
            CacheSlot::Atr {
                value,
                prev_close: bar.close,
            },
            IndicatorValue::Scalar(value),
        ))
    }
}

/// Range filter: a trailing level that only moves when price escapes a
/// smoothed range around it. Upper/lower bands sit one range above and below.
pub struct RangeFilter {
    period: usize,
    multiplier: f64,
}

impl RangeFilter {
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self {
            period: check_period(period),
            multiplier,
        }
    }
}

impl Indicator for RangeFilter {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::RangeFilter
    }

    fn advance(
        &self,
        prev: Option<&CacheSlot>,
        bar: &Bar,
    ) -> Result<(CacheSlot, IndicatorValue), EngineError> {
        let source = bar.close;
        let (filter, smooth_range) = match prev {
            Some(CacheSlot::RangeFilter {
                filter,
                smooth_range,
                prev_source,
            }) => {
                let range = (source - prev_source).abs();
                let smooth = ema_step(*smooth_range, range, self.period);
                let band = smooth * self.multiplier;
                let next_filter = if source > filter + band {
                    source - band
                } else if source < filter - band {
                    source + band
                } else {
                    *filter
                };
                (next_filter, smooth)
            }
            _ => (source, 0.0),
        };

        let band = smooth_range * self.multiplier;
        Ok((
            CacheSlot::RangeFilter {
                filter,
                smooth_range,
                prev_source: source,
            },
            IndicatorValue::Filter {
                value: filter,
                upper: filter + band,
                lower: filter - band,
            },
        ))
    }
}
