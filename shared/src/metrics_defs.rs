//! Common types for metrics definitions.
//!
//! Each crate declares its metrics as `MetricDef` constants so the full
//! set can be listed from the CLI and kept in sync with METRICS.md.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Emit a counter for a `MetricDef`, optionally with labels.
#[macro_export]
macro_rules! counter {
    ($def:expr) => { ::metrics::counter!($def.name) };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        ::metrics::counter!($def.name, $($label => $value),+)
    };
}

/// Emit a histogram for a `MetricDef`, optionally with labels.
#[macro_export]
macro_rules! histogram {
    ($def:expr) => { ::metrics::histogram!($def.name) };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        ::metrics::histogram!($def.name, $($label => $value),+)
    };
}

/// Emit a gauge for a `MetricDef`, optionally with labels.
#[macro_export]
macro_rules! gauge {
    ($def:expr) => { ::metrics::gauge!($def.name) };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        ::metrics::gauge!($def.name, $($label => $value),+)
    };
}
