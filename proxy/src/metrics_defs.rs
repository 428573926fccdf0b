//! Metrics definitions for the proxy worker.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "proxy.request.duration",
    metric_type: MetricType::Histogram,
    description: "Proxied request duration in seconds. Tagged with status, upstream.",
};

pub const SYNC_DURATION: MetricDef = MetricDef {
    name: "proxy.sync.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch and apply a table delta, in seconds. Tagged with status.",
};

pub const SYNC_FAILURES: MetricDef = MetricDef {
    name: "proxy.sync.failures",
    metric_type: MetricType::Counter,
    description: "Publisher polls or DNS expansions that failed. Tagged with stage.",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, SYNC_DURATION, SYNC_FAILURES];
