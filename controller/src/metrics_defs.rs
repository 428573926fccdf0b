//! Metrics definitions for the controller.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SYNC_DURATION: MetricDef = MetricDef {
    name: "controller.sync.duration",
    metric_type: MetricType::Histogram,
    description: "Time to build and publish the tables, in seconds. Tagged with status.",
};

pub const TABLE_BACKENDS: MetricDef = MetricDef {
    name: "controller.table.backends",
    metric_type: MetricType::Gauge,
    description: "Number of pools in the published backend table",
};

pub const TABLE_SERVERS: MetricDef = MetricDef {
    name: "controller.table.servers",
    metric_type: MetricType::Gauge,
    description: "Number of virtual hosts in the published server table",
};

pub const PUBLISHER_REQUESTS: MetricDef = MetricDef {
    name: "controller.publisher.requests",
    metric_type: MetricType::Counter,
    description: "Configuration endpoint hits. Tagged with endpoint.",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    SYNC_DURATION,
    TABLE_BACKENDS,
    TABLE_SERVERS,
    PUBLISHER_REQUESTS,
];
