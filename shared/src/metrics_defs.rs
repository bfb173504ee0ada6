//! Common types for metrics definitions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Registers the description of every metric with the installed recorder.
pub fn describe_all(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        metrics::gauge!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
    ($def:expr, $($label:literal => $value:expr),+ $(,)?) => {
        metrics::histogram!($def.name, $($label => $value),+)
    };
}
