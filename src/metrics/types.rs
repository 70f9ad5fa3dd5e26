use std::collections::BTreeMap;

/// Label set of a single sample. Ordered so that rendering is deterministic.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Gauge(v) | MetricValue::Counter(v) => *v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub name: &'static str,
    pub labels: Labels,
    pub value: MetricValue,
    pub help: &'static str,
    pub kind: MetricKind,
}
