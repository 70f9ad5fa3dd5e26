pub mod estimator;
pub mod exporter;
pub mod pipeline;
pub mod pruner;
pub mod timeline;

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}
