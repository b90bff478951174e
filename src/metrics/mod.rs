// Refresh activity counters

mod collector;

pub use collector::{MetricsSnapshot, RefreshMetrics};
