pub mod recorder;
pub mod store;

pub use recorder::{GenerationMetric, MetricsRecorder};
pub use store::{MemoryMetricsStore, MetricsStore};
