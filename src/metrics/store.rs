use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::metrics::recorder::GenerationMetric;

/// Append-only storage for generation records.
///
/// Implementations must tolerate concurrent `append` calls from independent
/// reveals; records are never rewritten in place.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn append(&self, metric: &GenerationMetric) -> Result<()>;

    /// All records in insertion order.
    async fn load_all(&self) -> Result<Vec<GenerationMetric>>;

    /// Drops every record and returns how many were removed.
    async fn clear(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryMetricsStore {
    records: Mutex<Vec<GenerationMetric>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn append(&self, metric: &GenerationMetric) -> Result<()> {
        self.records.lock().push(metric.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<GenerationMetric>> {
        Ok(self.records.lock().clone())
    }

    async fn clear(&self) -> Result<u64> {
        let mut records = self.records.lock();
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }
}
