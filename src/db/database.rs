use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::GenerationMetricRow;
use crate::metrics::{GenerationMetric, MetricsStore};

/// Durable metrics store. Every record is a fresh `INSERT`, so concurrent
/// reveals never overwrite each other.
#[derive(Clone)]
pub struct SqliteMetricsStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteMetricsStore {
    pub async fn init(database_url: &str, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generation_metrics (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                namespace TEXT NOT NULL,\
                session_id TEXT NOT NULL,\
                recorded_at TEXT NOT NULL,\
                strength REAL NOT NULL,\
                attempts INTEGER NOT NULL,\
                retried INTEGER NOT NULL,\
                final_score REAL NOT NULL,\
                all_scores_json TEXT NOT NULL,\
                facial_features_json TEXT NOT NULL,\
                validation_level TEXT NOT NULL,\
                success INTEGER NOT NULL,\
                processing_time_ms INTEGER NOT NULL,\
                model_used TEXT NOT NULL,\
                warnings_json TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generation_metrics_namespace ON generation_metrics(namespace);",
        )
        .execute(&pool)
        .await?;

        info!("Metrics table ready (namespace={})", namespace);

        Ok(SqliteMetricsStore {
            pool,
            namespace: namespace.to_string(),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn append(&self, metric: &GenerationMetric) -> Result<()> {
        sqlx::query(
            "INSERT INTO generation_metrics \
             (namespace, session_id, recorded_at, strength, attempts, retried, final_score, \
              all_scores_json, facial_features_json, validation_level, success, processing_time_ms, \
              model_used, warnings_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.namespace)
        .bind(&metric.session_id)
        .bind(metric.recorded_at)
        .bind(metric.strength)
        .bind(i64::try_from(metric.attempts).unwrap_or(i64::MAX))
        .bind(metric.retried)
        .bind(metric.final_score)
        .bind(serde_json::to_string(&metric.all_scores)?)
        .bind(serde_json::to_string(&metric.facial_features)?)
        .bind(metric.validation_level.as_str())
        .bind(metric.success)
        .bind(i64::try_from(metric.processing_time_ms).unwrap_or(i64::MAX))
        .bind(&metric.model_used)
        .bind(serde_json::to_string(&metric.warnings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<GenerationMetric>> {
        let rows = sqlx::query_as::<_, GenerationMetricRow>(
            "SELECT id, namespace, session_id, recorded_at, strength, attempts, retried, final_score, \
             all_scores_json, facial_features_json, validation_level, success, processing_time_ms, \
             model_used, warnings_json \
             FROM generation_metrics WHERE namespace = ? ORDER BY id ASC",
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(GenerationMetric::try_from).collect()
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM generation_metrics WHERE namespace = ?")
            .bind(&self.namespace)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::recorder::tests::metric;
    use crate::metrics::MetricsRecorder;

    async fn store_in(dir: &tempfile::TempDir, namespace: &str) -> SqliteMetricsStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("metrics.db").display());
        SqliteMetricsStore::init(&url, namespace).await.unwrap()
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut stored = metric(0.4, 88.5, true);
        stored.all_scores = vec![70.0, 88.5];
        stored.attempts = 2;
        stored.retried = true;
        stored.warnings = vec!["hairline shifted".to_string()];
        stored.facial_features.eyes = 91.0;

        {
            let store = store_in(&dir, "reveal_metrics").await;
            store.health_check().await.unwrap();
            store.append(&stored).await.unwrap();
        }

        let reopened = store_in(&dir, "reveal_metrics").await;
        let records = reopened.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        let loaded = &records[0];
        assert_eq!(loaded.all_scores, vec![70.0, 88.5]);
        assert_eq!(loaded.attempts, 2);
        assert!(loaded.retried);
        assert_eq!(loaded.warnings, stored.warnings);
        assert_eq!(loaded.facial_features.eyes, 91.0);
        assert_eq!(loaded.validation_level, stored.validation_level);
        assert_eq!(
            loaded.recorded_at.timestamp_millis(),
            stored.recorded_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let primary = store_in(&dir, "reveal_metrics").await;
        let other = store_in(&dir, "staging_metrics").await;

        primary.append(&metric(0.5, 80.0, true)).await.unwrap();
        other.append(&metric(0.9, 60.0, false)).await.unwrap();

        assert_eq!(primary.clear().await.unwrap(), 1);
        assert!(primary.load_all().await.unwrap().is_empty());
        assert_eq!(other.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir, "reveal_metrics").await);

        let mut handles = Vec::new();
        for index in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(&metric(0.5, index as f64, true)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 16);
        let mut scores: Vec<f64> = records.iter().map(|record| record.final_score).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(scores, (0..16).map(|index| index as f64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn recorder_aggregates_over_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir, "reveal_metrics").await);
        store.append(&metric(0.1, 96.0, true)).await.unwrap();
        store.append(&metric(0.8, 70.0, false)).await.unwrap();

        let recorder = MetricsRecorder::new(store);
        let stats = recorder.session_stats().await.unwrap();
        assert_eq!(stats.total_generations, 2);
        assert_eq!(stats.successful_generations, 1);
        assert!((stats.average_match_score - 83.0).abs() < 1e-9);
        let distribution = recorder.strength_distribution().await.unwrap();
        assert_eq!(distribution.low.count, 1);
        assert_eq!(distribution.high.count, 1);
    }
}
