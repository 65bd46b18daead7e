use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::metrics::GenerationMetric;
use crate::pipeline::thresholds::ValidationLevel;

#[derive(Debug, Clone, FromRow)]
pub struct GenerationMetricRow {
    pub id: i64,
    pub namespace: String,
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub strength: f64,
    pub attempts: i64,
    pub retried: bool,
    pub final_score: f64,
    pub all_scores_json: String,
    pub facial_features_json: String,
    pub validation_level: String,
    pub success: bool,
    pub processing_time_ms: i64,
    pub model_used: String,
    pub warnings_json: String,
}

impl TryFrom<GenerationMetricRow> for GenerationMetric {
    type Error = anyhow::Error;

    fn try_from(row: GenerationMetricRow) -> Result<Self> {
        let validation_level = ValidationLevel::parse(&row.validation_level).ok_or_else(|| {
            anyhow!(
                "Unknown validation level '{}' in metric row {}",
                row.validation_level,
                row.id
            )
        })?;
        Ok(GenerationMetric {
            session_id: row.session_id,
            recorded_at: row.recorded_at,
            strength: row.strength,
            attempts: usize::try_from(row.attempts).unwrap_or_default(),
            retried: row.retried,
            final_score: row.final_score,
            all_scores: serde_json::from_str(&row.all_scores_json)?,
            facial_features: serde_json::from_str(&row.facial_features_json)?,
            validation_level,
            success: row.success,
            processing_time_ms: u64::try_from(row.processing_time_ms).unwrap_or_default(),
            model_used: row.model_used,
            warnings: serde_json::from_str(&row.warnings_json)?,
        })
    }
}
