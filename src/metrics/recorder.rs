use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::store::MetricsStore;
use crate::pipeline::capabilities::FacialFeatureScores;
use crate::pipeline::reveal::RevealResult;
use crate::pipeline::thresholds::{StrengthBand, ValidationLevel};

/// One completed reveal. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetric {
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub strength: f64,
    pub attempts: usize,
    pub retried: bool,
    pub final_score: f64,
    pub all_scores: Vec<f64>,
    pub facial_features: FacialFeatureScores,
    pub validation_level: ValidationLevel,
    pub success: bool,
    pub processing_time_ms: u64,
    pub model_used: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub total_generations: usize,
    pub successful_generations: usize,
    pub failed_generations: usize,
    pub average_match_score: f64,
    pub average_attempts: f64,
    pub total_processing_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStats {
    pub count: usize,
    pub avg_score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StrengthDistribution {
    pub low: BucketStats,
    pub medium: BucketStats,
    pub high: BucketStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExport {
    pub exported_at: DateTime<Utc>,
    pub stats: SessionStats,
    pub strength_distribution: StrengthDistribution,
    pub common_failure_reasons: Vec<FailureReason>,
    pub generations: Vec<GenerationMetric>,
}

/// Records every finished reveal and answers aggregate questions about them.
///
/// Aggregates are recomputed from the full record set on each call.
pub struct MetricsRecorder {
    store: Arc<dyn MetricsStore>,
    session_id: String,
    started_at: DateTime<Utc>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self {
            store,
            session_id: format!("SESSION_{}", Uuid::new_v4().simple()),
            started_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn log(
        &self,
        result: &RevealResult,
        strength: f64,
        processing_time_ms: u64,
    ) -> Result<GenerationMetric> {
        let best = &result.best_candidate;
        let (facial_features, warnings) = best
            .validation
            .as_ref()
            .map(|validation| (validation.facial_features, validation.warnings.clone()))
            .unwrap_or_default();
        let metric = GenerationMetric {
            session_id: self.session_id.clone(),
            recorded_at: Utc::now(),
            strength,
            attempts: result.attempt_count,
            retried: result.retried,
            final_score: result.final_score,
            all_scores: result.all_scores.clone(),
            facial_features,
            validation_level: best.validation_level,
            success: result.success,
            processing_time_ms,
            model_used: best.used_model.clone(),
            warnings,
        };
        self.store.append(&metric).await?;
        info!(
            session_id = %self.session_id,
            attempts = metric.attempts,
            final_score = metric.final_score,
            success = metric.success,
            "Generation metric recorded"
        );
        Ok(metric)
    }

    pub async fn session_stats(&self) -> Result<SessionStats> {
        let records = self.store.load_all().await?;
        Ok(self.stats_for(&records))
    }

    pub async fn strength_distribution(&self) -> Result<StrengthDistribution> {
        let records = self.store.load_all().await?;
        Ok(strength_distribution(&records))
    }

    pub async fn common_failure_reasons(&self) -> Result<Vec<FailureReason>> {
        let records = self.store.load_all().await?;
        Ok(common_failure_reasons(&records))
    }

    pub async fn export(&self) -> Result<MetricsExport> {
        let records = self.store.load_all().await?;
        Ok(MetricsExport {
            exported_at: Utc::now(),
            stats: self.stats_for(&records),
            strength_distribution: strength_distribution(&records),
            common_failure_reasons: common_failure_reasons(&records),
            generations: records,
        })
    }

    pub async fn export_json(&self) -> Result<String> {
        let export = self.export().await?;
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Irreversibly removes every stored record.
    pub async fn clear(&self) -> Result<u64> {
        let removed = self.store.clear().await?;
        warn!(removed, "Generation metrics cleared");
        Ok(removed)
    }

    fn stats_for(&self, records: &[GenerationMetric]) -> SessionStats {
        let total_generations = records.len();
        let successful_generations = records.iter().filter(|metric| metric.success).count();
        SessionStats {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            total_generations,
            successful_generations,
            failed_generations: total_generations - successful_generations,
            average_match_score: mean(records.iter().map(|metric| metric.final_score)),
            average_attempts: mean(records.iter().map(|metric| metric.attempts as f64)),
            total_processing_time_ms: records.iter().map(|metric| metric.processing_time_ms).sum(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn bucket(records: &[&GenerationMetric]) -> BucketStats {
    BucketStats {
        count: records.len(),
        avg_score: mean(records.iter().map(|metric| metric.final_score)),
    }
}

pub fn strength_distribution(records: &[GenerationMetric]) -> StrengthDistribution {
    let in_band = |band: StrengthBand| {
        records
            .iter()
            .filter(|metric| StrengthBand::for_strength(metric.strength) == band)
            .collect::<Vec<_>>()
    };
    StrengthDistribution {
        low: bucket(&in_band(StrengthBand::Subtle)),
        medium: bucket(&in_band(StrengthBand::Balanced)),
        high: bucket(&in_band(StrengthBand::Dramatic)),
    }
}

/// Validator warnings across unsuccessful generations, most frequent first.
pub fn common_failure_reasons(records: &[GenerationMetric]) -> Vec<FailureReason> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for metric in records.iter().filter(|metric| !metric.success) {
        for warning in &metric.warnings {
            *counts.entry(warning.as_str()).or_default() += 1;
        }
    }

    let mut reasons: Vec<FailureReason> = counts
        .into_iter()
        .map(|(reason, count)| FailureReason {
            reason: reason.to_string(),
            count,
        })
        .collect();
    reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    reasons
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::store::MemoryMetricsStore;

    pub(crate) fn metric(strength: f64, final_score: f64, success: bool) -> GenerationMetric {
        GenerationMetric {
            session_id: "SESSION_test".to_string(),
            recorded_at: Utc::now(),
            strength,
            attempts: 1,
            retried: false,
            final_score,
            all_scores: vec![final_score],
            facial_features: FacialFeatureScores::default(),
            validation_level: ValidationLevel::Good,
            success,
            processing_time_ms: 1000,
            model_used: "gemini-2.5-flash-image".to_string(),
            warnings: Vec::new(),
        }
    }

    async fn recorder_with(
        records: Vec<GenerationMetric>,
    ) -> (MetricsRecorder, Arc<MemoryMetricsStore>) {
        let store = Arc::new(MemoryMetricsStore::new());
        for record in &records {
            store.append(record).await.unwrap();
        }
        (MetricsRecorder::new(store.clone()), store)
    }

    #[tokio::test]
    async fn session_stats_average_logged_scores() {
        let scores = [91.0, 72.5, 88.0, 60.0];
        let (recorder, _store) = recorder_with(
            scores
                .iter()
                .map(|score| metric(0.5, *score, *score >= 75.0))
                .collect(),
        )
        .await;

        let stats = recorder.session_stats().await.unwrap();
        assert_eq!(stats.total_generations, 4);
        assert_eq!(stats.successful_generations, 2);
        assert_eq!(stats.failed_generations, 2);
        let expected = scores.iter().sum::<f64>() / scores.len() as f64;
        assert!((stats.average_match_score - expected).abs() < 1e-9);
        assert!((stats.average_attempts - 1.0).abs() < 1e-9);
        assert_eq!(stats.total_processing_time_ms, 4000);
    }

    #[tokio::test]
    async fn empty_store_reports_zeroes() {
        let (recorder, _store) = recorder_with(Vec::new()).await;
        let stats = recorder.session_stats().await.unwrap();
        assert_eq!(stats.total_generations, 0);
        assert_eq!(stats.average_match_score, 0.0);
        assert_eq!(stats.average_attempts, 0.0);
        assert_eq!(recorder.strength_distribution().await.unwrap(), StrengthDistribution::default());
    }

    #[tokio::test]
    async fn distribution_buckets_by_strength_band() {
        let (recorder, _store) = recorder_with(vec![
            metric(0.5, 80.0, true),
            metric(0.1, 97.0, true),
            metric(0.3, 90.0, true),
            metric(0.7, 70.0, false),
            metric(1.0, 84.0, true),
        ])
        .await;

        let distribution = recorder.strength_distribution().await.unwrap();
        assert_eq!(distribution.low, BucketStats { count: 1, avg_score: 97.0 });
        assert_eq!(distribution.medium, BucketStats { count: 2, avg_score: 85.0 });
        assert_eq!(distribution.high, BucketStats { count: 2, avg_score: 77.0 });
    }

    #[tokio::test]
    async fn mid_strength_lands_only_in_medium_bucket() {
        let (recorder, _store) = recorder_with(vec![metric(0.5, 88.0, true)]).await;
        let distribution = recorder.strength_distribution().await.unwrap();
        assert_eq!(distribution.low.count, 0);
        assert_eq!(distribution.medium.count, 1);
        assert_eq!(distribution.high.count, 0);
    }

    #[tokio::test]
    async fn failure_reasons_only_count_unsuccessful_generations() {
        let mut failed_a = metric(0.5, 60.0, false);
        failed_a.warnings = vec!["eyes differ".to_string(), "jaw reshaped".to_string()];
        let mut failed_b = metric(0.8, 50.0, false);
        failed_b.warnings = vec!["eyes differ".to_string()];
        let mut succeeded = metric(0.5, 90.0, true);
        succeeded.warnings = vec!["jaw reshaped".to_string()];
        let (recorder, _store) = recorder_with(vec![failed_a, failed_b, succeeded]).await;

        let reasons = recorder.common_failure_reasons().await.unwrap();
        assert_eq!(
            reasons,
            vec![
                FailureReason { reason: "eyes differ".to_string(), count: 2 },
                FailureReason { reason: "jaw reshaped".to_string(), count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn clear_discards_all_records() {
        let (recorder, store) = recorder_with(vec![metric(0.5, 80.0, true), metric(0.2, 99.0, true)]).await;
        assert_eq!(recorder.clear().await.unwrap(), 2);
        assert!(store.load_all().await.unwrap().is_empty());
        assert_eq!(recorder.session_stats().await.unwrap().total_generations, 0);
    }

    #[tokio::test]
    async fn concurrent_appends_keep_every_record() {
        let store = Arc::new(MemoryMetricsStore::new());
        let mut handles = Vec::new();
        for index in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(&metric(0.5, index as f64, true)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.load_all().await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn export_json_carries_records_and_aggregates() {
        let (recorder, _store) = recorder_with(vec![metric(0.5, 80.0, true)]).await;
        let json = recorder.export_json().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["stats"]["totalGenerations"], 1);
        assert_eq!(value["strengthDistribution"]["medium"]["count"], 1);
        assert_eq!(value["generations"][0]["validationLevel"], "good");
        assert_eq!(value["generations"][0]["modelUsed"], "gemini-2.5-flash-image");
    }
}
