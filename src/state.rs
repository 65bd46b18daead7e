use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::db::database::SqliteMetricsStore;
use crate::llm::GeminiClient;
use crate::metrics::{MemoryMetricsStore, MetricsRecorder, MetricsStore};
use crate::pipeline::capabilities::{FaceAnalyzer, IdentityValidator, ImageSynthesizer};
use crate::pipeline::{ModelLadders, RetryPolicy, RevealEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceImageLimits {
    pub max_side: u32,
    pub jpeg_quality: u8,
}

#[derive(Clone)]
pub struct AppState {
    pub synthesizer: Arc<dyn ImageSynthesizer>,
    pub validator: Arc<dyn IdentityValidator>,
    pub analyzer: Arc<dyn FaceAnalyzer>,
    pub recorder: Arc<MetricsRecorder>,
    pub ladders: ModelLadders,
    pub policy: RetryPolicy,
    pub success_floor: f64,
    pub source_limits: SourceImageLimits,
    pub output_dir: PathBuf,
}

impl AppState {
    /// Wires the Gemini adapter and the metrics store described by `config`.
    /// `ephemeral` keeps metrics in memory for this process only.
    pub async fn init(config: &Config, ephemeral: bool) -> Result<Self> {
        let store: Arc<dyn MetricsStore> = if ephemeral {
            info!("Using in-memory metrics store");
            Arc::new(MemoryMetricsStore::new())
        } else {
            Arc::new(SqliteMetricsStore::init(&config.database_url, &config.metrics_namespace).await?)
        };
        let gemini = Arc::new(GeminiClient::from_config(config));

        Ok(AppState {
            synthesizer: gemini.clone(),
            validator: gemini.clone(),
            analyzer: gemini,
            recorder: Arc::new(MetricsRecorder::new(store)),
            ladders: ModelLadders::new(
                config.image_model_ladder.clone(),
                config.analysis_model_ladder.clone(),
            ),
            policy: RetryPolicy::new(
                config.reveal_max_attempts,
                Duration::from_millis(config.reveal_backoff_ms),
            ),
            success_floor: config.reveal_success_floor,
            source_limits: SourceImageLimits {
                max_side: config.source_image_max_side,
                jpeg_quality: config.source_image_jpeg_quality,
            },
            output_dir: config.output_dir.clone(),
        })
    }

    pub fn reveal_engine(&self) -> RevealEngine {
        RevealEngine::new(
            self.synthesizer.clone(),
            self.validator.clone(),
            self.ladders.clone(),
        )
        .with_policy(self.policy)
        .with_success_floor(self.success_floor)
        .with_recorder(self.recorder.clone())
    }
}
