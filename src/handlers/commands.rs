use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::llm::media::{
    estimate_image_quality, extension_for_mime, prepare_source_image, PreparedImage,
};
use crate::pipeline::capabilities::FaceAnalysis;
use crate::pipeline::prompt::{describe_subject, SceneDirection};
use crate::pipeline::{
    execute_with_fallback, EndpointError, ExecutionResult, OperationKind, RevealMode,
    RevealOptions, RevealResult, RevealSettings,
};
use crate::state::AppState;
use crate::utils::timing::{complete_command_timer, start_command_timer};

#[derive(Debug, Clone)]
pub struct RevealArgs {
    pub image: PathBuf,
    /// Subject blueprint; when absent the source portrait is analyzed first.
    pub prompt: Option<String>,
    pub settings: RevealSettings,
    pub mode: RevealMode,
    pub out: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealSummary {
    pub success: bool,
    pub final_score: f64,
    pub attempt_count: usize,
    pub all_scores: Vec<f64>,
    pub retried: bool,
    pub model_used: String,
    pub validation_level: String,
    pub warnings: Vec<String>,
    pub output_path: PathBuf,
}

impl RevealSummary {
    fn from_result(result: &RevealResult, output_path: PathBuf) -> Self {
        let best = &result.best_candidate;
        RevealSummary {
            success: result.success,
            final_score: result.final_score,
            attempt_count: result.attempt_count,
            all_scores: result.all_scores.clone(),
            retried: result.retried,
            model_used: best.used_model.clone(),
            validation_level: best.validation_level.to_string(),
            warnings: best
                .validation
                .as_ref()
                .map(|validation| validation.warnings.clone())
                .unwrap_or_default(),
            output_path,
        }
    }
}

async fn load_source(state: &AppState, path: &Path) -> Result<(PreparedImage, Option<f64>)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read source image {}", path.display()))?;
    let quality = estimate_image_quality(&bytes);
    let prepared = prepare_source_image(
        &bytes,
        state.source_limits.max_side,
        state.source_limits.jpeg_quality,
    )?;
    info!(
        "Loaded source image {} ({}x{}, quality={:?})",
        path.display(),
        prepared.width,
        prepared.height,
        quality
    );
    Ok((prepared, quality))
}

async fn analyze_subject(
    state: &AppState,
    image: &[u8],
) -> Result<ExecutionResult<FaceAnalysis>, EndpointError> {
    let analyzer = state.analyzer.as_ref();
    execute_with_fallback(&state.ladders, OperationKind::Analysis, None, |model| async move {
        analyzer.analyze(&model, image).await
    })
    .await
}

pub async fn analyze_handler(state: &AppState, image: &Path) -> Result<String> {
    let mut timer = start_command_timer("analyze", Some(image.display().to_string()));
    let outcome = async {
        let (prepared, _) = load_source(state, image).await?;
        let analysis = analyze_subject(state, &prepared.bytes).await?;
        let blueprint = describe_subject(&analysis.result.traits, &SceneDirection::default());
        let rendered = serde_json::to_string_pretty(&json!({
            "model": analysis.used_model,
            "analysis": analysis.result,
            "blueprint": blueprint,
        }))?;
        Ok::<_, anyhow::Error>(rendered)
    }
    .await;

    match &outcome {
        Ok(_) => complete_command_timer(&mut timer, "success", None),
        Err(err) => complete_command_timer(&mut timer, "error", Some(err.to_string())),
    }
    outcome
}

pub async fn reveal_handler(
    state: &AppState,
    args: &RevealArgs,
    cancel: CancellationToken,
) -> Result<RevealSummary> {
    let mut timer = start_command_timer("reveal", Some(args.image.display().to_string()));
    let outcome = run_reveal(state, args, cancel).await;
    match &outcome {
        Ok(summary) => complete_command_timer(
            &mut timer,
            "success",
            Some(format!(
                "score={:.1} attempts={} success={}",
                summary.final_score, summary.attempt_count, summary.success
            )),
        ),
        Err(err) => complete_command_timer(&mut timer, "error", Some(err.to_string())),
    }
    outcome
}

async fn run_reveal(
    state: &AppState,
    args: &RevealArgs,
    cancel: CancellationToken,
) -> Result<RevealSummary> {
    let (prepared, quality) = load_source(state, &args.image).await?;

    let blueprint = match args.prompt.as_deref().map(str::trim) {
        Some(prompt) if !prompt.is_empty() => prompt.to_string(),
        _ => {
            let analysis = analyze_subject(state, &prepared.bytes)
                .await
                .context("Facial analysis failed")?;
            info!("Subject analyzed with {}", analysis.used_model);
            describe_subject(&analysis.result.traits, &SceneDirection::default())
        }
    };

    let progress = |attempt: usize, score: f64| {
        info!(attempt, score, "Candidate scored");
    };
    let options = RevealOptions {
        source_quality: quality,
        cancel: Some(cancel),
    };
    let result = state
        .reveal_engine()
        .reveal_with_options(
            &blueprint,
            &prepared.bytes,
            &args.settings,
            args.mode,
            Some(&progress),
            &options,
        )
        .await?;

    if !result.success {
        warn!(
            "Best candidate scored {:.1}, below the success floor",
            result.final_score
        );
    }

    let output_path = match &args.out {
        Some(path) => path.clone(),
        None => state.output_dir.join(format!(
            "reveal_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            extension_for_mime(&result.best_candidate.image.mime_type)
        )),
    };
    if let Some(parent) = output_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&output_path, &result.best_candidate.image.bytes)
        .await
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    info!("Saved best candidate to {}", output_path.display());

    Ok(RevealSummary::from_result(&result, output_path))
}

pub async fn stats_handler(state: &AppState) -> Result<String> {
    let mut timer = start_command_timer("stats", None);
    let outcome = async {
        let records_stats = state.recorder.session_stats().await?;
        let distribution = state.recorder.strength_distribution().await?;
        let reasons = state.recorder.common_failure_reasons().await?;
        let rendered = serde_json::to_string_pretty(&json!({
            "stats": records_stats,
            "strengthDistribution": distribution,
            "commonFailureReasons": reasons,
        }))?;
        Ok::<_, anyhow::Error>(rendered)
    }
    .await;

    match &outcome {
        Ok(_) => complete_command_timer(&mut timer, "success", None),
        Err(err) => complete_command_timer(&mut timer, "error", Some(err.to_string())),
    }
    outcome
}

pub async fn export_metrics_handler(state: &AppState, out: Option<&Path>) -> Result<String> {
    let mut timer = start_command_timer("export-metrics", out.map(|path| path.display().to_string()));
    let outcome = async {
        let rendered = state.recorder.export_json().await?;
        let Some(path) = out else {
            return Ok::<_, anyhow::Error>(rendered);
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, rendered.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(format!("Metrics exported to {}", path.display()))
    }
    .await;

    match &outcome {
        Ok(_) => complete_command_timer(&mut timer, "success", None),
        Err(err) => complete_command_timer(&mut timer, "error", Some(err.to_string())),
    }
    outcome
}

pub async fn clear_metrics_handler(state: &AppState) -> Result<String> {
    let mut timer = start_command_timer("clear-metrics", None);
    let outcome = state.recorder.clear().await;
    match &outcome {
        Ok(removed) => complete_command_timer(&mut timer, "success", Some(format!("removed={removed}"))),
        Err(err) => complete_command_timer(&mut timer, "error", Some(err.to_string())),
    }
    Ok(format!("Cleared {} generation metrics", outcome?))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use parking_lot::Mutex;

    use super::*;
    use crate::metrics::{MemoryMetricsStore, MetricsRecorder};
    use crate::pipeline::capabilities::{
        FaceAnalyzer, FacialTraits, GeneratedImage, IdentityValidation, IdentityValidator,
        ImageSynthesizer, SynthesisRequest,
    };
    use crate::pipeline::{ModelLadders, RetryPolicy};
    use crate::state::SourceImageLimits;

    struct StubModels {
        score: f64,
        prompts: Mutex<Vec<String>>,
        analyses: Mutex<usize>,
    }

    impl StubModels {
        fn scoring(score: f64) -> Arc<Self> {
            Arc::new(Self {
                score,
                prompts: Mutex::new(Vec::new()),
                analyses: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageSynthesizer for StubModels {
        async fn synthesize(
            &self,
            _model: &str,
            request: &SynthesisRequest,
        ) -> Result<GeneratedImage, EndpointError> {
            self.prompts.lock().push(request.prompt.clone());
            Ok(GeneratedImage {
                bytes: vec![0x89, b'P', b'N', b'G'],
                mime_type: "image/png".to_string(),
            })
        }
    }

    #[async_trait]
    impl IdentityValidator for StubModels {
        async fn compare_identity(
            &self,
            _model: &str,
            _original: &[u8],
            _candidate: &[u8],
        ) -> Result<IdentityValidation, EndpointError> {
            Ok(IdentityValidation {
                match_score: self.score,
                is_same_person: true,
                ..IdentityValidation::default()
            })
        }
    }

    #[async_trait]
    impl FaceAnalyzer for StubModels {
        async fn analyze(&self, _model: &str, _image: &[u8]) -> Result<FaceAnalysis, EndpointError> {
            *self.analyses.lock() += 1;
            Ok(FaceAnalysis {
                traits: FacialTraits {
                    shape: "heart-shaped".to_string(),
                    eyes: "grey".to_string(),
                    nose: "button".to_string(),
                    mouth: "wide".to_string(),
                    skin: "tan".to_string(),
                    features: Vec::new(),
                },
                analysis_text: "clear frontal portrait".to_string(),
            })
        }
    }

    fn state_with(models: Arc<StubModels>, output_dir: PathBuf) -> AppState {
        AppState {
            synthesizer: models.clone(),
            validator: models.clone(),
            analyzer: models,
            recorder: Arc::new(MetricsRecorder::new(Arc::new(MemoryMetricsStore::new()))),
            ladders: ModelLadders::default(),
            policy: RetryPolicy::immediate(3),
            success_floor: 75.0,
            source_limits: SourceImageLimits {
                max_side: 256,
                jpeg_quality: 85,
            },
            output_dir,
        }
    }

    fn write_portrait(dir: &Path) -> PathBuf {
        let path = dir.join("portrait.png");
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_fn(320, 320, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 90])
        }))
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
        std::fs::write(&path, buffer.into_inner()).unwrap();
        path
    }

    fn reveal_args(image: PathBuf) -> RevealArgs {
        RevealArgs {
            image,
            prompt: None,
            settings: RevealSettings::default(),
            mode: RevealMode::Standard,
            out: None,
        }
    }

    #[tokio::test]
    async fn reveal_analyzes_subject_and_saves_best_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let models = StubModels::scoring(93.0);
        let state = state_with(models.clone(), dir.path().join("out"));
        let args = reveal_args(write_portrait(dir.path()));

        let summary = reveal_handler(&state, &args, CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.attempt_count, 1);
        assert_eq!(summary.validation_level, "good");
        assert_eq!(summary.model_used, "gemini-3-pro-image-preview");
        assert_eq!(summary.output_path.extension().unwrap(), "png");
        assert!(summary.output_path.starts_with(dir.path().join("out")));
        assert_eq!(
            std::fs::read(&summary.output_path).unwrap(),
            vec![0x89, b'P', b'N', b'G']
        );
        assert_eq!(*models.analyses.lock(), 1);
        assert!(models.prompts.lock()[0].contains("person with heart-shaped face"));

        let stats: serde_json::Value =
            serde_json::from_str(&stats_handler(&state).await.unwrap()).unwrap();
        assert_eq!(stats["stats"]["totalGenerations"], 1);
        assert_eq!(stats["strengthDistribution"]["medium"]["count"], 1);
    }

    #[tokio::test]
    async fn explicit_prompt_skips_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let models = StubModels::scoring(90.0);
        let state = state_with(models.clone(), dir.path().to_path_buf());
        let mut args = reveal_args(write_portrait(dir.path()));
        args.prompt = Some("astronaut portrait on the moon".to_string());
        args.out = Some(dir.path().join("custom").join("result.png"));

        let summary = reveal_handler(&state, &args, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*models.analyses.lock(), 0);
        assert!(models.prompts.lock()[0].contains("astronaut portrait on the moon"));
        assert_eq!(summary.output_path, dir.path().join("custom").join("result.png"));
        assert!(summary.output_path.exists());
    }

    #[tokio::test]
    async fn low_scores_exhaust_attempts_and_report_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(StubModels::scoring(40.0), dir.path().to_path_buf());
        let args = reveal_args(write_portrait(dir.path()));

        let summary = reveal_handler(&state, &args, CancellationToken::new())
            .await
            .unwrap();

        assert!(!summary.success);
        assert_eq!(summary.attempt_count, 3);
        assert_eq!(summary.all_scores, vec![40.0, 40.0, 40.0]);
        assert!(summary.retried);
    }

    #[tokio::test]
    async fn cancelled_reveal_without_candidates_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(StubModels::scoring(90.0), dir.path().to_path_buf());
        let args = reveal_args(write_portrait(dir.path()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reveal_handler(&state, &args, cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        let stats = state.recorder.session_stats().await.unwrap();
        assert_eq!(stats.total_generations, 0);
    }

    #[tokio::test]
    async fn missing_source_image_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(StubModels::scoring(90.0), dir.path().to_path_buf());
        let args = reveal_args(dir.path().join("missing.png"));

        let err = reveal_handler(&state, &args, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read source image"));
    }

    #[tokio::test]
    async fn analyze_renders_traits_and_blueprint() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(StubModels::scoring(90.0), dir.path().to_path_buf());
        let rendered = analyze_handler(&state, &write_portrait(dir.path()))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["model"], "gemini-3-pro-preview");
        assert_eq!(value["analysis"]["traits"]["eyes"], "grey");
        assert!(value["blueprint"]
            .as_str()
            .unwrap()
            .ends_with("environment: studio."));
    }

    #[tokio::test]
    async fn export_then_clear_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(StubModels::scoring(95.0), dir.path().to_path_buf());
        let args = reveal_args(write_portrait(dir.path()));
        reveal_handler(&state, &args, CancellationToken::new())
            .await
            .unwrap();

        let export_path = dir.path().join("exports").join("metrics.json");
        let message = export_metrics_handler(&state, Some(&export_path))
            .await
            .unwrap();
        assert!(message.contains("metrics.json"));
        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&export_path).unwrap()).unwrap();
        assert_eq!(exported["generations"].as_array().unwrap().len(), 1);

        assert_eq!(
            clear_metrics_handler(&state).await.unwrap(),
            "Cleared 1 generation metrics"
        );
        let inline: serde_json::Value =
            serde_json::from_str(&export_metrics_handler(&state, None).await.unwrap()).unwrap();
        assert!(inline["generations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_to_a_directory_reports_the_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(StubModels::scoring(95.0), dir.path().to_path_buf());

        let err = export_metrics_handler(&state, Some(dir.path()))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Failed to write"));
    }
}
