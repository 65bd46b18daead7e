use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::MetricsRecorder;
use crate::pipeline::capabilities::{
    GeneratedImage, IdentityValidation, IdentityValidator, ImageConfig, ImageSynthesizer,
    SynthesisRequest,
};
use crate::pipeline::fallback::{execute_with_fallback, EndpointError, ExecutionResult};
use crate::pipeline::ladder::{ModelLadders, OperationKind};
use crate::pipeline::prompt::build_reveal_prompt;
use crate::pipeline::thresholds::{evaluate, ValidationLevel};
use crate::utils::timing::TIMING_TARGET;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 1500;
/// Minimum best score for a reveal to count as successful. Independent of
/// the per-attempt acceptance thresholds.
pub const DEFAULT_SUCCESS_FLOOR: f64 = 75.0;

#[derive(Debug, thiserror::Error)]
pub enum RevealError {
    #[error("Image synthesis failed: {0}")]
    Synthesis(#[from] EndpointError),
    #[error("Identity validation failed: {0}")]
    Validation(EndpointError),
    #[error("Reveal cancelled before any candidate was produced")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevealSettings {
    /// Requested transformation intensity in `[0, 1]`.
    pub strength: f64,
    pub resolution: String,
    pub aspect_ratio: String,
    pub custom_prompt: String,
    pub validate_output: bool,
    pub enable_retry: bool,
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self {
            strength: 0.5,
            resolution: "2K".to_string(),
            aspect_ratio: "1:1".to_string(),
            custom_prompt: String::new(),
            validate_output: true,
            enable_retry: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevealMode {
    #[default]
    Standard,
    /// Single cheap attempt, accepted whatever its score.
    LowCost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::from_millis(DEFAULT_BACKOFF_MS))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_delay,
        }
    }

    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn backoff(&self, _attempt_index: usize) -> Duration {
        self.backoff_delay
    }
}

/// Loop shape for one reveal, fixed before the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealStrategy {
    pub max_attempts: usize,
    pub force_accept: bool,
}

impl RevealStrategy {
    pub fn select(mode: RevealMode, settings: &RevealSettings, policy: &RetryPolicy) -> Self {
        match mode {
            RevealMode::LowCost => Self::single_shot(),
            RevealMode::Standard => Self {
                max_attempts: if settings.enable_retry {
                    policy.max_attempts
                } else {
                    1
                },
                force_accept: false,
            },
        }
    }

    fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            force_accept: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// 1-based position within the reveal.
    pub index: usize,
    pub image: GeneratedImage,
    pub used_model: String,
    pub similarity_score: f64,
    pub validation_level: ValidationLevel,
    pub validation: Option<IdentityValidation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevealResult {
    pub success: bool,
    pub best_candidate: Attempt,
    pub attempt_count: usize,
    /// Scores of every produced candidate, in attempt order.
    pub all_scores: Vec<f64>,
    pub final_score: f64,
    pub retried: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RevealOptions {
    /// Measured quality of the source portrait, 0..=100.
    pub source_quality: Option<f64>,
    /// Checked before each attempt starts; a running attempt is never aborted.
    pub cancel: Option<CancellationToken>,
}

pub type AttemptCallback = dyn Fn(usize, f64) + Send + Sync;

pub struct RevealEngine {
    synthesizer: Arc<dyn ImageSynthesizer>,
    validator: Arc<dyn IdentityValidator>,
    ladders: ModelLadders,
    policy: RetryPolicy,
    success_floor: f64,
    recorder: Option<Arc<MetricsRecorder>>,
}

impl RevealEngine {
    pub fn new(
        synthesizer: Arc<dyn ImageSynthesizer>,
        validator: Arc<dyn IdentityValidator>,
        ladders: ModelLadders,
    ) -> Self {
        Self {
            synthesizer,
            validator,
            ladders,
            policy: RetryPolicy::default(),
            success_floor: DEFAULT_SUCCESS_FLOOR,
            recorder: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_success_floor(mut self, success_floor: f64) -> Self {
        self.success_floor = success_floor;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub async fn reveal(
        &self,
        prompt: &str,
        source_image: &[u8],
        settings: &RevealSettings,
        mode: RevealMode,
        on_attempt: Option<&AttemptCallback>,
    ) -> Result<RevealResult, RevealError> {
        self.reveal_with_options(
            prompt,
            source_image,
            settings,
            mode,
            on_attempt,
            &RevealOptions::default(),
        )
        .await
    }

    /// Generates candidates until one clears the acceptance threshold for
    /// the requested strength or the attempt budget runs out, and returns
    /// the best-scoring candidate seen.
    pub async fn reveal_with_options(
        &self,
        prompt: &str,
        source_image: &[u8],
        settings: &RevealSettings,
        mode: RevealMode,
        on_attempt: Option<&AttemptCallback>,
        options: &RevealOptions,
    ) -> Result<RevealResult, RevealError> {
        let started = Instant::now();
        let strength = settings.strength.clamp(0.0, 1.0);
        let strategy = RevealStrategy::select(mode, settings, &self.policy);
        let request = SynthesisRequest {
            prompt: build_reveal_prompt(
                prompt,
                strength,
                &settings.custom_prompt,
                &settings.resolution,
                &settings.aspect_ratio,
            ),
            source_image: source_image.to_vec(),
            image_config: ImageConfig {
                aspect_ratio: Some(settings.aspect_ratio.clone()),
                image_size: Some(settings.resolution.clone()),
            },
        };

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut best: Option<usize> = None;
        let mut attempt_count = 0usize;

        for attempt_index in 0..strategy.max_attempts {
            if options.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                warn!(attempt = attempt_index + 1, "Reveal cancelled before attempt");
                break;
            }
            attempt_count += 1;
            let is_last = attempt_index + 1 == strategy.max_attempts;

            let generated = match self.synthesize(&request).await {
                Ok(generated) => generated,
                Err(err) if is_last => {
                    warn!(attempt = attempt_count, "Synthesis failed on final attempt: {}", err);
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(attempt = attempt_count, "Synthesis failed, retrying: {}", err);
                    self.pause(attempt_index).await;
                    continue;
                }
            };

            let validation = if settings.validate_output {
                match self.score(source_image, &generated.result.bytes).await {
                    Ok(validation) => Some(validation),
                    Err(err) if is_last => {
                        warn!(attempt = attempt_count, "Identity validation failed on final attempt: {}", err);
                        return Err(RevealError::Validation(err));
                    }
                    Err(err) => {
                        warn!(attempt = attempt_count, "Identity validation failed, retrying: {}", err);
                        self.pause(attempt_index).await;
                        continue;
                    }
                }
            } else {
                None
            };
            let score = validation
                .as_ref()
                .map(|validation| validation.match_score)
                .unwrap_or(0.0);

            if let Some(callback) = on_attempt {
                callback(attempt_count, score);
            }

            let evaluation = evaluate(score, strength, options.source_quality);
            info!(
                attempt = attempt_count,
                model = %generated.used_model,
                score,
                level = %evaluation.level,
                "{}",
                evaluation.summary(score)
            );

            attempts.push(Attempt {
                index: attempt_count,
                image: generated.result,
                used_model: generated.used_model,
                similarity_score: score,
                validation_level: evaluation.level,
                validation,
            });
            let latest = attempts.len() - 1;
            match best {
                Some(current) if attempts[current].similarity_score >= score => {}
                _ => best = Some(latest),
            }

            if evaluation.is_valid || strategy.force_accept {
                break;
            }
            if !is_last {
                self.pause(attempt_index).await;
            }
        }

        let Some(best_index) = best else {
            return Err(RevealError::Cancelled);
        };
        let all_scores: Vec<f64> = attempts.iter().map(|attempt| attempt.similarity_score).collect();
        let best_candidate = attempts.swap_remove(best_index);
        let final_score = best_candidate.similarity_score;
        let result = RevealResult {
            success: final_score >= self.success_floor || strategy.force_accept,
            best_candidate,
            attempt_count,
            all_scores,
            final_score,
            retried: attempt_count > 1,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            target: TIMING_TARGET,
            "event=reveal_completed attempts={} final_score={:.1} success={} model={} duration_ms={}",
            result.attempt_count,
            result.final_score,
            result.success,
            result.best_candidate.used_model,
            elapsed_ms
        );

        if let Some(recorder) = &self.recorder {
            if let Err(err) = recorder.log(&result, strength, elapsed_ms).await {
                warn!("Failed to record generation metric: {err:#}");
            }
        }

        Ok(result)
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<ExecutionResult<GeneratedImage>, EndpointError> {
        let synthesizer = &self.synthesizer;
        execute_with_fallback(&self.ladders, OperationKind::Image, None, |model| async move {
            synthesizer.synthesize(&model, request).await
        })
        .await
    }

    async fn score(&self, original: &[u8], candidate: &[u8]) -> Result<IdentityValidation, EndpointError> {
        let validator = &self.validator;
        execute_with_fallback(&self.ladders, OperationKind::Analysis, None, |model| async move {
            validator.compare_identity(&model, original, candidate).await
        })
        .await
        .map(|validation| validation.result)
    }

    async fn pause(&self, attempt_index: usize) {
        let delay = self.policy.backoff(attempt_index);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
