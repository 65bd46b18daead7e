use std::future::Future;

use tracing::{info, warn};

use crate::pipeline::ladder::{ModelLadders, OperationKind};

/// How a failed endpoint call affects the ladder walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Quota, unavailable model, or a model-specific permission problem.
    Transient,
    Fatal,
}

impl FailureClass {
    pub fn advances_ladder(self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

/// A failed capability call, already classified by the adapter that made it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EndpointError {
    pub class: FailureClass,
    pub message: String,
    pub status: Option<u16>,
}

impl EndpointError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
            status: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Fatal,
            message: message.into(),
            status: None,
        }
    }

    /// The model answered but produced no usable payload. The next model may
    /// still succeed, so this advances the ladder.
    pub fn missing_output(model: &str, what: &str) -> Self {
        Self::transient(format!("No {what} returned by model {model}"))
    }

    pub fn no_available_models(kind: OperationKind) -> Self {
        Self::fatal(format!("No available models in the {kind} ladder"))
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.class.advances_ladder()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult<T> {
    pub result: T,
    pub used_model: String,
}

/// Runs `operation` against each model of the ladder until one succeeds.
///
/// `ladder` overrides the default ladder for `kind`. Transient failures move
/// on to the next model; a fatal failure is returned at once. When every
/// model failed transiently the last of those errors is returned.
pub async fn execute_with_fallback<T, F, Fut>(
    ladders: &ModelLadders,
    kind: OperationKind,
    ladder: Option<&[String]>,
    mut operation: F,
) -> Result<ExecutionResult<T>, EndpointError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, EndpointError>>,
{
    let models = ladder.unwrap_or_else(|| ladders.for_kind(kind));
    let mut last_error: Option<EndpointError> = None;

    for model in models {
        info!(kind = %kind, model = %model, "Attempting model");
        match operation(model.clone()).await {
            Ok(result) => {
                return Ok(ExecutionResult {
                    result,
                    used_model: model.clone(),
                })
            }
            Err(err) if err.is_transient() => {
                warn!(
                    kind = %kind,
                    model = %model,
                    status = ?err.status,
                    "Model failed ({}). Falling back...",
                    err.message
                );
                last_error = Some(err);
            }
            Err(err) => {
                warn!(kind = %kind, model = %model, "Model failed fatally: {}", err.message);
                return Err(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| EndpointError::no_available_models(kind)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn ladder(models: &[&str]) -> Vec<String> {
        models.iter().map(|model| model.to_string()).collect()
    }

    #[tokio::test]
    async fn tries_every_model_when_all_fail_transiently() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let models = ladder(&["a", "b", "c"]);
        let seen = calls.clone();
        let err = execute_with_fallback::<(), _, _>(
            &ModelLadders::default(),
            OperationKind::Image,
            Some(models.as_slice()),
            |model| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(model.clone());
                    Err(EndpointError::transient(format!("429 quota exceeded on {model}")))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(*calls.lock(), vec!["a", "b", "c"]);
        assert_eq!(err.message, "429 quota exceeded on c");
    }

    #[tokio::test]
    async fn stops_at_first_success_and_reports_model() {
        let calls = Arc::new(Mutex::new(0usize));
        let models = ladder(&["a", "b", "c", "d"]);
        let counter = calls.clone();
        let outcome = execute_with_fallback(
            &ModelLadders::default(),
            OperationKind::Image,
            Some(models.as_slice()),
            |model| {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    if model == "c" {
                        Ok(42)
                    } else {
                        Err(EndpointError::transient("model not found"))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(*calls.lock(), 3);
        assert_eq!(outcome.result, 42);
        assert_eq!(outcome.used_model, "c");
    }

    #[tokio::test]
    async fn fatal_error_short_circuits_the_ladder() {
        let calls = Arc::new(Mutex::new(0usize));
        let models = ladder(&["a", "b"]);
        let counter = calls.clone();
        let err = execute_with_fallback::<(), _, _>(
            &ModelLadders::default(),
            OperationKind::Analysis,
            Some(models.as_slice()),
            |_model| {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    Err(EndpointError::fatal("malformed request"))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(*calls.lock(), 1);
        assert_eq!(err.class, FailureClass::Fatal);
    }

    #[tokio::test]
    async fn empty_ladder_reports_no_available_models() {
        let empty: Vec<String> = Vec::new();
        let err = execute_with_fallback::<(), _, _>(
            &ModelLadders::default(),
            OperationKind::Image,
            Some(empty.as_slice()),
            |_model| async { Ok(()) },
        )
        .await
        .unwrap_err();

        assert!(err.message.contains("No available models"));
    }

    #[tokio::test]
    async fn default_ladder_is_used_without_override() {
        let ladders = ModelLadders::new(vec!["only-image".to_string()], Vec::new());
        let outcome = execute_with_fallback(&ladders, OperationKind::Image, None, |model| async move {
            Ok(model.len())
        })
        .await
        .unwrap();
        assert_eq!(outcome.used_model, "only-image");
    }

    #[tokio::test]
    async fn missing_output_advances_to_next_model() {
        let models = ladder(&["a", "b"]);
        let outcome = execute_with_fallback(
            &ModelLadders::default(),
            OperationKind::Image,
            Some(models.as_slice()),
            |model| async move {
                if model == "a" {
                    Err(EndpointError::missing_output(&model, "image"))
                } else {
                    Ok("png")
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.used_model, "b");
    }
}
