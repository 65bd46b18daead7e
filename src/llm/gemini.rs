use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::llm::media::detect_mime_type;
use crate::pipeline::capabilities::{
    FaceAnalysis, FaceAnalyzer, FacialTraits, GeneratedImage, IdentityValidation,
    IdentityValidator, ImageConfig, ImageSynthesizer, SynthesisRequest,
};
use crate::pipeline::fallback::{EndpointError, FailureClass};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_model_timing;

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a biometric portrait analyst. Extract the facial \
identity of the subject: bone geometry, micro-asymmetries, eye and skin traits. Reason about the \
structure before producing the final JSON. The JSON must be the only output.";
const ANALYSIS_USER_PROMPT: &str =
    "Run a forensic identity analysis and return the structured facial description as JSON.";
const COMPARE_PROMPT: &str = "Compare these two images. Decide whether the subject is the same \
person based on immutable facial structure. Ignore clothing, background and lighting changes.";
const SYNTHESIS_SYSTEM_PROMPT: &str =
    "Edit the image based on the prompt. CRITICAL: respond with an image, NOT TEXT.";

/// Error text signatures that mean "this model, not this request". Only
/// consulted when the HTTP status is not conclusive; wording changes
/// upstream will silently turn these into fatal failures.
static TRANSIENT_SIGNATURES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(429|403|404|503)\b|quota|resource_exhausted|not found|permission|denied|unavailable")
        .expect("transient signature pattern is valid")
});

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
        #[serde(default)]
        thought: bool,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    Other(serde::de::IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisPayload {
    shape: String,
    eyes: String,
    nose: String,
    mouth: String,
    skin: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    analysis_text: String,
}

/// Gemini `generateContent` client implementing every capability port.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_key: String,
    api_base: String,
    request_timeout: Duration,
    safety_profile: String,
    thinking_budget: Option<u32>,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(90),
            safety_profile: "permissive".to_string(),
            thinking_budget: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut client = Self::new(&config.gemini_api_key, &config.gemini_api_base);
        client.request_timeout = Duration::from_secs(config.gemini_request_timeout_secs.max(1));
        client.safety_profile = config.gemini_safety_settings.clone();
        client.thinking_budget = (config.analysis_thinking_budget > 0)
            .then_some(config.analysis_thinking_budget);
        client
    }

    fn redact(&self, text: &str) -> String {
        redact_api_key(text, &self.api_key)
    }

    async fn call_api(
        &self,
        model: &str,
        operation: &str,
        payload: Value,
    ) -> Result<GeminiResponse, EndpointError> {
        log_model_timing("gemini", model, operation, None, || async {
            self.send_with_retries(model, &payload).await
        })
        .await
    }

    async fn send_with_retries(
        &self,
        model: &str,
        payload: &Value,
    ) -> Result<GeminiResponse, EndpointError> {
        let client = get_http_client();
        let url = format!("{}/models/{}:generateContent", self.api_base, model);

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", model = model, payload = %summarize_gemini_payload(payload));
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .timeout(self.request_timeout)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err_text = self.redact(&err.to_string());
                    let should_retry =
                        gemini_should_retry_error(&err) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                    warn!(
                        "Gemini request failed to send: {} (timeout={}, connect={}, model={}, retrying={})",
                        err_text,
                        err.is_timeout(),
                        err.is_connect(),
                        model,
                        should_retry
                    );
                    if should_retry {
                        tokio::time::sleep(gemini_retry_delay(attempt)).await;
                        continue;
                    }
                    let message = format!("Gemini request failed: {err_text}");
                    return Err(EndpointError {
                        class: classify_failure(None, &message),
                        message,
                        status: None,
                    });
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let (message, body_summary) = summarize_error_body(&self.redact(&body));
                let should_retry =
                    gemini_should_retry_status(status) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini API error: model={}, status={}, body={}, retrying={}",
                    model, status, body_summary, should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                let message = format!(
                    "Gemini request failed with status {}: {}",
                    status,
                    message.unwrap_or(body_summary)
                );
                return Err(EndpointError {
                    class: classify_failure(Some(status), &message),
                    message,
                    status: Some(status.as_u16()),
                });
            }

            let value = response.json::<GeminiResponse>().await.map_err(|err| {
                EndpointError::missing_output(model, &format!("decodable response ({err})"))
            })?;
            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(target: "llm.gemini", model = model, response = %summarize_gemini_response(&value));
            }
            return Ok(value);
        }
    }
}

#[async_trait]
impl ImageSynthesizer for GeminiClient {
    async fn synthesize(
        &self,
        model: &str,
        request: &SynthesisRequest,
    ) -> Result<GeneratedImage, EndpointError> {
        let parts = vec![inline_image_part(&request.source_image), json!({ "text": request.prompt })];
        let mut generation_config = json!({ "responseModalities": ["TEXT", "IMAGE"] });
        if let Some(image_config) = build_image_config(&request.image_config) {
            if let Some(config_object) = generation_config.as_object_mut() {
                config_object.insert("imageConfig".to_string(), image_config);
            }
        }
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": SYNTHESIS_SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
            "safetySettings": build_safety_settings(&self.safety_profile),
        });

        let response = self.call_api(model, "synthesize", payload).await?;
        extract_images_from_response(response)
            .into_iter()
            .next()
            .ok_or_else(|| EndpointError::missing_output(model, "image"))
    }
}

#[async_trait]
impl IdentityValidator for GeminiClient {
    async fn compare_identity(
        &self,
        model: &str,
        original: &[u8],
        candidate: &[u8],
    ) -> Result<IdentityValidation, EndpointError> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": COMPARE_PROMPT },
                    inline_image_part(original),
                    inline_image_part(candidate),
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": identity_schema(),
            },
            "safetySettings": build_safety_settings(&self.safety_profile),
        });

        let response = self.call_api(model, "compare_identity", payload).await?;
        let text = extract_text_from_response(response);
        parse_identity_validation(&text)
            .ok_or_else(|| EndpointError::missing_output(model, "identity score"))
    }
}

#[async_trait]
impl FaceAnalyzer for GeminiClient {
    async fn analyze(&self, model: &str, image: &[u8]) -> Result<FaceAnalysis, EndpointError> {
        let mut generation_config = json!({
            "responseMimeType": "application/json",
            "responseSchema": analysis_schema(),
        });
        if let (Some(budget), Some(config_object)) =
            (self.thinking_budget, generation_config.as_object_mut())
        {
            config_object.insert(
                "thinkingConfig".to_string(),
                json!({ "thinkingBudget": budget }),
            );
        }
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": ANALYSIS_SYSTEM_PROMPT }] },
            "contents": [{
                "role": "user",
                "parts": [inline_image_part(image), { "text": ANALYSIS_USER_PROMPT }]
            }],
            "generationConfig": generation_config,
            "safetySettings": build_safety_settings(&self.safety_profile),
        });

        let response = self.call_api(model, "analyze", payload).await?;
        let text = extract_text_from_response(response);
        parse_face_analysis(&text).ok_or_else(|| EndpointError::missing_output(model, "facial analysis"))
    }
}

/// Maps an endpoint failure onto the ladder's failure classes. This is the
/// only place error text is inspected.
pub fn classify_failure(status: Option<StatusCode>, message: &str) -> FailureClass {
    if let Some(status) = status {
        if matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::FORBIDDEN
                | StatusCode::NOT_FOUND
                | StatusCode::SERVICE_UNAVAILABLE
        ) {
            return FailureClass::Transient;
        }
    }
    if TRANSIENT_SIGNATURES.is_match(message) {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

fn redact_api_key(text: &str, key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        return text.to_string();
    }
    text.replace(key, "[redacted]")
}

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "OFF",
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}', using permissive defaults.",
                profile
            );
            "OFF"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
    ]
}

fn build_image_config(config: &ImageConfig) -> Option<Value> {
    let mut map = Map::new();

    if let Some(aspect_ratio) = config.aspect_ratio.as_deref() {
        let trimmed = aspect_ratio.trim();
        if !trimmed.is_empty() {
            map.insert("aspectRatio".to_string(), json!(trimmed));
        }
    }

    if let Some(image_size) = config.image_size.as_deref() {
        let trimmed = image_size.trim();
        if !trimmed.is_empty() {
            map.insert("imageSize".to_string(), json!(trimmed));
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn inline_image_part(bytes: &[u8]) -> Value {
    let mime_type = detect_mime_type(bytes).unwrap_or_else(|| "image/jpeg".to_string());
    json!({
        "inlineData": {
            "mimeType": mime_type,
            "data": general_purpose::STANDARD.encode(bytes)
        }
    })
}

fn identity_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "matchScore": { "type": "NUMBER" },
            "isSamePerson": { "type": "BOOLEAN" },
            "facialFeatures": {
                "type": "OBJECT",
                "properties": {
                    "faceShape": { "type": "NUMBER" },
                    "eyes": { "type": "NUMBER" },
                    "nose": { "type": "NUMBER" },
                    "mouth": { "type": "NUMBER" },
                    "overall": { "type": "NUMBER" }
                },
                "required": ["faceShape", "eyes", "nose", "mouth", "overall"]
            },
            "warnings": { "type": "ARRAY", "items": { "type": "STRING" } }
        },
        "required": ["matchScore", "isSamePerson", "facialFeatures", "warnings"]
    })
}

fn analysis_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "shape": { "type": "STRING" },
            "eyes": { "type": "STRING" },
            "nose": { "type": "STRING" },
            "mouth": { "type": "STRING" },
            "skin": { "type": "STRING" },
            "features": { "type": "ARRAY", "items": { "type": "STRING" } },
            "analysisText": { "type": "STRING" }
        },
        "required": ["shape", "eyes", "nose", "mouth", "skin", "features", "analysisText"]
    })
}

fn strip_json_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_identity_validation(text: &str) -> Option<IdentityValidation> {
    let mut validation: IdentityValidation = serde_json::from_str(strip_json_fence(text)).ok()?;
    if !validation.match_score.is_finite() {
        return None;
    }
    validation.match_score = validation.match_score.clamp(0.0, 100.0);
    Some(validation)
}

fn parse_face_analysis(text: &str) -> Option<FaceAnalysis> {
    let payload: AnalysisPayload = serde_json::from_str(strip_json_fence(text)).ok()?;
    Some(FaceAnalysis {
        traits: FacialTraits {
            shape: payload.shape,
            eyes: payload.eyes,
            nose: payload.nose,
            mouth: payload.mouth,
            skin: payload.skin,
            features: payload.features,
        },
        analysis_text: payload.analysis_text,
    })
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_gemini_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_gemini_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let summarized: Vec<Value> = contents
            .iter()
            .map(|content| {
                let parts = content
                    .get("parts")
                    .and_then(|value| value.as_array())
                    .map(|parts| summarize_gemini_parts(parts))
                    .unwrap_or_default();
                json!({ "parts": parts })
            })
            .collect();
        summary.insert("contents".to_string(), Value::Array(summarized));
    }

    if let Some(config) = payload.get("generationConfig") {
        let mut config = config.clone();
        if let Some(object) = config.as_object_mut() {
            object.remove("responseSchema");
        }
        summary.insert("generationConfig".to_string(), config);
    }

    Value::Object(summary)
}

fn summarize_gemini_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut text_preview = None;

    let candidates = response.candidates.as_deref().unwrap_or(&[]);
    for part in candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .filter_map(|content| content.parts.as_ref())
        .flatten()
    {
        match part {
            GeminiPart::Text { text, .. } => {
                text_parts += 1;
                if text_preview.is_none() && !text.trim().is_empty() {
                    text_preview = Some(truncate_for_log(text, 200));
                }
            }
            GeminiPart::InlineData { inline_data } => {
                if inline_data.mime_type.starts_with("image/") {
                    image_parts += 1;
                }
            }
            GeminiPart::Other(_) => {}
        }
    }

    json!({
        "candidates": candidates.len(),
        "textParts": text_parts,
        "imageParts": image_parts,
        "textPreview": text_preview
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn response_parts(response: GeminiResponse) -> impl Iterator<Item = GeminiPart> {
    response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .filter_map(|content| content.parts)
        .flatten()
}

fn extract_text_from_response(response: GeminiResponse) -> String {
    response_parts(response)
        .filter_map(|part| match part {
            GeminiPart::Text { text, thought } if !thought && !text.trim().is_empty() => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_images_from_response(response: GeminiResponse) -> Vec<GeneratedImage> {
    response_parts(response)
        .filter_map(|part| match part {
            GeminiPart::InlineData { inline_data } if inline_data.mime_type.starts_with("image/") => {
                general_purpose::STANDARD
                    .decode(inline_data.data)
                    .ok()
                    .map(|bytes| GeneratedImage {
                        bytes,
                        mime_type: inline_data.mime_type,
                    })
            }
            _ => None,
        })
        .collect()
}
