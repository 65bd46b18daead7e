//! Ports for the external model endpoints the pipeline drives.
//!
//! Implementations classify their own failures into [`EndpointError`]; the
//! pipeline never inspects error text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::fallback::EndpointError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub prompt: String,
    pub source_image: Vec<u8>,
    pub image_config: ImageConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacialFeatureScores {
    pub face_shape: f64,
    pub eyes: f64,
    pub nose: f64,
    pub mouth: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityValidation {
    /// 0..=100, higher means the subject is better preserved.
    pub match_score: f64,
    #[serde(default)]
    pub is_same_person: bool,
    #[serde(default)]
    pub facial_features: FacialFeatureScores,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacialTraits {
    pub shape: String,
    pub eyes: String,
    pub nose: String,
    pub mouth: String,
    pub skin: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceAnalysis {
    pub traits: FacialTraits,
    pub analysis_text: String,
}

#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        model: &str,
        request: &SynthesisRequest,
    ) -> Result<GeneratedImage, EndpointError>;
}

#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn compare_identity(
        &self,
        model: &str,
        original: &[u8],
        candidate: &[u8],
    ) -> Result<IdentityValidation, EndpointError>;
}

#[async_trait]
pub trait FaceAnalyzer: Send + Sync {
    async fn analyze(&self, model: &str, image: &[u8]) -> Result<FaceAnalysis, EndpointError>;
}
