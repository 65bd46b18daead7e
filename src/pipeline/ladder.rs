use std::fmt;

pub const DEFAULT_IMAGE_LADDER: &[&str] = &["gemini-3-pro-image-preview", "gemini-2.5-flash-image"];
pub const DEFAULT_ANALYSIS_LADDER: &[&str] = &["gemini-3-pro-preview", "gemini-3-flash-preview"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Analysis,
    Image,
}

impl OperationKind {
    pub fn label(self) -> &'static str {
        match self {
            OperationKind::Analysis => "analysis",
            OperationKind::Image => "image",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered candidate models per operation kind, best first.
///
/// Built once at startup and only read afterwards, so it is shared freely
/// between concurrent reveals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLadders {
    image: Vec<String>,
    analysis: Vec<String>,
}

impl Default for ModelLadders {
    fn default() -> Self {
        Self {
            image: to_owned_list(DEFAULT_IMAGE_LADDER),
            analysis: to_owned_list(DEFAULT_ANALYSIS_LADDER),
        }
    }
}

impl ModelLadders {
    /// Empty lists fall back to the built-in ladder for that kind.
    pub fn new(image: Vec<String>, analysis: Vec<String>) -> Self {
        let defaults = Self::default();
        Self {
            image: normalize(image).unwrap_or(defaults.image),
            analysis: normalize(analysis).unwrap_or(defaults.analysis),
        }
    }

    pub fn for_kind(&self, kind: OperationKind) -> &[String] {
        match kind {
            OperationKind::Analysis => &self.analysis,
            OperationKind::Image => &self.image,
        }
    }
}

fn to_owned_list(models: &[&str]) -> Vec<String> {
    models.iter().map(|model| (*model).to_string()).collect()
}

fn normalize(models: Vec<String>) -> Option<Vec<String>> {
    let models: Vec<String> = models
        .into_iter()
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .collect();
    if models.is_empty() {
        None
    } else {
        Some(models)
    }
}
