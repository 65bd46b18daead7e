use std::fmt;

use serde::{Deserialize, Serialize};

pub const LOW_STRENGTH_LIMIT: f64 = 0.3;
pub const HIGH_STRENGTH_LIMIT: f64 = 0.7;

const PRISTINE_QUALITY: f64 = 80.0;
const FAIR_QUALITY: f64 = 60.0;
const FAIR_QUALITY_PENALTY: f64 = 3.0;
const POOR_QUALITY_PENALTY: f64 = 8.0;

/// Score cut-points, ordered `excellent >= good >= warning >= failed`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub excellent: f64,
    pub good: f64,
    pub warning: f64,
    pub failed: f64,
}

impl Thresholds {
    const fn new(excellent: f64, good: f64, warning: f64, failed: f64) -> Self {
        Self {
            excellent,
            good,
            warning,
            failed,
        }
    }

    fn lowered_by(self, penalty: f64) -> Self {
        Self {
            excellent: self.excellent - penalty,
            good: self.good - penalty,
            warning: self.warning - penalty,
            failed: self.failed - penalty,
        }
    }
}

const SUBTLE: Thresholds = Thresholds::new(98.0, 95.0, 90.0, 90.0);
const BALANCED: Thresholds = Thresholds::new(95.0, 85.0, 75.0, 75.0);
const DRAMATIC: Thresholds = Thresholds::new(92.0, 82.0, 72.0, 72.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrengthBand {
    Subtle,
    Balanced,
    Dramatic,
}

impl StrengthBand {
    pub fn for_strength(strength: f64) -> Self {
        if strength < LOW_STRENGTH_LIMIT {
            StrengthBand::Subtle
        } else if strength < HIGH_STRENGTH_LIMIT {
            StrengthBand::Balanced
        } else {
            StrengthBand::Dramatic
        }
    }

    pub fn thresholds(self) -> Thresholds {
        match self {
            StrengthBand::Subtle => SUBTLE,
            StrengthBand::Balanced => BALANCED,
            StrengthBand::Dramatic => DRAMATIC,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StrengthBand::Subtle => "low strength: near-perfect preservation expected",
            StrengthBand::Balanced => "medium strength: standard thresholds",
            StrengthBand::Dramatic => "high strength: dramatic transformation, relaxed thresholds",
        }
    }

    pub fn adjustment_factor(self) -> f64 {
        match self {
            StrengthBand::Subtle => 1.1,
            StrengthBand::Balanced => 1.0,
            StrengthBand::Dramatic => 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Excellent,
    Good,
    Warning,
    Failed,
}

impl ValidationLevel {
    pub fn classify(score: f64, thresholds: &Thresholds) -> Self {
        if score >= thresholds.excellent {
            ValidationLevel::Excellent
        } else if score >= thresholds.good {
            ValidationLevel::Good
        } else if score >= thresholds.warning {
            ValidationLevel::Warning
        } else {
            ValidationLevel::Failed
        }
    }

    pub fn is_accepting(self) -> bool {
        matches!(self, ValidationLevel::Excellent | ValidationLevel::Good)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationLevel::Excellent => "excellent",
            ValidationLevel::Good => "good",
            ValidationLevel::Warning => "warning",
            ValidationLevel::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "excellent" => Some(ValidationLevel::Excellent),
            "good" => Some(ValidationLevel::Good),
            "warning" => Some(ValidationLevel::Warning),
            "failed" => Some(ValidationLevel::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub is_valid: bool,
    pub level: ValidationLevel,
    pub thresholds: Thresholds,
    pub band: StrengthBand,
    /// Strictness multiplier of the band; above 1 is stricter than standard.
    pub adjustment_factor: f64,
}

impl Evaluation {
    pub fn summary(&self, score: f64) -> String {
        format!(
            "{} validation (score {:.1}, required {:.1}; {}, factor {:.2})",
            self.level.as_str().to_uppercase(),
            score,
            self.thresholds.good,
            self.band.reason(),
            self.adjustment_factor
        )
    }
}

pub fn thresholds_for(strength: f64) -> Thresholds {
    StrengthBand::for_strength(strength).thresholds()
}

/// Lowers every cut-point for a noisy source image. `None` means the
/// quality was not measured and leaves the thresholds untouched.
pub fn adjust_for_image_quality(thresholds: Thresholds, image_quality: Option<f64>) -> Thresholds {
    match image_quality {
        Some(quality) if quality < PRISTINE_QUALITY => {
            let penalty = if quality >= FAIR_QUALITY {
                FAIR_QUALITY_PENALTY
            } else {
                POOR_QUALITY_PENALTY
            };
            thresholds.lowered_by(penalty)
        }
        _ => thresholds,
    }
}

pub fn evaluate(score: f64, strength: f64, image_quality: Option<f64>) -> Evaluation {
    let band = StrengthBand::for_strength(strength);
    let thresholds = adjust_for_image_quality(band.thresholds(), image_quality);
    let level = ValidationLevel::classify(score, &thresholds);
    Evaluation {
        is_valid: level.is_accepting(),
        level,
        thresholds,
        band,
        adjustment_factor: band.adjustment_factor(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges_select_expected_thresholds() {
        assert_eq!(thresholds_for(0.29), SUBTLE);
        assert_eq!(thresholds_for(0.3), BALANCED);
        assert_eq!(thresholds_for(0.69), BALANCED);
        assert_eq!(thresholds_for(0.7), DRAMATIC);
        assert_eq!(thresholds_for(1.0), DRAMATIC);
        assert_eq!(thresholds_for(0.0), SUBTLE);
    }

    #[test]
    fn good_cut_point_is_inclusive_in_every_band() {
        for strength in [0.1, 0.5, 0.9] {
            let good = thresholds_for(strength).good;
            assert!(evaluate(good, strength, None).is_valid, "strength {strength}");
            assert!(!evaluate(good - 1.0, strength, None).is_valid, "strength {strength}");
        }
    }

    #[test]
    fn levels_follow_cut_points() {
        assert_eq!(evaluate(96.0, 0.5, None).level, ValidationLevel::Excellent);
        assert_eq!(evaluate(85.0, 0.5, None).level, ValidationLevel::Good);
        assert_eq!(evaluate(80.0, 0.5, None).level, ValidationLevel::Warning);
        assert_eq!(evaluate(74.9, 0.5, None).level, ValidationLevel::Failed);
        assert!(!evaluate(80.0, 0.5, None).is_valid);
    }

    #[test]
    fn same_score_is_judged_by_strength() {
        assert!(!evaluate(90.0, 0.1, None).is_valid);
        assert!(evaluate(90.0, 0.5, None).is_valid);
        assert!(evaluate(83.0, 0.8, None).is_valid);
    }

    #[test]
    fn low_quality_source_lowers_the_bar() {
        assert_eq!(evaluate(82.0, 0.5, Some(80.0)).level, ValidationLevel::Warning);
        assert_eq!(evaluate(82.0, 0.5, Some(70.0)).level, ValidationLevel::Good);
        let poor = evaluate(77.0, 0.5, Some(40.0));
        assert_eq!(poor.thresholds.good, 77.0);
        assert!(poor.is_valid);
    }

    #[test]
    fn summary_mentions_level_and_requirement() {
        let evaluation = evaluate(90.0, 0.5, None);
        assert_eq!(
            evaluation.summary(90.0),
            "GOOD validation (score 90.0, required 85.0; medium strength: standard thresholds, factor 1.00)"
        );
    }

    #[test]
    fn stricter_bands_carry_larger_adjustment_factor() {
        let subtle = evaluate(97.0, 0.1, None);
        let dramatic = evaluate(97.0, 0.9, Some(50.0));
        assert_eq!(subtle.adjustment_factor, 1.1);
        assert_eq!(dramatic.adjustment_factor, 0.95);
        assert_eq!(evaluate(50.0, 0.5, None).adjustment_factor, 1.0);
        assert!(subtle.summary(97.0).ends_with("factor 1.10)"));
    }
}
