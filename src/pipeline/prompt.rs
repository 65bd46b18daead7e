use crate::pipeline::capabilities::FacialTraits;
use crate::pipeline::thresholds::StrengthBand;

const IDENTITY_RULES: &str = "FACIAL IDENTITY (MANDATORY):
- Preserve bone structure, eye shape and colour, nose, mouth and ears exactly
- Keep skin tone and texture
- Keep every distinctive mark (moles, freckles, scars)
- Anyone who knows the subject must recognise them immediately";

fn transformation_rules(band: StrengthBand) -> &'static str {
    match band {
        StrengthBand::Subtle => "MODE: SUBTLE RETOUCH
- Keep the original pose, at most 15% change
- Lighting: subtle adjustments only
- Background: keep or lightly improve the current setting
- Style: naturalistic, no dramatic filters",
        StrengthBand::Balanced => "MODE: BALANCED TRANSFORMATION
- Pose: moderate changes (30-50%)
- Lighting: moderate creativity, new light angles
- Background: may change completely
- Style: moderate artistic filters",
        StrengthBand::Dramatic => "MODE: DRAMATIC TRANSFORMATION
- Pose: radical, dynamic change (up to 80% different)
- Lighting: full creative freedom, dramatic effects
- Background: entirely new scene
- Composition: cinematic angles and perspectives",
    }
}

pub fn fidelity_instructions(strength: f64) -> String {
    let band = StrengthBand::for_strength(strength);
    format!("{}\n\n{}", transformation_rules(band), IDENTITY_RULES)
}

#[derive(Debug, Clone, Default)]
pub struct SceneDirection {
    pub pose: Option<String>,
    pub style: Option<String>,
    pub environment: Option<String>,
}

/// One-line blueprint of the subject and scene, fed to the reveal prompt.
pub fn describe_subject(traits: &FacialTraits, scene: &SceneDirection) -> String {
    let mut description = format!(
        "person with {} face, {} eyes, {} nose, {} mouth, {} skin",
        traits.shape, traits.eyes, traits.nose, traits.mouth, traits.skin
    );
    if !traits.features.is_empty() {
        description.push_str(&format!(", distinctive features: {}", traits.features.join(", ")));
    }
    if let Some(pose) = scene.pose.as_deref().filter(|value| !value.trim().is_empty()) {
        description.push_str(&format!(". posing: {pose}"));
    }
    if let Some(style) = scene.style.as_deref().filter(|value| !value.trim().is_empty()) {
        description.push_str(&format!(". style: {style}"));
    }
    let environment = scene
        .environment
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or("studio");
    description.push_str(&format!(". environment: {environment}."));
    description
}

pub fn build_reveal_prompt(
    blueprint: &str,
    strength: f64,
    custom_prompt: &str,
    resolution: &str,
    aspect_ratio: &str,
) -> String {
    let mut prompt = format!(
        "PRIMARY DIRECTIVE: the subject's facial identity in the attached image must be preserved.\n\n\
         TRANSFORMATION BLUEPRINT:\n{}\n\n{}\n",
        blueprint.trim(),
        fidelity_instructions(strength)
    );
    let custom_prompt = custom_prompt.trim();
    if !custom_prompt.is_empty() {
        prompt.push_str(&format!("\nADDITIONAL DIRECTION:\n{custom_prompt}\n"));
    }
    prompt.push_str(&format!(
        "\nOUTPUT: photorealistic, resolution {resolution}, aspect ratio {aspect_ratio}.\n\
         If creativity and identity preservation conflict, always preserve identity."
    ));
    prompt
}
