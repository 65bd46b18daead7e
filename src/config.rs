use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;

use crate::pipeline::ladder::{DEFAULT_ANALYSIS_LADDER, DEFAULT_IMAGE_LADDER};
use crate::pipeline::reveal::{DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_SUCCESS_FLOOR};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub database_url: String,
    pub metrics_namespace: String,
    pub gemini_api_key: String,
    pub gemini_api_base: String,
    pub gemini_request_timeout_secs: u64,
    pub gemini_safety_settings: String,
    pub image_model_ladder: Vec<String>,
    pub analysis_model_ladder: Vec<String>,
    pub analysis_thinking_budget: u32,
    pub reveal_max_attempts: usize,
    pub reveal_backoff_ms: u64,
    pub reveal_success_floor: f64,
    pub source_image_max_side: u32,
    pub source_image_jpeg_quality: u8,
    pub output_dir: PathBuf,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_csv(name: &str, default: &[&str]) -> Vec<String> {
    match env::var(name) {
        Ok(value) => parse_csv(&value, default),
        Err(_) => default.iter().map(|entry| entry.to_string()).collect(),
    }
}

fn parse_csv(value: &str, default: &[&str]) -> Vec<String> {
    let entries: Vec<String> = value
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect();
    if entries.is_empty() {
        default.iter().map(|entry| entry.to_string()).collect()
    } else {
        entries
    }
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn normalize_success_floor(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

impl Config {
    pub fn load() -> Result<Self> {
        let metrics_namespace = env_string("METRICS_NAMESPACE", "reveal_metrics")
            .trim()
            .to_string();
        if metrics_namespace.is_empty() {
            return Err(anyhow!("METRICS_NAMESPACE must not be empty"));
        }

        let jpeg_quality = env_u32("SOURCE_IMAGE_JPEG_QUALITY", 90).clamp(1, 100);

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://darkroom.db",
            )),
            metrics_namespace,
            gemini_api_key: env_string("GEMINI_API_KEY", "").trim().to_string(),
            gemini_api_base: env_string(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            gemini_request_timeout_secs: env_u64("GEMINI_REQUEST_TIMEOUT_SECS", 120),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            image_model_ladder: env_csv("IMAGE_MODEL_LADDER", DEFAULT_IMAGE_LADDER),
            analysis_model_ladder: env_csv("ANALYSIS_MODEL_LADDER", DEFAULT_ANALYSIS_LADDER),
            analysis_thinking_budget: env_u32("ANALYSIS_THINKING_BUDGET", 2048),
            reveal_max_attempts: env_usize("REVEAL_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            reveal_backoff_ms: env_u64("REVEAL_BACKOFF_MS", DEFAULT_BACKOFF_MS),
            reveal_success_floor: normalize_success_floor(env_f64(
                "REVEAL_SUCCESS_FLOOR",
                DEFAULT_SUCCESS_FLOOR,
            )),
            source_image_max_side: env_u32("SOURCE_IMAGE_MAX_SIDE", 1536).max(64),
            source_image_jpeg_quality: u8::try_from(jpeg_quality).unwrap_or(90),
            output_dir: PathBuf::from(env_string("OUTPUT_DIR", "output")),
        })
    }
}
