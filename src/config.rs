//! Engine configuration.
//!
//! Settings come from an optional TOML file, then `RPI_*` environment
//! overrides, then `validate()`. Every field has a default so an empty file
//! (or no file) is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::AppError;
use crate::validation::require_in_range;

/// Upper bound for the improvement iteration count.
pub const MAX_ITERATIONS: u32 = 100;

pub const MAX_TOKENS_MIN: u32 = 1;
pub const MAX_TOKENS_MAX: u32 = 128_000;
pub const TIME_LIMIT_MIN_MS: u64 = 1_000;
pub const TIME_LIMIT_MAX_MS: u64 = 600_000;
pub const MAX_TOOL_ITERATIONS_MIN: u32 = 1;
pub const MAX_TOOL_ITERATIONS_MAX: u32 = 50;
pub const MAX_CONCURRENT_TESTS_MAX: usize = 8;

/// Global call settings applied to every model call in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(default)]
pub struct EngineSettings {
    pub max_tokens: u32,
    #[ts(type = "number")]
    pub time_limit_ms: u64,
    pub temperature: f32,
    /// Maximum model ↔ tool round trips inside a single test-pair call.
    pub max_tool_iterations: u32,
    /// Test pairs evaluated in parallel within one iteration.
    #[ts(type = "number")]
    pub max_concurrent_tests: usize,
    #[ts(type = "number")]
    pub rag_top_k: usize,
    pub rag_min_similarity: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            time_limit_ms: 60_000,
            temperature: 0.7,
            max_tool_iterations: 5,
            max_concurrent_tests: 1,
            rag_top_k: 5,
            rag_min_similarity: 0.0,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        require_in_range("max_tokens", self.max_tokens, MAX_TOKENS_MIN, MAX_TOKENS_MAX)?;
        require_in_range(
            "time_limit_ms",
            self.time_limit_ms,
            TIME_LIMIT_MIN_MS,
            TIME_LIMIT_MAX_MS,
        )?;
        require_in_range("temperature", self.temperature, 0.0, 1.0)?;
        require_in_range(
            "max_tool_iterations",
            self.max_tool_iterations,
            MAX_TOOL_ITERATIONS_MIN,
            MAX_TOOL_ITERATIONS_MAX,
        )?;
        require_in_range(
            "max_concurrent_tests",
            self.max_concurrent_tests,
            1,
            MAX_CONCURRENT_TESTS_MAX,
        )?;
        require_in_range("rag_top_k", self.rag_top_k, 1, 50)?;
        require_in_range("rag_min_similarity", self.rag_min_similarity, 0.0, 1.0)?;
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), AppError> {
        if let Some(v) = env_parse("RPI_MAX_TOKENS")? {
            self.max_tokens = v;
        }
        if let Some(v) = env_parse("RPI_TIME_LIMIT_MS")? {
            self.time_limit_ms = v;
        }
        if let Some(v) = env_parse("RPI_TEMPERATURE")? {
            self.temperature = v;
        }
        if let Some(v) = env_parse("RPI_MAX_TOOL_ITERATIONS")? {
            self.max_tool_iterations = v;
        }
        if let Some(v) = env_parse("RPI_MAX_CONCURRENT_TESTS")? {
            self.max_concurrent_tests = v;
        }
        Ok(())
    }
}

/// Connection details for the bundled OpenAI-compatible provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub organization: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            organization: None,
        }
    }
}

/// Top-level settings file layout.
///
/// ```toml
/// [engine]
/// max_concurrent_tests = 2
///
/// [provider]
/// base_url = "http://localhost:11434/v1"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub provider: ProviderSettings,
}

impl Settings {
    /// Load settings from `path` (if given and present), apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                Self::from_toml(&raw)?
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "Settings file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        settings.engine.apply_env()?;
        if let Ok(url) = std::env::var("RPI_PROVIDER_BASE_URL") {
            settings.provider.base_url = url;
        }
        if let Ok(key) = std::env::var("RPI_PROVIDER_API_KEY") {
            settings.provider.api_key = Some(key);
        }

        settings.engine.validate()?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AppError> {
        toml::from_str(raw).map_err(|e| AppError::Validation(format!("Invalid settings file: {e}")))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}
