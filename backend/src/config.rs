use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::inference::RetrySchedule;

pub const DEFAULT_SPACE_ID: &str = "DimasMP3/hf-classification-faceshape";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub frontend_origin: Option<String>,
    pub gradio: GradioConfig,
    pub inference: InferenceConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GradioConfig {
    pub url: Option<String>,
    pub space_id: Option<String>,
    pub hf_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub timeout_ms: u64,
    pub retry_delays_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            frontend_origin: None,
            gradio: GradioConfig::default(),
            inference: InferenceConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 25_000,
            retry_delays_ms: RetrySchedule::default().delays_ms().to_vec(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 30,
        }
    }
}

impl InferenceConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::new(self.retry_delays_ms.clone())
    }
}

impl AppConfig {
    /// Builds the process configuration: an optional YAML file named by
    /// `FACESHAPE_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("FACESHAPE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(path.trim())?,
            _ => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    /// Applies overrides from a key lookup (the process environment in
    /// production). Blank values are treated as unset.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(port) = get("PORT") {
            self.port = parse_number("PORT", &port)?;
        }
        if let Some(origin) = get("FRONTEND_ORIGIN") {
            self.frontend_origin = Some(origin);
        }
        if let Some(url) = get("GRADIO_URL") {
            self.gradio.url = Some(url);
        }
        if let Some(space_id) = get("GRADIO_SPACE_ID") {
            self.gradio.space_id = Some(space_id);
        }
        if let Some(token) = get("HF_TOKEN") {
            self.gradio.hf_token = Some(token);
        }
        if let Some(timeout) = get("MODEL_TIMEOUT_MS") {
            self.inference.timeout_ms = parse_number("MODEL_TIMEOUT_MS", &timeout)?;
        }
        if let Some(delays) = get("MODEL_RETRY_DELAYS_MS") {
            self.inference.retry_delays_ms = RetrySchedule::parse(&delays).delays_ms().to_vec();
        }
        if let Some(window) = get("PREDICT_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window_ms = parse_number("PREDICT_RATE_LIMIT_WINDOW_MS", &window)?;
        }
        if let Some(max) = get("PREDICT_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = parse_number("PREDICT_RATE_LIMIT_MAX", &max)?;
        }

        Ok(self)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
