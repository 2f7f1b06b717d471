//! Environment configuration.
//!
//! Binaries call `dotenv::dotenv().ok()` first, so values may come from a
//! `.env` file. Each setting has an `AI_*` name and, where one exists, the
//! `OPENAI_*` name as a fallback.

use crate::error::{AssistantError, Result};
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_ENDPOINT: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-coder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Raw error detail is only returned to clients outside production.
    pub fn exposes_errors(&self) -> bool {
        *self != Environment::Production
    }
}

impl FromStr for Environment {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" | "test" | "" => Ok(Environment::Development),
            other => Err(AssistantError::Config(format!("unknown APP_ENV '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub api_key: Option<String>,
    pub api_endpoint: String,
    pub model: String,
    pub timeout: Duration,
    pub max_attempts: usize,
    pub environment: Environment,
    pub data_path: PathBuf,
    /// Collection for pipelines that name none; `None` rejects them.
    pub default_pipeline_collection: Option<String>,
    pub narration_row_limit: usize,
    pub bind_addr: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            environment: Environment::Development,
            data_path: PathBuf::from("data/inventory.json"),
            default_pipeline_collection: Some("products".to_string()),
            narration_row_limit: 50,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AssistantConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| lookup(k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };
        let mut config = Self::default();

        config.api_key = get(&["AI_API_KEY", "OPENAI_API_KEY"]);
        if let Some(endpoint) = get(&["AI_API_ENDPOINT", "OPENAI_BASE_URL"]) {
            config.api_endpoint = endpoint;
        }
        if let Some(model) = get(&["AI_MODEL", "OPENAI_MODEL"]) {
            config.model = model;
        }
        if let Some(secs) = get(&["AI_TIMEOUT_SECS"]) {
            config.timeout = Duration::from_secs(parse_number(&secs, "AI_TIMEOUT_SECS")?);
        }
        if let Some(attempts) = get(&["AI_MAX_ATTEMPTS"]) {
            config.max_attempts = parse_number::<usize>(&attempts, "AI_MAX_ATTEMPTS")?.max(1);
        }
        if let Some(env) = get(&["APP_ENV", "NODE_ENV"]) {
            config.environment = env.parse()?;
        }
        if let Some(path) = get(&["INVENTORY_DATA"]) {
            config.data_path = PathBuf::from(path);
        }
        if let Some(collection) = get(&["PIPELINE_DEFAULT_COLLECTION"]) {
            config.default_pipeline_collection = match collection.to_lowercase().as_str() {
                "none" | "off" => None,
                _ => Some(collection),
            };
        }
        if let Some(limit) = get(&["NARRATION_ROW_LIMIT"]) {
            config.narration_row_limit = parse_number::<usize>(&limit, "NARRATION_ROW_LIMIT")?.max(1);
        }
        if let Some(addr) = get(&["BIND_ADDR"]) {
            config.bind_addr = addr;
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(1), self.timeout)
    }
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AssistantError::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AssistantConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AssistantConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.api_endpoint, DEFAULT_API_ENDPOINT);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.default_pipeline_collection.as_deref(), Some("products"));
        assert!(config.environment.exposes_errors());
    }

    #[test]
    fn test_openai_names_are_fallbacks() {
        let config = config(&[
            ("OPENAI_API_KEY", "sk-openai"),
            ("AI_MODEL", "gpt-4o-mini"),
            ("OPENAI_MODEL", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.model, "gpt-4o-mini");
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("APP_ENV", "production"),
            ("PIPELINE_DEFAULT_COLLECTION", "none"),
            ("AI_TIMEOUT_SECS", "5"),
            ("NARRATION_ROW_LIMIT", "10"),
        ])
        .unwrap();
        assert!(!config.environment.exposes_errors());
        assert!(config.default_pipeline_collection.is_none());
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.narration_row_limit, 10);
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = config(&[("AI_MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(err, AssistantError::Config(_)));
    }
}
