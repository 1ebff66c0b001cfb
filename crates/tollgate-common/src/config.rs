use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("config is missing required field: {0}")]
    MissingField(&'static str),
}

/// One tier of the hierarchical rate limiter: either the global limiter or
/// the per-user limiter template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitTier {
    #[serde(rename = "requests_per_minute", default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(rename = "concurrent_limit", default = "default_concurrent_limit")]
    pub concurrent_limit: u32,
    #[serde(rename = "queue_size", default = "default_queue_size")]
    pub queue_size: u32,
}

impl Default for RateLimitTier {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            concurrent_limit: default_concurrent_limit(),
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub global: RateLimitTier,
    #[serde(default)]
    pub per_user: RateLimitTier,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: RateLimitTier {
                requests_per_minute: 3000,
                concurrent_limit: 64,
                queue_size: 128,
            },
            per_user: RateLimitTier::default(),
            enabled: true,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoints: HashSet<String>,
    #[serde(default)]
    pub models: HashSet<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: HashSet::new(),
            models: HashSet::new(),
            default_model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_json_secs")]
    pub timeout_json_secs: u64,
    #[serde(default = "default_timeout_multipart_secs")]
    pub timeout_multipart_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: HashSet<u16>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_json_secs: default_timeout_json_secs(),
            timeout_multipart_secs: default_timeout_multipart_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            retryable_statuses: default_retryable_statuses(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Top-level parsed configuration document.
///
/// Mirrors the on-disk JSON sections verbatim (`RATE_LIMITING`, `ALLOWLIST`,
/// `HTTP_CLIENT`, `OPENAI_API_KEY`) plus a handful of process-level knobs
/// that have no natural home in any one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "RATE_LIMITING", default)]
    pub rate_limiting: RateLimitConfig,
    #[serde(rename = "ALLOWLIST", default)]
    pub allowlist: AllowlistConfig,
    #[serde(rename = "HTTP_CLIENT", default)]
    pub http_client: HttpClientConfig,
    #[serde(rename = "OPENAI_API_KEY", default)]
    pub openai_api_key: String,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_access_log_path")]
    pub access_log_path: String,
    #[serde(default = "default_usage_db_path")]
    pub usage_db_path: String,
    #[serde(default = "default_drain_deadline_secs")]
    pub drain_deadline_secs: u64,
}

impl AppConfig {
    /// Loads and validates a config document from `path`, then applies the
    /// `OPENAI_API_KEY` environment overlay when the file left it blank.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let raw = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path_display,
                source,
            })?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overlay(&mut self) {
        if self.openai_api_key.trim().is_empty() {
            if let Ok(value) = std::env::var("OPENAI_API_KEY") {
                self.openai_api_key = value;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.openai_api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("OPENAI_API_KEY"));
        }
        if self.allowlist.default_model.trim().is_empty() {
            return Err(ConfigError::MissingField("ALLOWLIST.default_model"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_rpm() -> u32 {
    60
}
fn default_concurrent_limit() -> u32 {
    5
}
fn default_queue_size() -> u32 {
    10
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_timeout_json_secs() -> u64 {
    120
}
fn default_timeout_multipart_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retryable_statuses() -> HashSet<u16> {
    [429, 500, 502, 503, 504].into_iter().collect()
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_key_file() -> String {
    "keys.json".to_string()
}
fn default_staging_dir() -> String {
    "tollgate-staging".to_string()
}
fn default_access_log_path() -> String {
    "tollgate-access.log".to_string()
}
fn default_usage_db_path() -> String {
    "tollgate-usage.sqlite3".to_string()
}
fn default_drain_deadline_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
        file.write_all(body.as_bytes()).expect("write temp config");
        file
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let fixture = write_temp_config(
            r#"{
                "OPENAI_API_KEY": "sk-test",
                "ALLOWLIST": {"default_model": "gpt-4o-mini"}
            }"#,
        );
        let config = AppConfig::load(fixture.path()).expect("parse minimal config");
        assert_eq!(config.openai_api_key, "sk-test");
        assert_eq!(config.rate_limiting.per_user.requests_per_minute, 60);
        assert_eq!(config.http_client.max_retries, 3);
        assert!(config.http_client.retryable_statuses.contains(&429));
    }

    #[test]
    fn missing_api_key_without_env_fails() {
        let fixture = write_temp_config(r#"{"ALLOWLIST": {"default_model": "gpt-4o-mini"}}"#);
        // SAFETY: this test does not run concurrently with another test that reads this var.
        unsafe {
            std::env::remove_var("OPENAI_API_KEY");
        }
        let err = AppConfig::load(fixture.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("OPENAI_API_KEY")));
    }

    #[test]
    fn full_config_overrides_every_default() {
        let fixture = write_temp_config(
            r#"{
                "RATE_LIMITING": {
                    "global": {"requests_per_minute": 1000, "concurrent_limit": 20, "queue_size": 40},
                    "per_user": {"requests_per_minute": 30, "concurrent_limit": 2, "queue_size": 5},
                    "enabled": true,
                    "metrics_enabled": false
                },
                "ALLOWLIST": {
                    "enabled": true,
                    "endpoints": ["/v1/chat/completions"],
                    "models": ["gpt-4o-mini"],
                    "default_model": "gpt-4o-mini"
                },
                "HTTP_CLIENT": {
                    "base_url": "https://example.test",
                    "max_retries": 5
                },
                "OPENAI_API_KEY": "sk-full"
            }"#,
        );
        let config = AppConfig::load(fixture.path()).expect("parse full config");
        assert_eq!(config.rate_limiting.per_user.concurrent_limit, 2);
        assert_eq!(config.http_client.base_url, "https://example.test");
        assert_eq!(config.http_client.max_retries, 5);
        assert!(!config.rate_limiting.metrics_enabled);
        assert!(config.allowlist.endpoints.contains("/v1/chat/completions"));
    }
}
