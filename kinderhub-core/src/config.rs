//! Configuration management

use crate::error::{ErrorContext, KinderhubError, KinderhubResult};
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KinderhubConfig {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Remote session authority settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Backend base URL
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string
    pub user_agent: String,
    pub endpoints: AuthEndpoints,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout_seconds: 30,
            user_agent: "kinderhub/0.1".to_string(),
            endpoints: AuthEndpoints::default(),
        }
    }
}

/// Endpoint paths relative to `base_url`
///
/// `current_user` may contain an `{id}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub sign_in: String,
    pub sign_up: String,
    pub refresh: String,
    pub logout: String,
    pub current_user: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            sign_in: "/auth/login".to_string(),
            sign_up: "/auth/register".to_string(),
            refresh: "/auth/refresh".to_string(),
            logout: "/auth/logout".to_string(),
            current_user: "/users/{id}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// One JSON file per key under `StorageConfig::dir`
    File,
    /// Process-local, lost on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Directory for the file backend; defaults to the platform data dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::File,
            dir: None,
        }
    }
}

impl StorageConfig {
    /// Resolve the storage directory
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kinderhub")
                .join("session")
        })
    }
}

/// What to do when the authoritative profile fetch fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    /// Total attempts before giving up (at least 1)
    pub max_attempts: usize,
    /// Delay before the first retry, doubled on each further retry
    pub initial_delay_ms: u64,
    /// Clear the session after the last failed attempt
    pub invalidate_on_failure: bool,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 500,
            invalidate_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub refresh: RefreshPolicy,
}

impl KinderhubConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> KinderhubResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KinderhubError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: KinderhubConfig = toml::from_str(&content).map_err(|e| KinderhubError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> KinderhubResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| KinderhubError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content).map_err(|e| KinderhubError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kinderhub")
            .join("config.toml")
    }

    /// Validate configuration
    pub fn validate(&self) -> KinderhubResult<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(KinderhubError::Config {
                message: format!("api.base_url must be an http(s) URL: {}", self.api.base_url),
                source: None,
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set api.base_url to e.g. https://example.com/api"),
            });
        }

        if self.api.timeout_seconds == 0 {
            return Err(KinderhubError::Config {
                message: "api.timeout_seconds must be greater than 0".to_string(),
                source: None,
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set api.timeout_seconds to a positive value"),
            });
        }

        if self.session.refresh.max_attempts == 0 {
            return Err(KinderhubError::Config {
                message: "session.refresh.max_attempts must be at least 1".to_string(),
                source: None,
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set session.refresh.max_attempts to 1 to disable retries"),
            });
        }

        Ok(())
    }
}
