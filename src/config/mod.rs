//! Configuration loading and management.
//!
//! Loads configuration from `./straylight.toml` (or `$STRAYLIGHT_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.
//!
//! API credentials are resolved separately from the environment only —
//! they never live in the config file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Primary API key variable.
pub const API_KEY_VAR: &str = "STRAYLIGHT_API_KEY";
/// Fallback API key variable (OpenRouter-compatible gateways).
pub const API_KEY_FALLBACK_VAR: &str = "OPENROUTER_API_KEY";
/// Primary base-URL variable.
pub const BASE_URL_VAR: &str = "STRAYLIGHT_BASE_URL";
/// Fallback base-URL variable.
pub const BASE_URL_FALLBACK_VAR: &str = "OPENROUTER_BASE_URL";
/// Gateway used when no base-URL variable is set.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Errors raised during configuration resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Neither the primary nor the fallback API key variable is set.
    #[error("missing API key: set {primary} (or {fallback})")]
    MissingApiKey {
        /// Primary variable name.
        primary: &'static str,
        /// Fallback variable name.
        fallback: &'static str,
    },
}

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StraylightConfig {
    /// Model selection.
    pub models: ModelsConfig,
    /// Request timeouts and response caps.
    pub request: RequestConfig,
    /// Transport retry policy.
    pub retry: RetryConfig,
    /// Loop, recursion and ingestion limits.
    pub limits: LimitsConfig,
    /// Store location.
    pub store: StorePathConfig,
}

impl StraylightConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing config file fails to parse.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: StraylightConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(StraylightConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("STRAYLIGHT_CONFIG_PATH")
            .map_or_else(|| PathBuf::from("straylight.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`
    /// in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("STRAYLIGHT_DEFAULT_MODEL") {
            self.models.default = v;
        }
        if let Some(v) = env("STRAYLIGHT_FAST_MODEL") {
            self.models.fast = v;
        }
        if let Some(v) = env("STRAYLIGHT_DATA_DIR") {
            self.store.data_dir = v;
        }
        if let Some(v) = env("STRAYLIGHT_TIMEOUT_MS") {
            match v.parse() {
                Ok(n) => self.request.timeout_ms = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_TIMEOUT_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_MAX_ITERATIONS") {
            match v.parse() {
                Ok(n) => self.limits.max_iterations = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_MAX_ITERATIONS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML does not parse.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: StraylightConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Models ──────────────────────────────────────────────────────

/// Model selection for the different call sites.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Main reasoning model.
    pub default: String,
    /// Cheap model for routing and dedup passes.
    pub fast: String,
    /// Vision-capable model for image rescans.
    pub vision: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: "openai/gpt-4o".to_string(),
            fast: "openai/gpt-4o-mini".to_string(),
            vision: "openai/gpt-4o".to_string(),
        }
    }
}

// ── Request ─────────────────────────────────────────────────────

/// Request timeouts and response caps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Response token cap passed to the backend.
    pub max_response_tokens: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 180_000,
            max_response_tokens: 4_096,
        }
    }
}

impl RequestConfig {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Retry ───────────────────────────────────────────────────────

/// Exponential backoff policy for transient transport failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first failure.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Delay multiplier between attempts.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms = (self.initial_delay_ms as f64 * self.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX)))
            .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

// ── Limits ──────────────────────────────────────────────────────

/// Loop, recursion and ingestion limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Default iteration cap per query.
    pub max_iterations: u32,
    /// Sub-query recursion cap.
    pub max_recursion_depth: u32,
    /// Cap on visual nodes rescanned per document during ingest.
    pub max_vision_rescan_nodes: usize,
    /// Degree of parallelism for vision rescans.
    pub vision_parallelism: usize,
    /// Per-snippet sandbox wall deadline in milliseconds.
    pub sandbox_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_recursion_depth: 3,
            max_vision_rescan_nodes: 16,
            vision_parallelism: 4,
            sandbox_timeout_ms: 10_000,
        }
    }
}

// ── Store ───────────────────────────────────────────────────────

/// Store location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorePathConfig {
    /// Base directory for collection files.
    pub data_dir: String,
}

impl Default for StorePathConfig {
    fn default() -> Self {
        Self {
            data_dir: "./straylight-store".to_string(),
        }
    }
}

// ── Credentials ─────────────────────────────────────────────────

/// Resolved API credentials. Never serialised; `Debug` redacts the key.
#[derive(Clone)]
pub struct ApiCredentials {
    /// Bearer key for the chat gateway.
    pub api_key: String,
    /// Gateway base URL.
    pub base_url: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"__REDACTED__")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ApiCredentials {
    /// Resolve credentials from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingApiKey`] when neither key variable is
    /// set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve credentials through an injected resolver (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingApiKey`] when neither key variable
    /// resolves.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = env(API_KEY_VAR)
            .or_else(|| env(API_KEY_FALLBACK_VAR))
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey {
                primary: API_KEY_VAR,
                fallback: API_KEY_FALLBACK_VAR,
            })?;
        let base_url = env(BASE_URL_VAR)
            .or_else(|| env(BASE_URL_FALLBACK_VAR))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self { api_key, base_url })
    }
}

// ── Tests ───────────────────────────────────────────────────────
