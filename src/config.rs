//! Configuration parsing and validation for cachewise.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::admission::AdmissionPolicy;
use crate::classifier::TierBoundaries;
use crate::registry::ModelProfile;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    #[serde(default)]
    pub classifier: TierBoundaries,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Requests handled at once; further requests wait
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_concurrent_requests() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./cachewise.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name; models refer to it through their `provider` field
    pub name: String,
    /// Base URL of an OpenAI-compatible API (e.g., "https://api.example.com/v1")
    pub url: String,
    pub api_key: Option<ApiKey>,
    /// HTTP timeout for a single call
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

/// A model entry: its profile plus an operator switch.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub profile: ModelProfile,
    /// Disabled models are left out of the registry entirely
    pub enabled: bool,
}

impl<'de> Deserialize<'de> for ModelConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;

        let mut table = toml::Table::deserialize(deserializer)?;
        let enabled = match table.remove("enabled") {
            Some(value) => value
                .as_bool()
                .ok_or_else(|| D::Error::custom("'enabled' must be a boolean"))?,
            None => true,
        };
        let profile = toml::Value::Table(table)
            .try_into()
            .map_err(D::Error::custom)?;
        Ok(Self { profile, enabled })
    }
}

/// Deduplication store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Dispatch and health settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Hard deadline for one provider call
    pub call_timeout_ms: u64,
    /// Output size assumed when comparing candidates before dispatch
    pub assumed_output_tokens: u64,
    /// Consecutive retryable failures that open a model's circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a probe
    pub open_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            assumed_output_tokens: 256,
            failure_threshold: 3,
            open_secs: 30,
        }
    }
}

impl RouterConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn open_for(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to log every cost event through tracing
    #[serde(default = "default_true")]
    pub log_events: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_events: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_file(path.as_ref())?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - every route will fail");
        }

        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider '{}'",
                    provider.name
                )));
            }
        }

        let mut model_ids = HashSet::new();
        for model in &self.models {
            let profile = &model.profile;
            profile.validate().map_err(ConfigError::Validation)?;
            if !provider_names.contains(profile.provider.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' refers to unknown provider '{}'",
                    profile.id(),
                    profile.provider
                )));
            }
            if !model_ids.insert(profile.id()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate model '{}'",
                    profile.id()
                )));
            }
        }

        self.classifier
            .validate()
            .map_err(ConfigError::Validation)?;
        self.admission
            .validate()
            .map_err(ConfigError::Validation)?;

        if self.dedup.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "dedup.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.router.call_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "router.call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(ConfigError::Validation(
                "server.max_concurrent_requests must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }

    /// Profiles of every enabled model.
    pub fn profiles(&self) -> Vec<ModelProfile> {
        self.models
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.profile.clone())
            .collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Raw provider config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    url: String,
    api_key: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    timeout_ms: u64,
}

/// Raw configuration deserialized directly from TOML.
/// Provider api_key values may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    dedup: DedupConfig,
    #[serde(default)]
    admission: AdmissionPolicy,
    #[serde(default)]
    classifier: TierBoundaries,
    #[serde(default)]
    router: RouterConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_name
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expand_env_vars(input: &str, provider_name: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, provider_name, |name| std::env::var(name).ok())
}

/// Convention env var for a provider's key: `CACHEWISE_<UPPER_SNAKE_NAME>_API_KEY`.
///
/// - "anthropic" -> "CACHEWISE_ANTHROPIC_API_KEY"
/// - "open-router" -> "CACHEWISE_OPEN_ROUTER_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' '], "_");
    format!("CACHEWISE_{}_API_KEY", upper_snake)
}

fn convention_key_lookup(provider_name: &str) -> Option<(String, String)> {
    let var_name = convention_env_var_name(provider_name);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

impl Config {
    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// For each provider:
    /// - If `api_key` contains `${VAR}`: expand from environment, source = `EnvExpanded`
    /// - If `api_key` is a literal string: wrap directly, source = `Literal`
    /// - If `api_key` is absent: try `CACHEWISE_<NAME>_API_KEY`,
    ///   source = `Convention(var_name)` or `KeySource::None`
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let (api_key, source) = match rp.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars(raw_key, &rp.name)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => match convention_key_lookup(&rp.name) {
                    Some((var_name, value)) => {
                        (Some(ApiKey::from(value)), KeySource::Convention(var_name))
                    }
                    None => (None, KeySource::None),
                },
            };

            key_sources.push((rp.name.clone(), source));

            providers.push(ProviderConfig {
                name: rp.name,
                url: rp.url,
                api_key,
                timeout_ms: rp.timeout_ms,
            });
        }

        let config = Config {
            server: raw.server,
            database: raw.database,
            providers,
            models: raw.models,
            dedup: raw.dedup,
            admission: raw.admission,
            classifier: raw.classifier,
            router: raw.router,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Parse a TOML string with environment variable expansion, then validate.
    pub fn parse_str_with_env(
        content: &str,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = read_file(path.as_ref())?;
        Self::parse_str_with_env(&content)
    }
}
