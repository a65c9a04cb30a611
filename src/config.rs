//! Configuration parsing and validation for switchyard.
//!
//! The config file is the static catalog of the gateway: providers and their
//! capabilities, the credentials backing each provider, the model catalog,
//! credit tiers and routing knobs.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// How each provider's credentials were resolved. Filled by secret expansion.
    #[serde(skip)]
    pub key_sources: Vec<(String, KeySource)>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Header carrying the original client IP when running behind a CDN.
    #[serde(default = "default_client_ip_header")]
    pub client_ip_header: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_client_ip_header() -> String {
    "cf-connecting-ip".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./switchyard.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Routing and failover knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Total attempts per request across all providers.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minimum tier allowed to pin a provider with `provider_name`.
    #[serde(default = "default_pin_tier")]
    pub pin_tier: i64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_pin_tier() -> i64 {
    5
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            pin_tier: default_pin_tier(),
        }
    }
}

/// Credit ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CreditsConfig {
    /// Replenishment never raises a balance above this cap.
    #[serde(default = "default_max_balance")]
    pub max_balance: f64,
    /// Seconds between replenishment sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Minimum seconds between two grants to the same account.
    #[serde(default = "default_daily_interval_secs")]
    pub daily_interval_secs: u64,
    /// Tiers at or above this value are premium: no IP lock, early access.
    #[serde(default = "default_premium_tier")]
    pub premium_tier: i64,
    /// Daily grant per tier.
    #[serde(default)]
    pub tiers: Vec<TierGrant>,
}

fn default_max_balance() -> f64 {
    5000.0
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_daily_interval_secs() -> u64 {
    86_400
}

fn default_premium_tier() -> i64 {
    2
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            max_balance: default_max_balance(),
            sweep_interval_secs: default_sweep_interval_secs(),
            daily_interval_secs: default_daily_interval_secs(),
            premium_tier: default_premium_tier(),
            tiers: Vec::new(),
        }
    }
}

impl CreditsConfig {
    /// Daily grant configured for `tier`, if any.
    pub fn daily_grant(&self, tier: i64) -> Option<f64> {
        self.tiers.iter().find(|t| t.tier == tier).map(|t| t.daily)
    }
}

/// Daily credit grant for one tier.
#[derive(Debug, Clone, Deserialize)]
pub struct TierGrant {
    pub tier: i64,
    pub daily: f64,
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Used both for upstream credentials and for gateway account keys seeded
/// from config. Only accessible via `.expose_secret()` (grep-auditable).
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
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

/// How a provider's credentials were resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Keys were literal strings in config (no ${} references)
    Literal,
    /// At least one key contained ${VAR} references expanded from environment
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

/// Which adapter implementation serves a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Any upstream speaking the OpenAI REST dialect.
    #[default]
    Openai,
}

/// Provider configuration: capability metadata plus transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    /// Short tag stamped into responses as `provider_id`
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub kind: AdapterKind,
    /// Base URL of the upstream API, without the `/v1` suffix
    pub url: String,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_tool_calling: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub free_models: Vec<String>,
    #[serde(default)]
    pub paid_models: Vec<String>,
    #[serde(default)]
    pub early_access_models: Vec<String>,
    /// Timeout for chat and other short calls
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout for image, audio and embedding calls
    #[serde(default = "default_long_timeout_secs")]
    pub long_timeout_secs: u64,
    /// Upstream accounts backing this provider
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

fn default_timeout_secs() -> u64 {
    100
}

fn default_long_timeout_secs() -> u64 {
    600
}

impl ProviderConfig {
    /// All models served, in free, paid, early-access order.
    pub fn all_models(&self) -> Vec<String> {
        self.free_models
            .iter()
            .chain(&self.paid_models)
            .chain(&self.early_access_models)
            .cloned()
            .collect()
    }
}

/// One upstream credential backing a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub api_key: ApiKey,
    #[serde(default)]
    pub organization: Option<String>,
    /// Models this credential may serve. Empty means every model of the provider.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Access class of a catalog model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelAccess {
    #[default]
    Free,
    Paid,
    EarlyAccess,
}

/// Catalog entry for a model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "default_owned_by")]
    pub owned_by: String,
    /// Endpoint paths this model may be used with
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Flat price per call. When absent the model is priced per token.
    #[serde(default)]
    pub price: Option<f64>,
    /// Credits charged per token for per-token models
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub access: ModelAccess,
    #[serde(default)]
    pub voices: Vec<String>,
}

fn default_owned_by() -> String {
    "openai".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["/v1/chat/completions".to_string()]
}

fn default_multiplier() -> f64 {
    1.0
}

/// Account created at boot when missing. Normally accounts come from the
/// community bot; seeding is for local setups and tests.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSeed {
    pub key: ApiKey,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub tier: i64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
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

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` secrets from the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string using real environment variables.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_str_with(content, |name| std::env::var(name).ok())
    }

    /// Parse configuration with a custom variable lookup.
    ///
    /// The closure-based design makes this testable without touching global env state.
    pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.expand_secrets(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve every provider's credentials.
    ///
    /// - keys containing `${VAR}` are expanded, source = `EnvExpanded`
    /// - literal keys are kept, source = `Literal`
    /// - a provider without credentials tries `SWITCHYARD_<NAME>_API_KEY`,
    ///   source = `Convention(var_name)` or `KeySource::None`
    fn expand_secrets<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut key_sources = Vec::with_capacity(self.providers.len());

        for provider in &mut self.providers {
            let source = if provider.credentials.is_empty() {
                let var_name = convention_env_var_name(&provider.name);
                match lookup(&var_name) {
                    Some(value) => {
                        provider.credentials.push(CredentialConfig {
                            api_key: ApiKey::from(value),
                            organization: None,
                            models: Vec::new(),
                        });
                        KeySource::Convention(var_name)
                    }
                    None => KeySource::None,
                }
            } else {
                let mut expanded_any = false;
                for credential in &mut provider.credentials {
                    let raw = credential.api_key.expose_secret();
                    if raw.contains("${") {
                        let expanded = expand_env_vars_with(raw, &provider.name, lookup)?;
                        credential.api_key = ApiKey::from(expanded);
                        expanded_any = true;
                    }
                }
                if expanded_any {
                    KeySource::EnvExpanded
                } else {
                    KeySource::Literal
                }
            };

            key_sources.push((provider.name.clone(), source));
        }

        self.key_sources = key_sources;
        Ok(())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - gateway will reject all routed requests");
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' is defined more than once",
                    provider.name
                )));
            }
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
        }

        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !model_ids.insert(model.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' is defined more than once",
                    model.id
                )));
            }
            if model.endpoints.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' lists no endpoints",
                    model.id
                )));
            }
        }

        if self.routing.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "routing.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.credits.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "credits.sweep_interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${PREFIX}-${SUFFIX}`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: &F,
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
            message: "Unclosed '${' in credential value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: String::new(),
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

/// Derive the convention-based env var name for a provider.
///
/// - "openai" -> "SWITCHYARD_OPENAI_API_KEY"
/// - "deep-infra" -> "SWITCHYARD_DEEP_INFRA_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' '], "_");
    format!("SWITCHYARD_{}_API_KEY", upper_snake)
}
