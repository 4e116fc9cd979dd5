//! Configuration parsing and validation for relaygate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub database: Option<DatabaseConfig>,
    pub credentials: Vec<CredentialConfig>,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Upstream backend and timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the inference backend (e.g., "https://plugin-api.example.com")
    pub base_url: String,
    /// Overall deadline for one upstream call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Deadline for establishing the upstream connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Cadence of heartbeat frames while a buffered call is outstanding
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Config variants whose `streamGenerateContent` calls are served from
    /// the upstream's native stream. Everything else goes through heartbeats.
    #[serde(default = "default_native_stream_variants")]
    pub native_stream_variants: Vec<String>,
}

fn default_request_timeout() -> u64 {
    1200
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_native_stream_variants() -> Vec<String> {
    vec!["gemini-cli".to_string()]
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Credential cache TTLs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub credential_ttl_secs: u64,
    #[serde(default = "default_ttl")]
    pub touch_throttle_secs: u64,
}

fn default_ttl() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            credential_ttl_secs: default_ttl(),
            touch_throttle_secs: default_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }

    pub fn touch_throttle(&self) -> Duration {
        Duration::from_secs(self.touch_throttle_secs)
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
    "./relaygate.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Upstream credential wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
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

/// How a caller's upstream key was resolved.
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

/// A caller and the upstream credential the gateway uses on its behalf.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub caller_id: String,
    pub api_key: Option<ApiKey>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether usage records go to the database (when one is configured)
    #[serde(default = "default_true")]
    pub log_requests: bool,
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
            log_requests: true,
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

    #[error("Environment variable '{var}' not set for caller '{caller}': {message}")]
    EnvVar {
        var: String,
        caller: String,
        message: String,
    },
}

/// Raw credential entry; `api_key` may still contain `${VAR}` references.
#[derive(Deserialize)]
pub struct RawCredentialConfig {
    caller_id: String,
    api_key: Option<String>,
}

/// Configuration exactly as written in the TOML file.
#[derive(Deserialize)]
pub struct RawConfig {
    server: ServerConfig,
    upstream: UpstreamConfig,
    #[serde(default)]
    cache: CacheConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    credentials: Vec<RawCredentialConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports several references in one value. Fails on the first missing
/// variable, an unclosed `${`, or an empty variable name.
fn expand_env_vars_with<F>(input: &str, caller_id: &str, lookup: &F) -> Result<String, ConfigError>
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
            caller: caller_id.to_string(),
            message: "Unclosed '${' in api_key".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                caller: caller_id.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            caller: caller_id.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Convention env var for a caller without an explicit key.
///
/// - "alice" -> "RELAYGATE_ALICE_API_KEY"
/// - "team-beta" -> "RELAYGATE_TEAM_BETA_API_KEY"
pub fn convention_env_var_name(caller_id: &str) -> String {
    let upper_snake = caller_id.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("RELAYGATE_{}_API_KEY", upper_snake)
}

fn real_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references.
    pub fn from_file(path: impl AsRef<Path>) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with(&content, real_env)
    }

    /// Parse configuration from a TOML string using the process environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_str_with(content, real_env).map(|(config, _)| config)
    }

    /// Parse configuration with an injected environment lookup.
    pub fn parse_str_with<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content)?;
        let (config, key_sources) = Self::from_raw(raw, &lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Resolve credential keys and build the final config.
    ///
    /// For each credential:
    /// - `api_key` containing `${VAR}`: expanded, source `EnvExpanded`
    /// - literal `api_key`: used as-is, source `Literal`
    /// - absent `api_key`: convention variable, source `Convention` or `None`
    pub fn from_raw<F>(
        raw: RawConfig,
        lookup: &F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut credentials = Vec::with_capacity(raw.credentials.len());
        let mut key_sources = Vec::with_capacity(raw.credentials.len());

        for rc in raw.credentials {
            let (api_key, source) = match rc.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars_with(raw_key, &rc.caller_id, lookup)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => {
                    let var_name = convention_env_var_name(&rc.caller_id);
                    match lookup(&var_name) {
                        Some(value) => (Some(ApiKey::from(value)), KeySource::Convention(var_name)),
                        None => (None, KeySource::None),
                    }
                }
            };

            key_sources.push((rc.caller_id.clone(), source));
            credentials.push(CredentialConfig {
                caller_id: rc.caller_id,
                api_key,
            });
        }

        let config = Config {
            server: raw.server,
            upstream: raw.upstream,
            cache: raw.cache,
            database: raw.database,
            credentials,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.upstream.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::Validation("upstream.base_url is empty".to_string()));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "upstream.base_url must be http(s): {}",
                base_url
            )));
        }

        let durations = [
            ("upstream.request_timeout_secs", self.upstream.request_timeout_secs),
            ("upstream.connect_timeout_secs", self.upstream.connect_timeout_secs),
            ("upstream.heartbeat_interval_secs", self.upstream.heartbeat_interval_secs),
            ("cache.credential_ttl_secs", self.cache.credential_ttl_secs),
            ("cache.touch_throttle_secs", self.cache.touch_throttle_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be > 0", name)));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for credential in &self.credentials {
            if credential.caller_id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "credential with empty caller_id".to_string(),
                ));
            }
            if !seen.insert(credential.caller_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate credential for caller '{}'",
                    credential.caller_id
                )));
            }
            if credential.api_key.is_none() {
                tracing::warn!(
                    caller_id = %credential.caller_id,
                    "Caller has no upstream key - its requests will be rejected"
                );
            }
        }

        if self.credentials.is_empty() && self.database.is_none() {
            tracing::warn!("No credentials and no database configured - gateway will reject all requests");
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}
