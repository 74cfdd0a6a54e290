//! TOML-based configuration for idmigrate.
//!
//! Destination credentials are never written into the file. The file names
//! the environment variables that hold them (`*_env` fields) and the values
//! are resolved at startup via [`AppConfig::resolve_env_vars`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run-wide settings (logging, result log location).
    #[serde(default)]
    pub run: RunConfig,

    /// Tabular input files and join settings.
    pub input: InputConfig,

    /// Destination tenant API settings.
    pub destination: DestinationConfig,

    /// Retry/backoff policy for destination calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append-only JSON-lines file holding one result per processed unit.
    #[serde(default = "default_result_log")]
    pub result_log: PathBuf,

    /// Optional file that receives a copy of the tracing output.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_result_log() -> PathBuf {
    PathBuf::from("migration-results.jsonl")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            result_log: default_result_log(),
            log_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Which column joins profile rows to password rows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinKey {
    /// The `email` column, normalized to lower case.
    #[default]
    Email,
    /// The source tenant's `userId` column.
    SourceId,
}

impl JoinKey {
    /// CSV header that carries the key.
    pub fn column(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::SourceId => "userId",
        }
    }

    /// Headers accepted for the key column, canonical name first.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Email => &["email"],
            Self::SourceId => crate::loader::USER_ID,
        }
    }

    /// Normalize a raw cell into a join key.
    pub fn normalize(self, raw: &str) -> String {
        match self {
            Self::Email => raw.trim().to_lowercase(),
            Self::SourceId => raw.trim().to_string(),
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::SourceId => write!(f, "source_id"),
        }
    }
}

/// What to do when the password file has more than one row for a key.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first row, skip and report the rest.
    #[default]
    Reject,
    /// Keep the row with the newest `createdAt`, report the displaced ones.
    Latest,
}

/// Input file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// CSV with one row per user profile.
    pub profiles: PathBuf,

    /// CSV with one row per password credential.
    pub passwords: PathBuf,

    /// Join column shared by both files.
    #[serde(default)]
    pub join_key: JoinKey,

    /// Duplicate handling for the password file.
    #[serde(default)]
    pub duplicate_passwords: DuplicatePolicy,

    /// Hash algorithm used when a password row has no `passwordHashType`.
    #[serde(default)]
    pub default_hash_algorithm: Option<String>,
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// Endpoint paths on the destination API, relative to `base_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPaths {
    /// Vendor token exchange.
    #[serde(default = "default_auth_path")]
    pub auth: String,

    /// User creation.
    #[serde(default = "default_create_user_path")]
    pub create_user: String,

    /// Lookup of an existing user by email.
    #[serde(default = "default_user_by_email_path")]
    pub user_by_email: String,

    /// Password assignment; `{userId}` is replaced with the destination ID.
    #[serde(default = "default_set_password_path")]
    pub set_password: String,
}

fn default_auth_path() -> String {
    "/auth/vendor".into()
}
fn default_create_user_path() -> String {
    "/identity/resources/users/v2".into()
}
fn default_user_by_email_path() -> String {
    "/identity/resources/users/v1/email".into()
}
fn default_set_password_path() -> String {
    "/identity/resources/users/v1/{userId}/password".into()
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            auth: default_auth_path(),
            create_user: default_create_user_path(),
            user_by_email: default_user_by_email_path(),
            set_password: default_set_password_path(),
        }
    }
}

/// Destination tenant connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// API base URL (e.g. `https://api.us.frontegg.com`).
    pub base_url: String,

    /// Environment variable holding the vendor client ID.
    pub client_id_env: String,

    /// Environment variable holding the vendor secret.
    pub secret_env: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Endpoint paths.
    #[serde(default)]
    pub paths: EndpointPaths,

    /// Resolved client ID (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub client_id: Option<String>,

    /// Resolved secret (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub secret: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl DestinationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Resolved credentials must never reach logs.
impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("base_url", &self.base_url)
            .field("client_id_env", &self.client_id_env)
            .field("secret_env", &self.secret_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("paths", &self.paths)
            .field("client_id", &self.client_id.as_ref().map(|_| "<set>"))
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubled for each later one.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, including `Retry-After`.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the `*_env` fields from environment variables.
    ///
    /// Missing variables only log a warning here; commands that talk to the
    /// destination call [`require_credentials`](Self::require_credentials).
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.destination.client_id = resolve_optional_env(
            &self.destination.client_id_env,
            "destination.client_id_env",
        );
        self.destination.secret =
            resolve_optional_env(&self.destination.secret_env, "destination.secret_env");

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Fail unless both destination credentials were resolved.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.destination.client_id.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.destination.client_id_env.clone(),
                field: "destination.client_id_env".into(),
            });
        }
        if self.destination.secret.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.destination.secret_env.clone(),
                field: "destination.secret_env".into(),
            });
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination.base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "destination.base_url".into(),
                detail: "base URL must not be empty".into(),
            });
        }
        if !self.destination.base_url.starts_with("https://")
            && !self.destination.base_url.starts_with("http://")
        {
            return Err(ConfigError::InvalidValue {
                field: "destination.base_url".into(),
                detail: "base URL must start with http:// or https://".into(),
            });
        }
        if !self.destination.paths.set_password.contains("{userId}") {
            return Err(ConfigError::InvalidValue {
                field: "destination.paths.set_password".into(),
                detail: "path must contain the {userId} placeholder".into(),
            });
        }
        if self.destination.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "destination.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_delay_ms".into(),
                detail: "base delay must not exceed max_delay_ms".into(),
            });
        }
        if self.input.profiles == self.input.passwords {
            return Err(ConfigError::InvalidValue {
                field: "input.passwords".into(),
                detail: "profiles and passwords must be different files".into(),
            });
        }
        if let Some(ref algo) = self.input.default_hash_algorithm {
            if algo.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "input.default_hash_algorithm".into(),
                    detail: "must not be empty when set".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[run]
log_level = "debug"
result_log = "/tmp/idmigrate/results.jsonl"
log_file = "/tmp/idmigrate/migration.log"

[input]
profiles = "account_data/user_details.csv"
passwords = "account_data/user_passwords.csv"
join_key = "source_id"
duplicate_passwords = "latest"
default_hash_algorithm = "bcrypt"

[destination]
base_url = "https://api.us.frontegg.com"
client_id_env = "DEST_CLIENT_ID"
secret_env = "DEST_SECRET"
timeout_secs = 10

[destination.paths]
set_password = "/custom/{userId}/pw"

[retry]
max_attempts = 5
base_delay_ms = 100
max_delay_ms = 1000
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.run.log_level, "debug");
        assert_eq!(config.input.join_key, JoinKey::SourceId);
        assert_eq!(config.input.duplicate_passwords, DuplicatePolicy::Latest);
        assert_eq!(config.input.default_hash_algorithm.as_deref(), Some("bcrypt"));
        assert_eq!(config.destination.timeout(), Duration::from_secs(10));
        assert_eq!(config.destination.paths.set_password, "/custom/{userId}/pw");
        assert_eq!(config.destination.paths.auth, "/auth/vendor");
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idmigrate.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.destination.base_url, "https://api.us.frontegg.com");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/idmigrate.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[input]
profiles = "users.csv"
passwords = "passwords.csv"
[destination]
base_url = "https://api.example.com"
client_id_env = "ID"
secret_env = "SECRET"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.run.log_level, "info");
        assert_eq!(config.run.result_log, PathBuf::from("migration-results.jsonl"));
        assert!(config.run.log_file.is_none());
        assert_eq!(config.input.join_key, JoinKey::Email);
        assert_eq!(config.input.duplicate_passwords, DuplicatePolicy::Reject);
        assert_eq!(config.destination.timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.destination.base_url = "api.example.com".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "destination.base_url"
        ));
    }

    #[test]
    fn test_validate_rejects_missing_placeholder() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.destination.paths.set_password = "/users/password".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "destination.paths.set_password"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_env_vars_and_redaction() {
        std::env::set_var("TEST_IDM_CLIENT_ID", "client-123");
        std::env::set_var("TEST_IDM_SECRET", "hunter2");

        let toml_str = r#"
[input]
profiles = "u.csv"
passwords = "p.csv"
[destination]
base_url = "https://api.example.com"
client_id_env = "TEST_IDM_CLIENT_ID"
secret_env = "TEST_IDM_SECRET"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.destination.client_id.as_deref(), Some("client-123"));
        assert_eq!(config.destination.secret.as_deref(), Some("hunter2"));
        assert!(config.require_credentials().is_ok());

        let debug = format!("{:?}", config.destination);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("client-123"));

        std::env::remove_var("TEST_IDM_CLIENT_ID");
        std::env::remove_var("TEST_IDM_SECRET");
    }

    #[test]
    fn test_require_credentials_reports_missing_var() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.destination.client_id = Some("id".into());
        config.destination.secret = None;
        assert!(matches!(
            config.require_credentials(),
            Err(ConfigError::EnvVarMissing { ref var, .. }) if var == "DEST_SECRET"
        ));
    }

    #[test]
    fn test_join_key_normalize() {
        assert_eq!(JoinKey::Email.normalize("  Alice@X.com "), "alice@x.com");
        assert_eq!(JoinKey::SourceId.normalize(" AbC-1 "), "AbC-1");
        assert_eq!(JoinKey::SourceId.column(), "userId");
    }
}
