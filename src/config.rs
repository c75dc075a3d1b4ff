//! Configuration management
//!
//! Layered: built-in defaults, then an optional YAML file, then
//! `PGP_SIGNER_*` environment variables, then the documented plain
//! environment names (`ADMIN_TOKEN`, `KEY_PASSPHRASE`, `ALLOWED_ISSUERS`,
//! `ALLOWED_ORIGINS`, `KEY_ID`) as final overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt};

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading/validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File missing, unparseable, or env extraction failed.
    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Admin authentication
    pub auth: AuthConfig,
    /// OIDC verification
    pub oidc: OidcConfig,
    /// Signing configuration
    pub signing: SigningConfig,
    /// Per-identity rate limiting
    pub rate_limit: RateLimitConfig,
    /// Key storage
    pub storage: StorageConfig,
    /// Audit database
    pub audit: AuditConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// CORS origin allow-list; empty means `*`
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8990,
            allowed_origins: Vec::new(),
        }
    }
}

/// Admin bearer-token configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token guarding `/admin/*`
    pub admin_token: Option<String>,
}

/// OIDC verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URLs whose tokens are accepted
    pub allowed_issuers: Vec<String>,
    /// Expected audience; unset skips the audience check
    pub audience: Option<String>,
    /// Deadline for each discovery/JWKS fetch
    #[serde(with = "humantime_serde")]
    pub fetch_deadline: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            allowed_issuers: Vec::new(),
            audience: None,
            fetch_deadline: Duration::from_secs(10),
        }
    }
}

/// Signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Passphrase unlocking stored private keys
    pub passphrase: String,
    /// Key used when a sign request names none
    pub default_key_id: Option<String>,
    /// TTL for unlocked-key cache entries
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            default_key_id: None,
            key_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fixed window size
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests per identity per window
    pub capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            capacity: 30,
        }
    }
}

/// Key storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the JSON key-store file; defaults to
    /// `~/.pgp-signer/keys.json`
    pub keys_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the key-store path, falling back to the dot-directory default.
    #[must_use]
    pub fn resolved_keys_path(&self) -> PathBuf {
        self.keys_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pgp-signer")
                .join("keys.json")
        })
    }
}

/// Audit database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// `sqlx` connection URL; unset derives a SQLite file next to the
    /// key store
    pub database_url: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { database_url: None }
    }
}

impl AuditConfig {
    /// Resolve the database URL, deriving the SQLite default when unset.
    #[must_use]
    pub fn resolved_database_url(&self, storage: &StorageConfig) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            let db_path = storage
                .resolved_keys_path()
                .with_file_name("audit.db");
            format!("sqlite://{}?mode=rwc", db_path.display())
        })
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus the environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when the file is missing/unparseable or a
    /// value fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(ConfigError::Invalid(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("PGP_SIGNER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply the documented plain environment names as final overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                self.auth.admin_token = Some(token);
            }
        }
        if let Ok(passphrase) = env::var("KEY_PASSPHRASE") {
            if !passphrase.is_empty() {
                self.signing.passphrase = passphrase;
            }
        }
        if let Ok(issuers) = env::var("ALLOWED_ISSUERS") {
            let parsed = split_list(&issuers);
            if !parsed.is_empty() {
                self.oidc.allowed_issuers = parsed;
            }
        }
        if let Ok(origins) = env::var("ALLOWED_ORIGINS") {
            self.server.allowed_origins = split_list(&origins);
        }
        if let Ok(key_id) = env::var("KEY_ID") {
            if !key_id.is_empty() {
                self.signing.default_key_id = Some(key_id);
            }
        }
    }

    /// Check the invariants the server cannot start without.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first violated requirement.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oidc.allowed_issuers.is_empty() {
            return Err(ConfigError::Invalid(
                "ALLOWED_ISSUERS must name at least one OIDC issuer".to_string(),
            ));
        }
        for issuer in &self.oidc.allowed_issuers {
            if !issuer.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "Issuer must be an https URL: {issuer}"
                )));
            }
        }
        if self.signing.passphrase.is_empty() {
            return Err(ConfigError::Invalid(
                "KEY_PASSPHRASE must be set".to_string(),
            ));
        }
        if self.auth.admin_token.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Invalid("ADMIN_TOKEN must be set".to_string()));
        }
        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Config {
    /// Summary line for startup logging; never prints secrets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} issuers={} default_key={}",
            self.server.host,
            self.server.port,
            self.oidc.allowed_issuers.len(),
            self.signing.default_key_id.as_deref().unwrap_or("-"),
        )
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.oidc.allowed_issuers =
            vec!["https://token.actions.githubusercontent.com".to_string()];
        config.signing.passphrase = "passphrase".to_string();
        config.auth.admin_token = Some("admin-token".to_string());
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.capacity, 30);
        assert_eq!(config.signing.key_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.oidc.fetch_deadline, Duration::from_secs(10));
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_requires_issuers() {
        let mut config = valid_config();
        config.oidc.allowed_issuers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_https_issuers() {
        let mut config = valid_config();
        config.oidc.allowed_issuers = vec!["http://plain.example.com".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_passphrase_and_admin_token() {
        let mut config = valid_config();
        config.signing.passphrase.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.auth.admin_token = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(
            split_list("https://a.example.com, https://b.example.com,,"),
            vec!["https://a.example.com", "https://b.example.com"]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn display_never_leaks_secrets() {
        let config = valid_config();
        let shown = config.to_string();
        assert!(!shown.contains("admin-token"));
        assert!(!shown.contains("passphrase"));
    }

    #[test]
    fn audit_url_derives_from_keys_path() {
        let storage = StorageConfig {
            keys_path: Some(PathBuf::from("/var/lib/pgp-signer/keys.json")),
        };
        let url = AuditConfig::default().resolved_database_url(&storage);
        assert_eq!(url, "sqlite:///var/lib/pgp-signer/audit.db?mode=rwc");
    }
}
