//! Configuration module for Resumable Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion, human readable byte sizes, and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

// ============================================================================
// Byte Sizes
// ============================================================================

/// Parse a byte size such as `1024`, `512KB`, `5 GB` or `1.5MB`.
///
/// Units are binary multiples (1KB = 1024 bytes), case-insensitive.
pub fn parse_byte_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        _ => return None,
    };
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some((number * multiplier as f64) as u64)
}

/// Accept either an integer or a human readable size string.
fn deserialize_byte_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Human(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Human(s) => {
            let expanded = expand_env_vars(&s);
            parse_byte_size(&expanded).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid byte size '{}'", expanded))
            })
        }
    }
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

fn deserialize_option_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)))
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub protocols: ProtocolsConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mounts = self.protocols.enabled();
        if mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one protocol must be enabled".into(),
            ));
        }

        for (name, mount) in &mounts {
            if !mount.path_prefix.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Protocol '{}' path_prefix must start with '/'",
                    name
                )));
            }
        }

        if let [(_, a), (_, b)] = mounts.as_slice() {
            if a.path_prefix.trim_end_matches('/') == b.path_prefix.trim_end_matches('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Protocols share the path_prefix '{}'",
                    a.path_prefix
                )));
            }
        }

        if self.storage.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "storage.max_upload_size must be greater than zero".into(),
            ));
        }

        if self.storage.directory.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.directory cannot be empty".into(),
            ));
        }

        if let Some(ref jwt) = self.identity.jwt {
            match jwt.algorithm.to_uppercase().as_str() {
                "HS256" | "RS256" | "ES256" => {}
                alg => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid JWT algorithm '{}': must be 'HS256', 'RS256' or 'ES256'",
                        alg
                    )))
                }
            }
            if jwt.secret.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "identity.jwt.secret cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address", deserialize_with = "deserialize_with_env")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// How `create` assigns upload ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    /// Random id per create call
    #[default]
    Unique,
    /// Id derived from owner, size, content type and metadata; a repeated
    /// create returns the existing upload instead of allocating a new one
    ContentHash,
}

/// Storage configuration consumed by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for payloads and sidecar state
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(
        default = "default_max_upload_size",
        deserialize_with = "deserialize_byte_size"
    )]
    pub max_upload_size: u64,
    #[serde(
        default = "default_max_metadata_size",
        deserialize_with = "deserialize_byte_size"
    )]
    pub max_metadata_size: u64,
    /// Emit `Location` headers without scheme and host
    #[serde(default)]
    pub use_relative_location: bool,
    #[serde(default)]
    pub id_policy: IdPolicy,
}

impl StorageConfig {
    /// Defaults rooted at `directory`
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_upload_size: default_max_upload_size(),
            max_metadata_size: default_max_metadata_size(),
            use_relative_location: false,
            id_policy: IdPolicy::default(),
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("./files")
}

fn default_max_upload_size() -> u64 {
    5 << 40 // 5TB
}

fn default_max_metadata_size() -> u64 {
    4 << 20 // 4MB
}

/// Which protocols are served and where
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolsConfig {
    #[serde(default = "default_tus_mount")]
    pub tus: ProtocolMount,
    #[serde(default = "default_uploadx_mount")]
    pub uploadx: ProtocolMount,
}

impl ProtocolsConfig {
    /// Enabled mounts with their protocol names
    pub fn enabled(&self) -> Vec<(&'static str, &ProtocolMount)> {
        [("tus", &self.tus), ("uploadx", &self.uploadx)]
            .into_iter()
            .filter(|(_, mount)| mount.enabled)
            .collect()
    }
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            tus: default_tus_mount(),
            uploadx: default_uploadx_mount(),
        }
    }
}

/// Protocol mount point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMount {
    #[serde(default = "default_protocol_enabled")]
    pub enabled: bool,
    pub path_prefix: String,
}

fn default_protocol_enabled() -> bool {
    true
}

fn default_tus_mount() -> ProtocolMount {
    ProtocolMount {
        enabled: true,
        path_prefix: "/files".into(),
    }
}

fn default_uploadx_mount() -> ProtocolMount {
    ProtocolMount {
        enabled: true,
        path_prefix: "/upload".into(),
    }
}

/// User identity extraction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Request header carrying an already authenticated user id
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
}

/// JWT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret (HS256) or PEM public key (RS256/ES256)
    #[serde(deserialize_with = "deserialize_with_env")]
    pub secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub issuer: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub audience: Option<String>,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocols.tus.path_prefix, "/files");
        assert_eq!(config.storage.id_policy, IdPolicy::Unique);
    }

    #[test]
    fn test_config_validation_no_protocols() {
        let mut config = Config::default();
        config.protocols.tus.enabled = false;
        config.protocols.uploadx.enabled = false;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_shared_prefix() {
        let mut config = Config::default();
        config.protocols.uploadx.path_prefix = "/files/".into();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_jwt_algorithm() {
        let mut config = Config::default();
        config.identity.jwt = Some(JwtConfig {
            secret: "s".into(),
            algorithm: "none".into(),
            issuer: None,
            audience: None,
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1024"), Some(1024));
        assert_eq!(parse_byte_size("4KB"), Some(4096));
        assert_eq!(parse_byte_size("5 gb"), Some(5 << 30));
        assert_eq!(parse_byte_size("1.5MB"), Some(1572864));
        assert_eq!(parse_byte_size("ten"), None);
        assert_eq!(parse_byte_size("10XB"), None);
    }

    #[test]
    fn test_storage_config_accepts_human_sizes() {
        let yaml = "directory: /tmp/up\n\
                    max_upload_size: 2GB\n\
                    max_metadata_size: 512\n\
                    id_policy: content_hash\n";
        let storage: StorageConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(storage.max_upload_size, 2 << 30);
        assert_eq!(storage.max_metadata_size, 512);
        assert_eq!(storage.id_policy, IdPolicy::ContentHash);
        assert!(!storage.use_relative_location);
    }
}
