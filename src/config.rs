//! Layered configuration for the storefront.
//!
//! Reads `.apothecary/apothecary.toml`, then applies `APOTHECARY_*`
//! environment overrides (a `.env` file is loaded first when present), then
//! CLI flags. Every field has a default so an empty file is valid.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! dev_mode = false
//!
//! [database]
//! path = ".apothecary/shop.db"
//!
//! [auth]
//! jwt_secret = "change-me"
//! token_ttl_hours = 168
//! cookie_secure = false
//!
//! [uploads]
//! dir = ".apothecary/uploads"
//! max_bytes = 5242880
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! # dir = ".apothecary/logs"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".apothecary";
pub const CONFIG_FILE: &str = "apothecary.toml";
pub const DEFAULT_JWT_SECRET: &str = "change-me";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShopConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub uploads: UploadsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("shop.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u32,
    #[serde(default)]
    pub cookie_secure: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_hours: default_token_ttl_hours(),
            cookie_secure: false,
        }
    }
}

fn default_jwt_secret() -> String {
    DEFAULT_JWT_SECRET.to_string()
}

fn default_token_ttl_hours() -> u32 {
    24 * 7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsSection {
    #[serde(default = "default_uploads_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for UploadsSection {
    fn default() -> Self {
        Self {
            dir: default_uploads_dir(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("uploads")
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ShopConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse apothecary.toml")
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then `.env` + process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize apothecary.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `APOTHECARY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("APOTHECARY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("APOTHECARY_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid APOTHECARY_PORT '{}'", port))?;
        }
        if let Some(dev) = lookup("APOTHECARY_DEV_MODE") {
            self.server.dev_mode = dev != "false" && dev != "0";
        }
        if let Some(path) = lookup("APOTHECARY_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secret) = lookup("APOTHECARY_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(ttl) = lookup("APOTHECARY_TOKEN_TTL_HOURS") {
            self.auth.token_ttl_hours = ttl
                .parse()
                .with_context(|| format!("Invalid APOTHECARY_TOKEN_TTL_HOURS '{}'", ttl))?;
        }
        if let Some(secure) = lookup("APOTHECARY_COOKIE_SECURE") {
            self.auth.cookie_secure = secure == "true" || secure == "1";
        }
        if let Some(dir) = lookup("APOTHECARY_UPLOADS_DIR") {
            self.uploads.dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("APOTHECARY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("APOTHECARY_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(dir) = lookup("APOTHECARY_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Copy with the JWT secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.auth.jwt_secret = "********".to_string();
        copy
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.auth.jwt_secret == DEFAULT_JWT_SECRET {
            warnings.push(
                "auth.jwt_secret is the built-in default; set APOTHECARY_JWT_SECRET".to_string(),
            );
        } else if self.auth.jwt_secret.len() < 32 {
            warnings.push("auth.jwt_secret is shorter than 32 bytes".to_string());
        }
        if self.auth.token_ttl_hours == 0 {
            warnings.push("auth.token_ttl_hours is 0; every token expires immediately".to_string());
        }
        if self.server.port == 0 {
            warnings.push("server.port is 0; an ephemeral port will be chosen".to_string());
        }
        if self.uploads.max_bytes == 0 {
            warnings.push("uploads.max_bytes is 0; every upload will be rejected".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Default config path under `project_dir`.
pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ShopConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.database.path, PathBuf::from(".apothecary/shop.db"));
        assert_eq!(config.auth.token_ttl_hours, 168);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.dir.is_none());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let content = r#"
[server]
port = 9000

[logging]
format = "json"
"#;
        let config = ShopConfig::parse(content).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = ShopConfig::parse("[server]\nport = 9000\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("APOTHECARY_PORT", "7000"),
            ("APOTHECARY_JWT_SECRET", "from-env"),
            ("APOTHECARY_LOG_FORMAT", "JSON"),
            ("APOTHECARY_DEV_MODE", "true"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 7000);
        assert!(config.server.dev_mode);
        assert_eq!(config.auth.jwt_secret, "from-env");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = ShopConfig::default();
        let err = config
            .apply_env(|k| (k == "APOTHECARY_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("APOTHECARY_PORT"));
    }

    #[test]
    fn test_validate_flags_default_secret() {
        let warnings = ShopConfig::default().validate();
        assert!(warnings.iter().any(|w| w.contains("jwt_secret")));
    }

    #[test]
    fn test_validate_clean_config() {
        let mut config = ShopConfig::default();
        config.auth.jwt_secret = "a".repeat(48);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_redacted_hides_secret() {
        let mut config = ShopConfig::default();
        config.auth.jwt_secret = "super-secret".to_string();
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("super-secret"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        let mut config = ShopConfig::default();
        config.server.port = 4321;
        config.save(&path).unwrap();

        let loaded = ShopConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4321);
    }
}
