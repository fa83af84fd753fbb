//! Login manager configuration
//!
//! Loaded from TOML. Every field has a default so a partial file (or no
//! file at all) still yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lamco-login/login.toml";

/// Login manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session discovery and environment
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LoginConfig {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let sessions = &self.sessions;

        if sessions.directories.is_empty() {
            anyhow::bail!("sessions.directories must list at least one directory");
        }

        if sessions.extension.is_empty()
            || sessions.extension.contains('.')
            || sessions.extension.contains('/')
        {
            anyhow::bail!(
                "Invalid session descriptor extension: {:?} (expected e.g. \"desktop\")",
                sessions.extension
            );
        }

        if sessions.fallback.is_empty() {
            anyhow::bail!("sessions.fallback cannot be empty");
        }

        if sessions.search_path.is_empty() {
            anyhow::bail!("sessions.search_path cannot be empty");
        }

        for var in &sessions.environment {
            if var.name.is_empty() || var.name.contains('=') {
                anyhow::bail!("Invalid environment variable name: {:?}", var.name);
            }
            if var.name.contains('\0') || var.value.contains('\0') {
                anyhow::bail!("Environment variable {:?} contains a NUL byte", var.name);
            }
        }

        for dir in &sessions.directories {
            if !dir.exists() {
                tracing::debug!("Session directory not present: {:?}", dir);
            }
        }

        Ok(())
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// PAM service name
    #[serde(default = "default_pam_service")]
    pub pam_service: String,

    /// Enable audit logging of login attempts
    #[serde(default = "default_true")]
    pub audit_logging: bool,

    /// Audit log file (append-only)
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            pam_service: default_pam_service(),
            audit_logging: true,
            audit_log: default_audit_log(),
        }
    }
}

fn default_pam_service() -> String {
    "login".to_string()
}

fn default_true() -> bool {
    true
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("/var/log/lamco-login/audit.log")
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Provisioning directories scanned for session descriptors, in order
    #[serde(default = "default_session_directories")]
    pub directories: Vec<PathBuf>,

    /// Session descriptor extension (without the dot)
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Identifier offered when no descriptor is found
    #[serde(default = "default_fallback")]
    pub fallback: String,

    /// PATH given to every session
    #[serde(default = "default_search_path")]
    pub search_path: String,

    /// Extra environment variables to set
    #[serde(default)]
    pub environment: Vec<EnvVar>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directories: default_session_directories(),
            extension: default_extension(),
            fallback: default_fallback(),
            search_path: default_search_path(),
            environment: Vec::new(),
        }
    }
}

fn default_session_directories() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/share/xsessions"),
        PathBuf::from("/usr/share/wayland-sessions"),
    ]
}

fn default_extension() -> String {
    "desktop".to_string()
}

fn default_fallback() -> String {
    "failsafe".to_string()
}

fn default_search_path() -> String {
    "/usr/local/sbin:/usr/local/bin:/usr/bin".to_string()
}

/// Environment variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when neither RUST_LOG nor -v is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
