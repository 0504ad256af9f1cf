//! Server configuration with layered loading.
//!
//! Configuration comes from a TOML file plus `SHALE_`-prefixed
//! environment overrides. Validation happens after extraction and is
//! fatal at startup: an invalid log level, TLS without both certificate
//! and key, an unusable storage directory, or the FTP backend selected
//! without FTP settings all refuse to serve.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Parse(Box<figment::Error>),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(Box::new(err))
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShaleConfig {
    /// Listen address and optional TLS settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Log verbosity.
    #[serde(default)]
    pub log: LogSettings,

    /// Authentication settings.
    pub auth: AuthSettings,

    /// Storage backend selection and paths.
    pub storage: StorageSettings,
}

impl ShaleConfig {
    /// Load from the given file, with `SHALE_` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SHALE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string; used by tests and tooling.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.log.level()?;
        if let Some(tls) = &self.server.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "tls requires both cert and key".to_string(),
                ));
            }
        }
        if self.auth.password_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "auth.password_file must be set".to_string(),
            ));
        }
        if self.storage.directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.directory must be set".to_string(),
            ));
        }
        if self.storage.backend == BackendKind::Ftp && self.storage.ftp.is_none() {
            return Err(ConfigError::Invalid(
                "storage.ftp settings are required for the ftp backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listen address and TLS.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// TLS settings; absent means plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls: None,
        }
    }
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 443)
}

/// TLS certificate and key paths (PEM).
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Log verbosity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogSettings {
    /// The tracing filter directive for the configured level.
    pub fn level(&self) -> Result<&'static str, ConfigError> {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "info" => Ok("info"),
            "" | "warn" => Ok("warn"),
            "error" => Ok("error"),
            "off" => Ok("off"),
            other => Err(ConfigError::Invalid(format!(
                "{other} is an invalid log level"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// Path to the password file.
    pub password_file: PathBuf,
}

/// Storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: BackendKind,

    /// Storage root for the file backend; local staging directory for
    /// the ftp backend.
    pub directory: PathBuf,

    /// FTP settings, required when `backend = "ftp"`.
    #[serde(default)]
    pub ftp: Option<FtpSettings>,
}

/// Which backend persists shards.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Ftp,
}

/// Remote FTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FtpSettings {
    /// Server address as `host:port`.
    pub server: String,
    pub username: String,
    pub password: String,
    /// Base directory on the server.
    pub base_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = ShaleConfig::parse(
            r#"
            [auth]
            password_file = "/var/lib/shale/passwd"

            [storage]
            directory = "/var/lib/shale/store"
        "#,
        )
        .unwrap();
        assert_eq!(config.server.listen.port(), 443);
        assert!(config.server.tls.is_none());
        assert_eq!(config.log.level().unwrap(), "warn");
        assert_eq!(config.storage.backend, BackendKind::File);
    }

    #[test]
    fn ftp_backend_requires_settings() {
        let result = ShaleConfig::parse(
            r#"
            [auth]
            password_file = "/etc/shale/passwd"

            [storage]
            backend = "ftp"
            directory = "/var/lib/shale/staging"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = ShaleConfig::parse(
            r#"
            [auth]
            password_file = "/etc/shale/passwd"

            [storage]
            backend = "ftp"
            directory = "/var/lib/shale/staging"

            [storage.ftp]
            server = "ftp.example.com:21"
            username = "archive"
            password = "hunter2"
            base_dir = "/archive"
        "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, BackendKind::Ftp);
        let ftp = config.storage.ftp.unwrap();
        assert_eq!(ftp.server, "ftp.example.com:21");
        assert_eq!(ftp.base_dir, "/archive");
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let result = ShaleConfig::parse(
            r#"
            [log]
            level = "loud"

            [auth]
            password_file = "/etc/shale/passwd"

            [storage]
            directory = "/var/lib/shale/store"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn tls_settings_parse() {
        let config = ShaleConfig::parse(
            r#"
            [server]
            listen = "0.0.0.0:8443"

            [server.tls]
            cert = "/etc/ssl/shale.crt"
            key = "/etc/ssl/shale.key"

            [auth]
            password_file = "/etc/shale/passwd"

            [storage]
            directory = "/var/lib/shale/store"
        "#,
        )
        .unwrap();
        let tls = config.server.tls.unwrap();
        assert_eq!(tls.cert, PathBuf::from("/etc/ssl/shale.crt"));
        assert_eq!(tls.key, PathBuf::from("/etc/ssl/shale.key"));
        assert_eq!(config.server.listen.port(), 8443);
    }

    #[test]
    fn missing_required_sections_fail() {
        assert!(ShaleConfig::parse("").is_err());
        assert!(ShaleConfig::parse("[auth]\npassword_file = \"/p\"\n").is_err());
    }
}
