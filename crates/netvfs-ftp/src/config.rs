//! Session configuration.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::DEFAULT_PORT;
use crate::connection::ConnectionConfig;
use crate::error::{FtpError, Result};

/// User name for anonymous logins.
pub const ANONYMOUS_USER: &str = "anonymous";
/// Password sent for anonymous logins.
pub const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Everything needed to mount a session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server host name or address.
    pub host: String,
    /// Control port.
    pub port: u16,
    /// Login name; anonymous when unset.
    pub user: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Connection limit; unbounded when unset.
    pub max_connections: Option<usize>,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per read/write timeout in milliseconds.
    pub io_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            user: None,
            password: None,
            max_connections: None,
            connect_timeout_ms: 30_000,
            io_timeout_ms: 60_000,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("io_timeout_ms", &self.io_timeout_ms)
            .finish()
    }
}

impl SessionConfig {
    /// Config for `host` with everything else defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SessionConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| FtpError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| FtpError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(FtpError::Config {
                    reason: format!("unsupported config file extension: {ext:?}"),
                })
            }
        };
        Ok(config)
    }

    /// Check the values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(FtpError::Config {
                reason: "host must not be empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(FtpError::Config {
                reason: "port must not be 0".to_string(),
            });
        }
        if self.max_connections == Some(0) {
            return Err(FtpError::Config {
                reason: "max_connections must be at least 1".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(FtpError::Config {
                reason: "timeouts must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// `host`, or `host:port` for a non-standard port.
    pub fn display_name(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Login credentials, falling back to anonymous.
    pub fn credentials(&self) -> Credentials {
        match &self.user {
            Some(user) if !user.is_empty() => Credentials {
                user: user.clone(),
                password: self.password.clone().unwrap_or_default(),
            },
            _ => Credentials::anonymous(),
        }
    }

    /// Socket settings for connections of this session.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            io_timeout_ms: self.io_timeout_ms,
            ..ConnectionConfig::default()
        }
    }
}

/// User name and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub user: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// The anonymous login.
    pub fn anonymous() -> Self {
        Self {
            user: ANONYMOUS_USER.to_string(),
            password: ANONYMOUS_PASSWORD.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 21);
        assert!(config.user.is_none());
        assert!(config.max_connections.is_none());
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.io_timeout_ms, 60_000);
    }

    #[test]
    fn test_validate() {
        assert!(SessionConfig::new("ftp.example.org").validate().is_ok());
        assert!(SessionConfig::default().validate().is_err());

        let mut config = SessionConfig::new("ftp.example.org");
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::new("ftp.example.org");
        config.max_connections = Some(0);
        assert!(matches!(config.validate(), Err(FtpError::Config { .. })));
        config.max_connections = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_display_name() {
        let mut config = SessionConfig::new("ftp.example.org");
        assert_eq!(config.display_name(), "ftp.example.org");
        config.port = 2121;
        assert_eq!(config.display_name(), "ftp.example.org:2121");
    }

    #[test]
    fn test_credentials_default_to_anonymous() {
        let config = SessionConfig::new("h");
        assert_eq!(config.credentials(), Credentials::anonymous());
        assert_eq!(config.credentials().password, "anonymous@");

        let mut config = SessionConfig::new("h");
        config.user = Some("alice".into());
        config.password = Some("pw".into());
        let creds = config.credentials();
        assert_eq!(creds.user, "alice");
        assert_eq!(creds.password, "pw");
        assert!(!format!("{creds:?}").contains("pw"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = SessionConfig::new("h");
        config.password = Some("hunter2".into());
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "host": "ftp.example.org",
                "port": 2121,
                "user": "bob",
                "max_connections": 4
            }}"#
        )
        .unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "ftp.example.org");
        assert_eq!(config.port, 2121);
        assert_eq!(config.user.as_deref(), Some("bob"));
        assert_eq!(config.max_connections, Some(4));
        assert_eq!(config.io_timeout_ms, 60_000);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
host = "10.0.0.1"
io_timeout_ms = 5000
"#
        )
        .unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 21);
        assert_eq!(config.io_timeout_ms, 5000);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            SessionConfig::from_file(file.path()),
            Err(FtpError::Config { .. })
        ));
    }

    #[test]
    fn test_from_file_bad_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "host = ").unwrap();
        assert!(matches!(
            SessionConfig::from_file(file.path()),
            Err(FtpError::Config { .. })
        ));
    }
}
