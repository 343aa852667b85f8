//! Daemon configuration
//!
//! Read from `config.toml` (by default under the platform config directory,
//! e.g. `~/.config/matrixfs/config.toml`) and then overridden field by field
//! from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use common::auth::AuthDefaults;
use common::prelude::MountOptions;

pub const APP_NAME: &str = "matrixfs";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("conflicting settings: {0}")]
    Conflict(String),
    #[error("homeserver must be an http(s) url, got {0}")]
    InvalidHomeserver(String),
    #[error("verbosity must be between 0 and 3, got {0}")]
    Verbosity(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub homeserver: Option<Url>,
    /// Room id (`!abc:example.org`) whose state is mounted
    pub room: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub access_token: Option<String>,
    pub access_token_file: Option<PathBuf>,

    /// Follow live room changes after mounting
    pub listen: bool,
    /// Seconds of inactivity before file content is evicted; negative disables
    pub retention_secs: i64,
    pub reclaim_interval_secs: u64,
    pub xattr_debounce_ms: u64,
    /// Power level assumed for users when the room does not say
    pub default_user_level: i64,
    /// Power level assumed to be required for state events when the room does not say
    pub default_state_level: i64,

    /// 0 = info, 1 = debug for matrixfs, 2 = debug everywhere, 3 = trace
    pub verbosity: u8,
    /// Also write a daily rolling log file into this directory
    pub log_dir: Option<PathBuf>,

    pub mount_point: Option<PathBuf>,
    pub allow_other: bool,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = MountOptions::default();
        Self {
            homeserver: None,
            room: None,
            user: None,
            password: None,
            password_file: None,
            access_token: None,
            access_token_file: None,
            listen: true,
            retention_secs: defaults.retention_secs,
            reclaim_interval_secs: defaults.reclaim_interval.as_secs(),
            xattr_debounce_ms: defaults.debounce.as_millis() as u64,
            default_user_level: defaults.auth_defaults.user_level,
            default_state_level: defaults.auth_defaults.state_level,
            verbosity: 0,
            log_dir: None,
            mount_point: None,
            allow_other: false,
        }
    }
}

/// How the daemon authenticates against the homeserver
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { user: String, password: String },
    AccessToken(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { user, .. } => write!(f, "Password({}, ***)", user),
            Credentials::AccessToken(_) => write!(f, "AccessToken(***)"),
        }
    }
}

impl Config {
    /// `$CONFIG_DIR/matrixfs/config.toml`, when the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load `path`, or the default file when it exists, or built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Check the settings needed to talk to a homeserver
    ///
    /// With `memory` set nothing remote is needed and only the local
    /// settings are checked.
    pub fn validate(&self, memory: bool) -> Result<(), ConfigError> {
        if self.verbosity > 3 {
            return Err(ConfigError::Verbosity(self.verbosity));
        }
        if memory {
            return Ok(());
        }

        let homeserver = self
            .homeserver
            .as_ref()
            .ok_or(ConfigError::Missing("homeserver"))?;
        if !matches!(homeserver.scheme(), "http" | "https") || homeserver.cannot_be_a_base() {
            return Err(ConfigError::InvalidHomeserver(homeserver.to_string()));
        }
        if self.room.is_none() {
            return Err(ConfigError::Missing("room"));
        }

        let sources = [
            self.password.is_some() || self.password_file.is_some(),
            self.access_token.is_some() || self.access_token_file.is_some(),
        ];
        match sources.iter().filter(|set| **set).count() {
            0 => Err(ConfigError::Missing("password or access_token")),
            1 => {
                if self.password.is_some() && self.password_file.is_some() {
                    return Err(ConfigError::Conflict(
                        "password and password_file".to_string(),
                    ));
                }
                if self.access_token.is_some() && self.access_token_file.is_some() {
                    return Err(ConfigError::Conflict(
                        "access_token and access_token_file".to_string(),
                    ));
                }
                if sources[0] && self.user.is_none() {
                    return Err(ConfigError::Missing("user"));
                }
                Ok(())
            }
            _ => Err(ConfigError::Conflict(
                "a password and an access token".to_string(),
            )),
        }
    }

    /// Resolve the credential source, reading secret files as needed
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        if let Some(token) = &self.access_token {
            return Ok(Credentials::AccessToken(token.clone()));
        }
        if let Some(path) = &self.access_token_file {
            return Ok(Credentials::AccessToken(read_secret(path)?));
        }

        let user = self.user.clone().ok_or(ConfigError::Missing("user"))?;
        let password = match (&self.password, &self.password_file) {
            (Some(password), _) => password.clone(),
            (None, Some(path)) => read_secret(path)?,
            (None, None) => return Err(ConfigError::Missing("password or access_token")),
        };
        Ok(Credentials::Password { user, password })
    }

    /// Engine options derived from this config
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            listen: self.listen,
            retention_secs: self.retention_secs,
            reclaim_interval: Duration::from_secs(self.reclaim_interval_secs.max(1)),
            debounce: Duration::from_millis(self.xattr_debounce_ms),
            auth_defaults: AuthDefaults {
                user_level: self.default_user_level,
                state_level: self.default_state_level,
            },
            ..Default::default()
        }
    }
}

/// First line of a secret file, surrounding whitespace removed
fn read_secret(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    fn remote_config() -> Config {
        Config {
            homeserver: Some(Url::parse("https://matrix.example.org").unwrap()),
            room: Some("!room:example.org".to_string()),
            user: Some("@me:example.org".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "config.toml",
            r#"
            homeserver = "https://matrix.example.org"
            room = "!room:example.org"
            retention_secs = -1
            "#,
        );

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.room.as_deref(), Some("!room:example.org"));
        assert_eq!(config.retention_secs, -1);
        assert!(config.listen);
        assert_eq!(config.xattr_debounce_ms, 1000);
        assert_eq!(config.default_state_level, 50);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.toml", "listen = \"sometimes\"");
        assert!(matches!(Config::load(Some(&path)), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_requires_room_and_homeserver() {
        let mut config = remote_config();
        assert!(config.validate(false).is_ok());

        config.room = None;
        assert!(matches!(config.validate(false), Err(ConfigError::Missing("room"))));
        assert!(config.validate(true).is_ok());

        config = remote_config();
        config.homeserver = Some(Url::parse("ftp://example.org").unwrap());
        assert!(matches!(
            config.validate(false),
            Err(ConfigError::InvalidHomeserver(_))
        ));
    }

    #[test]
    fn test_validate_wants_exactly_one_credential() {
        let mut config = remote_config();
        config.access_token = Some("token".to_string());
        assert!(matches!(config.validate(false), Err(ConfigError::Conflict(_))));

        config.password = None;
        assert!(config.validate(false).is_ok());

        config.access_token = None;
        assert!(matches!(config.validate(false), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_token_file_is_read_and_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "token", "  syt_secret  \nignored\n");
        let config = Config {
            access_token_file: Some(path),
            ..remote_config()
        };
        assert_eq!(
            config.credentials().unwrap(),
            Credentials::AccessToken("syt_secret".to_string())
        );
    }

    #[test]
    fn test_mount_options_follow_config() {
        let config = Config {
            listen: false,
            retention_secs: 30,
            xattr_debounce_ms: 250,
            default_user_level: 10,
            ..Default::default()
        };
        let options = config.mount_options();
        assert!(!options.listen);
        assert_eq!(options.retention_secs, 30);
        assert_eq!(options.debounce, Duration::from_millis(250));
        assert_eq!(options.auth_defaults.user_level, 10);
        assert_eq!(options.auth_defaults.state_level, 50);
    }
}
