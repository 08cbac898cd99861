//! Settings file schema and loader
//!
//! Settings live in `duet.toml` under the platform config directory.
//! Every section and field has a default, so a missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{PeerId, PeerProfile};

/// Default port for Duet servers
pub const DEFAULT_PORT: u16 = 7440;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "duet.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientSettings,
    pub sync: SyncSettings,
    pub server: ServerSettings,
}

/// Connection to the conversation host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_addr: String,
    /// Bearer token identifying the local user
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            token: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Conversation refresh behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Subscribe to change notifications from the host
    pub enable_realtime: bool,
    /// Periodic refresh; 0 disables polling
    pub poll_interval_ms: u64,
    /// Tolerance when matching a local send against the server's copy
    pub match_window_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enable_realtime: true,
            poll_interval_ms: 0,
            match_window_ms: 10_000,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn match_window(&self) -> Duration {
        Duration::from_millis(self.match_window_ms)
    }
}

/// Conversation host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub users: Vec<UserRecord>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            users: Vec::new(),
        }
    }
}

/// A user known to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: PeerId,
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

impl UserRecord {
    pub fn profile(&self) -> PeerProfile {
        PeerProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            profile_image: self.profile_image.clone(),
            is_live: false,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`, or from the default location
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let settings = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Location of the settings file in the platform config directory
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "duet", "duet")
            .ok_or_else(|| Error::Config("Could not determine config directory".into()))?;
        Ok(dirs.config_dir().join(SETTINGS_FILE))
    }

    fn validate(&self) -> Result<()> {
        let users = &self.server.users;
        for (i, user) in users.iter().enumerate() {
            if user.id.is_empty() {
                return Err(Error::Config(format!("server.users[{}] has an empty id", i)));
            }
            if user.token.trim().is_empty() {
                return Err(Error::Config(format!("User {} has an empty token", user.id)));
            }
            if users[..i].iter().any(|u| u.id == user.id) {
                return Err(Error::Config(format!("Duplicate user id {}", user.id)));
            }
            if users[..i].iter().any(|u| u.token == user.token) {
                return Err(Error::Config(format!("User {} reuses another user's token", user.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.client.server_addr, "127.0.0.1:7440");
        assert!(settings.sync.enable_realtime);
        assert_eq!(settings.sync.poll_interval(), None);
        assert_eq!(settings.sync.match_window(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file() {
        let settings = Settings::from_toml_str(
            r#"
            [sync]
            poll_interval_ms = 2500

            [[server.users]]
            id = "u1"
            name = "Alice"
            token = "alice-secret"
            "#,
        )
        .unwrap();

        assert_eq!(settings.sync.poll_interval(), Some(Duration::from_millis(2500)));
        assert!(settings.sync.enable_realtime);
        assert_eq!(settings.server.port, DEFAULT_PORT);
        assert_eq!(settings.server.users.len(), 1);
        assert_eq!(settings.server.users[0].profile().name, "Alice");
    }

    #[test]
    fn test_duplicate_tokens_rejected() {
        let result = Settings::from_toml_str(
            r#"
            [[server.users]]
            id = "u1"
            name = "Alice"
            token = "same"

            [[server.users]]
            id = "u2"
            name = "Bob"
            token = "same"
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = Settings::from_toml_str("[client\nserver_addr = ");
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\ntoken = \"t0k\"\nrequest_timeout_ms = 500").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.client.token.as_deref(), Some("t0k"));
        assert_eq!(settings.client.request_timeout(), Duration::from_millis(500));
    }
}
