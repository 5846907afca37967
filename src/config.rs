use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keepalive::DEFAULT_KEEPALIVE;
use crate::pty::PtyOptions;
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::runspace::Runspace;
use crate::scrollback::DEFAULT_SCROLLBACK_BYTES;

/// Server configuration, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds a detached session is kept alive awaiting reattachment.
    pub keepalive_secs: u64,
    /// Scrollback cap per session, in bytes.
    pub scrollback_bytes: usize,
    /// Outbound queue length per attached connection.
    pub outbound_queue: usize,
    /// Maximum live sessions; `0` means unlimited.
    pub max_sessions: usize,
    /// Shell to spawn. Falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    /// Browser origins allowed to open WebSockets, besides loopback.
    pub allowed_origins: Vec<String>,
    pub runspaces: Vec<Runspace>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_secs: DEFAULT_KEEPALIVE.as_secs(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            outbound_queue: 256,
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
            shell: None,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            allowed_origins: Vec::new(),
            runspaces: Vec::new(),
        }
    }
}

impl Config {
    /// Default location: `$XDG_CONFIG_HOME/shellkeep/config.toml` (or the
    /// platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("shellkeep").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, or fall back to defaults if the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid("outbound_queue must be at least 1".into()));
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(ConfigError::Invalid(format!(
                "terminal size must be non-zero, got {}x{}",
                self.cols, self.rows
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for runspace in &self.runspaces {
            if !seen.insert(runspace.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "runspace '{}' is defined more than once",
                    runspace.id
                )));
            }
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        let mut pty = PtyOptions {
            cols: self.cols,
            rows: self.rows,
            term: self.term.clone(),
            ..PtyOptions::default()
        };
        if let Some(shell) = &self.shell {
            pty.shell = shell.clone();
        }
        RegistryConfig {
            pty,
            scrollback_bytes: self.scrollback_bytes,
            keepalive: self.keepalive(),
            max_sessions: (self.max_sessions > 0).then_some(self.max_sessions),
            outbound_queue: self.outbound_queue,
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if a config file is world-readable; runspace env values may be secret.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             Runspace environments may hold secrets -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
