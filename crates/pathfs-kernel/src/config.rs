//! File system configuration.
//!
//! Loaded from RON:
//!
//! ```ron
//! (
//!     local_root: "/srv/project",
//!     virtual_access: (read: true, write: false),
//!     virtual_seed: Some("assets"),
//!     callback_scope: Subtree,
//! )
//! ```
//!
//! Every field is optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::vfs::{CallbackScope, FileAccess};

/// Configuration for [`FileSystem`](crate::FileSystem).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Directory the `.` namespace maps to.
    pub local_root: PathBuf,
    /// When false, every `.` path fails with `NotSupported`.
    pub allow_local: bool,
    /// Access of the virtual root, inherited by everything created under it.
    pub virtual_access: FileAccess,
    /// Directory copied into `~` at construction.
    pub virtual_seed: Option<PathBuf>,
    /// Upper bound for a local open that keeps being denied.
    pub open_timeout_ms: u64,
    /// Delay between local open attempts.
    pub open_retry_ms: u64,
    /// How long a watcher thread blocks before re-checking its stop flag.
    pub watch_wait_ms: u64,
    /// Watcher events for paths this process changed itself within this
    /// window are dropped.
    pub echo_window_ms: u64,
    pub callback_scope: CallbackScope,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("."),
            allow_local: true,
            virtual_access: FileAccess::read_write(),
            virtual_seed: None,
            open_timeout_ms: 1000,
            open_retry_ms: 50,
            watch_wait_ms: 1000,
            echo_window_ms: 500,
            callback_scope: CallbackScope::All,
        }
    }
}

impl FsConfig {
    /// Load a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&text)
    }

    /// Parse a config from RON text.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn watch_wait(&self) -> Duration {
        Duration::from_millis(self.watch_wait_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }
}

/// Errors from loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(FsConfig::from_ron_str("()").unwrap(), FsConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let cfg = FsConfig::from_ron_str(
            r#"(
                local_root: "/srv/project",
                allow_local: false,
                virtual_access: (read: true, write: false),
                virtual_seed: Some("assets"),
                open_timeout_ms: 250,
                callback_scope: Subtree,
            )"#,
        )
        .unwrap();
        assert_eq!(cfg.local_root, PathBuf::from("/srv/project"));
        assert!(!cfg.allow_local);
        assert_eq!(cfg.virtual_access, FileAccess::read_only());
        assert_eq!(cfg.virtual_seed, Some(PathBuf::from("assets")));
        assert_eq!(cfg.open_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.open_retry(), Duration::from_millis(50));
        assert_eq!(cfg.callback_scope, CallbackScope::Subtree);
    }

    #[test]
    fn test_bad_ron() {
        assert!(matches!(
            FsConfig::from_ron_str("(allow_local: maybe)"),
            Err(ConfigError::Ron(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            FsConfig::load("/definitely/not/here.ron"),
            Err(ConfigError::Io(_))
        ));
    }
}
