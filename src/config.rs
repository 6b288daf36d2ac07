// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the settings file that sugarkube reads on start up.
//! Every setting is optional, and a missing settings file simply means that
//! defaults are used throughout.
//!
//! # General Layout
//!
//! ```toml
//! cache_dir = "$HOME/.cache/sugarkube"
//!
//! [git]
//! binary = "git"
//! fetch_timeout = 600
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::debug;

/// Tool settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Root directory of the kapp cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<CacheDir>,

    /// How to drive the git executable.
    #[serde(default)]
    pub git: GitSettings,
}

impl Settings {
    /// Load settings from file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists, but cannot be read.
    /// - Return any error of [`Settings::from_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(data) => data.parse(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no settings at {:?}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Read {
                reason: err.to_string(),
                path: path.to_path_buf(),
            }),
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on cache directory field.
        if let Some(cache_dir) = settings.cache_dir.take() {
            settings.cache_dir = Some(CacheDir::new(
                shellexpand::full(cache_dir.to_string().as_str())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned(),
            ));
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Git executable settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct GitSettings {
    /// Git executable to invoke.
    #[serde(default = "default_git_binary")]
    pub binary: String,

    /// Seconds any single git step may take.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_timeout: Option<u64>,
}

impl GitSettings {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout.map(Duration::from_secs)
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            fetch_timeout: None,
        }
    }
}

fn default_git_binary() -> String {
    "git".into()
}

/// Path to the root of the kapp cache.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct CacheDir(PathBuf);

impl CacheDir {
    /// Construct new cache directory path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Treat cache directory as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Display for CacheDir {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_path().to_string_lossy().as_ref())
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read settings file.
    #[error("failed to read settings at {:?}: {reason}", path.display())]
    Read { reason: String, path: PathBuf },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
