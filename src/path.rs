// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations of files that sugarkube reads or writes when
//! the user does not say otherwise.

use std::path::PathBuf;

/// Determine default absolute path to the kapp cache.
///
/// Uses XDG Base Directory path `$XDG_CACHE_HOME/sugarkube`. Does not check
/// if the path returned actually exists.
///
/// # Errors
///
/// - Return [`UnknownUserDirs`] if cache directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join("sugarkube"))
        .ok_or(UnknownUserDirs)
}

/// Determine default absolute path to the settings file.
///
/// Uses `$XDG_CONFIG_HOME/sugarkube/config.toml`. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`UnknownUserDirs`] if configuration directory cannot be
///   determined.
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("sugarkube").join("config.toml"))
        .ok_or(UnknownUserDirs)
}

/// No way to determine user's standard directories.
///
/// # See Also
///
/// - [`dirs`](https://docs.rs/dirs/latest/dirs/)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's standard directories")]
pub struct UnknownUserDirs;

/// Friendly result alias :3
pub type Result<T, E = UnknownUserDirs> = std::result::Result<T, E>;

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [
        ("XDG_CACHE_HOME", "/tmp/xdg/cache"),
        ("XDG_CONFIG_HOME", "/tmp/xdg/config"),
    ])]
    fn defaults_follow_xdg_dirs() -> anyhow::Result<()> {
        assert_eq!(default_cache_dir()?, PathBuf::from("/tmp/xdg/cache/sugarkube"));
        assert_eq!(
            default_config_path()?,
            PathBuf::from("/tmp/xdg/config/sugarkube/config.toml")
        );

        Ok(())
    }
}
