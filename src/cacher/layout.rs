// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cache directory layout.
//!
//! Single source of truth for where things live in a cache. Nothing here
//! touches the file system.
//!
//! ```text
//! <cache root>/
//! └── <manifest id>/
//!     └── <kapp id>/                     kapp root
//!         ├── .sugarkube/
//!         │   └── <acquirer id>/         staging area of one source
//!         │       └── <path>/...
//!         └── <acquirer name> -> .sugarkube/<acquirer id>/<path>
//! ```

use crate::manifest::{Kapp, Manifest};

use std::path::{Component, Path, PathBuf};

/// Name of the directory in a kapp root that holds staged sources.
pub const CACHE_DIR: &str = ".sugarkube";

/// Cache directory of a manifest.
pub fn manifest_cache_path(cache_root: impl AsRef<Path>, manifest: &Manifest) -> PathBuf {
    cache_root.as_ref().join(&manifest.id)
}

/// Root path of a kapp in its manifest's cache directory.
pub fn kapp_root_path(manifest_cache_path: impl AsRef<Path>, kapp: &Kapp) -> PathBuf {
    manifest_cache_path.as_ref().join(&kapp.id)
}

/// Directory of a kapp where its sources are staged.
pub fn kapp_staging_path(kapp_root: impl AsRef<Path>) -> PathBuf {
    kapp_root.as_ref().join(CACHE_DIR)
}

/// Staging area of a single source.
pub fn source_staging_path(kapp_staging_path: impl AsRef<Path>, acquirer_id: &str) -> PathBuf {
    kapp_staging_path.as_ref().join(acquirer_id)
}

/// Location of the symlink exposing a source in the kapp root.
pub fn link_path(kapp_root: impl AsRef<Path>, acquirer_name: &str) -> PathBuf {
    kapp_root.as_ref().join(acquirer_name)
}

/// Target of the symlink exposing a source, relative to the kapp root.
///
/// Resolves `wanted` inside `source_dest` lexically. Leading '/' and '.'
/// components of `wanted` are ignored, and '..' components may step back up
/// within `source_dest` but never out of it.
///
/// # Errors
///
/// - Return [`LayoutError::NotNested`] if `source_dest` does not live below
///   `kapp_root`.
/// - Return [`LayoutError::Escapes`] if `wanted` leaves `source_dest`.
pub fn link_target(
    kapp_root: impl AsRef<Path>,
    source_dest: impl AsRef<Path>,
    wanted: impl AsRef<Path>,
) -> Result<PathBuf> {
    let kapp_root = kapp_root.as_ref();
    let source_dest = source_dest.as_ref();
    let wanted = wanted.as_ref();

    let base = source_dest
        .strip_prefix(kapp_root)
        .ok()
        .filter(|base| is_plain(base))
        .ok_or_else(|| LayoutError::NotNested {
            kapp_root: kapp_root.to_path_buf(),
            source_dest: source_dest.to_path_buf(),
        })?;

    let mut inner = Vec::new();
    for component in wanted.components() {
        match component {
            Component::Normal(segment) => inner.push(segment),
            Component::ParentDir => {
                inner.pop().ok_or_else(|| LayoutError::Escapes {
                    source_dest: source_dest.to_path_buf(),
                    wanted: wanted.to_path_buf(),
                })?;
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => continue,
        }
    }

    Ok(inner
        .into_iter()
        .fold(base.to_path_buf(), |target, segment| target.join(segment)))
}

fn is_plain(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Cache layout error types.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    /// Staging area is not strictly nested under kapp root.
    #[error(
        "source directory {:?} is not nested under kapp root {:?}",
        source_dest.display(),
        kapp_root.display()
    )]
    NotNested {
        kapp_root: PathBuf,
        source_dest: PathBuf,
    },

    /// Wanted path leaves its source directory.
    #[error("path {:?} escapes source directory {:?}", wanted.display(), source_dest.display())]
    Escapes {
        source_dest: PathBuf,
        wanted: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LayoutError> = std::result::Result<T, E>;
