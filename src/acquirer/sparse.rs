// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sparse checkout rule handling.
//!
//! A kapp usually lives in one subdirectory of a much larger repository. Git's
//! __sparse checkout__ feature reduces a work tree to the subset of tracked
//! files matched by a set of __sparsity rules__, so only the wanted subtree is
//! ever materialized in the cache.
//!
//! # Sparse Checkout Configuration File Layout
//!
//! Sparsity rules are stored in the gitdir at `$gitdir/info/sparse-checkout`,
//! one rule per line, using gitignore syntax with inverted semantics: each
//! rule names what to _include_. Rules only take effect when the
//! `core.sparseCheckout` option of the repository is enabled.
//!
//! # See Also
//!
//! - [Man page sparse checkout](https://git-scm.com/docs/git-sparse-checkout)

use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::debug;

/// Build the sparsity rule that includes everything below `path`.
///
/// Any trailing slash on `path` is stripped first, e.g., "some/path/" becomes
/// "some/path/*".
pub fn subtree_rule(path: &str) -> String {
    format!("{}/*", path.trim_end_matches('/'))
}

/// Manage sparsity rules in sparse checkout file.
#[derive(Clone, Debug)]
pub struct SparseCheckout {
    sparse_path: PathBuf,
}

impl SparseCheckout {
    /// Construct new sparsity rule manager for repository at `gitdir`.
    ///
    /// Nothing is touched on disk until rules are read or written.
    pub fn new(gitdir: impl Into<PathBuf>) -> Self {
        Self {
            sparse_path: gitdir.into().join("info").join("sparse-checkout"),
        }
    }

    /// Path to the sparse checkout configuration file.
    pub fn path(&self) -> &Path {
        &self.sparse_path
    }

    /// List current sparsity rule set.
    ///
    /// A missing sparse checkout file simply means no rules are set.
    ///
    /// # Errors
    ///
    /// - Return [`SparseError::ReadSparseFile`] if sparse checkout
    ///   configuration file exists, but cannot be read.
    pub async fn current_rules(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.sparse_path).await {
            Ok(content) => Ok(content.lines().map(str::to_owned).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(SparseError::ReadSparseFile {
                source: err,
                sparse_path: self.sparse_path.clone(),
            }),
        }
    }

    /// Append a sparsity rule unless it is already present.
    ///
    /// Creates the sparse checkout configuration file, and its parent
    /// directory, when missing. Returns whether the rule was appended.
    ///
    /// # Errors
    ///
    /// - Return [`SparseError::ReadSparseFile`] if existing rules cannot be
    ///   read.
    /// - Return [`SparseError::WriteSparseFile`] if rule cannot be appended.
    pub async fn insert_rule(&self, rule: impl Into<String>) -> Result<bool> {
        let rule = rule.into();
        if self.current_rules().await?.contains(&rule) {
            debug!("sparsity rule {rule:?} already present");
            return Ok(false);
        }

        if let Some(info_dir) = self.sparse_path.parent() {
            mkdirp::mkdirp(info_dir).map_err(|err| SparseError::WriteSparseFile {
                source: err,
                sparse_path: self.sparse_path.clone(),
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sparse_path)
            .await
            .map_err(|err| SparseError::WriteSparseFile {
                source: err,
                sparse_path: self.sparse_path.clone(),
            })?;

        let append = async {
            file.write_all(format!("{rule}\n").as_bytes()).await?;
            file.flush().await
        };
        append.await.map_err(|err| SparseError::WriteSparseFile {
            source: err,
            sparse_path: self.sparse_path.clone(),
        })?;

        debug!("append sparsity rule {rule:?} to {:?}", self.sparse_path.display());
        Ok(true)
    }
}

/// Sparsity rule management error types.
#[derive(Debug, thiserror::Error)]
pub enum SparseError {
    /// Sparse configuration file cannot be read from.
    #[error("failed to read from sparse file at {:?}", sparse_path.display())]
    ReadSparseFile {
        #[source]
        source: std::io::Error,
        sparse_path: PathBuf,
    },

    /// Sparse configuration file cannot be written to.
    #[error("failed to write to sparse file at {:?}", sparse_path.display())]
    WriteSparseFile {
        #[source]
        source: std::io::Error,
        sparse_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = SparseError> = std::result::Result<T, E>;
