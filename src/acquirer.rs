// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source acquisition.
//!
//! An __acquirer__ materializes one source of a kapp into a destination
//! directory. Every acquirer exposes a deterministic identity used as the name
//! of its staging directory in the cache, a visible name used for the symlink
//! that exposes it in the kapp root, and the subdirectory of the fetched tree
//! that is actually wanted.
//!
//! # Acquirer Settings
//!
//! Sources are declared in manifests as flat string settings:
//!
//! | key        | meaning                                              |
//! |------------|------------------------------------------------------|
//! | `acquirer` | explicit acquirer variant, e.g., "git"               |
//! | `name`     | visible name, defaults to base name of `path`        |
//! | `uri`      | remote location of the source                        |
//! | `branch`   | branch or tag to check out                           |
//! | `path`     | subdirectory of the fetched tree to expose           |
//!
//! [`Source::from_settings`] picks the acquirer variant from these settings,
//! either by the explicit `acquirer` key or by sniffing the `uri`.

pub mod git;
pub mod sparse;

use crate::{
    acquirer::git::GitAcquirer,
    process::{Cancellation, SyscallError},
};

use async_trait::async_trait;
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};
use tracing::debug;

/// Settings key naming the acquirer variant explicitly.
pub const ACQUIRER_KEY: &str = "acquirer";

/// Settings key of the visible source name.
pub const NAME_KEY: &str = "name";

/// Settings key of the source URI.
pub const URI_KEY: &str = "uri";

/// Settings key of the branch to check out.
pub const BRANCH_KEY: &str = "branch";

/// Settings key of the wanted subdirectory.
pub const PATH_KEY: &str = "path";

/// Everything an acquirer needs from its caller to perform a fetch.
#[derive(Debug, Clone)]
pub struct AcquireContext {
    /// Git executable to invoke.
    pub git_binary: String,

    /// Give up on any single fetch step after this long.
    pub timeout: Option<Duration>,

    /// Signal to stop fetching early.
    pub cancel: Cancellation,
}

impl Default for AcquireContext {
    fn default() -> Self {
        Self {
            git_binary: "git".into(),
            timeout: None,
            cancel: Cancellation::never(),
        }
    }
}

/// Fetch strategy for a single source.
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// Deterministic identity of the source.
    ///
    /// Doubles as the name of the source's staging directory, so it must be a
    /// valid path segment that differs between any two sources that differ
    /// in location, revision, or name.
    fn id(&self) -> Result<String>;

    /// Visible name of the source.
    fn name(&self) -> &str;

    /// Subdirectory of the fetched tree that is wanted.
    fn path(&self) -> &str;

    /// Fetch source into `dest`, leaving only [`Acquirer::path`] materialized.
    async fn acquire(&self, dest: &Path, context: &AcquireContext) -> Result<()>;
}

/// All known acquirer variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Git(GitAcquirer),
}

impl Source {
    /// Identify acquirer variant from `settings`, and construct it.
    ///
    /// # Errors
    ///
    /// - Return [`AcquirerError::Unknown`] if `acquirer` key names a variant
    ///   that does not exist.
    /// - Return [`AcquirerError::Unidentified`] if no variant matches the
    ///   URI.
    /// - Return [`AcquirerError::MissingSettings`] if the selected variant
    ///   lacks mandatory settings.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Result<Self> {
        let uri = settings.get(URI_KEY).map(String::as_str).unwrap_or_default();

        let variant = match settings.get(ACQUIRER_KEY).map(String::as_str) {
            Some(name) if !name.is_empty() => name,
            _ if uri.ends_with(".git") => git::GIT,
            _ => return Err(AcquirerError::Unidentified(uri.into())),
        };

        debug!("construct new {variant} acquirer");
        match variant {
            git::GIT => Ok(Self::Git(GitAcquirer::from_settings(settings)?)),
            _ => Err(AcquirerError::Unknown(variant.into())),
        }
    }
}

#[async_trait]
impl Acquirer for Source {
    fn id(&self) -> Result<String> {
        match self {
            Self::Git(git) => git.id(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Git(git) => git.name(),
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Git(git) => git.path(),
        }
    }

    async fn acquire(&self, dest: &Path, context: &AcquireContext) -> Result<()> {
        match self {
            Self::Git(git) => git.acquire(dest, context).await,
        }
    }
}

impl From<GitAcquirer> for Source {
    fn from(git: GitAcquirer) -> Self {
        Self::Git(git)
    }
}

/// Acquirer error types.
#[derive(Debug, thiserror::Error)]
pub enum AcquirerError {
    /// Mandatory settings were not provided.
    #[error("invalid {acquirer} settings, missing mandatory {}", missing.join(", "))]
    MissingSettings {
        acquirer: &'static str,
        missing: Vec<&'static str>,
    },

    /// Explicitly requested acquirer does not exist.
    #[error("acquirer {0:?} does not exist")]
    Unknown(String),

    /// No acquirer matches the source URI.
    #[error("no acquirer could be identified for URI {0:?}")]
    Unidentified(String),

    /// URI cannot be turned into a source identity.
    #[error("unexpected git URI {0:?}, expected a single ':' character")]
    MalformedUri(String),

    /// Destination directory cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDest {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Fetch step failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    /// Requested branch cannot be checked out.
    #[error("failed to check out branch {branch:?} of {uri:?} with path {path:?}")]
    Checkout {
        #[source]
        source: SyscallError,
        uri: String,
        branch: String,
        path: String,
    },

    /// Sparse checkout configuration cannot be updated.
    #[error(transparent)]
    Sparse(#[from] crate::acquirer::sparse::SparseError),
}

/// Friendly result alias :3
pub type Result<T, E = AcquirerError> = std::result::Result<T, E>;
