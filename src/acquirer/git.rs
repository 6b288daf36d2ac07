// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git acquirer.
//!
//! Fetches a single branch of a remote repository through the git executable,
//! using sparse checkout so only the wanted subdirectory lands in the work
//! tree. Authentication is left to whatever the git executable is already
//! configured with, e.g., SSH agent or credential helpers.
//!
//! # Source Identity
//!
//! A git source is identified by its repository, branch, and name. The URI must
//! contain exactly one ':' separating the host part from the "org/repo[.git]"
//! part, e.g., "git@github.com:sugarkube/kapps-A.git". The identity joins the
//! hyphenated "org/repo", branch, and name with '-', e.g.,
//! "sugarkube-kapps-A-kappA-0.1.0-pathA".

use crate::{
    acquirer::{
        sparse::{subtree_rule, SparseCheckout},
        AcquireContext, Acquirer, AcquirerError, Result, BRANCH_KEY, NAME_KEY, PATH_KEY,
        URI_KEY,
    },
    process::{Syscall, SyscallError},
};

use async_trait::async_trait;
use std::{collections::BTreeMap, path::Path};
use tracing::{debug, info};

/// Name of the git acquirer variant.
pub const GIT: &str = "git";

// Keep git from spawning detached housekeeping that outlives a fetch.
const GIT_OPTIONS: [&str; 4] = ["-c", "gc.auto=0", "-c", "maintenance.auto=false"];

/// Source fetched from a git repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAcquirer {
    name: String,
    uri: String,
    branch: String,
    path: String,
}

impl GitAcquirer {
    /// Construct new git acquirer.
    ///
    /// Name defaults to the base name of `path` when not given.
    pub fn new(
        name: Option<String>,
        uri: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let name = name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_name(&path));

        Self {
            name,
            uri: uri.into(),
            branch: branch.into(),
            path,
        }
    }

    /// Construct new git acquirer from source settings.
    ///
    /// # Errors
    ///
    /// - Return [`AcquirerError::MissingSettings`] if any of uri, branch, or
    ///   path is missing or empty.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Result<Self> {
        let setting = |key: &str| {
            settings
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
        };

        let missing = [URI_KEY, BRANCH_KEY, PATH_KEY]
            .into_iter()
            .filter(|key| setting(*key).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(AcquirerError::MissingSettings {
                acquirer: GIT,
                missing,
            });
        }

        Ok(Self::new(
            setting(NAME_KEY),
            setting(URI_KEY).unwrap_or_default(),
            setting(BRANCH_KEY).unwrap_or_default(),
            setting(PATH_KEY).unwrap_or_default(),
        ))
    }

    // INVARIANT: Remote "origin" must point at our URI, even in a repository
    //   left behind half initialized by an earlier run.
    async fn point_origin(&self, dest: &Path, context: &AcquireContext) -> Result<()> {
        let current = match self
            .git(dest, context, ["remote", "get-url", "origin"])
            .await
        {
            Ok(url) => Some(url),
            Err(SyscallError::Failed { .. }) => None,
            Err(error) => return Err(error.into()),
        };

        match current {
            Some(url) if url == self.uri => {}
            Some(url) => {
                debug!("repoint origin from {url} to {}", self.uri);
                self.git(dest, context, ["remote", "set-url", "origin", self.uri.as_str()])
                    .await?;
            }
            None => {
                self.git(dest, context, ["remote", "add", "origin", self.uri.as_str()])
                    .await?;
            }
        }

        Ok(())
    }

    async fn git(
        &self,
        dest: &Path,
        context: &AcquireContext,
        args: impl IntoIterator<Item = impl Into<std::ffi::OsString>>,
    ) -> std::result::Result<String, SyscallError> {
        let args = GIT_OPTIONS
            .iter()
            .map(std::ffi::OsString::from)
            .chain(args.into_iter().map(Into::into));
        Syscall::new(&context.git_binary, args)
            .current_dir(dest)
            .timeout(context.timeout)
            .run(&context.cancel)
            .await
    }
}

#[async_trait]
impl Acquirer for GitAcquirer {
    /// Identity of git source.
    ///
    /// # Errors
    ///
    /// - Return [`AcquirerError::MalformedUri`] if URI does not contain exactly
    ///   one ':'.
    fn id(&self) -> Result<String> {
        let (_, org_repo) = match self.uri.matches(':').count() {
            1 => self.uri.split_once(':'),
            _ => None,
        }
        .ok_or_else(|| AcquirerError::MalformedUri(self.uri.clone()))?;

        let org_repo = hyphenate(org_repo);
        let org_repo = org_repo.strip_suffix(".git").unwrap_or(&org_repo);
        let branch = hyphenate(&self.branch);
        let name = hyphenate(&self.name);

        Ok([org_repo, branch.as_str(), name.as_str()].join("-"))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    /// Fetch branch into `dest` through sparse checkout.
    ///
    /// A `dest` that already holds a repository from an earlier run is
    /// fetched and checked out again instead of being initialized anew. Its
    /// origin remote is added or repointed when missing or stale.
    ///
    /// # Errors
    ///
    /// - Return [`AcquirerError::CreateDest`] if `dest` cannot be created.
    /// - Return [`AcquirerError::Syscall`] if any git step fails.
    /// - Return [`AcquirerError::Sparse`] if sparsity rule cannot be written.
    /// - Return [`AcquirerError::Checkout`] if branch cannot be checked out.
    async fn acquire(&self, dest: &Path, context: &AcquireContext) -> Result<()> {
        info!("acquire git source {} into {:?}", self.uri, dest.display());
        mkdirp::mkdirp(dest).map_err(|source| AcquirerError::CreateDest {
            source,
            path: dest.to_path_buf(),
        })?;

        let gitdir = dest.join(".git");
        if gitdir.is_dir() {
            debug!("reuse existing repository at {:?}", gitdir.display());
        } else {
            self.git(dest, context, ["init"]).await?;
        }
        self.point_origin(dest, context).await?;

        self.git(dest, context, ["fetch"]).await?;
        self.git(dest, context, ["config", "core.sparsecheckout", "true"])
            .await?;
        SparseCheckout::new(gitdir)
            .insert_rule(subtree_rule(&self.path))
            .await?;

        self.git(dest, context, ["checkout", self.branch.as_str()])
            .await
            .map_err(|source| AcquirerError::Checkout {
                source,
                uri: self.uri.clone(),
                branch: self.branch.clone(),
                path: self.path.clone(),
            })?;

        Ok(())
    }
}

fn default_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn hyphenate(text: &str) -> String {
    text.replace('/', "-")
}
