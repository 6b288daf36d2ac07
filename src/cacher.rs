// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Kapp cache builder.
//!
//! A __cache__ is a directory tree holding every kapp of a set of manifests,
//! ready for installers to pick up. Each source of a kapp is fetched into a
//! hidden staging area of its kapp root, and then exposed in the kapp root
//! through a relative symlink named after the source. See [`layout`] for the
//! exact directory scheme.
//!
//! Manifests and kapps are processed one after the other. The sources of a
//! single kapp are fetched side by side. When one source fails, every other
//! fetch of that kapp is cancelled and waited on before the failure is
//! reported.

pub mod layout;

use crate::{
    acquirer::{AcquireContext, Acquirer, AcquirerError, Source},
    cacher::layout::{
        kapp_root_path, kapp_staging_path, link_path, link_target, manifest_cache_path,
        source_staging_path, LayoutError,
    },
    manifest::{validate_manifest, validate_manifests, Kapp, Manifest, ManifestError},
    process::cancellation,
};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

const SPINNER_TEMPLATE: &str = "{spinner:.green} {elapsed:>4.yellow}  {msg}";

/// Build kapp caches below a root directory.
#[derive(Debug, Clone)]
pub struct Cacher {
    root: PathBuf,
    dry_run: bool,
    git_binary: String,
    fetch_timeout: Option<Duration>,
    progress: Option<MultiProgress>,
}

impl Cacher {
    /// Construct new cache builder rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dry_run: false,
            git_binary: "git".into(),
            fetch_timeout: None,
            progress: None,
        }
    }

    /// Only create directories, and log what would be fetched and linked.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Git executable to fetch sources with.
    pub fn git_binary(mut self, binary: impl Into<String>) -> Self {
        self.git_binary = binary.into();
        self
    }

    /// Give up on any single fetch step after `timeout`.
    pub fn fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Show a spinner per source in `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cache every manifest in order.
    ///
    /// The whole set is validated before anything touches the file system.
    /// Stops at the first manifest that fails.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Manifest`] if validation fails.
    /// - Return any error of [`Cacher::cache_manifest`].
    pub async fn cache_manifests(&self, manifests: &[Manifest]) -> Result<()> {
        validate_manifests(manifests)?;

        for manifest in manifests {
            self.cache_manifest(manifest).await?;
        }

        Ok(())
    }

    /// Cache every kapp of `manifest` in order.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Manifest`] if manifest is invalid.
    /// - Return [`CacheError::CreateDir`] if cache directories cannot be
    ///   created.
    /// - Return [`CacheError::Kapp`] if any source of a kapp fails.
    #[instrument(skip(self, manifest), fields(manifest = %manifest.id), level = "debug")]
    pub async fn cache_manifest(&self, manifest: &Manifest) -> Result<()> {
        validate_manifest(manifest)?;

        let manifest_dir = manifest_cache_path(&self.root, manifest);
        info!("cache manifest {} into {:?}", manifest.id, manifest_dir.display());
        create_dir(&manifest_dir)?;

        for kapp in &manifest.kapps {
            self.cache_kapp(&manifest_dir, kapp)
                .await
                .map_err(|source| CacheError::Kapp {
                    source: Box::new(source),
                    manifest: manifest.id.clone(),
                    kapp: kapp.id.clone(),
                })?;
        }

        Ok(())
    }

    async fn cache_kapp(&self, manifest_dir: &Path, kapp: &Kapp) -> Result<()> {
        let kapp_root = kapp_root_path(manifest_dir, kapp);
        let staging = kapp_staging_path(&kapp_root);
        debug!("cache kapp {} into {:?}", kapp.id, kapp_root.display());
        create_dir(&kapp_root)?;
        create_dir(&staging)?;

        let style = match self.progress {
            Some(_) => Some(ProgressStyle::with_template(SPINNER_TEMPLATE)?),
            None => None,
        };

        let (handle, cancel) = cancellation();
        let context = AcquireContext {
            git_binary: self.git_binary.clone(),
            timeout: self.fetch_timeout,
            cancel,
        };

        let mut workers = JoinSet::new();
        for source in &kapp.sources {
            let bar = self.progress.as_ref().zip(style.as_ref()).map(|(progress, style)| {
                let bar = progress.add(ProgressBar::new_spinner());
                bar.set_style(style.clone());
                bar.set_message(format!("{}/{}", kapp.id, source.name()));
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            });

            let job = SourceJob {
                source: source.clone(),
                kapp_root: kapp_root.clone(),
                staging: staging.clone(),
                context: context.clone(),
                dry_run: self.dry_run,
            };
            workers.spawn(job.run(bar));
        }

        // INVARIANT: Drain every worker, even after the first failure.
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(CacheError::from).and_then(|result| result);
            if let Err(error) = result {
                if failure.is_some() {
                    debug!("discard error of cancelled source: {error}");
                    continue;
                }

                warn!("kapp {} failed, cancelling remaining sources", kapp.id);
                handle.cancel();
                failure = Some(error);
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// Everything one worker needs, owned so it can move onto the runtime.
struct SourceJob {
    source: Source,
    kapp_root: PathBuf,
    staging: PathBuf,
    context: AcquireContext,
    dry_run: bool,
}

impl SourceJob {
    async fn run(self, bar: Option<ProgressBar>) -> Result<()> {
        let name = self.source.name().to_string();
        let result = self.acquire_and_link().await;

        if let Some(bar) = bar {
            match &result {
                Ok(_) => bar.finish_with_message(format!("{name} done")),
                Err(_) => bar.abandon_with_message(format!("{name} failed")),
            }
        }

        result
    }

    async fn acquire_and_link(&self) -> Result<()> {
        let id = self.source.id()?;
        let dest = source_staging_path(&self.staging, &id);

        if self.dry_run {
            info!("dry run: skip fetch of {id} into {:?}", dest.display());
        } else {
            self.source
                .acquire(&dest, &self.context)
                .await
                .map_err(|source| CacheError::Acquire {
                    source,
                    id: id.clone(),
                })?;
        }

        let target = link_target(&self.kapp_root, &dest, self.source.path())?;
        let link = link_path(&self.kapp_root, self.source.name());

        if self.dry_run {
            info!("dry run: would link {:?} -> {:?}", link.display(), target.display());
            return Ok(());
        }

        check_link_source(id, self.kapp_root.join(&target)).await?;
        place_symlink(&link, &target).await
    }
}

async fn check_link_source(id: String, path: PathBuf) -> Result<()> {
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(CacheError::MissingLinkSource { id, path }),
        Err(source) => Err(CacheError::Inspect { source, path }),
    }
}

fn create_dir(path: &Path) -> Result<()> {
    mkdirp::mkdirp(path).map_err(|source| CacheError::CreateDir {
        source,
        path: path.to_path_buf(),
    })?;

    Ok(())
}

/// Point symlink at `link` to `target`.
///
/// An identical symlink is kept, and a symlink to anything else is replaced.
/// Anything at `link` that is not a symlink is left alone.
///
/// # Errors
///
/// - Return [`CacheError::LinkOccupied`] if `link` exists, but is not a
///   symlink.
/// - Return [`CacheError::Symlink`] if symlink cannot be inspected, removed,
///   or created.
async fn place_symlink(link: &Path, target: &Path) -> Result<()> {
    let symlink_error = |source| CacheError::Symlink {
        source,
        link: link.to_path_buf(),
        target: target.to_path_buf(),
    };

    match tokio::fs::symlink_metadata(link).await {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            let current = tokio::fs::read_link(link).await.map_err(symlink_error)?;
            if current == target {
                debug!("keep symlink {:?} -> {:?}", link.display(), target.display());
                return Ok(());
            }

            debug!("replace stale symlink {:?} -> {:?}", link.display(), current.display());
            tokio::fs::remove_file(link).await.map_err(symlink_error)?;
        }
        Ok(_) => {
            return Err(CacheError::LinkOccupied {
                link: link.to_path_buf(),
            })
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(symlink_error(error)),
    }

    info!("link {:?} -> {:?}", link.display(), target.display());
    symlink(target, link).await.map_err(symlink_error)
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

/// Cache builder error types.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Manifests are not fit for caching.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Cache directory cannot be created.
    #[error("failed to create cache directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Source identity cannot be derived.
    #[error(transparent)]
    Identity(#[from] AcquirerError),

    /// Source cannot be fetched.
    #[error("failed to acquire source {id}")]
    Acquire {
        #[source]
        source: AcquirerError,
        id: String,
    },

    /// Link target cannot be derived.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Fetched source lacks its wanted path.
    #[error("source {id} does not contain {:?}", path.display())]
    MissingLinkSource { id: String, path: PathBuf },

    /// Fetched source cannot be inspected.
    #[error("failed to inspect {:?}", path.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Symlink cannot be placed.
    #[error("failed to link {:?} to {:?}", link.display(), target.display())]
    Symlink {
        #[source]
        source: std::io::Error,
        link: PathBuf,
        target: PathBuf,
    },

    /// Something other than a symlink is in the way.
    #[error("cannot link {:?}, path exists and is not a symlink", link.display())]
    LinkOccupied { link: PathBuf },

    /// A source of a kapp failed.
    #[error("failed to cache kapp {kapp:?} of manifest {manifest:?}")]
    Kapp {
        #[source]
        source: Box<CacheError>,
        manifest: String,
        kapp: String,
    },

    /// Worker task panicked or was aborted.
    #[error(transparent)]
    Join(#[from] JoinError),

    /// Progress bar template is invalid.
    #[error(transparent)]
    ProgressStyle(#[from] indicatif::style::TemplateError),
}

/// Friendly result alias :3
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquirer::git::GitAcquirer;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn source(name: &str, uri: &str) -> Source {
        GitAcquirer::new(Some(name.into()), uri, "kappA-0.1.0", format!("some/{name}")).into()
    }

    #[sealed_test]
    fn dry_run_only_creates_directories() -> anyhow::Result<()> {
        let manifest = Manifest::new(
            "manifest1.yaml",
            None,
            vec![Kapp::new(
                "kappA",
                true,
                vec![
                    source("pathA", "git@github.com:sugarkube/kapps-A.git"),
                    source("pathB", "git@github.com:sugarkube/kapps-B.git"),
                ],
            )],
        );
        let cacher = Cacher::new("cache")
            .dry_run(true)
            .git_binary("/definitely/not/git");

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(cacher.cache_manifests(std::slice::from_ref(&manifest)))?;

        let staging = Path::new("cache/manifest1/kappA/.sugarkube");
        assert!(staging.is_dir());
        assert_eq!(std::fs::read_dir(staging)?.count(), 0);
        assert!(std::fs::symlink_metadata("cache/manifest1/kappA/pathA").is_err());
        assert!(std::fs::symlink_metadata("cache/manifest1/kappA/pathB").is_err());

        Ok(())
    }

    #[sealed_test]
    fn duplicate_kapps_leave_file_system_untouched() -> anyhow::Result<()> {
        let manifest = Manifest::new(
            "manifest1.yaml",
            None,
            vec![
                Kapp::new("kappA", true, Vec::new()),
                Kapp::new("kappA", true, Vec::new()),
            ],
        );

        let runtime = tokio::runtime::Runtime::new()?;
        let result = runtime.block_on(Cacher::new("cache").cache_manifests(&[manifest]));
        assert!(matches!(
            result,
            Err(CacheError::Manifest(ManifestError::DuplicateKapp { .. }))
        ));
        assert!(!Path::new("cache").exists());

        Ok(())
    }

    #[sealed_test]
    fn malformed_uri_fails_before_any_fetch() -> anyhow::Result<()> {
        let manifest = Manifest::new(
            "manifest1.yaml",
            None,
            vec![Kapp::new(
                "kappA",
                true,
                vec![source("pathA", "github.com/sugarkube/kapps-A.git")],
            )],
        );

        let runtime = tokio::runtime::Runtime::new()?;
        let result = runtime.block_on(Cacher::new("cache").cache_manifests(&[manifest]));
        assert!(matches!(
            result,
            Err(CacheError::Manifest(ManifestError::Source {
                source: AcquirerError::MalformedUri(_),
                ..
            }))
        ));
        assert!(!Path::new("cache").exists());

        Ok(())
    }

    #[sealed_test]
    fn escaping_kapp_id_leaves_file_system_untouched() -> anyhow::Result<()> {
        let manifest = Manifest::new(
            "manifest1.yaml",
            None,
            vec![Kapp::new(
                "../../outside",
                true,
                vec![source("pathA", "git@github.com:sugarkube/kapps-A.git")],
            )],
        );
        let cacher = Cacher::new("root/cache").dry_run(true);

        let runtime = tokio::runtime::Runtime::new()?;
        let result = runtime.block_on(cacher.cache_manifests(&[manifest]));
        assert!(matches!(
            result,
            Err(CacheError::Manifest(ManifestError::InvalidKappId { .. }))
        ));
        assert!(!Path::new("root").exists());
        assert!(!Path::new("outside").exists());

        Ok(())
    }

    #[cfg(unix)]
    #[sealed_test]
    fn failing_source_cancels_slow_sibling() -> anyhow::Result<()> {
        use std::{os::unix::fs::PermissionsExt, time::Instant};

        let git = std::env::current_dir()?.join("fake-git");
        std::fs::write(
            &git,
            indoc::indoc! {r#"
                #!/bin/sh
                case "$(pwd -P)" in
                  *-slow)
                    case " $* " in
                      *" fetch "*) (sleep 1; echo late > late-write) & sleep 30 ;;
                    esac ;;
                  *-broken)
                    case " $* " in
                      *" checkout "*) sleep 0.5; echo "no such branch" >&2; exit 1 ;;
                    esac ;;
                esac
                exit 0
            "#},
        )?;
        std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755))?;

        let sources: Vec<Source> = ["slow", "broken"]
            .into_iter()
            .map(|name| {
                GitAcquirer::new(
                    Some(name.into()),
                    "git@example.com:org/kapps.git",
                    "main",
                    format!("some/{name}"),
                )
                .into()
            })
            .collect();
        let kapps = vec![Kapp::new("kappA", true, sources)];
        let manifest = Manifest::new("manifest1.yaml", None, kapps);
        let cacher = Cacher::new("cache").git_binary(git.to_string_lossy());

        let start = Instant::now();
        let runtime = tokio::runtime::Runtime::new()?;
        let result = runtime.block_on(cacher.cache_manifests(&[manifest]));
        assert!(start.elapsed() < Duration::from_secs(10));

        match result {
            Err(CacheError::Kapp { source, kapp, .. }) => {
                assert_eq!(kapp, "kappA");
                assert!(matches!(
                    *source,
                    CacheError::Acquire {
                        source: AcquirerError::Checkout { .. },
                        ref id,
                    } if id.ends_with("-broken")
                ));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        std::thread::sleep(Duration::from_millis(1500));
        let slow = Path::new("cache/manifest1/kappA/.sugarkube/org-kapps-main-slow");
        assert!(slow.is_dir());
        assert!(!slow.join("late-write").exists());

        Ok(())
    }

    #[cfg(unix)]
    #[sealed_test]
    fn link_source_inspection_failure_is_not_reported_missing() -> anyhow::Result<()> {
        std::fs::write("staged", "not a directory")?;

        let runtime = tokio::runtime::Runtime::new()?;
        let missing = runtime.block_on(check_link_source("id".into(), "absent/pathA".into()));
        assert!(matches!(missing, Err(CacheError::MissingLinkSource { .. })));

        let blocked = runtime.block_on(check_link_source("id".into(), "staged/pathA".into()));
        assert!(matches!(
            blocked,
            Err(CacheError::Inspect { ref path, .. }) if path == Path::new("staged/pathA")
        ));

        Ok(())
    }

    #[cfg(unix)]
    #[sealed_test]
    fn place_symlink_keeps_or_replaces_links() -> anyhow::Result<()> {
        std::fs::create_dir_all("kapp/.sugarkube/one/pathA")?;
        std::fs::create_dir_all("kapp/.sugarkube/two/pathA")?;
        let link = Path::new("kapp/pathA");

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            place_symlink(link, Path::new(".sugarkube/one/pathA")).await?;
            place_symlink(link, Path::new(".sugarkube/one/pathA")).await?;
            assert_eq!(std::fs::read_link(link)?, PathBuf::from(".sugarkube/one/pathA"));

            place_symlink(link, Path::new(".sugarkube/two/pathA")).await?;
            assert_eq!(std::fs::read_link(link)?, PathBuf::from(".sugarkube/two/pathA"));
            assert!(link.is_dir());

            Ok::<_, anyhow::Error>(())
        })?;

        Ok(())
    }

    #[cfg(unix)]
    #[sealed_test]
    fn place_symlink_refuses_to_clobber_directory() -> anyhow::Result<()> {
        std::fs::create_dir_all("kapp/pathA")?;

        let runtime = tokio::runtime::Runtime::new()?;
        let result = runtime.block_on(place_symlink(
            Path::new("kapp/pathA"),
            Path::new(".sugarkube/one/pathA"),
        ));
        assert!(matches!(result, Err(CacheError::LinkOccupied { .. })));
        assert!(Path::new("kapp/pathA").is_dir());

        Ok(())
    }
}
