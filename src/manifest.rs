// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Manifest model.
//!
//! A __manifest__ is an ordered list of kapps loaded from one YAML file. Each
//! kapp declares one or more sources that get acquired into the cache.
//!
//! # Manifest File Layout
//!
//! ```yaml
//! id: optional-override      # defaults to file name without extension
//! kapps:
//!   - id: kappA
//!     state: present         # present or absent, defaults to present
//!     sources:
//!       - uri: git@github.com:sugarkube/kapps-A.git
//!         branch: kappA-0.1.0
//!         path: some/pathA
//!         name: pathA        # optional
//! ```
//!
//! Source entries are flat settings handed to [`Source::from_settings`]. Any
//! YAML scalar is accepted as a setting value, so `branch: 1.2` works just as
//! well as `branch: "1.2"`.

use crate::{
    acquirer::{Acquirer, AcquirerError, Source},
    cacher::layout::CACHE_DIR,
};

use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Ordered collection of kapps loaded from a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Namespace of the manifest in the cache.
    pub id: String,

    /// Location the manifest was loaded from.
    pub uri: String,

    pub kapps: Vec<Kapp>,
}

impl Manifest {
    /// Construct new manifest.
    ///
    /// When no explicit `id` is given, it defaults to the base name of `uri`
    /// without its extension, e.g., "manifests/web.yaml" becomes "web".
    pub fn new(uri: impl Into<String>, id: Option<String>, kapps: Vec<Kapp>) -> Self {
        let uri = uri.into();
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| default_id(&uri));

        Self { id, uri, kapps }
    }
}

/// Versioned application bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kapp {
    /// Identity of kapp, unique within its manifest.
    pub id: String,

    /// Whether installers should make sure the kapp is installed.
    pub should_be_present: bool,

    /// Sources layered into the kapp root.
    pub sources: Vec<Source>,
}

impl Kapp {
    /// Construct new kapp.
    pub fn new(id: impl Into<String>, should_be_present: bool, sources: Vec<Source>) -> Self {
        Self {
            id: id.into(),
            should_be_present,
            sources,
        }
    }
}

/// Raw manifest file layout.
#[derive(Debug, Default, PartialEq, Clone, Deserialize)]
pub struct ManifestFile {
    /// Explicit manifest identity.
    pub id: Option<String>,

    #[serde(default)]
    pub kapps: Vec<KappDeclaration>,
}

impl FromStr for ManifestFile {
    type Err = serde_yaml::Error;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(data)
    }
}

impl ManifestFile {
    /// Turn raw manifest into a [`Manifest`] located at `uri`.
    ///
    /// # Errors
    ///
    /// - Return [`ManifestError::NonScalarSetting`] if a source setting is a
    ///   sequence or mapping.
    /// - Return [`ManifestError::Source`] if a source has no matching
    ///   acquirer, or lacks mandatory settings.
    pub fn into_manifest(self, uri: impl Into<String>) -> Result<Manifest> {
        let uri = uri.into();
        let mut kapps = Vec::with_capacity(self.kapps.len());

        for declaration in self.kapps {
            let mut sources = Vec::with_capacity(declaration.sources.len());
            for raw in declaration.sources {
                let settings =
                    stringify_settings(raw).map_err(|key| ManifestError::NonScalarSetting {
                        manifest: uri.clone(),
                        kapp: declaration.id.clone(),
                        key,
                    })?;
                let source =
                    Source::from_settings(&settings).map_err(|source| ManifestError::Source {
                        source,
                        manifest: uri.clone(),
                        kapp: declaration.id.clone(),
                    })?;
                sources.push(source);
            }

            kapps.push(Kapp::new(
                declaration.id,
                declaration.state == KappState::Present,
                sources,
            ));
        }

        Ok(Manifest::new(uri, self.id, kapps))
    }
}

/// Raw kapp entry of a manifest file.
#[derive(Debug, Default, PartialEq, Clone, Deserialize)]
pub struct KappDeclaration {
    pub id: String,

    #[serde(default)]
    pub state: KappState,

    #[serde(default)]
    pub sources: Vec<BTreeMap<String, serde_yaml::Value>>,
}

/// Desired install state of a kapp.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KappState {
    #[default]
    Present,
    Absent,
}

/// Load a single manifest file and parse the kapps it defines.
///
/// # Errors
///
/// - Return [`ManifestError::Read`] if file cannot be read.
/// - Return [`ManifestError::Parse`] if file is not a valid manifest.
/// - Return any error of [`ManifestFile::into_manifest`].
#[instrument(skip(path), level = "debug")]
pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Manifest> {
    let path = path.as_ref();
    debug!("parse manifest {:?}", path.display());

    let data = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        source,
        path: path.to_path_buf(),
    })?;
    let file: ManifestFile = data.parse().map_err(|source| ManifestError::Parse {
        source,
        path: path.to_path_buf(),
    })?;

    file.into_manifest(path.to_string_lossy())
}

/// Parse manifest files in order.
///
/// # Errors
///
/// - Return first error of [`parse_manifest_file`]. No partial result is
///   returned.
pub fn parse_manifests(paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Result<Vec<Manifest>> {
    let manifests = paths
        .into_iter()
        .map(parse_manifest_file)
        .collect::<Result<Vec<_>>>()?;
    debug!("parsed {} manifest(s)", manifests.len());

    Ok(manifests)
}

/// Validate that a manifest can be cached.
///
/// Manifest and kapp identities must be plain path segments, and kapp
/// identities must be unique, because they name directories in the cache.
/// Source names must be unique plain path segments within a kapp, because they
/// name symlinks in the kapp root. Every source identity is derived once so
/// that malformed URIs surface here instead of during a fetch.
///
/// # Errors
///
/// - Return [`ManifestError::InvalidManifestId`] on unusable manifest
///   identity.
/// - Return [`ManifestError::InvalidKappId`] on unusable kapp identity.
/// - Return [`ManifestError::DuplicateKapp`] on repeated kapp identity.
/// - Return [`ManifestError::InvalidSourceName`] on unusable source name.
/// - Return [`ManifestError::DuplicateSourceName`] on repeated source name.
/// - Return [`ManifestError::Source`] if source identity cannot be derived.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    if !is_path_segment(&manifest.id) {
        return Err(ManifestError::InvalidManifestId(manifest.id.clone()));
    }

    let mut kapp_ids = HashSet::new();
    for kapp in &manifest.kapps {
        if !is_path_segment(&kapp.id) {
            return Err(ManifestError::InvalidKappId {
                manifest: manifest.id.clone(),
                kapp: kapp.id.clone(),
            });
        }

        if !kapp_ids.insert(kapp.id.as_str()) {
            return Err(ManifestError::DuplicateKapp {
                manifest: manifest.id.clone(),
                kapp: kapp.id.clone(),
            });
        }

        let mut names = HashSet::new();
        for source in &kapp.sources {
            let name = source.name();
            if !is_path_segment(name) || name == CACHE_DIR {
                return Err(ManifestError::InvalidSourceName {
                    manifest: manifest.id.clone(),
                    kapp: kapp.id.clone(),
                    name: name.into(),
                });
            }

            if !names.insert(name) {
                return Err(ManifestError::DuplicateSourceName {
                    manifest: manifest.id.clone(),
                    kapp: kapp.id.clone(),
                    name: name.into(),
                });
            }

            source.id().map_err(|source| ManifestError::Source {
                source,
                manifest: manifest.id.clone(),
                kapp: kapp.id.clone(),
            })?;
        }
    }

    Ok(())
}

/// Validate a set of manifests that will share one cache.
///
/// # Errors
///
/// - Return [`ManifestError::DuplicateManifest`] if two manifests share an
///   identity, and would thus share a cache directory.
/// - Return any error of [`validate_manifest`].
pub fn validate_manifests<'a>(manifests: impl IntoIterator<Item = &'a Manifest>) -> Result<()> {
    let mut ids = HashSet::new();

    for manifest in manifests {
        if !ids.insert(manifest.id.as_str()) {
            return Err(ManifestError::DuplicateManifest(manifest.id.clone()));
        }

        validate_manifest(manifest)?;
    }

    Ok(())
}

fn default_id(uri: &str) -> String {
    Path::new(uri)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| uri.to_string())
}

fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

// Flatten YAML scalars into strings. Returns offending key on nested values.
fn stringify_settings(
    raw: BTreeMap<String, serde_yaml::Value>,
) -> std::result::Result<BTreeMap<String, String>, String> {
    use serde_yaml::Value;

    let mut settings = BTreeMap::new();
    for (key, value) in raw {
        let value = match value {
            Value::Null => continue,
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::String(text) => text,
            Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => return Err(key),
        };
        settings.insert(key, value);
    }

    Ok(settings)
}

/// Manifest error types.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Manifest file cannot be read.
    #[error("failed to read manifest {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Manifest file is not valid YAML, or does not follow the manifest layout.
    #[error("failed to parse manifest {:?}", path.display())]
    Parse {
        #[source]
        source: serde_yaml::Error,
        path: PathBuf,
    },

    /// Source setting is not a scalar.
    #[error("setting {key:?} of kapp {kapp:?} in manifest {manifest:?} must be a scalar")]
    NonScalarSetting {
        manifest: String,
        kapp: String,
        key: String,
    },

    /// Source is invalid.
    #[error("invalid source in kapp {kapp:?} of manifest {manifest:?}")]
    Source {
        #[source]
        source: AcquirerError,
        manifest: String,
        kapp: String,
    },

    /// Two kapps of one manifest share an identity.
    #[error("multiple kapps exist with the same id {kapp:?} in manifest {manifest:?}")]
    DuplicateKapp { manifest: String, kapp: String },

    /// Two sources of one kapp share a name.
    #[error("multiple sources named {name:?} in kapp {kapp:?} of manifest {manifest:?}")]
    DuplicateSourceName {
        manifest: String,
        kapp: String,
        name: String,
    },

    /// Source name cannot be used as a symlink in the kapp root.
    #[error("source name {name:?} in kapp {kapp:?} of manifest {manifest:?} is unusable")]
    InvalidSourceName {
        manifest: String,
        kapp: String,
        name: String,
    },

    /// Manifest identity cannot be used as a directory name.
    #[error("manifest id {0:?} is not a single path segment")]
    InvalidManifestId(String),

    /// Kapp identity cannot be used as a directory name.
    #[error("kapp id {kapp:?} in manifest {manifest:?} is not a single path segment")]
    InvalidKappId { manifest: String, kapp: String },

    /// Two manifests share an identity.
    #[error("multiple manifests exist with the same id {0:?}")]
    DuplicateManifest(String),
}

/// Friendly result alias :3
pub type Result<T, E = ManifestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquirer::git::GitAcquirer;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn git_source(name: &str, uri: &str) -> Source {
        GitAcquirer::new(Some(name.into()), uri, "kappA-0.1.0", format!("some/{name}")).into()
    }

    #[test]
    fn parse_manifest_layout() -> anyhow::Result<()> {
        let data = indoc! {r#"
            kapps:
              - id: kappA
                sources:
                  - uri: git@github.com:sugarkube/kapps-A.git
                    branch: kappA-0.1.0
                    path: some/pathA
              - id: kappB
                state: absent
                sources:
                  - uri: git@github.com:sugarkube/kapps-B.git
                    branch: 0.2
                    path: some/pathB/
                    name: bee
        "#};
        let result = data.parse::<ManifestFile>()?.into_manifest("manifests/manifest1.yaml")?;

        let expect = Manifest {
            id: "manifest1".into(),
            uri: "manifests/manifest1.yaml".into(),
            kapps: vec![
                Kapp::new(
                    "kappA",
                    true,
                    vec![GitAcquirer::new(
                        None,
                        "git@github.com:sugarkube/kapps-A.git",
                        "kappA-0.1.0",
                        "some/pathA",
                    )
                    .into()],
                ),
                Kapp::new(
                    "kappB",
                    false,
                    vec![GitAcquirer::new(
                        Some("bee".into()),
                        "git@github.com:sugarkube/kapps-B.git",
                        "0.2",
                        "some/pathB/",
                    )
                    .into()],
                ),
            ],
        };
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn explicit_id_overrides_file_name() -> anyhow::Result<()> {
        let data = indoc! {r#"
            id: exampleManifest2
            kapps: []
        "#};
        let result = data.parse::<ManifestFile>()?.into_manifest("manifests/manifest2.yaml")?;
        assert_eq!(result.id, "exampleManifest2");

        Ok(())
    }

    #[test]
    fn nested_source_setting_is_rejected() -> anyhow::Result<()> {
        let data = indoc! {r#"
            kapps:
              - id: kappA
                sources:
                  - uri: git@github.com:sugarkube/kapps-A.git
                    branch: [one, two]
                    path: some/pathA
        "#};
        let result = data.parse::<ManifestFile>()?.into_manifest("manifest1.yaml");
        assert!(matches!(
            result,
            Err(ManifestError::NonScalarSetting { key, .. }) if key == "branch"
        ));

        Ok(())
    }

    #[test]
    fn unidentifiable_source_is_rejected() -> anyhow::Result<()> {
        let data = indoc! {r#"
            kapps:
              - id: kappA
                sources:
                  - uri: https://example.com/kapps.tar.gz
                    branch: main
                    path: kappA
        "#};
        let result = data.parse::<ManifestFile>()?.into_manifest("manifest1.yaml");
        assert!(matches!(
            result,
            Err(ManifestError::Source { source: AcquirerError::Unidentified(_), .. })
        ));

        Ok(())
    }

    #[sealed_test]
    fn parse_manifests_from_files() -> anyhow::Result<()> {
        std::fs::write(
            "manifest1.yaml",
            indoc! {r#"
                kapps:
                  - id: kappA
                    sources:
                      - uri: git@github.com:sugarkube/kapps-A.git
                        branch: kappA-0.1.0
                        path: some/pathA
            "#},
        )?;
        std::fs::write("manifest2.yml", "id: second\nkapps: []\n")?;

        let result = parse_manifests(["manifest1.yaml", "manifest2.yml"])?;
        let ids = result.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["manifest1", "second"]);
        assert_eq!(result[0].kapps[0].sources[0].name(), "pathA");

        Ok(())
    }

    #[sealed_test]
    fn parse_manifests_fails_on_first_error() {
        std::fs::write("good.yaml", "kapps: []\n").unwrap();
        std::fs::write("bad.yaml", "kapps: {not: a list}\n").unwrap();

        let result = parse_manifests(["good.yaml", "bad.yaml", "missing.yaml"]);
        assert!(matches!(
            result,
            Err(ManifestError::Parse { path, .. }) if path == Path::new("bad.yaml")
        ));

        let result = parse_manifests(["missing.yaml", "bad.yaml"]);
        assert!(matches!(result, Err(ManifestError::Read { .. })));
    }

    #[test]
    fn validate_rejects_duplicate_kapps() {
        let manifest = Manifest::new(
            "web.yaml",
            None,
            vec![
                Kapp::new("web", true, Vec::new()),
                Kapp::new("db", true, Vec::new()),
                Kapp::new("web", false, Vec::new()),
            ],
        );
        let result = validate_manifest(&manifest);
        assert!(matches!(result, Err(ManifestError::DuplicateKapp { kapp, .. }) if kapp == "web"));
    }

    #[test]
    fn validate_rejects_malformed_uri() {
        let manifest = Manifest::new(
            "web.yaml",
            None,
            vec![Kapp::new(
                "web",
                true,
                vec![git_source("pathA", "github.com/sugarkube/kapps-A.git")],
            )],
        );
        let result = validate_manifest(&manifest);
        assert!(matches!(
            result,
            Err(ManifestError::Source {
                source: AcquirerError::MalformedUri(_),
                kapp,
                ..
            }) if kapp == "web"
        ));
    }

    #[test]
    fn validate_rejects_duplicate_source_names() {
        let manifest = Manifest::new(
            "web.yaml",
            None,
            vec![Kapp::new(
                "web",
                true,
                vec![
                    git_source("pathA", "git@github.com:sugarkube/kapps-A.git"),
                    git_source("pathA", "git@github.com:sugarkube/kapps-B.git"),
                ],
            )],
        );
        let result = validate_manifest(&manifest);
        assert!(matches!(
            result,
            Err(ManifestError::DuplicateSourceName { name, .. }) if name == "pathA"
        ));
    }

    #[test]
    fn validate_rejects_unusable_source_names() {
        for name in ["..", "a/b", ".sugarkube"] {
            let source = GitAcquirer::new(
                Some(name.into()),
                "git@github.com:sugarkube/kapps-A.git",
                "main",
                "some/pathA",
            );
            let kapps = vec![Kapp::new("web", true, vec![source.into()])];
            let result = validate_manifest(&Manifest::new("web.yaml", None, kapps));
            assert!(matches!(result, Err(ManifestError::InvalidSourceName { .. })), "{name}");
        }
    }

    #[test]
    fn validate_rejects_unusable_kapp_ids() {
        for id in ["../../outside", "..", ".", "", "a/b"] {
            let kapps = vec![Kapp::new(id, true, Vec::new())];
            let result = validate_manifest(&Manifest::new("web.yaml", None, kapps));
            assert!(
                matches!(result, Err(ManifestError::InvalidKappId { ref kapp, .. }) if kapp == id),
                "{id:?}"
            );
        }
    }

    #[test]
    fn validate_rejects_unusable_manifest_ids() -> anyhow::Result<()> {
        let manifest = "id: ..\nkapps: []\n"
            .parse::<ManifestFile>()?
            .into_manifest("manifests/web.yaml")?;
        let result = validate_manifests([&manifest]);
        assert!(matches!(result, Err(ManifestError::InvalidManifestId(id)) if id == ".."));

        let manifest = Manifest::new("..", None, Vec::new());
        let result = validate_manifest(&manifest);
        assert!(matches!(result, Err(ManifestError::InvalidManifestId(_))));

        Ok(())
    }

    #[test]
    fn validate_manifests_rejects_shared_ids() {
        let first = Manifest::new("one/web.yaml", None, Vec::new());
        let second = Manifest::new("two/web.yml", None, Vec::new());
        let result = validate_manifests([&first, &second]);
        assert!(matches!(result, Err(ManifestError::DuplicateManifest(id)) if id == "web"));
    }

    #[test]
    fn validate_accepts_well_formed_manifests() -> anyhow::Result<()> {
        let first = Manifest::new(
            "manifest1.yaml",
            None,
            vec![Kapp::new(
                "kappA",
                true,
                vec![
                    git_source("pathA", "git@github.com:sugarkube/kapps-A.git"),
                    git_source("pathB", "git@github.com:sugarkube/kapps-A.git"),
                ],
            )],
        );
        let kapps = vec![Kapp::new("kappA", true, Vec::new())];
        let second = Manifest::new("manifest2.yaml", None, kapps);
        validate_manifests([&first, &second])?;

        Ok(())
    }
}
