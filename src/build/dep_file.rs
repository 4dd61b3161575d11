//! Dependency-file tracking.
//!
//! After a library compiles, the compiler leaves a usage log next to its outputs
//! naming every classpath entry (and archive member) it read. Intersecting that log
//! with the declared dependencies gives the inputs the incremental cache key is
//! computed from, instead of the whole declared classpath.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::build::abi::{DiagnosticLevel, ToolchainCapabilities};
use crate::build::build_types::{ArtifactRef, CompilationUnitId, LibraryUnit};
use crate::build::dependency_info::{DependencyInfo, DependencyInfoIndex};
use crate::build::unused_deps::UnusedDependenciesAction;
use crate::error::ErrorKind;

/// Archive directories whose entries may be enumerated without being read.
const EXISTENCE_OF_INTEREST_DIRS: [&str; 2] = ["META-INF", "_STRIPPED_RESOURCES"];

#[derive(Debug, thiserror::Error)]
pub enum DepFileError {
    #[error("usage log {} was not written by the compiler", path.display())]
    Missing { path: PathBuf },
    #[error("could not read usage log {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("usage log {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DepFileError {
    /// A broken log means the compile step did not do what it was asked to; running
    /// it against a fresh daemon would not change the log it already wrote.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogEntry {
    Members(Vec<PathBuf>),
    Counted(BTreeMap<PathBuf, u64>),
}

impl LogEntry {
    fn into_members(self) -> BTreeSet<PathBuf> {
        match self {
            LogEntry::Members(members) => members.into_iter().collect(),
            LogEntry::Counted(counts) => counts.into_keys().collect(),
        }
    }
}

/// Classpath entries read during a compilation, keyed by their project-relative path.
/// Lookups normalise the queried path the same way, so absolute and `./` forms
/// of a declared artifact find the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLog {
    root: PathBuf,
    entries: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl UsageLog {
    pub fn parse(path: &Path, contents: &str, root: &Path) -> Result<Self, DepFileError> {
        let raw: BTreeMap<PathBuf, LogEntry> =
            serde_json::from_str(contents).map_err(|source| DepFileError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        let mut log = UsageLog {
            root: root.to_path_buf(),
            entries: BTreeMap::new(),
        };
        for (entry, members) in raw {
            log.entries
                .entry(normalize(&entry, root))
                .or_default()
                .extend(members.into_members());
        }
        Ok(log)
    }

    pub fn read(path: &Path, root: &Path) -> Result<Self, DepFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                DepFileError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                DepFileError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(path, &contents, root)
    }

    /// Reads and unions several logs. The first failing log fails the whole read.
    pub fn read_all(paths: &[PathBuf], root: &Path) -> Result<Self, DepFileError> {
        let logs = paths
            .par_iter()
            .map(|path| Self::read(path, root))
            .collect::<Result<Vec<_>, _>>()?;

        let empty = UsageLog {
            root: root.to_path_buf(),
            entries: BTreeMap::new(),
        };
        Ok(logs.into_iter().fold(empty, |mut acc, log| {
            acc.merge(log);
            acc
        }))
    }

    pub fn merge(&mut self, other: UsageLog) {
        if self.root.as_os_str().is_empty() {
            self.root = other.root;
        }
        for (entry, members) in other.entries {
            self.entries.entry(entry).or_default().extend(members);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn references(&self, path: &Path) -> bool {
        self.entries.contains_key(&normalize(path, &self.root))
    }

    pub fn members(&self, path: &Path) -> Option<&BTreeSet<PathBuf>> {
        self.entries.get(&normalize(path, &self.root))
    }
}

fn normalize(path: &Path, root: &Path) -> PathBuf {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// One input of the fine-grained cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
    Path { path: PathBuf },
    ArchiveMember { archive: PathBuf, member: PathBuf },
}

/// Declared dependencies the compiler actually read from, each with the archive
/// members it read.
///
/// Keys are always the dependency's interface artifact, whichever of its jars
/// the log mentions, so switching between the full and the interface jar of the
/// same dependency does not change the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsedInputSet {
    used: BTreeMap<ArtifactRef, BTreeSet<PathBuf>>,
}

impl UsedInputSet {
    pub fn from_log(log: &UsageLog, declared: &[DependencyInfo]) -> Self {
        let mut used: BTreeMap<ArtifactRef, BTreeSet<PathBuf>> = BTreeMap::new();
        for dep in declared {
            for path in [&dep.full_artifact.path, &dep.interface_artifact.path] {
                if let Some(members) = log.members(path) {
                    used.entry(dep.interface_artifact.clone())
                        .or_default()
                        .extend(members.iter().cloned());
                }
            }
        }
        UsedInputSet { used }
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn contains(&self, artifact: &ArtifactRef) -> bool {
        self.used.contains_key(artifact)
    }

    pub fn owners(&self) -> BTreeSet<CompilationUnitId> {
        self.used.keys().map(|artifact| artifact.owner.library_id()).collect()
    }

    /// Flattened key inputs, relative to the project root. An artifact whose
    /// members were not recorded contributes the archive itself.
    pub fn inputs(&self) -> Vec<InputRef> {
        let mut inputs = Vec::new();
        for (artifact, members) in &self.used {
            if members.is_empty() {
                inputs.push(InputRef::Path {
                    path: artifact.path.clone(),
                });
            }
            inputs.extend(members.iter().map(|member| InputRef::ArchiveMember {
                archive: artifact.path.clone(),
                member: member.clone(),
            }));
        }
        inputs
    }

    /// Inputs of the fine-grained key. Members of interface archives are keyed
    /// one by one; any other archive the compiler read is keyed in full. Metadata
    /// members stay in the key whichever archive they come from.
    pub fn key_inputs(&self, coverage: &DepFileCoverage) -> BTreeSet<InputRef> {
        self.inputs()
            .into_iter()
            .map(|input| {
                if coverage.covers(&input) || DepFileCoverage::is_existence_of_interest(&input) {
                    return input;
                }
                match input {
                    InputRef::ArchiveMember { archive, .. } => InputRef::Path { path: archive },
                    path => path,
                }
            })
            .collect()
    }
}

pub fn compute_used_inputs(
    usage_logs: &[PathBuf],
    declared: &[DependencyInfo],
    root: &Path,
) -> Result<UsedInputSet, DepFileError> {
    let _span = tracing::info_span!("dep_file", logs = usage_logs.len()).entered();
    let log = UsageLog::read_all(usage_logs, root)?;
    let used = UsedInputSet::from_log(&log, declared);
    tracing::debug!(used = used.len(), declared = declared.len(), "computed used inputs");
    Ok(used)
}

/// Decides which inputs take part in a unit's fine-grained key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepFileCoverage {
    interface_archives: BTreeSet<PathBuf>,
}

impl DepFileCoverage {
    pub fn for_unit(index: &DependencyInfoIndex, unit: &CompilationUnitId) -> Self {
        DepFileCoverage {
            interface_archives: index.interface_classpath(unit),
        }
    }

    pub fn for_deps(deps: &[DependencyInfo]) -> Self {
        DepFileCoverage {
            interface_archives: deps.iter().map(|dep| dep.interface_artifact.path.clone()).collect(),
        }
    }

    /// Only members of interface archives are tracked; everything else is keyed
    /// in full.
    pub fn covers(&self, input: &InputRef) -> bool {
        match input {
            InputRef::ArchiveMember { archive, .. } => self.interface_archives.contains(archive),
            InputRef::Path { .. } => false,
        }
    }

    /// Entries that stay in the key even when the log never saw them read.
    pub fn is_existence_of_interest(input: &InputRef) -> bool {
        match input {
            InputRef::ArchiveMember { member, .. } => member
                .components()
                .next()
                .and_then(|first| first.as_os_str().to_str())
                .is_some_and(|first| EXISTENCE_OF_INTEREST_DIRS.contains(&first)),
            InputRef::Path { .. } => false,
        }
    }
}

/// How a unit's usage log is consumed after it compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "mode", content = "level", rename_all = "snake_case")]
pub enum DepFileMode {
    Tracked,
    UnusedDependencies(DiagnosticLevel),
    Disabled,
}

impl DepFileMode {
    pub fn for_unit(
        unit: &LibraryUnit,
        caps: ToolchainCapabilities,
        track_class_usage: bool,
        unused_dependencies: UnusedDependenciesAction,
    ) -> Self {
        if unit.sources.is_empty() || !caps.tracks_class_usage || !track_class_usage {
            return DepFileMode::Disabled;
        }
        match unused_dependencies.severity() {
            Some(level) => DepFileMode::UnusedDependencies(level),
            None => DepFileMode::Tracked,
        }
    }

    /// Whether the compiler has to write a usage log at all.
    pub fn needs_usage_log(&self) -> bool {
        !matches!(self, DepFileMode::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build_types::Language;
    use crate::build::test_support::{dep, java_unit};
    use tempfile::TempDir;

    fn write_log(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn intersects_log_with_declared_dependencies() {
        let dir = TempDir::new().unwrap();
        let a = dep("//lib:a", false);
        let b = dep("//lib:b", false);
        let c = dep("//lib:c", false);
        let log = write_log(
            &dir,
            "used-classes.json",
            &format!(
                r#"{{"{}": ["a/A.class"], "{}": {{"c/C.class": 1}}}}"#,
                a.full_artifact.path.display(),
                c.interface_artifact.path.display()
            ),
        );

        let used = compute_used_inputs(&[log], &[a.clone(), b.clone(), c.clone()], dir.path()).unwrap();
        assert_eq!(used.len(), 2);
        assert!(used.contains(&a.interface_artifact));
        assert!(!used.contains(&b.interface_artifact));
        assert!(used.contains(&c.interface_artifact));
        assert_eq!(
            used.owners(),
            BTreeSet::from([a.owner(), c.owner()])
        );
    }

    #[test]
    fn empty_log_uses_nothing() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "used-classes.json", "{}");
        let used = compute_used_inputs(&[log], &[dep("//lib:a", false)], dir.path()).unwrap();
        assert!(used.is_empty());
    }

    #[test]
    fn undeclared_paths_are_ignored() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            "used-classes.json",
            r#"{"third-party/guava.jar": ["com/google/common/base/Preconditions.class"]}"#,
        );
        let used = compute_used_inputs(&[log], &[dep("//lib:a", false)], dir.path()).unwrap();
        assert!(used.is_empty());
    }

    #[test]
    fn absolute_paths_under_the_root_are_matched() {
        let dir = TempDir::new().unwrap();
        let a = dep("//lib:a", false);
        let absolute = dir.path().join(&a.full_artifact.path);
        let log = write_log(
            &dir,
            "used-classes.json",
            &format!(r#"{{"{}": ["a/A.class"]}}"#, absolute.display()),
        );
        let used = compute_used_inputs(&[log], &[a.clone()], dir.path()).unwrap();
        assert!(used.contains(&a.interface_artifact));
    }

    #[test]
    fn declared_paths_are_normalized_like_log_keys() {
        let dir = TempDir::new().unwrap();
        let relative = dep("//lib:a", false);
        let log = write_log(
            &dir,
            "used-classes.json",
            &format!(r#"{{"{}": ["a/A.class"]}}"#, relative.full_artifact.path.display()),
        );

        let mut absolute = relative.clone();
        absolute.full_artifact.path = dir.path().join(&relative.full_artifact.path);
        let used = compute_used_inputs(&[log.clone()], &[absolute.clone()], dir.path()).unwrap();
        assert_eq!(used.len(), 1);
        assert!(used.contains(&absolute.interface_artifact));

        let mut dotted = relative.clone();
        dotted.full_artifact.path = Path::new(".").join(&relative.full_artifact.path);
        let used = compute_used_inputs(&[log], &[dotted.clone()], dir.path()).unwrap();
        assert_eq!(used.len(), 1);
        assert!(used.contains(&dotted.interface_artifact));
    }

    #[test]
    fn absolute_log_keys_match_absolute_declared_paths() {
        let dir = TempDir::new().unwrap();
        let mut a = dep("//lib:a", false);
        a.full_artifact.path = dir.path().join(&a.full_artifact.path);
        let log = write_log(
            &dir,
            "used-classes.json",
            &format!(r#"{{"{}": ["a/A.class"]}}"#, a.full_artifact.path.display()),
        );
        let used = compute_used_inputs(&[log], &[a.clone()], dir.path()).unwrap();
        assert!(used.contains(&a.interface_artifact));
    }

    #[test]
    fn key_inputs_collapse_uncovered_archives() {
        let dir = TempDir::new().unwrap();
        let a = dep("//lib:a", false);
        let log = write_log(
            &dir,
            "used-classes.json",
            &format!(
                r#"{{"{}": ["a/A.class", "META-INF/MANIFEST.MF"]}}"#,
                a.interface_artifact.path.display()
            ),
        );
        let used = compute_used_inputs(&[log], &[a.clone()], dir.path()).unwrap();
        let archive = a.interface_artifact.path.clone();
        let member = |m: &str| InputRef::ArchiveMember {
            archive: archive.clone(),
            member: PathBuf::from(m),
        };

        let tracked = used.key_inputs(&DepFileCoverage::for_deps(&[a.clone()]));
        assert_eq!(tracked, BTreeSet::from([member("a/A.class"), member("META-INF/MANIFEST.MF")]));

        let untracked = used.key_inputs(&DepFileCoverage::for_deps(&[]));
        assert_eq!(
            untracked,
            BTreeSet::from([InputRef::Path { path: archive.clone() }, member("META-INF/MANIFEST.MF")])
        );
    }

    #[test]
    fn multiple_logs_are_unioned() {
        let dir = TempDir::new().unwrap();
        let a = dep("//lib:a", false);
        let path = a.interface_artifact.path.display().to_string();
        let first = write_log(&dir, "one.json", &format!(r#"{{"{path}": ["a/A.class"]}}"#));
        let second = write_log(&dir, "two.json", &format!(r#"{{"{path}": ["a/B.class"]}}"#));

        let used = compute_used_inputs(&[first, second], &[a.clone()], dir.path()).unwrap();
        let inputs = used.inputs();
        assert_eq!(inputs.len(), 2);
        assert!(inputs.contains(&InputRef::ArchiveMember {
            archive: a.interface_artifact.path.clone(),
            member: PathBuf::from("a/B.class"),
        }));
    }

    #[test]
    fn missing_log_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let err = compute_used_inputs(&[dir.path().join("nope.json")], &[], dir.path()).unwrap_err();
        assert!(matches!(err, DepFileError::Missing { .. }));
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn malformed_log_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "used-classes.json", r#"{"a.jar": 3}"#);
        let err = compute_used_inputs(&[log], &[], dir.path()).unwrap_err();
        assert!(matches!(err, DepFileError::Malformed { .. }));
    }

    #[test]
    fn coverage_is_limited_to_interface_archives() {
        let a = dep("//lib:a", false);
        let mut index = DependencyInfoIndex::new();
        let unit = CompilationUnitId::library("//app:main").unwrap();
        index.insert(&unit, vec![a.clone()]);
        let coverage = DepFileCoverage::for_unit(&index, &unit);

        assert!(coverage.covers(&InputRef::ArchiveMember {
            archive: a.interface_artifact.path.clone(),
            member: PathBuf::from("a/A.class"),
        }));
        assert!(!coverage.covers(&InputRef::ArchiveMember {
            archive: a.full_artifact.path.clone(),
            member: PathBuf::from("a/A.class"),
        }));
        assert!(!coverage.covers(&InputRef::Path {
            path: a.interface_artifact.path.clone(),
        }));
    }

    #[test]
    fn metadata_entries_are_of_interest() {
        let member = |m: &str| InputRef::ArchiveMember {
            archive: PathBuf::from("a.jar"),
            member: PathBuf::from(m),
        };
        assert!(DepFileCoverage::is_existence_of_interest(&member(
            "META-INF/services/javax.annotation.processing.Processor"
        )));
        assert!(DepFileCoverage::is_existence_of_interest(&member("_STRIPPED_RESOURCES/x.txt")));
        assert!(!DepFileCoverage::is_existence_of_interest(&member("com/META-INF/A.class")));
    }

    #[test]
    fn tracking_is_exclusive_with_the_unused_dependency_check() {
        let unit = java_unit("//app:main", vec![]);
        let java = ToolchainCapabilities::for_language(Language::Java);

        assert_eq!(
            DepFileMode::for_unit(&unit, java, true, UnusedDependenciesAction::Ignore),
            DepFileMode::Tracked
        );
        assert_eq!(
            DepFileMode::for_unit(&unit, java, true, UnusedDependenciesAction::Fail),
            DepFileMode::UnusedDependencies(DiagnosticLevel::Error)
        );
        assert_eq!(
            DepFileMode::for_unit(&unit, java, false, UnusedDependenciesAction::Ignore),
            DepFileMode::Disabled
        );

        let scala = ToolchainCapabilities::for_language(Language::Scala);
        assert_eq!(
            DepFileMode::for_unit(&unit, scala, true, UnusedDependenciesAction::Ignore),
            DepFileMode::Disabled
        );

        let mut no_sources = unit.clone();
        no_sources.sources.clear();
        assert_eq!(
            DepFileMode::for_unit(&no_sources, java, true, UnusedDependenciesAction::Ignore),
            DepFileMode::Disabled
        );
    }
}
