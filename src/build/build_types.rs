use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use crate::build::dependency_info::DependencyInfo;

/// Which of the three outputs of one logical library a unit id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitVariant {
    Library,
    SourceAbi,
    SourceOnlyAbi,
}

impl UnitVariant {
    pub fn flavor(&self) -> &'static str {
        match self {
            UnitVariant::Library => "",
            UnitVariant::SourceAbi => "#source-abi",
            UnitVariant::SourceOnlyAbi => "#source-only-abi",
        }
    }

    fn from_flavor(flavor: &str) -> Option<Self> {
        match flavor {
            "" => Some(UnitVariant::Library),
            "source-abi" => Some(UnitVariant::SourceAbi),
            "source-only-abi" => Some(UnitVariant::SourceOnlyAbi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid target `{target}`: {reason}")]
pub struct TargetParseError {
    pub target: String,
    pub reason: &'static str,
}

/// Identifier of one compilable unit: `[cell]//base/path:name[#flavor]`.
///
/// Interface variants are only ever derived from a library id, so every logical
/// library has exactly one library id and at most two interface ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompilationUnitId {
    cell: Option<String>,
    base_path: String,
    short_name: String,
    variant: UnitVariant,
}

impl CompilationUnitId {
    /// Parses a library target. Flavored targets are rejected here; use
    /// [`CompilationUnitId::source_abi`] and friends to reach the interface variants.
    pub fn library(target: &str) -> Result<Self, TargetParseError> {
        let id: CompilationUnitId = target.parse()?;
        if id.variant != UnitVariant::Library {
            return Err(TargetParseError {
                target: target.to_string(),
                reason: "expected a library target without a flavor",
            });
        }
        Ok(id)
    }

    pub fn variant(&self) -> UnitVariant {
        self.variant
    }

    pub fn is_library(&self) -> bool {
        self.variant == UnitVariant::Library
    }

    pub fn cell(&self) -> Option<&str> {
        self.cell.as_deref()
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn with_variant(&self, variant: UnitVariant) -> Self {
        CompilationUnitId {
            variant,
            ..self.clone()
        }
    }

    pub fn library_id(&self) -> Self {
        self.with_variant(UnitVariant::Library)
    }

    pub fn source_abi(&self) -> Self {
        self.with_variant(UnitVariant::SourceAbi)
    }

    pub fn source_only_abi(&self) -> Self {
        self.with_variant(UnitVariant::SourceOnlyAbi)
    }

    /// The unflavored `cell//base:name` string.
    pub fn fully_qualified_name(&self) -> String {
        format!(
            "{}//{}:{}",
            self.cell.as_deref().unwrap_or(""),
            self.base_path,
            self.short_name
        )
    }
}

impl Display for CompilationUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.fully_qualified_name(), self.variant.flavor())
    }
}

impl FromStr for CompilationUnitId {
    type Err = TargetParseError;

    fn from_str(target: &str) -> Result<Self, Self::Err> {
        let err = |reason| TargetParseError {
            target: target.to_string(),
            reason,
        };

        let (cell, rest) = target.split_once("//").ok_or_else(|| err("missing `//`"))?;
        let (base_path, name) = rest.rsplit_once(':').ok_or_else(|| err("missing `:name`"))?;
        let (short_name, flavor) = match name.split_once('#') {
            Some((short_name, flavor)) => (short_name, flavor),
            None => (name, ""),
        };

        if short_name.is_empty() {
            return Err(err("empty target name"));
        }
        if base_path.starts_with('/') || base_path.ends_with('/') {
            return Err(err("base path must not start or end with `/`"));
        }
        if short_name.contains('/') {
            return Err(err("target name must not contain `/`"));
        }
        let variant = UnitVariant::from_flavor(flavor).ok_or_else(|| err("unknown flavor"))?;

        Ok(CompilationUnitId {
            cell: (!cell.is_empty()).then(|| cell.to_string()),
            base_path: base_path.to_string(),
            short_name: short_name.to_string(),
            variant,
        })
    }
}

impl TryFrom<String> for CompilationUnitId {
    type Error = TargetParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompilationUnitId> for String {
    fn from(value: CompilationUnitId) -> Self {
        value.to_string()
    }
}

/// A build output owned by a unit, addressed relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub owner: CompilationUnitId,
    pub path: PathBuf,
}

impl ArtifactRef {
    pub fn new(owner: CompilationUnitId, path: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            path: path.into(),
        }
    }
}

impl Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.owner, self.path.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Java,
    Kotlin,
    Scala,
}

impl Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Java => write!(f, "java"),
            Language::Kotlin => write!(f, "kotlin"),
            Language::Scala => write!(f, "scala"),
        }
    }
}

/// The compiler a unit resolved to. Opaque to this crate apart from the language,
/// which selects the toolchain capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerHandle {
    pub language: Language,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub version: Option<String>,
}

/// An annotation processor or compiler plugin attached to a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub classpath: Vec<PathBuf>,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub can_reuse_class_loader: bool,
}

/// Caller-supplied description of one library and its compile-time inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryUnit {
    pub target: CompilationUnitId,
    pub compiler: CompilerHandle,
    #[serde(default)]
    pub sources: BTreeSet<PathBuf>,
    /// Resource source path to its destination inside the classes directory.
    #[serde(default)]
    pub resources: BTreeMap<PathBuf, PathBuf>,
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub deps: Vec<DependencyInfo>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    /// Regex patterns of class names stripped from the library jar.
    #[serde(default)]
    pub remove_classes: Vec<String>,
}

impl LibraryUnit {
    pub fn produces_jar(&self) -> bool {
        !self.sources.is_empty() || !self.resources.is_empty() || self.manifest.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cell_relative_targets() {
        let id = CompilationUnitId::library("//java/com/example:lib").unwrap();
        assert_eq!(id.cell(), None);
        assert_eq!(id.base_path(), "java/com/example");
        assert_eq!(id.short_name(), "lib");
        assert_eq!(id.to_string(), "//java/com/example:lib");
    }

    #[test]
    fn parses_cells_and_flavors() {
        let id: CompilationUnitId = "third//lib:guava#source-only-abi".parse().unwrap();
        assert_eq!(id.cell(), Some("third"));
        assert_eq!(id.variant(), UnitVariant::SourceOnlyAbi);
        assert_eq!(id.library_id().to_string(), "third//lib:guava");
    }

    #[test]
    fn interface_variants_derive_from_library() {
        let lib = CompilationUnitId::library("//a:b").unwrap();
        assert_eq!(lib.source_abi().to_string(), "//a:b#source-abi");
        assert_eq!(lib.source_only_abi().library_id(), lib);
        assert!(lib.source_abi().library_id().is_library());
    }

    #[test]
    fn library_rejects_flavored_targets() {
        assert!(CompilationUnitId::library("//a:b#source-abi").is_err());
    }

    #[test]
    fn rejects_malformed_targets() {
        for bad in ["a:b", "//a", "//a:", "///a:b", "//a/:b", "//a:b#weird"] {
            assert!(bad.parse::<CompilationUnitId>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn round_trips_through_json() {
        let id = CompilationUnitId::library("//a/b:c").unwrap().source_abi();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"//a/b:c#source-abi\"");
        let back: CompilationUnitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn produces_jar_requires_some_input() {
        let mut unit = LibraryUnit {
            target: CompilationUnitId::library("//a:b").unwrap(),
            compiler: CompilerHandle {
                language: Language::Java,
                executable: None,
                version: None,
            },
            sources: BTreeSet::new(),
            resources: BTreeMap::new(),
            manifest: None,
            deps: vec![],
            options: vec![],
            plugins: vec![],
            remove_classes: vec![],
        };
        assert!(!unit.produces_jar());
        unit.manifest = Some(PathBuf::from("MANIFEST.MF"));
        assert!(unit.produces_jar());
    }
}
