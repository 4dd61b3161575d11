use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::build::build_types::{ArtifactRef, CompilationUnitId};

/// One upstream compile-time dependency of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyInfo {
    pub full_artifact: ArtifactRef,
    pub interface_artifact: ArtifactRef,
    #[serde(default)]
    pub required_for_interface_only_build: bool,
}

impl DependencyInfo {
    /// The library that owns this dependency's outputs.
    pub fn owner(&self) -> CompilationUnitId {
        self.full_artifact.owner.library_id()
    }
}

/// Per-unit dependency lists, keyed by library id. Interface variants share the
/// list of the library they were derived from.
#[derive(Debug, Default)]
pub struct DependencyInfoIndex {
    infos: AHashMap<CompilationUnitId, Arc<[DependencyInfo]>>,
}

impl DependencyInfoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: &CompilationUnitId, infos: Vec<DependencyInfo>) {
        self.infos.insert(unit.library_id(), infos.into());
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Dependencies of `unit`; empty for units that were never registered.
    pub fn get(&self, unit: &CompilationUnitId) -> Arc<[DependencyInfo]> {
        self.infos
            .get(&unit.library_id())
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn required_for_interface_only(&self, unit: &CompilationUnitId) -> Vec<DependencyInfo> {
        self.get(unit)
            .iter()
            .filter(|info| info.required_for_interface_only_build)
            .cloned()
            .collect()
    }

    pub fn full_classpath(&self, unit: &CompilationUnitId) -> BTreeSet<PathBuf> {
        self.get(unit).iter().map(|info| info.full_artifact.path.clone()).collect()
    }

    pub fn interface_classpath(&self, unit: &CompilationUnitId) -> BTreeSet<PathBuf> {
        self.get(unit)
            .iter()
            .map(|info| info.interface_artifact.path.clone())
            .collect()
    }

    pub fn interface_only_classpath(&self, unit: &CompilationUnitId) -> BTreeSet<PathBuf> {
        self.get(unit)
            .iter()
            .filter(|info| info.required_for_interface_only_build)
            .map(|info| info.interface_artifact.path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(target: &str, required: bool) -> DependencyInfo {
        let lib = CompilationUnitId::library(target).unwrap();
        let name = lib.short_name().to_string();
        DependencyInfo {
            full_artifact: ArtifactRef::new(lib.clone(), format!("out/{name}.jar")),
            interface_artifact: ArtifactRef::new(lib.source_abi(), format!("out/{name}-abi.jar")),
            required_for_interface_only_build: required,
        }
    }

    #[test]
    fn interface_variants_share_library_deps() {
        let unit = CompilationUnitId::library("//app:main").unwrap();
        let mut index = DependencyInfoIndex::new();
        index.insert(&unit.source_abi(), vec![dep("//lib:a", true), dep("//lib:b", false)]);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&unit).len(), 2);
        assert_eq!(index.get(&unit.source_only_abi()).len(), 2);
    }

    #[test]
    fn interface_only_subset_follows_flag() {
        let unit = CompilationUnitId::library("//app:main").unwrap();
        let mut index = DependencyInfoIndex::new();
        index.insert(&unit, vec![dep("//lib:a", true), dep("//lib:b", false)]);

        let required = index.required_for_interface_only(&unit);
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].owner().to_string(), "//lib:a");
        assert_eq!(
            index.interface_only_classpath(&unit),
            BTreeSet::from([PathBuf::from("out/a-abi.jar")])
        );
        assert!(index.full_classpath(&unit).contains(&PathBuf::from("out/b.jar")));
    }

    #[test]
    fn unknown_unit_has_no_deps() {
        let index = DependencyInfoIndex::new();
        let unit = CompilationUnitId::library("//nowhere:x").unwrap();
        assert!(index.get(&unit).is_empty());
        assert!(index.interface_classpath(&unit).is_empty());
    }
}
