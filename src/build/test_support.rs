//! Fixtures shared by the unit tests of the build modules.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::build::build_types::{ArtifactRef, CompilationUnitId, CompilerHandle, Language, LibraryUnit};
use crate::build::dependency_info::DependencyInfo;
use crate::build::output_layout::{OutputPaths, OutputRoot};

/// A dependency on `target` pointing at its default-layout jar and source ABI jar.
pub fn dep(target: &str, required_for_interface_only_build: bool) -> DependencyInfo {
    let lib = CompilationUnitId::library(target).unwrap();
    let root = OutputRoot::default();
    let full = OutputPaths::resolve(&lib, true, &root);
    let interface = OutputPaths::resolve(&lib.source_abi(), true, &root);
    DependencyInfo {
        full_artifact: ArtifactRef::new(lib.clone(), full.jar_path().unwrap()),
        interface_artifact: ArtifactRef::new(lib.source_abi(), interface.interface_jar_path()),
        required_for_interface_only_build,
    }
}

pub fn java_unit(target: &str, deps: Vec<DependencyInfo>) -> LibraryUnit {
    let id = CompilationUnitId::library(target).unwrap();
    LibraryUnit {
        sources: BTreeSet::from([PathBuf::from(format!(
            "{}/{}.java",
            id.base_path(),
            id.short_name()
        ))]),
        target: id,
        compiler: CompilerHandle {
            language: Language::Java,
            executable: None,
            version: None,
        },
        resources: BTreeMap::new(),
        manifest: None,
        deps,
        options: vec!["-source".to_string(), "11".to_string()],
        plugins: vec![],
        remove_classes: vec![],
    }
}
