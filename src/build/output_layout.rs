//! Deterministic output locations for a compilation unit.
//!
//! Every variant of a library gets its own generated and scratch directory so the
//! library, its source ABI and its source-only ABI never write to the same place.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::build::build_types::{CompilationUnitId, UnitVariant};

pub const DEP_FILE_NAME: &str = "used-classes.json";

/// Roots the per-unit directories hang off, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputRoot {
    pub gen_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl Default for OutputRoot {
    fn default() -> Self {
        Self {
            gen_dir: PathBuf::from("buck-out/gen"),
            scratch_dir: PathBuf::from("buck-out/bin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputPaths {
    classes_dir: PathBuf,
    jar_path: Option<PathBuf>,
    annotation_path: PathBuf,
    dep_file_path: PathBuf,
    interface_jar_path: PathBuf,
}

impl OutputPaths {
    pub fn resolve(unit: &CompilationUnitId, produces_jar: bool, root: &OutputRoot) -> Self {
        let name = format!("{}{}", unit.short_name(), unit.variant().flavor());
        let gen_base = with_cell(&root.gen_dir, unit).join(unit.base_path());
        let scratch_base = with_cell(&root.scratch_dir, unit).join(unit.base_path());

        let gen_dir = gen_base.join(format!("lib__{name}__output"));
        let classes_dir = scratch_base.join(format!("lib__{name}__scratch")).join("classes");
        let annotation_path = gen_base.join(format!("__{name}_gen__"));

        OutputPaths {
            classes_dir,
            jar_path: produces_jar.then(|| gen_dir.join(format!("{}.jar", unit.short_name()))),
            annotation_path,
            dep_file_path: gen_dir.join(DEP_FILE_NAME),
            interface_jar_path: gen_dir.join(format!("{}-abi.jar", unit.short_name())),
        }
    }

    pub fn classes_dir(&self) -> &Path {
        &self.classes_dir
    }

    /// Absent when the unit has nothing to put in a jar.
    pub fn jar_path(&self) -> Option<&Path> {
        self.jar_path.as_deref()
    }

    pub fn annotation_path(&self) -> &Path {
        &self.annotation_path
    }

    pub fn dep_file_path(&self) -> &Path {
        &self.dep_file_path
    }

    pub fn interface_jar_path(&self) -> &Path {
        &self.interface_jar_path
    }
}

fn with_cell(dir: &Path, unit: &CompilationUnitId) -> PathBuf {
    match unit.cell() {
        Some(cell) => dir.join(format!("cells/{cell}")),
        None => dir.to_path_buf(),
    }
}

/// The layouts of all three variants of one library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputPathsValue {
    library_target: String,
    library: OutputPaths,
    source_abi: OutputPaths,
    source_only_abi: OutputPaths,
}

impl OutputPathsValue {
    pub fn of(unit: &CompilationUnitId, produces_jar: bool, root: &OutputRoot) -> Self {
        let library = unit.library_id();
        OutputPathsValue {
            library_target: library.fully_qualified_name(),
            library: OutputPaths::resolve(&library, produces_jar, root),
            source_abi: OutputPaths::resolve(&library.source_abi(), produces_jar, root),
            source_only_abi: OutputPaths::resolve(&library.source_only_abi(), produces_jar, root),
        }
    }

    pub fn library_target(&self) -> &str {
        &self.library_target
    }

    pub fn by_variant(&self, variant: UnitVariant) -> &OutputPaths {
        match variant {
            UnitVariant::Library => &self.library,
            UnitVariant::SourceAbi => &self.source_abi,
            UnitVariant::SourceOnlyAbi => &self.source_only_abi,
        }
    }
}
