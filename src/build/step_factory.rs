//! Per-unit step planning.
//!
//! The step factory kind of every step is chosen here, once, when a unit is
//! planned. Execution code matches on [`StepFactoryKind`] and never has to work
//! out again which kind of step it is looking at.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::build::abi::{self, AbiDecision, AbiError, AbiPlan, SourceAbiVerificationMode, ToolchainCapabilities};
use crate::build::build_types::{CompilationUnitId, LibraryUnit, UnitVariant};
use crate::build::dep_file::DepFileMode;
use crate::build::dependency_info::DependencyInfoIndex;
use crate::build::pipeline::PipelineId;
use crate::config::JavaConfig;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFlavor {
    /// Interface jar derived from the compiled library.
    ClassAbi,
    SourceAbi,
    SourceOnlyAbi,
    Library,
}

impl StepFlavor {
    /// The variant whose output directory the step writes to.
    pub fn variant(&self) -> UnitVariant {
        match self {
            StepFlavor::ClassAbi | StepFlavor::Library => UnitVariant::Library,
            StepFlavor::SourceAbi => UnitVariant::SourceAbi,
            StepFlavor::SourceOnlyAbi => UnitVariant::SourceOnlyAbi,
        }
    }
}

impl fmt::Display for StepFlavor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StepFlavor::ClassAbi => write!(f, "class_abi"),
            StepFlavor::SourceAbi => write!(f, "source_abi"),
            StepFlavor::SourceOnlyAbi => write!(f, "source_only_abi"),
            StepFlavor::Library => write!(f, "library"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    /// Each step is a standalone request with its own command.
    InProcess,
    /// Steps go through the pipeline state manager and may share daemon state.
    Pipelined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepFactoryKind {
    pub flavor: StepFlavor,
    pub execution: Execution,
}

impl fmt::Display for StepFactoryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let execution = match self.execution {
            Execution::InProcess => "in_process",
            Execution::Pipelined => "pipelined",
        };
        write!(f, "{}/{}", self.flavor, execution)
    }
}

/// Stages dispatched in order on one daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedPipeline {
    pub id: PipelineId,
    pub stages: Vec<StepFactoryKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    pub unit: CompilationUnitId,
    pub execution: Execution,
    pub abi: AbiDecision,
    pub verification: SourceAbiVerificationMode,
    pub dep_file: DepFileMode,
    /// What the library stage compiles against.
    pub library_classpath: BTreeSet<PathBuf>,
    pub pipelines: Vec<PlannedPipeline>,
}

impl UnitPlan {
    pub fn stage_count(&self) -> usize {
        self.pipelines.iter().map(|p| p.stages.len()).sum()
    }

    pub fn step_kinds(&self) -> impl Iterator<Item = StepFactoryKind> + '_ {
        self.pipelines.iter().flat_map(|p| p.stages.iter().copied())
    }

    /// What an interface stage compiles against; empty for class-derived ABIs.
    pub fn abi_classpath(&self) -> BTreeSet<PathBuf> {
        self.abi.plan.classpath().cloned().unwrap_or_default()
    }

    pub fn is_chained(&self) -> bool {
        self.pipelines.iter().any(|p| p.stages.len() > 1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("{unit} is not a library target")]
    NotALibrary { unit: CompilationUnitId },
    #[error("invalid remove_classes pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl PlanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::Abi(err) => err.kind(),
            PlanError::NotALibrary { .. } | PlanError::InvalidPattern { .. } => ErrorKind::Configuration,
        }
    }
}

/// Chooses the ABI plan, the step kinds and their grouping into pipelines for
/// one library. Runs before any daemon work, so every configuration problem of
/// the unit surfaces here.
pub fn plan_unit(
    unit: &LibraryUnit,
    index: &DependencyInfoIndex,
    config: &JavaConfig,
    caps: ToolchainCapabilities,
) -> Result<UnitPlan, PlanError> {
    let _span = tracing::info_span!("build.plan_unit", unit = %unit.target).entered();

    if !unit.target.is_library() {
        return Err(PlanError::NotALibrary {
            unit: unit.target.clone(),
        });
    }
    for pattern in &unit.remove_classes {
        regex::Regex::new(pattern).map_err(|source| PlanError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
    }

    let decision = abi::plan_abi(unit, index, config.abi_policy(), caps)?;
    let execution = if config.javacd.enabled {
        Execution::Pipelined
    } else {
        Execution::InProcess
    };
    let effective_mode = decision.effective_mode();
    let chain = execution == Execution::Pipelined
        && !config.pipelining_disabled
        && effective_mode.is_source_abi()
        && effective_mode.uses_dependencies();
    let verification = config.verification_mode();

    let kind = |flavor| StepFactoryKind { flavor, execution };
    let mut groups: Vec<Vec<StepFactoryKind>> = Vec::new();
    match &decision.plan {
        AbiPlan::FromClassFile => {
            groups.push(vec![kind(StepFlavor::Library)]);
            if unit.produces_jar() {
                groups.push(vec![kind(StepFlavor::ClassAbi)]);
            }
        }
        AbiPlan::FromSource { .. } if chain => {
            groups.push(vec![kind(StepFlavor::SourceAbi), kind(StepFlavor::Library)]);
        }
        AbiPlan::FromSource { .. } => {
            groups.push(vec![kind(StepFlavor::SourceAbi)]);
            groups.push(vec![kind(StepFlavor::Library)]);
        }
        AbiPlan::FromSourceOnly { .. } => {
            groups.push(vec![kind(StepFlavor::SourceOnlyAbi)]);
            groups.push(vec![kind(StepFlavor::Library)]);
        }
    }
    if verification != SourceAbiVerificationMode::Off
        && decision.effective_mode().is_source_abi()
        && unit.produces_jar()
    {
        groups.push(vec![kind(StepFlavor::ClassAbi)]);
    }

    let library_id = unit.target.library_id();
    let library_classpath = if config.compile_against_abis {
        index.interface_classpath(&library_id)
    } else {
        index.full_classpath(&library_id)
    };
    let dep_file = DepFileMode::for_unit(
        unit,
        caps,
        config.track_class_usage,
        config.unused_dependencies_action,
    );

    let pipelines = groups
        .into_iter()
        .enumerate()
        .map(|(ordinal, stages)| PlannedPipeline {
            id: PipelineId::new(&library_id, ordinal),
            stages,
        })
        .collect();

    let plan = UnitPlan {
        unit: library_id,
        execution,
        abi: decision,
        verification,
        dep_file,
        library_classpath,
        pipelines,
    };
    tracing::debug!(
        unit = %plan.unit,
        mode = %plan.abi.effective_mode(),
        stages = plan.stage_count(),
        chained = plan.is_chained(),
        "planned unit"
    );
    Ok(plan)
}
