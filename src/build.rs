pub mod abi;
pub mod build_types;
pub mod class_loader_cache;
pub mod compile;
pub mod dep_file;
pub mod dependency_info;
pub mod output_layout;
pub mod pipeline;
pub mod step_factory;
pub mod unused_deps;

#[cfg(test)]
pub(crate) mod test_support;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::build::abi::{AbiGenerationMode, ModeResolution, ToolchainCapabilities};
use crate::build::build_types::{CompilationUnitId, LibraryUnit};
use crate::build::class_loader_cache::ClassLoaderCache;
use crate::build::dep_file::{DepFileError, InputRef, UsedInputSet};
use crate::build::dependency_info::DependencyInfoIndex;
use crate::build::pipeline::{PipelineError, PipelineStateManager};
use crate::build::step_factory::{PlanError, StepFlavor, UnitPlan};
use crate::config::{Config, ConfigError};
use crate::error::ErrorKind;
use crate::protocol::{self, StepOutcome};
use crate::worker::{BuildCancellation, DaemonLauncher, PoolError, WorkerId, WorkerPool};

#[derive(Debug, Clone, PartialEq)]
pub enum BuildProgress {
    /// Step kinds and ABI mode were chosen for a unit
    Planned {
        unit: CompilationUnitId,
        mode: AbiGenerationMode,
        resolution: ModeResolution,
        stages: usize,
    },
    /// A stage was sent to a daemon
    StageStarted {
        unit: CompilationUnitId,
        step: StepFlavor,
        worker: WorkerId,
        first_stage: bool,
    },
    StageFinished {
        unit: CompilationUnitId,
        step: StepFlavor,
        exit_code: i32,
        duration_seconds: f64,
    },
    /// Compiler output of a stage, already formatted with its action id
    CompilerOutput { unit: CompilationUnitId, stderr: String },
    /// Dependency-file inputs of a unit
    UsedInputs {
        unit: CompilationUnitId,
        used: usize,
        declared: usize,
    },
    UnusedDependency {
        unit: CompilationUnitId,
        dependency: CompilationUnitId,
    },
    /// Class-derived and source-derived interfaces differ
    AbiMismatch { unit: CompilationUnitId },
    UnitFinished {
        unit: CompilationUnitId,
        success: bool,
        duration_seconds: f64,
    },
    Finished {
        compiled_count: usize,
        failed_count: usize,
        duration_seconds: f64,
    },
}

/// Trait for reporting build progress
pub trait BuildReporter: Send + Sync {
    fn report(&self, progress: BuildProgress);
}

/// A no-op reporter that discards all progress messages.
pub struct NoopReporter;

impl BuildReporter for NoopReporter {
    fn report(&self, _progress: BuildProgress) {}
}

#[derive(Debug)]
pub enum UnitErrorKind {
    Plan(PlanError),
    /// A stage could not be dispatched or produced no result.
    Dispatch { action_id: String, source: PoolError },
    Pipeline(PipelineError),
    /// The compiler reported a failure; the outcome carries its message verbatim.
    CompileFailed(StepOutcome),
    DepFile(DepFileError),
    UnusedDependencies(Vec<CompilationUnitId>),
    AbiMismatch { class_abi: PathBuf, source_abi: PathBuf },
    AbiCheck(abi::AbiError),
    /// A blocking post-compile task panicked or was aborted.
    Blocking(tokio::task::JoinError),
    Cancelled,
}

impl UnitErrorKind {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnitErrorKind::Plan(err) => err.kind(),
            UnitErrorKind::Dispatch { source, .. } => source.kind(),
            UnitErrorKind::Pipeline(err) => err.kind(),
            UnitErrorKind::CompileFailed(_)
            | UnitErrorKind::UnusedDependencies(_)
            | UnitErrorKind::AbiMismatch { .. } => ErrorKind::UserCompile,
            UnitErrorKind::DepFile(err) => err.kind(),
            UnitErrorKind::AbiCheck(err) => err.kind(),
            UnitErrorKind::Blocking(_) | UnitErrorKind::Cancelled => ErrorKind::Process,
        }
    }
}

#[derive(Debug)]
pub struct UnitError {
    pub unit: CompilationUnitId,
    pub mode: AbiGenerationMode,
    pub kind: UnitErrorKind,
}

impl UnitError {
    pub fn new(unit: CompilationUnitId, mode: AbiGenerationMode, kind: UnitErrorKind) -> Self {
        UnitError { unit, mode, kind }
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.kind.kind()
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, UnitErrorKind::Cancelled) && self.error_kind().is_retryable()
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} abi): ", self.unit, self.mode)?;
        match &self.kind {
            UnitErrorKind::Plan(err) => write!(f, "{err}"),
            UnitErrorKind::Dispatch { action_id, source } => {
                write!(f, "{}", protocol::failure_stderr(action_id, source))
            }
            UnitErrorKind::Pipeline(err) => write!(f, "{err}"),
            UnitErrorKind::CompileFailed(outcome) => match &outcome.message {
                Some(message) => write!(f, "Failed to Compile. Error: {message}"),
                None => write!(f, "Failed to Compile with exit code {}", outcome.exit_code),
            },
            UnitErrorKind::DepFile(err) => write!(f, "{err}"),
            UnitErrorKind::UnusedDependencies(deps) => {
                let names: Vec<String> = deps.iter().map(|dep| dep.to_string()).collect();
                write!(f, "unused dependencies: {}", names.join(", "))
            }
            UnitErrorKind::AbiMismatch { class_abi, source_abi } => write!(
                f,
                "source ABI {} does not match class ABI {}",
                source_abi.display(),
                class_abi.display()
            ),
            UnitErrorKind::AbiCheck(err) => write!(f, "{err}"),
            UnitErrorKind::Blocking(err) => write!(f, "post-compile task failed: {err}"),
            UnitErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for UnitError {}

/// What a successful unit build produced.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: CompilationUnitId,
    pub mode: AbiGenerationMode,
    pub steps: Vec<StepOutcome>,
    /// Declared dependencies the compiler read, when the usage log was consumed.
    pub used_inputs: Option<UsedInputSet>,
    /// Inputs of the fine-grained cache key; empty unless dep-file tracking is on.
    pub key_inputs: BTreeSet<InputRef>,
    pub unused_dependencies: Vec<CompilationUnitId>,
}

/// The units of one build invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    pub units: Vec<LibraryUnit>,
}

pub fn read_request(path: &Path) -> Result<BuildRequest> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read build request {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Could not parse build request {}", path.display()))
}

/// Everything shared by the units of one build invocation.
pub struct BuildContext<L: DaemonLauncher> {
    pub root: PathBuf,
    pub config: Config,
    pub pool: WorkerPool<L>,
    pub pipelines: PipelineStateManager,
    pub loaders: ClassLoaderCache,
    pub cancel: BuildCancellation,
}

impl<L: DaemonLauncher> BuildContext<L> {
    /// Fails on a config that would leave the pool unable to lend anything.
    pub fn new(root: PathBuf, config: Config, launcher: L) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = WorkerPool::new(launcher, config.java.javacd.pool_config());
        Ok(BuildContext {
            root,
            config,
            pool,
            pipelines: PipelineStateManager::new(),
            loaders: ClassLoaderCache::new(),
            cancel: BuildCancellation::new(),
        })
    }
}

pub fn index_units(units: &[LibraryUnit]) -> DependencyInfoIndex {
    let mut index = DependencyInfoIndex::new();
    for unit in units {
        index.insert(&unit.target, unit.deps.clone());
    }
    index
}

/// Plans every unit without dispatching anything.
pub fn plan_units(units: &[LibraryUnit], config: &Config) -> Vec<Result<UnitPlan, UnitError>> {
    let index = index_units(units);
    units
        .iter()
        .map(|unit| plan(unit, &index, config))
        .collect()
}

fn plan(unit: &LibraryUnit, index: &DependencyInfoIndex, config: &Config) -> Result<UnitPlan, UnitError> {
    let caps = ToolchainCapabilities::for_language(unit.compiler.language);
    step_factory::plan_unit(unit, index, &config.java, caps).map_err(|err| {
        UnitError::new(
            unit.target.clone(),
            config.java.abi_generation_mode,
            UnitErrorKind::Plan(err),
        )
    })
}

/// Builds every unit concurrently and returns one result per unit, in request
/// order. A failing unit never stops the others.
pub async fn build_units<L: DaemonLauncher, R: BuildReporter>(
    ctx: &BuildContext<L>,
    units: &[LibraryUnit],
    reporter: &R,
) -> Vec<Result<UnitOutcome, UnitError>> {
    let started = Instant::now();
    let index = index_units(units);
    log::debug!("Building {} units with a pool of {}", units.len(), ctx.pool.capacity());

    let results =
        futures::future::join_all(units.iter().map(|unit| build_unit(ctx, &index, unit, reporter))).await;

    let forgotten = ctx.pipelines.purge_retired();
    tracing::debug!(pipelines = forgotten, "forgot retired pipelines");

    let failed_count = results.iter().filter(|result| result.is_err()).count();
    reporter.report(BuildProgress::Finished {
        compiled_count: results.len() - failed_count,
        failed_count,
        duration_seconds: started.elapsed().as_secs_f64(),
    });
    results
}

async fn build_unit<L: DaemonLauncher, R: BuildReporter>(
    ctx: &BuildContext<L>,
    index: &DependencyInfoIndex,
    unit: &LibraryUnit,
    reporter: &R,
) -> Result<UnitOutcome, UnitError> {
    let started = Instant::now();
    let result = match plan(unit, index, &ctx.config) {
        Ok(plan) => {
            reporter.report(BuildProgress::Planned {
                unit: plan.unit.clone(),
                mode: plan.abi.effective_mode(),
                resolution: plan.abi.resolution.clone(),
                stages: plan.stage_count(),
            });
            compile::compile_unit(ctx, unit, &plan, reporter).await
        }
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        log::debug!("{err}");
    }
    reporter.report(BuildProgress::UnitFinished {
        unit: unit.target.clone(),
        success: result.is_ok(),
        duration_seconds: started.elapsed().as_secs_f64(),
    });
    result
}
