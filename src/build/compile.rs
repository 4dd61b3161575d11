//! Dispatches the planned stages of one unit and runs its post-compile checks.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use crate::build::abi::{self, DiagnosticLevel, SourceAbiVerificationMode};
use crate::build::build_types::{CompilationUnitId, LibraryUnit, UnitVariant};
use crate::build::dep_file::{self, DepFileCoverage, DepFileMode, InputRef, UsageLog, UsedInputSet};
use crate::build::output_layout::OutputPathsValue;
use crate::build::pipeline::{PipelineRun, PipelineState};
use crate::build::step_factory::{Execution, PlannedPipeline, StepFlavor, UnitPlan};
use crate::build::unused_deps;
use crate::build::{BuildContext, BuildProgress, BuildReporter, UnitError, UnitErrorKind, UnitOutcome};
use crate::protocol::{
    self, CompileCommand, CompileCommandBuilder, ExecuteRequest, FilesystemParams, JarParameters, Request,
    StepOutcome,
};
use crate::worker::{DaemonLauncher, PoolError};

/// Runs every pipeline of `plan` in order, each on one borrowed daemon, then
/// consumes the usage log and verifies the source ABI when asked to.
#[tracing::instrument(name = "build.compile_unit", skip_all, fields(unit = %plan.unit))]
pub async fn compile_unit<L: DaemonLauncher, R: BuildReporter>(
    ctx: &BuildContext<L>,
    unit: &LibraryUnit,
    plan: &UnitPlan,
    reporter: &R,
) -> Result<UnitOutcome, UnitError> {
    let mode = plan.abi.effective_mode();
    let fail = |kind| UnitError::new(plan.unit.clone(), mode, kind);

    let mut steps = Vec::with_capacity(plan.stage_count());
    for pipeline in &plan.pipelines {
        steps.extend(run_pipeline(ctx, unit, plan, pipeline, reporter).await.map_err(fail)?);
    }

    let outputs = OutputPathsValue::of(&unit.target, unit.produces_jar(), &ctx.config.output);
    let usage = consume_usage_log(ctx, unit, plan, &outputs, reporter)
        .await
        .map_err(fail)?;
    verify_source_abi(ctx, unit, plan, &outputs, reporter)
        .await
        .map_err(fail)?;

    Ok(UnitOutcome {
        unit: plan.unit.clone(),
        mode,
        steps,
        used_inputs: usage.used_inputs,
        key_inputs: usage.key_inputs,
        unused_dependencies: usage.unused_dependencies,
    })
}

/// Dispatches the stages of one pipeline on a single lease. The pipeline is
/// retired when this returns, however it returns.
async fn run_pipeline<L: DaemonLauncher, R: BuildReporter>(
    ctx: &BuildContext<L>,
    unit: &LibraryUnit,
    plan: &UnitPlan,
    pipeline: &PlannedPipeline,
    reporter: &R,
) -> Result<Vec<StepOutcome>, UnitErrorKind> {
    let Some(first) = pipeline.stages.first() else {
        return Ok(Vec::new());
    };
    if ctx.cancel.is_cancelled() {
        return Err(UnitErrorKind::Cancelled);
    }

    let mut lease = ctx
        .pool
        .borrow(&ctx.cancel)
        .await
        .map_err(|source| dispatch_error(protocol::action_id(&plan.unit, first.flavor), source))?;

    let run = match first.execution {
        Execution::Pipelined => Some(ctx.pipelines.start(pipeline.id.clone())),
        Execution::InProcess => None,
    };
    let (classpath, abi_classpath) = stage_classpaths(plan, pipeline);
    let create = || PipelineState::create(unit, classpath.clone(), abi_classpath.clone(), &ctx.config.output);

    let mut outcomes = Vec::with_capacity(pipeline.stages.len());
    for kind in &pipeline.stages {
        if ctx.cancel.is_cancelled() {
            return Err(UnitErrorKind::Cancelled);
        }
        let action_id = protocol::action_id(&plan.unit, kind.flavor);
        let request = stage_request(ctx, unit, plan, run.as_ref(), kind.flavor, &action_id, create)?;

        reporter.report(BuildProgress::StageStarted {
            unit: plan.unit.clone(),
            step: kind.flavor,
            worker: lease.id(),
            first_stage: request.first_stage,
        });
        let started = Instant::now();
        let result = lease
            .execute(&Request::Execute(request), &ctx.cancel)
            .await
            .map_err(|source| dispatch_error(action_id.clone(), source))?;
        if let Some(run) = &run {
            if let Err(err) = run.complete_stage() {
                // The daemon's pipeline state no longer matches ours.
                lease.poison();
                return Err(UnitErrorKind::Pipeline(err));
            }
        }

        let outcome = StepOutcome::from_result(action_id, kind.flavor, result);
        reporter.report(BuildProgress::StageFinished {
            unit: plan.unit.clone(),
            step: kind.flavor,
            exit_code: outcome.exit_code,
            duration_seconds: started.elapsed().as_secs_f64(),
        });
        if let Some(stderr) = outcome.stderr() {
            reporter.report(BuildProgress::CompilerOutput {
                unit: plan.unit.clone(),
                stderr,
            });
        }
        if !outcome.is_success() {
            return Err(UnitErrorKind::CompileFailed(outcome));
        }
        outcomes.push(outcome);
    }

    drop(run);
    if let Err(err) = lease.release() {
        log::debug!("Could not return worker after {}: {err}", pipeline.id);
    }
    Ok(outcomes)
}

fn stage_request<L: DaemonLauncher>(
    ctx: &BuildContext<L>,
    unit: &LibraryUnit,
    plan: &UnitPlan,
    run: Option<&PipelineRun<'_>>,
    step: StepFlavor,
    action_id: &str,
    create: impl FnOnce() -> PipelineState,
) -> Result<ExecuteRequest, UnitErrorKind> {
    let Some(run) = run else {
        let state = create();
        return Ok(ExecuteRequest {
            action_id: action_id.to_string(),
            pipeline_id: None,
            first_stage: true,
            step,
            command: Some(compile_command(ctx, unit, plan, &state)),
        });
    };

    let ticket = run.stage(create).map_err(UnitErrorKind::Pipeline)?;
    Ok(ExecuteRequest {
        action_id: action_id.to_string(),
        pipeline_id: Some(run.id().to_string()),
        first_stage: ticket.is_first_stage,
        step,
        command: ticket
            .is_first_stage
            .then(|| compile_command(ctx, unit, plan, &ticket.state)),
    })
}

/// A pipeline ships only the classpaths its own stages read: the library
/// classpath when it compiles the library, the interface classpath when it
/// computes a source-derived ABI.
fn stage_classpaths(plan: &UnitPlan, pipeline: &PlannedPipeline) -> (BTreeSet<PathBuf>, BTreeSet<PathBuf>) {
    let has = |wanted: &[StepFlavor]| pipeline.stages.iter().any(|k| wanted.contains(&k.flavor));
    let classpath = if has(&[StepFlavor::Library]) {
        plan.library_classpath.clone()
    } else {
        BTreeSet::new()
    };
    let abi_classpath = if has(&[StepFlavor::SourceAbi, StepFlavor::SourceOnlyAbi]) {
        plan.abi_classpath()
    } else {
        BTreeSet::new()
    };
    (classpath, abi_classpath)
}

fn compile_command<L: DaemonLauncher>(
    ctx: &BuildContext<L>,
    unit: &LibraryUnit,
    plan: &UnitPlan,
    state: &PipelineState,
) -> CompileCommand {
    let outputs = state.output_paths();
    let library = outputs.by_variant(UnitVariant::Library);

    let mut builder = CompileCommandBuilder::new(
        state.target().clone(),
        state.compiler().clone(),
        FilesystemParams {
            root_path: ctx.root.clone(),
            output_root: ctx.config.output.clone(),
        },
        outputs.clone(),
    )
    .with_options(state.options().iter().cloned())
    .with_classpath(state.classpath().iter().cloned())
    .with_abi_classpath(state.abi_classpath().iter().cloned())
    .with_sources(state.sources().iter().cloned())
    .with_resources(unit.resources.clone())
    .with_cell_to_path(ctx.config.cells.clone())
    .with_plugins(ctx.loaders.resolve_all(&unit.plugins))
    .with_abi_generation_mode(plan.abi.effective_mode())
    .with_source_only_diagnostics(plan.abi.source_only_diagnostics)
    .with_class_usage_tracking(plan.dep_file.needs_usage_log());

    if let Some(jar) = library.jar_path() {
        builder = builder.with_library_jar(JarParameters {
            jar_path: jar.to_path_buf(),
            entries_to_jar: vec![library.classes_dir().to_path_buf()],
            manifest: unit.manifest.clone(),
            remove_patterns: unit.remove_classes.clone(),
        });
    }

    let abi_jar = match plan.abi.plan.abi_unit() {
        Some(abi_unit) => {
            let paths = outputs.by_variant(abi_unit.variant());
            Some(JarParameters {
                jar_path: paths.interface_jar_path().to_path_buf(),
                entries_to_jar: vec![paths.classes_dir().to_path_buf()],
                manifest: None,
                remove_patterns: unit.remove_classes.clone(),
            })
        }
        None => library.jar_path().map(|jar| JarParameters {
            jar_path: library.interface_jar_path().to_path_buf(),
            entries_to_jar: vec![jar.to_path_buf()],
            manifest: None,
            remove_patterns: Vec::new(),
        }),
    };
    if let Some(jar) = abi_jar {
        builder = builder.with_abi_jar(jar);
    }
    builder.build()
}

fn dispatch_error(action_id: String, source: PoolError) -> UnitErrorKind {
    match source {
        PoolError::Cancelled => UnitErrorKind::Cancelled,
        source => UnitErrorKind::Dispatch { action_id, source },
    }
}

/// Runs filesystem and hashing work off the async workers so other units'
/// daemon round-trips keep moving.
async fn blocking<T, F>(work: F) -> Result<T, UnitErrorKind>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(work))
        .await
        .map_err(UnitErrorKind::Blocking)
}

#[derive(Default)]
struct UsageResult {
    used_inputs: Option<UsedInputSet>,
    key_inputs: BTreeSet<InputRef>,
    unused_dependencies: Vec<CompilationUnitId>,
}

async fn consume_usage_log<L: DaemonLauncher, R: BuildReporter>(
    ctx: &BuildContext<L>,
    unit: &LibraryUnit,
    plan: &UnitPlan,
    outputs: &OutputPathsValue,
    reporter: &R,
) -> Result<UsageResult, UnitErrorKind> {
    let log_path = ctx
        .root
        .join(outputs.by_variant(UnitVariant::Library).dep_file_path());
    let root = ctx.root.clone();

    let result = match plan.dep_file {
        DepFileMode::Disabled => return Ok(UsageResult::default()),
        DepFileMode::Tracked => {
            let deps = unit.deps.clone();
            let used = blocking(move || dep_file::compute_used_inputs(&[log_path], &deps, &root))
                .await?
                .map_err(UnitErrorKind::DepFile)?;
            let key_inputs = used.key_inputs(&DepFileCoverage::for_deps(&unit.deps));
            UsageResult {
                used_inputs: Some(used),
                key_inputs,
                unused_dependencies: Vec::new(),
            }
        }
        DepFileMode::UnusedDependencies(level) => {
            let log = blocking(move || UsageLog::read(&log_path, &root))
                .await?
                .map_err(UnitErrorKind::DepFile)?;
            let unused: Vec<CompilationUnitId> = unused_deps::find_unused_dependencies(&log, &unit.deps)
                .iter()
                .map(|dep| dep.owner())
                .collect();
            if !unused.is_empty() && level == DiagnosticLevel::Error {
                return Err(UnitErrorKind::UnusedDependencies(unused));
            }
            for dependency in &unused {
                log::warn!("{} does not use its dependency {}", plan.unit, dependency);
                reporter.report(BuildProgress::UnusedDependency {
                    unit: plan.unit.clone(),
                    dependency: dependency.clone(),
                });
            }
            UsageResult {
                used_inputs: Some(UsedInputSet::from_log(&log, &unit.deps)),
                key_inputs: BTreeSet::new(),
                unused_dependencies: unused,
            }
        }
    };

    if let Some(used) = &result.used_inputs {
        reporter.report(BuildProgress::UsedInputs {
            unit: plan.unit.clone(),
            used: used.len(),
            declared: unit.deps.len(),
        });
    }
    Ok(result)
}

async fn verify_source_abi<L: DaemonLauncher, R: BuildReporter>(
    ctx: &BuildContext<L>,
    unit: &LibraryUnit,
    plan: &UnitPlan,
    outputs: &OutputPathsValue,
    reporter: &R,
) -> Result<(), UnitErrorKind> {
    if plan.verification == SourceAbiVerificationMode::Off || !unit.produces_jar() {
        return Ok(());
    }
    let Some(abi_unit) = plan.abi.plan.abi_unit() else {
        return Ok(());
    };

    let class_abi = ctx
        .root
        .join(outputs.by_variant(UnitVariant::Library).interface_jar_path());
    let source_abi = ctx
        .root
        .join(outputs.by_variant(abi_unit.variant()).interface_jar_path());

    let compared = {
        let (class_abi, source_abi) = (class_abi.clone(), source_abi.clone());
        blocking(move || abi::abi_jars_match(&class_abi, &source_abi)).await?
    };
    let matches = match compared {
        Ok(matches) => matches,
        Err(err) if plan.verification == SourceAbiVerificationMode::Log => {
            log::warn!("Could not verify the source ABI of {}: {err}", plan.unit);
            return Ok(());
        }
        Err(err) => return Err(UnitErrorKind::AbiCheck(err)),
    };
    if matches {
        return Ok(());
    }

    reporter.report(BuildProgress::AbiMismatch {
        unit: plan.unit.clone(),
    });
    match plan.verification {
        SourceAbiVerificationMode::Fail => Err(UnitErrorKind::AbiMismatch { class_abi, source_abi }),
        _ => {
            log::warn!(
                "Source ABI of {} differs from its class ABI {}",
                plan.unit,
                class_abi.display()
            );
            Ok(())
        }
    }
}
