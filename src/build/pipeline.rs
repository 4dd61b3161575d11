//! Shared state for the stages of one pipeline.
//!
//! Each pipeline moves through `Uninitialized -> Materialized -> Retired`. The
//! first stage materializes a [`PipelineState`]; every later stage gets the same
//! `Arc`, so the classpath and options can never differ between stages.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::build::build_types::{CompilationUnitId, CompilerHandle, LibraryUnit};
use crate::build::output_layout::{OutputPathsValue, OutputRoot};
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    pub fn new(unit: &CompilationUnitId, ordinal: usize) -> Self {
        PipelineId(format!("{unit}/{ordinal}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the stages of a pipeline must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    target: CompilationUnitId,
    compiler: CompilerHandle,
    options: Vec<String>,
    classpath: BTreeSet<PathBuf>,
    abi_classpath: BTreeSet<PathBuf>,
    sources: BTreeSet<PathBuf>,
    output_paths: OutputPathsValue,
}

impl PipelineState {
    /// `classpath` is what the library compiles against; `abi_classpath` is what an
    /// interface stage of the same pipeline may read.
    pub fn create(
        unit: &LibraryUnit,
        classpath: BTreeSet<PathBuf>,
        abi_classpath: BTreeSet<PathBuf>,
        root: &OutputRoot,
    ) -> Self {
        PipelineState {
            target: unit.target.library_id(),
            compiler: unit.compiler.clone(),
            options: unit.options.clone(),
            classpath,
            abi_classpath,
            sources: unit.sources.clone(),
            output_paths: OutputPathsValue::of(&unit.target, unit.produces_jar(), root),
        }
    }

    pub fn target(&self) -> &CompilationUnitId {
        &self.target
    }

    pub fn compiler(&self) -> &CompilerHandle {
        &self.compiler
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn classpath(&self) -> &BTreeSet<PathBuf> {
        &self.classpath
    }

    pub fn abi_classpath(&self) -> &BTreeSet<PathBuf> {
        &self.abi_classpath
    }

    pub fn sources(&self) -> &BTreeSet<PathBuf> {
        &self.sources
    }

    pub fn output_paths(&self) -> &OutputPathsValue {
        &self.output_paths
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline {0} already has a stage in flight")]
    ConcurrentStage(PipelineId),
    #[error("pipeline {0} was retired, no further stages may be dispatched")]
    StageAfterRetirement(PipelineId),
    #[error("pipeline {0} has no stage in flight")]
    NoStageInFlight(PipelineId),
}

impl PipelineError {
    /// Misuse is a bug in the caller and is never retried.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug)]
enum Slot {
    Materialized {
        state: Arc<PipelineState>,
        in_flight: bool,
        stages: usize,
    },
    Retired,
}

/// What a stage needs to dispatch: the shared state and whether it is the one
/// that materialized it.
#[derive(Debug, Clone)]
pub struct StageTicket {
    pub state: Arc<PipelineState>,
    pub is_first_stage: bool,
}

#[derive(Debug, Default)]
pub struct PipelineStateManager {
    slots: Mutex<AHashMap<PipelineId, Slot>>,
}

impl PipelineStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a stage of `id` as in flight, materializing the state with `create`
    /// if this is the pipeline's first stage.
    pub fn get_or_create(
        &self,
        id: &PipelineId,
        create: impl FnOnce() -> PipelineState,
    ) -> Result<StageTicket, PipelineError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(id) {
            None => {
                let state = Arc::new(create());
                slots.insert(
                    id.clone(),
                    Slot::Materialized {
                        state: state.clone(),
                        in_flight: true,
                        stages: 0,
                    },
                );
                tracing::debug!(pipeline = %id, "materialized pipeline state");
                Ok(StageTicket {
                    state,
                    is_first_stage: true,
                })
            }
            Some(Slot::Materialized { in_flight: true, .. }) => Err(PipelineError::ConcurrentStage(id.clone())),
            Some(Slot::Materialized { state, in_flight, .. }) => {
                *in_flight = true;
                Ok(StageTicket {
                    state: state.clone(),
                    is_first_stage: false,
                })
            }
            Some(Slot::Retired) => Err(PipelineError::StageAfterRetirement(id.clone())),
        }
    }

    pub fn complete_stage(&self, id: &PipelineId) -> Result<(), PipelineError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(id) {
            Some(Slot::Materialized { in_flight, stages, .. }) if *in_flight => {
                *in_flight = false;
                *stages += 1;
                Ok(())
            }
            Some(Slot::Retired) => Err(PipelineError::StageAfterRetirement(id.clone())),
            _ => Err(PipelineError::NoStageInFlight(id.clone())),
        }
    }

    /// Releases the state of `id`. Returns false if it was already retired.
    pub fn retire(&self, id: &PipelineId) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.insert(id.clone(), Slot::Retired) {
            Some(Slot::Retired) => false,
            Some(Slot::Materialized { stages, .. }) => {
                tracing::debug!(pipeline = %id, stages, "retired pipeline");
                true
            }
            None => true,
        }
    }

    /// Drops the tombstones of retired pipelines. Only call this once no run of
    /// those pipelines can still be in flight, e.g. between build invocations.
    pub fn purge_retired(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|_, slot| !matches!(slot, Slot::Retired));
        before - slots.len()
    }

    pub fn is_retired(&self, id: &PipelineId) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        matches!(slots.get(id), Some(Slot::Retired))
    }

    /// Number of pipelines currently holding materialized state.
    pub fn live_pipelines(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Materialized { .. }))
            .count()
    }

    /// Starts a run of `id` that retires the pipeline when dropped, whether its
    /// stages succeeded, failed or were cancelled.
    pub fn start(&self, id: PipelineId) -> PipelineRun<'_> {
        PipelineRun { manager: self, id }
    }
}

pub struct PipelineRun<'a> {
    manager: &'a PipelineStateManager,
    id: PipelineId,
}

impl PipelineRun<'_> {
    pub fn id(&self) -> &PipelineId {
        &self.id
    }

    pub fn stage(&self, create: impl FnOnce() -> PipelineState) -> Result<StageTicket, PipelineError> {
        self.manager.get_or_create(&self.id, create)
    }

    pub fn complete_stage(&self) -> Result<(), PipelineError> {
        self.manager.complete_stage(&self.id)
    }
}

impl Drop for PipelineRun<'_> {
    fn drop(&mut self) {
        self.manager.retire(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::test_support::{dep, java_unit};

    fn state_for(unit: &LibraryUnit) -> PipelineState {
        let classpath = unit.deps.iter().map(|d| d.full_artifact.path.clone()).collect();
        let abi_classpath = unit.deps.iter().map(|d| d.interface_artifact.path.clone()).collect();
        PipelineState::create(unit, classpath, abi_classpath, &OutputRoot::default())
    }

    #[test]
    fn later_stages_share_the_first_stage_state() {
        let manager = PipelineStateManager::new();
        let mut unit = java_unit("//app:main", vec![dep("//lib:a", false)]);
        let id = PipelineId::new(&unit.target, 0);

        let first = manager.get_or_create(&id, || state_for(&unit)).unwrap();
        assert!(first.is_first_stage);
        manager.complete_stage(&id).unwrap();

        unit.options.push("-g".to_string());
        unit.deps.push(dep("//lib:b", false));

        let second = manager
            .get_or_create(&id, || panic!("state must not be created twice"))
            .unwrap();
        assert!(!second.is_first_stage);
        assert!(Arc::ptr_eq(&first.state, &second.state));
        assert_eq!(second.state.options(), &["-source".to_string(), "11".to_string()]);
        assert_eq!(second.state.classpath().len(), 1);
    }

    #[test]
    fn single_stage_pipelines_go_through_the_same_transitions() {
        let manager = PipelineStateManager::new();
        let unit = java_unit("//app:main", vec![]);
        let id = PipelineId::new(&unit.target, 0);

        let ticket = manager.get_or_create(&id, || state_for(&unit)).unwrap();
        assert!(ticket.is_first_stage);
        assert_eq!(manager.live_pipelines(), 1);
        manager.complete_stage(&id).unwrap();
        assert!(manager.retire(&id));
        assert!(manager.is_retired(&id));
        assert_eq!(manager.live_pipelines(), 0);
    }

    #[test]
    fn concurrent_stages_of_one_pipeline_are_rejected() {
        let manager = PipelineStateManager::new();
        let unit = java_unit("//app:main", vec![]);
        let id = PipelineId::new(&unit.target, 0);

        manager.get_or_create(&id, || state_for(&unit)).unwrap();
        assert_eq!(
            manager.get_or_create(&id, || state_for(&unit)).unwrap_err(),
            PipelineError::ConcurrentStage(id.clone())
        );
    }

    #[test]
    fn stages_after_retirement_are_rejected() {
        let manager = PipelineStateManager::new();
        let unit = java_unit("//app:main", vec![]);
        let id = PipelineId::new(&unit.target, 0);

        manager.get_or_create(&id, || state_for(&unit)).unwrap();
        manager.complete_stage(&id).unwrap();
        manager.retire(&id);

        let err = manager.get_or_create(&id, || state_for(&unit)).unwrap_err();
        assert_eq!(err, PipelineError::StageAfterRetirement(id.clone()));
        assert!(!err.kind().is_retryable());
        assert!(!manager.retire(&id));
    }

    #[test]
    fn purging_forgets_only_retired_pipelines() {
        let manager = PipelineStateManager::new();
        let unit = java_unit("//app:main", vec![]);
        let done = PipelineId::new(&unit.target, 0);
        let running = PipelineId::new(&unit.target, 1);

        manager.get_or_create(&done, || state_for(&unit)).unwrap();
        manager.complete_stage(&done).unwrap();
        manager.retire(&done);
        manager.get_or_create(&running, || state_for(&unit)).unwrap();

        assert_eq!(manager.purge_retired(), 1);
        assert!(!manager.is_retired(&done));
        assert_eq!(manager.live_pipelines(), 1);
        assert!(manager.get_or_create(&done, || state_for(&unit)).unwrap().is_first_stage);
    }

    #[test]
    fn completing_without_a_stage_in_flight_is_an_error() {
        let manager = PipelineStateManager::new();
        let unit = java_unit("//app:main", vec![]);
        let id = PipelineId::new(&unit.target, 0);
        assert_eq!(
            manager.complete_stage(&id).unwrap_err(),
            PipelineError::NoStageInFlight(id)
        );
    }

    #[test]
    fn dropping_a_run_retires_the_pipeline() {
        let manager = PipelineStateManager::new();
        let unit = java_unit("//app:main", vec![]);
        let id = PipelineId::new(&unit.target, 1);
        {
            let run = manager.start(id.clone());
            let ticket = run.stage(|| state_for(&unit)).unwrap();
            assert!(ticket.is_first_stage);
            // dropped mid-stage, as on a failed dispatch
        }
        assert!(manager.is_retired(&id));
        assert_eq!(manager.live_pipelines(), 0);
    }

    #[test]
    fn pipeline_ids_are_per_unit_and_ordinal() {
        let unit = CompilationUnitId::library("//app:main").unwrap();
        assert_eq!(PipelineId::new(&unit, 2).as_str(), "//app:main/2");
        assert_ne!(PipelineId::new(&unit, 0), PipelineId::new(&unit, 1));
    }
}
