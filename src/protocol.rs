//! Wire types exchanged with a compiler daemon.
//!
//! A command is assembled with [`CompileCommandBuilder`] and frozen by `build()`.
//! Nothing can change a [`CompileCommand`] after that, which is what lets later
//! pipeline stages refer to the state the first stage shipped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::build::abi::{AbiGenerationMode, DiagnosticLevel};
use crate::build::build_types::{CompilationUnitId, CompilerHandle};
use crate::build::class_loader_cache::ResolvedPlugin;
use crate::build::output_layout::{OutputPathsValue, OutputRoot};
use crate::build::step_factory::StepFlavor;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemParams {
    pub root_path: PathBuf,
    pub output_root: OutputRoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JarParameters {
    pub jar_path: PathBuf,
    pub entries_to_jar: Vec<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub remove_patterns: Vec<String>,
}

/// Everything a daemon needs to materialize compiler state for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileCommand {
    target: CompilationUnitId,
    compiler: CompilerHandle,
    options: Vec<String>,
    filesystem: FilesystemParams,
    output_layout: OutputPathsValue,
    classpath: Vec<PathBuf>,
    abi_classpath: Vec<PathBuf>,
    sources: Vec<PathBuf>,
    resources: BTreeMap<PathBuf, PathBuf>,
    cell_to_path: BTreeMap<String, PathBuf>,
    abi_jar: Option<JarParameters>,
    library_jar: Option<JarParameters>,
    plugins: Vec<ResolvedPlugin>,
    abi_generation_mode: AbiGenerationMode,
    source_only_diagnostics: Option<DiagnosticLevel>,
    track_class_usage: bool,
}

impl CompileCommand {
    pub fn target(&self) -> &CompilationUnitId {
        &self.target
    }

    pub fn compiler(&self) -> &CompilerHandle {
        &self.compiler
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn filesystem(&self) -> &FilesystemParams {
        &self.filesystem
    }

    pub fn output_layout(&self) -> &OutputPathsValue {
        &self.output_layout
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    pub fn abi_classpath(&self) -> &[PathBuf] {
        &self.abi_classpath
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn resources(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.resources
    }

    pub fn cell_to_path(&self) -> &BTreeMap<String, PathBuf> {
        &self.cell_to_path
    }

    pub fn abi_jar(&self) -> Option<&JarParameters> {
        self.abi_jar.as_ref()
    }

    pub fn library_jar(&self) -> Option<&JarParameters> {
        self.library_jar.as_ref()
    }

    pub fn plugins(&self) -> &[ResolvedPlugin] {
        &self.plugins
    }

    pub fn abi_generation_mode(&self) -> AbiGenerationMode {
        self.abi_generation_mode
    }

    pub fn source_only_diagnostics(&self) -> Option<DiagnosticLevel> {
        self.source_only_diagnostics
    }

    pub fn track_class_usage(&self) -> bool {
        self.track_class_usage
    }

    /// Every path the command makes the daemon read from.
    pub fn referenced_paths(&self) -> BTreeSet<PathBuf> {
        self.classpath
            .iter()
            .chain(&self.abi_classpath)
            .chain(self.plugins.iter().flat_map(|p| &p.classpath))
            .cloned()
            .collect()
    }
}

pub struct CompileCommandBuilder {
    command: CompileCommand,
}

impl CompileCommandBuilder {
    pub fn new(
        target: CompilationUnitId,
        compiler: CompilerHandle,
        filesystem: FilesystemParams,
        output_layout: OutputPathsValue,
    ) -> Self {
        CompileCommandBuilder {
            command: CompileCommand {
                target,
                compiler,
                options: Vec::new(),
                filesystem,
                output_layout,
                classpath: Vec::new(),
                abi_classpath: Vec::new(),
                sources: Vec::new(),
                resources: BTreeMap::new(),
                cell_to_path: BTreeMap::new(),
                abi_jar: None,
                library_jar: None,
                plugins: Vec::new(),
                abi_generation_mode: AbiGenerationMode::FromClassFile,
                source_only_diagnostics: None,
                track_class_usage: false,
            },
        }
    }

    pub fn with_options(mut self, options: impl IntoIterator<Item = String>) -> Self {
        self.command.options = options.into_iter().collect();
        self
    }

    pub fn with_classpath(mut self, classpath: impl IntoIterator<Item = PathBuf>) -> Self {
        self.command.classpath = classpath.into_iter().collect();
        self
    }

    pub fn with_abi_classpath(mut self, classpath: impl IntoIterator<Item = PathBuf>) -> Self {
        self.command.abi_classpath = classpath.into_iter().collect();
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = PathBuf>) -> Self {
        self.command.sources = sources.into_iter().collect();
        self
    }

    pub fn with_resources(mut self, resources: BTreeMap<PathBuf, PathBuf>) -> Self {
        self.command.resources = resources;
        self
    }

    pub fn with_cell_to_path(mut self, cells: BTreeMap<String, PathBuf>) -> Self {
        self.command.cell_to_path = cells;
        self
    }

    pub fn with_abi_jar(mut self, jar: JarParameters) -> Self {
        self.command.abi_jar = Some(jar);
        self
    }

    pub fn with_library_jar(mut self, jar: JarParameters) -> Self {
        self.command.library_jar = Some(jar);
        self
    }

    pub fn with_plugins(mut self, plugins: Vec<ResolvedPlugin>) -> Self {
        self.command.plugins = plugins;
        self
    }

    pub fn with_abi_generation_mode(mut self, mode: AbiGenerationMode) -> Self {
        self.command.abi_generation_mode = mode;
        self
    }

    pub fn with_source_only_diagnostics(mut self, level: Option<DiagnosticLevel>) -> Self {
        self.command.source_only_diagnostics = level;
        self
    }

    pub fn with_class_usage_tracking(mut self, track: bool) -> Self {
        self.command.track_class_usage = track;
        self
    }

    pub fn build(self) -> CompileCommand {
        self.command
    }
}

/// One step to run. `command` is present only on the first stage of a pipeline
/// and on standalone requests; later stages reuse the daemon-side state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub action_id: String,
    pub pipeline_id: Option<String>,
    pub first_stage: bool,
    pub step: StepFlavor,
    pub command: Option<CompileCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Handshake { protocol_version: u32 },
    Execute(ExecuteRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub exit_code: i32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Ready,
    Result(ResultEvent),
}

pub fn action_id(unit: &CompilationUnitId, step: StepFlavor) -> String {
    format!("{unit}[{step}]")
}

/// The caller-visible result of one dispatched step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub action_id: String,
    pub step: StepFlavor,
    pub exit_code: i32,
    pub message: Option<String>,
    pub cause: Option<String>,
}

impl StepOutcome {
    pub fn from_result(action_id: String, step: StepFlavor, result: ResultEvent) -> Self {
        StepOutcome {
            action_id,
            step,
            exit_code: result.exit_code,
            message: result.message,
            cause: result.cause,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Compiler output as shown to the user. Escaped newlines in the daemon's
    /// message are expanded here only; `message` stays verbatim.
    pub fn stderr(&self) -> Option<String> {
        self.message
            .as_ref()
            .filter(|message| !message.is_empty())
            .map(|message| format!("javacd action id: {}\n{}", self.action_id, message.replace("\\n", "\n")))
    }
}

/// Message for a step that never produced a result.
pub fn failure_stderr(action_id: &str, cause: &dyn std::fmt::Display) -> String {
    format!("ActionId: {action_id}. Caused by: {cause}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build_types::Language;

    fn command() -> CompileCommand {
        let target = CompilationUnitId::library("//app:main").unwrap();
        let root = OutputRoot::default();
        CompileCommandBuilder::new(
            target.clone(),
            CompilerHandle {
                language: Language::Java,
                executable: None,
                version: None,
            },
            FilesystemParams {
                root_path: PathBuf::from("/repo"),
                output_root: root.clone(),
            },
            OutputPathsValue::of(&target, true, &root),
        )
        .with_classpath([PathBuf::from("lib/a.jar")])
        .with_abi_classpath([PathBuf::from("lib/a-abi.jar")])
        .with_sources([PathBuf::from("app/Main.java")])
        .with_class_usage_tracking(true)
        .build()
    }

    #[test]
    fn handshake_is_tagged() {
        let line = serde_json::to_string(&Request::Handshake {
            protocol_version: PROTOCOL_VERSION,
        })
        .unwrap();
        assert_eq!(line, r#"{"type":"handshake","protocol_version":1}"#);
    }

    #[test]
    fn execute_requests_carry_the_stage_flag() {
        let request = Request::Execute(ExecuteRequest {
            action_id: "//app:main[library]".to_string(),
            pipeline_id: Some("//app:main/0".to_string()),
            first_stage: true,
            step: StepFlavor::Library,
            command: Some(command()),
        });
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["first_stage"], true);
        assert_eq!(value["step"], "library");
        assert_eq!(value["command"]["classpath"][0], "lib/a.jar");

        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn reads_daemon_messages() {
        assert_eq!(
            serde_json::from_str::<DaemonMessage>(r#"{"type":"ready"}"#).unwrap(),
            DaemonMessage::Ready
        );
        assert_eq!(
            serde_json::from_str::<DaemonMessage>(r#"{"type":"result","exit_code":1,"message":"boom"}"#).unwrap(),
            DaemonMessage::Result(ResultEvent {
                exit_code: 1,
                message: Some("boom".to_string()),
                cause: None,
            })
        );
    }

    #[test]
    fn stderr_keeps_the_message_and_expands_newlines() {
        let outcome = StepOutcome::from_result(
            "//app:main[library]".to_string(),
            StepFlavor::Library,
            ResultEvent {
                exit_code: 1,
                message: Some("compile error: foo.src:3\\nsecond line".to_string()),
                cause: None,
            },
        );
        assert!(!outcome.is_success());
        assert_eq!(outcome.message.as_deref(), Some("compile error: foo.src:3\\nsecond line"));
        assert_eq!(
            outcome.stderr().unwrap(),
            "javacd action id: //app:main[library]\ncompile error: foo.src:3\nsecond line"
        );
    }

    #[test]
    fn failure_message_names_the_action() {
        assert_eq!(
            failure_stderr("//app:main[library]", &"daemon exited"),
            "ActionId: //app:main[library]. Caused by: daemon exited"
        );
    }

    #[test]
    fn referenced_paths_cover_both_classpaths() {
        let paths = command().referenced_paths();
        assert!(paths.contains(&PathBuf::from("lib/a.jar")));
        assert!(paths.contains(&PathBuf::from("lib/a-abi.jar")));
    }
}
