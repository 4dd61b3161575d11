use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::config::DaemonConfig;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("the daemon bootstrap classpath is not set, export {var} before starting a build")]
    MissingBootstrapClasspath { var: String },
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

static JAVA_BINARY_MEMO: OnceLock<PathBuf> = OnceLock::new();

/// `$JAVA_HOME/bin/java`, or `java` from the `PATH` when `JAVA_HOME` is unset.
pub fn java_binary() -> &'static Path {
    JAVA_BINARY_MEMO.get_or_init(|| match std::env::var_os("JAVA_HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join("bin").join("java"),
        _ => PathBuf::from("java"),
    })
}

/// Reads the bootstrap classpath from the environment variable named in `config`.
pub fn bootstrap_classpath(config: &DaemonConfig) -> Result<String, LaunchError> {
    std::env::var(&config.bootstrap_classpath_env)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| LaunchError::MissingBootstrapClasspath {
            var: config.bootstrap_classpath_env.clone(),
        })
}

/// The daemon argv, failing before anything is spawned when the bootstrap
/// classpath is missing.
pub fn launch_command(config: &DaemonConfig, cell_root: &Path) -> Result<Vec<String>, LaunchError> {
    let classpath = bootstrap_classpath(config)?;
    Ok(launch_command_with(config, cell_root, java_binary(), &classpath))
}

pub fn launch_command_with(
    config: &DaemonConfig,
    cell_root: &Path,
    java: &Path,
    bootstrap_classpath: &str,
) -> Vec<String> {
    let tmp_dir = config.java_tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let heap_dump_dir = cell_root.join(&config.log_directory);

    let mut argv = vec![
        java.to_string_lossy().to_string(),
        "-Dfile.encoding=UTF-8".to_string(),
        format!("-Djava.io.tmpdir={}", tmp_dir.display()),
        "-XX:+HeapDumpOnOutOfMemoryError".to_string(),
        format!("-XX:HeapDumpPath={}", heap_dump_dir.display()),
        "-XX:-MaxFDLimit".to_string(),
    ];
    argv.extend(config.start_command_options.iter().cloned());
    argv.extend([
        "-cp".to_string(),
        bootstrap_classpath.to_string(),
        config.bootstrap_main_class.clone(),
        config.main_class.clone(),
    ]);
    argv
}
