use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::build::abi::{AbiGenerationMode, AbiPolicy, SourceAbiVerificationMode};
use crate::build::output_layout::OutputRoot;
use crate::build::unused_deps::UnusedDependenciesAction;
use crate::worker::PoolConfig;

pub const DEFAULT_CONFIG_FILE: &str = "jvmcd.json";
pub const DEFAULT_BOOTSTRAP_CLASSPATH_ENV: &str = "JVMCD_BOOTSTRAP_CLASSPATH";
pub const DEFAULT_BOOTSTRAP_MAIN_CLASS: &str = "jvmcd.bootstrap.ClassLoaderBootstrapper";
pub const DEFAULT_DAEMON_MAIN_CLASS: &str = "jvmcd.daemon.WorkerToolMain";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub java: JavaConfig,
    pub output: OutputRoot,
    /// Cell name to its root, relative to the project root.
    pub cells: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JavaConfig {
    pub abi_generation_mode: AbiGenerationMode,
    pub source_abi_verification_mode: SourceAbiVerificationMode,
    pub migrate_to_source_only_abi: bool,
    pub track_class_usage: bool,
    pub compile_against_abis: bool,
    pub unused_dependencies_action: UnusedDependenciesAction,
    pub pipelining_disabled: bool,
    pub javacd: DaemonConfig,
}

impl Default for JavaConfig {
    fn default() -> Self {
        Self {
            abi_generation_mode: AbiGenerationMode::FromClassFile,
            source_abi_verification_mode: SourceAbiVerificationMode::Off,
            migrate_to_source_only_abi: false,
            track_class_usage: true,
            compile_against_abis: false,
            unused_dependencies_action: UnusedDependenciesAction::Ignore,
            pipelining_disabled: false,
            javacd: DaemonConfig::default(),
        }
    }
}

impl JavaConfig {
    pub fn abi_policy(&self) -> AbiPolicy {
        AbiPolicy {
            mode: self.abi_generation_mode,
            migrate_to_source_only: self.migrate_to_source_only_abi,
        }
    }

    pub fn verification_mode(&self) -> SourceAbiVerificationMode {
        self.source_abi_verification_mode.effective(self.abi_generation_mode)
    }
}

/// Settings of the compiler daemon and its pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub start_command_options: Vec<String>,
    pub worker_tool_pool_size: usize,
    pub worker_tool_max_instances_size: usize,
    pub borrow_from_pool_timeout_seconds: u64,
    pub max_wait_for_result_timeout_seconds: u64,
    pub handshake_timeout_seconds: u64,
    pub log_directory: PathBuf,
    pub java_tmp_dir: Option<PathBuf>,
    pub bootstrap_classpath_env: String,
    pub bootstrap_main_class: String,
    pub main_class: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let pool_size = num_cpus::get().max(1);
        Self {
            enabled: true,
            start_command_options: Vec::new(),
            worker_tool_pool_size: pool_size,
            worker_tool_max_instances_size: pool_size * 2,
            borrow_from_pool_timeout_seconds: 600,
            max_wait_for_result_timeout_seconds: 3600,
            handshake_timeout_seconds: 30,
            log_directory: PathBuf::from("buck-out/log"),
            java_tmp_dir: None,
            bootstrap_classpath_env: DEFAULT_BOOTSTRAP_CLASSPATH_ENV.to_string(),
            bootstrap_main_class: DEFAULT_BOOTSTRAP_MAIN_CLASS.to_string(),
            main_class: DEFAULT_DAEMON_MAIN_CLASS.to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_pool_size: self.worker_tool_pool_size,
            max_instances: self.worker_tool_max_instances_size,
            borrow_timeout: Duration::from_secs(self.borrow_from_pool_timeout_seconds),
            result_timeout: Duration::from_secs(self.max_wait_for_result_timeout_seconds),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("java.javacd.worker_tool_pool_size must be at least 1")]
    ZeroPoolSize,
    #[error(
        "java.javacd.worker_tool_max_instances_size ({max_instances}) must not be smaller than the pool size ({pool_size})"
    )]
    InstancesBelowPoolSize { max_instances: usize, pool_size: usize },
    #[error("java.javacd.{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

impl Config {
    /// Rejects settings that would make every daemon dispatch fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let daemon = &self.java.javacd;
        if daemon.worker_tool_pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if daemon.worker_tool_max_instances_size < daemon.worker_tool_pool_size {
            return Err(ConfigError::InstancesBelowPoolSize {
                max_instances: daemon.worker_tool_max_instances_size,
                pool_size: daemon.worker_tool_pool_size,
            });
        }
        for (name, value) in [
            ("borrow_from_pool_timeout_seconds", daemon.borrow_from_pool_timeout_seconds),
            ("max_wait_for_result_timeout_seconds", daemon.max_wait_for_result_timeout_seconds),
            ("handshake_timeout_seconds", daemon.handshake_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }
}

pub fn read(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read config file {}", path.display()))?;
    parse(&contents).with_context(|| format!("Could not parse config file {}", path.display()))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Reads `path` if it exists, falling back to the defaults otherwise.
pub fn read_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        read(path)
    } else {
        log::debug!("No config at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_the_default_config() {
        let config = parse("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.java.abi_generation_mode, AbiGenerationMode::FromClassFile);
        assert!(config.java.track_class_usage);
        assert!(config.java.javacd.enabled);
    }

    #[test]
    fn reads_java_section() {
        let config = parse(
            r#"{
                "java": {
                    "abi_generation_mode": "source_only",
                    "source_abi_verification_mode": "fail",
                    "unused_dependencies_action": "warn",
                    "pipelining_disabled": true,
                    "javacd": {
                        "worker_tool_pool_size": 2,
                        "worker_tool_max_instances_size": 4,
                        "borrow_from_pool_timeout_seconds": 5,
                        "start_command_options": ["-Xmx2g"]
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.java.abi_generation_mode, AbiGenerationMode::FromSourceOnly);
        assert_eq!(config.java.verification_mode(), SourceAbiVerificationMode::Fail);
        assert_eq!(config.java.unused_dependencies_action, UnusedDependenciesAction::Warn);
        assert!(config.java.pipelining_disabled);

        let pool = config.java.javacd.pool_config();
        assert_eq!(pool.max_pool_size, 2);
        assert_eq!(pool.max_instances, 4);
        assert_eq!(pool.borrow_timeout, Duration::from_secs(5));
        assert_eq!(config.java.javacd.start_command_options, vec!["-Xmx2g".to_string()]);
    }

    #[test]
    fn verification_is_forced_off_for_class_abis() {
        let config = parse(r#"{"java": {"source_abi_verification_mode": "log"}}"#).unwrap();
        assert_eq!(config.java.verification_mode(), SourceAbiVerificationMode::Off);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(parse(r#"{"java": {"abi_mode": "source"}}"#).is_err());
    }

    #[test]
    fn rejects_instance_ceiling_below_pool_size() {
        let err = parse(
            r#"{"java": {"javacd": {"worker_tool_pool_size": 4, "worker_tool_max_instances_size": 2}}}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::InstancesBelowPoolSize {
                max_instances: 2,
                pool_size: 4
            })
        );
    }

    #[test]
    fn rejects_zero_timeouts() {
        let err = parse(r#"{"java": {"javacd": {"handshake_timeout_seconds": 0}}}"#).unwrap_err();
        assert!(err.to_string().contains("handshake_timeout_seconds"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = read_or_default(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn read_reports_the_path_on_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let err = read(&path).unwrap_err();
        assert!(format!("{err:#}").contains(DEFAULT_CONFIG_FILE));
    }
}
