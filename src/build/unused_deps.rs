use serde::{Deserialize, Serialize};
use std::fmt;

use crate::build::abi::DiagnosticLevel;
use crate::build::dep_file::UsageLog;
use crate::build::dependency_info::DependencyInfo;

/// What to do about declared dependencies the compiler never read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnusedDependenciesAction {
    Fail,
    Warn,
    #[default]
    Ignore,
    IgnoreAlways,
    WarnIfFail,
}

impl UnusedDependenciesAction {
    /// `None` when the check does not run at all.
    pub fn severity(self) -> Option<DiagnosticLevel> {
        match self {
            UnusedDependenciesAction::Fail => Some(DiagnosticLevel::Error),
            UnusedDependenciesAction::Warn | UnusedDependenciesAction::WarnIfFail => {
                Some(DiagnosticLevel::Warning)
            }
            UnusedDependenciesAction::Ignore | UnusedDependenciesAction::IgnoreAlways => None,
        }
    }
}

impl fmt::Display for UnusedDependenciesAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnusedDependenciesAction::Fail => write!(f, "fail"),
            UnusedDependenciesAction::Warn => write!(f, "warn"),
            UnusedDependenciesAction::Ignore => write!(f, "ignore"),
            UnusedDependenciesAction::IgnoreAlways => write!(f, "ignore_always"),
            UnusedDependenciesAction::WarnIfFail => write!(f, "warn_if_fail"),
        }
    }
}

/// Declared dependencies none of whose artifacts show up in the usage log, in
/// declaration order.
pub fn find_unused_dependencies(log: &UsageLog, declared: &[DependencyInfo]) -> Vec<DependencyInfo> {
    declared
        .iter()
        .filter(|dep| !log.references(&dep.full_artifact.path) && !log.references(&dep.interface_artifact.path))
        .cloned()
        .collect()
}
