//! ABI reduction: choosing how a unit's interface artifact is produced.
//!
//! `plan_abi` is a pure function of the unit, the policy and the toolchain
//! capabilities. Every deviation from the requested mode is recorded in the
//! returned decision, since dependents key their caches on the effective mode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::build::build_types::{CompilationUnitId, Language, LibraryUnit};
use crate::build::dependency_info::DependencyInfoIndex;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AbiGenerationMode {
    #[default]
    #[serde(rename = "class")]
    FromClassFile,
    #[serde(rename = "source")]
    FromSource,
    #[serde(rename = "source_only")]
    FromSourceOnly,
}

impl AbiGenerationMode {
    pub fn is_source_abi(&self) -> bool {
        !matches!(self, AbiGenerationMode::FromClassFile)
    }

    /// Source-only ABIs are computed without looking at the full dependency set.
    pub fn uses_dependencies(&self) -> bool {
        !matches!(self, AbiGenerationMode::FromSourceOnly)
    }
}

impl fmt::Display for AbiGenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AbiGenerationMode::FromClassFile => write!(f, "class"),
            AbiGenerationMode::FromSource => write!(f, "source"),
            AbiGenerationMode::FromSourceOnly => write!(f, "source_only"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceAbiVerificationMode {
    #[default]
    Off,
    Log,
    Fail,
}

impl SourceAbiVerificationMode {
    /// Verification only means something when a source ABI is generated.
    pub fn effective(self, mode: AbiGenerationMode) -> Self {
        if mode.is_source_abi() {
            self
        } else {
            SourceAbiVerificationMode::Off
        }
    }
}

/// What a language toolchain can do at the interface level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolchainCapabilities {
    pub source_abi: bool,
    pub source_only_abi: bool,
    /// Some toolchains lose the plain source ABI mode once source-only is available.
    pub source_abi_available_if_source_only_abi_available: bool,
    pub tracks_class_usage: bool,
}

impl ToolchainCapabilities {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Java => ToolchainCapabilities {
                source_abi: true,
                source_only_abi: true,
                source_abi_available_if_source_only_abi_available: true,
                tracks_class_usage: true,
            },
            Language::Kotlin => ToolchainCapabilities {
                source_abi: true,
                source_only_abi: true,
                source_abi_available_if_source_only_abi_available: false,
                tracks_class_usage: true,
            },
            Language::Scala => ToolchainCapabilities {
                source_abi: false,
                source_only_abi: false,
                source_abi_available_if_source_only_abi_available: false,
                tracks_class_usage: false,
            },
        }
    }

    fn source_abi_usable(&self) -> bool {
        self.source_abi && (!self.source_only_abi || self.source_abi_available_if_source_only_abi_available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AbiPolicy {
    pub mode: AbiGenerationMode,
    pub migrate_to_source_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbiPlan {
    /// The interface is derived from the finished library jar.
    FromClassFile,
    /// The interface is computed from sources against all dependency interfaces.
    FromSource {
        abi_unit: CompilationUnitId,
        classpath: BTreeSet<PathBuf>,
    },
    /// Like `FromSource`, restricted to dependencies flagged as required for
    /// interface-only builds. References outside that set fail the compile.
    FromSourceOnly {
        abi_unit: CompilationUnitId,
        classpath: BTreeSet<PathBuf>,
    },
}

impl AbiPlan {
    pub fn mode(&self) -> AbiGenerationMode {
        match self {
            AbiPlan::FromClassFile => AbiGenerationMode::FromClassFile,
            AbiPlan::FromSource { .. } => AbiGenerationMode::FromSource,
            AbiPlan::FromSourceOnly { .. } => AbiGenerationMode::FromSourceOnly,
        }
    }

    pub fn abi_unit(&self) -> Option<&CompilationUnitId> {
        match self {
            AbiPlan::FromClassFile => None,
            AbiPlan::FromSource { abi_unit, .. } | AbiPlan::FromSourceOnly { abi_unit, .. } => Some(abi_unit),
        }
    }

    pub fn classpath(&self) -> Option<&BTreeSet<PathBuf>> {
        match self {
            AbiPlan::FromClassFile => None,
            AbiPlan::FromSource { classpath, .. } | AbiPlan::FromSourceOnly { classpath, .. } => {
                Some(classpath)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModeResolution {
    AsRequested,
    Substituted {
        requested: AbiGenerationMode,
        reason: &'static str,
    },
    /// The mode was kept but a policy input (migration) could not be honoured.
    Pinned { reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbiDecision {
    pub unit: CompilationUnitId,
    pub plan: AbiPlan,
    pub resolution: ModeResolution,
    /// How source-only incompatibilities are reported, if they are checked at all.
    pub source_only_diagnostics: Option<DiagnosticLevel>,
}

impl AbiDecision {
    pub fn effective_mode(&self) -> AbiGenerationMode {
        self.plan.mode()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("the {language} toolchain cannot generate ABIs in `{mode}` mode")]
    UnsupportedMode {
        language: Language,
        mode: AbiGenerationMode,
    },
    #[error("could not read ABI jar {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AbiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AbiError::UnsupportedMode { .. } => ErrorKind::Configuration,
            AbiError::Io { .. } => ErrorKind::Process,
        }
    }
}

pub fn plan_abi(
    unit: &LibraryUnit,
    index: &DependencyInfoIndex,
    policy: AbiPolicy,
    caps: ToolchainCapabilities,
) -> Result<AbiDecision, AbiError> {
    let id = unit.target.library_id();
    let decide = |plan: AbiPlan, resolution: ModeResolution, diagnostics: Option<DiagnosticLevel>| AbiDecision {
        unit: id.clone(),
        plan,
        resolution,
        source_only_diagnostics: diagnostics,
    };

    if policy.mode == AbiGenerationMode::FromClassFile {
        return Ok(decide(AbiPlan::FromClassFile, ModeResolution::AsRequested, None));
    }
    if !caps.source_abi && !caps.source_only_abi {
        return Err(AbiError::UnsupportedMode {
            language: unit.compiler.language,
            mode: policy.mode,
        });
    }
    if unit.sources.is_empty() {
        return Ok(decide(
            AbiPlan::FromClassFile,
            ModeResolution::Substituted {
                requested: policy.mode,
                reason: "unit has no sources to derive an interface from",
            },
            None,
        ));
    }

    let from_source = || AbiPlan::FromSource {
        abi_unit: id.source_abi(),
        classpath: index.interface_classpath(&id),
    };
    let from_source_only = || AbiPlan::FromSourceOnly {
        abi_unit: id.source_only_abi(),
        classpath: index.interface_only_classpath(&id),
    };

    let decision = if policy.mode == AbiGenerationMode::FromSource {
        if caps.source_abi_usable() {
            let diagnostics =
                (policy.migrate_to_source_only && caps.source_only_abi).then_some(DiagnosticLevel::Warning);
            decide(from_source(), ModeResolution::AsRequested, diagnostics)
        } else {
            decide(
                from_source_only(),
                ModeResolution::Substituted {
                    requested: policy.mode,
                    reason: "toolchain only generates source-only ABIs",
                },
                Some(DiagnosticLevel::Error),
            )
        }
    } else if !caps.source_only_abi {
        decide(
            from_source(),
            ModeResolution::Substituted {
                requested: policy.mode,
                reason: "toolchain does not support source-only ABIs",
            },
            None,
        )
    } else if !policy.migrate_to_source_only {
        decide(from_source_only(), ModeResolution::AsRequested, Some(DiagnosticLevel::Error))
    } else if caps.source_abi_usable() {
        decide(
            from_source(),
            ModeResolution::Substituted {
                requested: policy.mode,
                reason: "migrating to source-only ABIs",
            },
            Some(DiagnosticLevel::Warning),
        )
    } else {
        decide(
            from_source_only(),
            ModeResolution::Pinned {
                reason: "toolchain has no separate source ABI mode to migrate from",
            },
            Some(DiagnosticLevel::Error),
        )
    };
    Ok(decision)
}

/// Compares the class-derived and the source-derived interface jars by content.
pub fn abi_jars_match(class_abi: &Path, source_abi: &Path) -> Result<bool, AbiError> {
    Ok(digest(class_abi)? == digest(source_abi)?)
}

fn digest(path: &Path) -> Result<blake3::Hash, AbiError> {
    std::fs::read(path).map(|bytes| blake3::hash(&bytes)).map_err(|source| AbiError::Io {
        path: path.to_path_buf(),
        source,
    })
}
