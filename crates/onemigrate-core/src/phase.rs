//! Pipeline phases and their outcomes.

use std::fmt;
use std::time::Duration;

use crate::job::StagedArtifact;

/// A step of the migration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Pull the disk out of the source hypervisor.
    Export,
    /// Turn the raw disk into the destination format.
    Convert,
    /// Register the converted disk in the destination catalog.
    Upload,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Export, Phase::Convert, Phase::Upload];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Export => write!(f, "Export"),
            Phase::Convert => write!(f, "Convert"),
            Phase::Upload => write!(f, "Upload"),
        }
    }
}

/// How the orchestrator treats a failure of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the pipeline.
    Fatal,
    /// Record the failure and carry on.
    BestEffort,
}

/// Failure policy for every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePolicies {
    pub export: FailurePolicy,
    pub convert: FailurePolicy,
    pub upload: FailurePolicy,
}

impl Default for PhasePolicies {
    /// Local data preparation is fatal; registration can be retried by hand.
    fn default() -> Self {
        Self {
            export: FailurePolicy::Fatal,
            convert: FailurePolicy::Fatal,
            upload: FailurePolicy::BestEffort,
        }
    }
}

impl PhasePolicies {
    pub fn for_phase(&self, phase: Phase) -> FailurePolicy {
        match phase {
            Phase::Export => self.export,
            Phase::Convert => self.convert,
            Phase::Upload => self.upload,
        }
    }
}

/// Classified cause of a phase failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No staged raw disk to work from.
    MissingArtifact,
    /// The export tool failed or produced no disk.
    ExportToolFailed,
    /// The conversion tool failed.
    ConversionToolFailed,
    /// No registry credentials configured.
    MissingCredentials,
    /// The registry refused or could not be reached.
    RegistrationRejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::MissingArtifact => write!(f, "MissingArtifact"),
            FailureKind::ExportToolFailed => write!(f, "ExportToolFailed"),
            FailureKind::ConversionToolFailed => write!(f, "ConversionToolFailed"),
            FailureKind::MissingCredentials => write!(f, "MissingCredentials"),
            FailureKind::RegistrationRejected => write!(f, "RegistrationRejected"),
        }
    }
}

/// Why a phase failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl PhaseFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn missing_artifact(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::MissingArtifact, detail)
    }

    pub fn export_tool_failed(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ExportToolFailed, detail)
    }

    pub fn conversion_tool_failed(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ConversionToolFailed, detail)
    }

    pub fn missing_credentials(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::MissingCredentials, detail)
    }

    pub fn registration_rejected(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::RegistrationRejected, detail)
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for PhaseFailure {}

/// Result of a single phase.
pub type PhaseResult<T> = std::result::Result<T, PhaseFailure>;

/// What happened to a phase during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    /// The mode does not call for this phase.
    Skipped,
    /// An earlier fatal failure stopped the pipeline first.
    NotRun,
    /// The phase completed.
    Succeeded,
    /// The phase failed.
    Failed(PhaseFailure),
}

impl PhaseStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::NotRun => "not run",
            PhaseStatus::Succeeded => "ok",
            PhaseStatus::Failed(_) => "failed",
        }
    }
}

/// Outcome of one phase as recorded in the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Artifact produced by the phase, if it produces one.
    pub artifact: Option<StagedArtifact>,
    /// Time spent in the phase; zero if it did not run.
    pub elapsed: Duration,
}

impl PhaseOutcome {
    pub fn skipped(phase: Phase) -> Self {
        Self::without_run(phase, PhaseStatus::Skipped)
    }

    pub fn not_run(phase: Phase) -> Self {
        Self::without_run(phase, PhaseStatus::NotRun)
    }

    pub fn succeeded(phase: Phase, artifact: Option<StagedArtifact>, elapsed: Duration) -> Self {
        Self {
            phase,
            status: PhaseStatus::Succeeded,
            artifact,
            elapsed,
        }
    }

    pub fn failed(phase: Phase, failure: PhaseFailure, elapsed: Duration) -> Self {
        Self {
            phase,
            status: PhaseStatus::Failed(failure),
            artifact: None,
            elapsed,
        }
    }

    fn without_run(phase: Phase, status: PhaseStatus) -> Self {
        Self {
            phase,
            status,
            artifact: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failure(&self) -> Option<&PhaseFailure> {
        match &self.status {
            PhaseStatus::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
