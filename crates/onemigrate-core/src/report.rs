//! Aggregate result of a pipeline run.

use std::path::PathBuf;

use crate::job::{MigrationJob, MigrationMode};
use crate::phase::{Phase, PhaseFailure, PhaseOutcome, PhaseStatus};
use crate::upload::{ImageId, RegisteredImage};

/// What a pipeline run did, phase by phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub vm_name: String,
    pub mode: MigrationMode,
    /// `{staging_root}/{vm_name}` as used by the run.
    pub staging_dir: PathBuf,
    /// One entry per phase, in execution order.
    pub outcomes: Vec<PhaseOutcome>,
    /// Fatal failure that stopped the run, if any.
    pub aborted: Option<PhaseFailure>,
    /// Image registered by the Upload phase.
    pub image: Option<RegisteredImage>,
}

impl PipelineReport {
    pub(crate) fn new(job: &MigrationJob) -> Self {
        Self {
            vm_name: job.vm_name().to_string(),
            mode: job.mode(),
            staging_dir: job.staging_dir(),
            outcomes: Vec::with_capacity(Phase::ALL.len()),
            aborted: None,
            image: None,
        }
    }

    pub(crate) fn record(&mut self, outcome: PhaseOutcome) {
        self.outcomes.push(outcome);
    }

    /// Mark the run as aborted and every phase without an outcome as not run.
    pub(crate) fn abort(&mut self, failure: PhaseFailure) {
        self.aborted = Some(failure);
        for phase in Phase::ALL {
            if self.outcome(phase).is_none() {
                self.outcomes.push(PhaseOutcome::not_run(phase));
            }
        }
    }

    /// Outcome recorded for `phase`.
    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.outcomes.iter().find(|o| o.phase == phase)
    }

    /// Whether a fatal failure stopped the run.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Number of phases that ran and failed.
    pub fn failed_phases(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, PhaseStatus::Failed(_)))
            .count()
    }

    /// Whether any phase actually ran.
    pub fn work_performed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, PhaseStatus::Succeeded | PhaseStatus::Failed(_)))
    }

    pub fn image_id(&self) -> Option<ImageId> {
        self.image.as_ref().map(|image| image.id)
    }
}
