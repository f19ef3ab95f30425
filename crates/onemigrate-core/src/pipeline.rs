//! Migration pipeline orchestration.
//!
//! This module sequences the three phases of a migration:
//! 1. Export the VM's disk from vSphere into staging (`full` mode only)
//! 2. Convert the staged VMDK to QCOW2
//! 3. Register the QCOW2 image in OpenNebula
//!
//! When Export does not run or yields nothing, the raw disk is looked up in
//! `{staging_root}/{vm_name}/` instead. Each phase's failure is classified by
//! its [`FailurePolicy`]: fatal failures stop the run, best-effort failures are
//! recorded and the run carries on.
//!
//! # Example
//!
//! ```no_run
//! use onemigrate_core::{MigrationJob, MigrationMode, Pipeline, Settings};
//! use std::path::Path;
//!
//! let settings = Settings::load(Path::new("config/settings.yaml")).unwrap();
//! let job = MigrationJob::new("web01", MigrationMode::Local, &settings.app.staging_path).unwrap();
//!
//! let pipeline = Pipeline::from_settings(&settings, None, None).unwrap();
//! let report = pipeline.run(&job).unwrap();
//! println!("failed phases: {}", report.failed_phases());
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::{OpenNebulaSettings, RegistryCredentials, Settings, SourceCredentials};
use crate::convert::{Converter, QemuImgConverter};
use crate::error::{Error, Result};
use crate::export::{Exporter, OvfToolExporter};
use crate::job::{DiskFormat, MigrationJob, StagedArtifact};
use crate::locator;
use crate::opennebula::OpenNebulaClient;
use crate::phase::{FailurePolicy, Phase, PhaseFailure, PhaseOutcome, PhasePolicies, PhaseResult};
use crate::report::PipelineReport;
use crate::upload::{upload, ImageRegistry, RegisteredImage};

/// Progress notification emitted while a pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A phase is about to run.
    PhaseStarted { phase: Phase },
    /// A line of output from the external tool driving a phase.
    ToolOutput { phase: Phase, line: String },
    /// A pre-staged raw disk was picked up from the staging directory.
    ArtifactLocated { artifact: StagedArtifact },
    /// A phase finished, was skipped, or failed.
    PhaseFinished { outcome: PhaseOutcome },
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(PipelineEvent) + Send>;

/// Sequencer for Export, Convert and Upload.
pub struct Pipeline {
    exporter: Box<dyn Exporter>,
    converter: Box<dyn Converter>,
    registry: Box<dyn ImageRegistry>,
    registry_settings: OpenNebulaSettings,
    credentials: Option<RegistryCredentials>,
    policies: PhasePolicies,
    progress: Option<ProgressCallback>,
}

/// How a phase ended, from the sequencer's point of view.
enum Step<T> {
    Completed(T),
    Failed(FailurePolicy),
}

/// Values phases hand back; producing phases expose their artifact.
trait PhaseOutput {
    fn artifact(&self) -> Option<StagedArtifact>;
}

impl PhaseOutput for StagedArtifact {
    fn artifact(&self) -> Option<StagedArtifact> {
        Some(self.clone())
    }
}

impl PhaseOutput for RegisteredImage {
    fn artifact(&self) -> Option<StagedArtifact> {
        None
    }
}

impl Pipeline {
    /// Create a pipeline over the given collaborators with default policies
    /// and no registry credentials.
    pub fn new(
        exporter: Box<dyn Exporter>,
        converter: Box<dyn Converter>,
        registry: Box<dyn ImageRegistry>,
        registry_settings: OpenNebulaSettings,
    ) -> Self {
        Self {
            exporter,
            converter,
            registry,
            registry_settings,
            credentials: None,
            policies: PhasePolicies::default(),
            progress: None,
        }
    }

    /// Wire up `ovftool`, `qemu-img` and OpenNebula from settings.
    pub fn from_settings(
        settings: &Settings,
        source: Option<SourceCredentials>,
        credentials: Option<RegistryCredentials>,
    ) -> Result<Self> {
        let exporter = OvfToolExporter::from_settings(&settings.tools, source);
        let converter = QemuImgConverter::from_settings(&settings.tools);
        let registry = OpenNebulaClient::new(&settings.opennebula)?;

        Ok(Self::new(
            Box::new(exporter),
            Box::new(converter),
            Box::new(registry),
            settings.opennebula.clone(),
        )
        .with_credentials(credentials))
    }

    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_policies(mut self, policies: PhasePolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run `job` to completion.
    ///
    /// Phase failures never surface as `Err`; they are recorded in the
    /// returned report and [`PipelineReport::is_aborted`] tells whether one
    /// of them was fatal.
    ///
    /// # Errors
    ///
    /// Returns an error only if the staging root cannot be created.
    pub fn run(&self, job: &MigrationJob) -> Result<PipelineReport> {
        let mut report = PipelineReport::new(job);
        let mode = job.mode();
        let vm_name = job.vm_name();

        info!(vm = vm_name, %mode, "starting migration job");

        if !mode.moves_data() {
            for phase in Phase::ALL {
                self.skip(phase, &mut report);
            }
            info!(vm = vm_name, "dry run, no work performed");
            return Ok(report);
        }

        let staging_root = prepare_staging_root(job.staging_root())?;
        let staging_dir = staging_root.join(vm_name);
        report.staging_dir = staging_dir.clone();

        let exported = if mode.runs_export() {
            let step = self.run_phase(Phase::Export, &mut report, |progress| {
                self.exporter.export(vm_name, &staging_dir, progress)
            });
            match step {
                Step::Completed(artifact) => Some(artifact),
                Step::Failed(FailurePolicy::Fatal) => return Ok(report),
                Step::Failed(FailurePolicy::BestEffort) => None,
            }
        } else {
            self.skip(Phase::Export, &mut report);
            None
        };

        let raw = match exported {
            Some(artifact) => artifact,
            None => match self.locate_raw(&staging_root, vm_name) {
                Ok(artifact) => artifact,
                Err(failure) => {
                    error!(vm = vm_name, detail = %failure.detail, "no raw disk to convert, aborting");
                    report.abort(failure);
                    return Ok(report);
                }
            },
        };

        let step = self.run_phase(Phase::Convert, &mut report, |progress| {
            self.converter.convert(&raw, progress)
        });
        let converted = match step {
            Step::Completed(artifact) => artifact,
            Step::Failed(FailurePolicy::Fatal) => return Ok(report),
            Step::Failed(FailurePolicy::BestEffort) => {
                report.record(PhaseOutcome::not_run(Phase::Upload));
                return Ok(report);
            }
        };

        let step = self.run_phase(Phase::Upload, &mut report, |_| {
            upload(
                &converted,
                &self.registry_settings,
                self.credentials.as_ref(),
                self.registry.as_ref(),
            )
        });
        if let Step::Completed(image) = step {
            report.image = Some(image);
        }

        info!(
            vm = vm_name,
            failed_phases = report.failed_phases(),
            aborted = report.is_aborted(),
            "pipeline finished"
        );
        Ok(report)
    }

    fn run_phase<T, F>(&self, phase: Phase, report: &mut PipelineReport, body: F) -> Step<T>
    where
        T: PhaseOutput,
        F: FnOnce(&mut dyn FnMut(&str)) -> PhaseResult<T>,
    {
        info!(%phase, "phase started");
        self.emit(PipelineEvent::PhaseStarted { phase });

        let started = Instant::now();
        let mut forward = |line: &str| {
            debug!(%phase, "{}", line);
            self.emit(PipelineEvent::ToolOutput {
                phase,
                line: line.to_string(),
            });
        };
        let result = body(&mut forward);
        let elapsed = started.elapsed();

        match result {
            Ok(output) => {
                info!(%phase, ?elapsed, "phase succeeded");
                self.finish(PhaseOutcome::succeeded(phase, output.artifact(), elapsed), report);
                Step::Completed(output)
            }
            Err(failure) => {
                let policy = self.policies.for_phase(phase);
                self.finish(PhaseOutcome::failed(phase, failure.clone(), elapsed), report);
                match policy {
                    FailurePolicy::Fatal => {
                        error!(%phase, kind = %failure.kind, detail = %failure.detail, "phase failed, aborting");
                        report.abort(failure);
                    }
                    FailurePolicy::BestEffort => {
                        warn!(%phase, kind = %failure.kind, detail = %failure.detail, "phase failed, continuing");
                    }
                }
                Step::Failed(policy)
            }
        }
    }

    fn locate_raw(&self, staging_root: &Path, vm_name: &str) -> PhaseResult<StagedArtifact> {
        let expected = staging_root.join(vm_name);
        match locator::locate(staging_root, vm_name, DiskFormat::Vmdk) {
            Ok(Some(artifact)) => {
                info!(path = %artifact.path.display(), "using staged raw disk");
                self.emit(PipelineEvent::ArtifactLocated {
                    artifact: artifact.clone(),
                });
                Ok(artifact)
            }
            Ok(None) => Err(PhaseFailure::missing_artifact(format!(
                "no .{} found in '{}'",
                DiskFormat::Vmdk.extension(),
                expected.display()
            ))),
            Err(e) => Err(PhaseFailure::missing_artifact(format!(
                "cannot scan '{}': {}",
                expected.display(),
                e
            ))),
        }
    }

    fn skip(&self, phase: Phase, report: &mut PipelineReport) {
        debug!(%phase, "phase skipped");
        self.finish(PhaseOutcome::skipped(phase), report);
    }

    fn finish(&self, outcome: PhaseOutcome, report: &mut PipelineReport) {
        self.emit(PipelineEvent::PhaseFinished {
            outcome: outcome.clone(),
        });
        report.record(outcome);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(ref callback) = self.progress {
            callback(event);
        }
    }
}

/// Create the staging root if needed and return its absolute form.
fn prepare_staging_root(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root).map_err(|e| Error::io(e, root))?;
    fs::canonicalize(root).map_err(|e| Error::io(e, root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_staging_root_creates_and_absolutizes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("stage");
        let prepared = prepare_staging_root(&root).unwrap();
        assert!(prepared.is_absolute());
        assert!(prepared.is_dir());
        assert!(prepared.ends_with("nested/stage"));
    }

    #[test]
    fn test_phase_output_artifacts() {
        let artifact = StagedArtifact::new("/s/web01/web01.vmdk", DiskFormat::Vmdk, "web01");
        assert_eq!(artifact.artifact(), Some(artifact.clone()));

        let image = RegisteredImage {
            id: crate::upload::ImageId(7),
            name: "web01-disk0".to_string(),
            datastore_id: 1,
        };
        assert_eq!(image.artifact(), None);
    }
}
