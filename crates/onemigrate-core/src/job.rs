//! Migration job and staged artifact types.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Operator-selected pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationMode {
    /// Export, convert and upload.
    #[default]
    Full,
    /// Skip export; the raw disk is expected to be staged already.
    Local,
    /// Validate the job and stop without touching anything.
    DryRun,
}

impl MigrationMode {
    /// Whether the Export phase runs in this mode.
    pub fn runs_export(self) -> bool {
        matches!(self, MigrationMode::Full)
    }

    /// Whether Convert and Upload run in this mode.
    pub fn moves_data(self) -> bool {
        !matches!(self, MigrationMode::DryRun)
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationMode::Full => write!(f, "full"),
            MigrationMode::Local => write!(f, "local"),
            MigrationMode::DryRun => write!(f, "dry-run"),
        }
    }
}

impl FromStr for MigrationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(MigrationMode::Full),
            "local" => Ok(MigrationMode::Local),
            "dry-run" | "dryrun" | "dry_run" => Ok(MigrationMode::DryRun),
            other => Err(Error::invalid_job(format!(
                "unknown mode '{}' (expected full, local or dry-run)",
                other
            ))),
        }
    }
}

/// Disk formats handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// VMware disk as produced by the export tool.
    Vmdk,
    /// QEMU copy-on-write v2, native to the destination catalog.
    Qcow2,
}

impl DiskFormat {
    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Qcow2 => "qcow2",
        }
    }

    /// Format name as understood by `qemu-img -f/-O` and the registry driver.
    pub fn tool_name(self) -> &'static str {
        self.extension()
    }

    /// Infer the format from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "vmdk" => Some(DiskFormat::Vmdk),
            "qcow2" => Some(DiskFormat::Qcow2),
            _ => None,
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_name())
    }
}

/// One migration attempt.
///
/// Built once per invocation and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    vm_name: String,
    mode: MigrationMode,
    staging_root: PathBuf,
}

impl MigrationJob {
    /// Create a validated job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJob`] if the VM name is empty, is `.`/`..`, or
    /// contains a path separator (it is used verbatim as a directory name).
    pub fn new(
        vm_name: impl Into<String>,
        mode: MigrationMode,
        staging_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let vm_name = vm_name.into();
        let trimmed = vm_name.trim();

        if trimmed.is_empty() {
            return Err(Error::invalid_job("VM name must not be empty"));
        }
        if trimmed == "." || trimmed == ".." || trimmed.contains(['/', '\\']) {
            return Err(Error::invalid_job(format!(
                "VM name '{}' cannot be used as a staging directory name",
                vm_name
            )));
        }

        Ok(Self {
            vm_name: trimmed.to_string(),
            mode,
            staging_root: staging_root.into(),
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn mode(&self) -> MigrationMode {
        self.mode
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Directory holding this VM's artifacts: `{staging_root}/{vm_name}`.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_root.join(&self.vm_name)
    }
}

/// A disk file on local staging storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    /// Path of the disk file.
    pub path: PathBuf,
    /// Format of the disk file.
    pub format: DiskFormat,
    /// Name of the VM the disk belongs to.
    pub vm_name: String,
}

impl StagedArtifact {
    pub fn new(path: impl Into<PathBuf>, format: DiskFormat, vm_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format,
            vm_name: vm_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("full".parse::<MigrationMode>().unwrap(), MigrationMode::Full);
        assert_eq!("LOCAL".parse::<MigrationMode>().unwrap(), MigrationMode::Local);
        assert_eq!("dry-run".parse::<MigrationMode>().unwrap(), MigrationMode::DryRun);
        assert!("partial".parse::<MigrationMode>().is_err());
    }

    #[test]
    fn test_mode_display_round_trips_cli_names() {
        for mode in [MigrationMode::Full, MigrationMode::Local, MigrationMode::DryRun] {
            assert_eq!(mode.to_string().parse::<MigrationMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_mode_phase_selection() {
        assert!(MigrationMode::Full.runs_export());
        assert!(!MigrationMode::Local.runs_export());
        assert!(!MigrationMode::DryRun.runs_export());
        assert!(MigrationMode::Local.moves_data());
        assert!(!MigrationMode::DryRun.moves_data());
    }

    #[test]
    fn test_default_mode_is_full() {
        assert_eq!(MigrationMode::default(), MigrationMode::Full);
    }

    #[test]
    fn test_disk_format_from_path() {
        assert_eq!(
            DiskFormat::from_path(Path::new("/s/web01/web01.VMDK")),
            Some(DiskFormat::Vmdk)
        );
        assert_eq!(
            DiskFormat::from_path(Path::new("web01.qcow2")),
            Some(DiskFormat::Qcow2)
        );
        assert_eq!(DiskFormat::from_path(Path::new("web01.ovf")), None);
        assert_eq!(DiskFormat::from_path(Path::new("web01")), None);
    }

    #[test]
    fn test_job_staging_dir() {
        let job = MigrationJob::new("web01", MigrationMode::Local, "/tmp/stage").unwrap();
        assert_eq!(job.staging_dir(), PathBuf::from("/tmp/stage/web01"));
        assert_eq!(job.vm_name(), "web01");
        assert_eq!(job.mode(), MigrationMode::Local);
    }

    #[test]
    fn test_job_rejects_empty_name() {
        assert!(MigrationJob::new("", MigrationMode::Full, "/tmp/stage").is_err());
        assert!(MigrationJob::new("   ", MigrationMode::Full, "/tmp/stage").is_err());
    }

    #[test]
    fn test_job_rejects_path_like_names() {
        assert!(MigrationJob::new("..", MigrationMode::Full, "/tmp/stage").is_err());
        assert!(MigrationJob::new("a/b", MigrationMode::Full, "/tmp/stage").is_err());
        assert!(MigrationJob::new("a\\b", MigrationMode::Full, "/tmp/stage").is_err());
    }
}
