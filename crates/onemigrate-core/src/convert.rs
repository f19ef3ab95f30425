//! Convert phase: rewrite a staged VMDK as QCOW2 with `qemu-img`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::config::ToolSettings;
use crate::job::{DiskFormat, StagedArtifact};
use crate::phase::{PhaseFailure, PhaseResult};
use crate::process::ToolCommand;

/// Transforms a staged raw disk into the destination format.
pub trait Converter {
    /// Convert `artifact` and return the converted sibling.
    fn convert(
        &self,
        artifact: &StagedArtifact,
        progress: &mut dyn FnMut(&str),
    ) -> PhaseResult<StagedArtifact>;
}

/// Output path for converting `input` into `format`: same path, new extension.
pub fn derive_output_path(input: &Path, format: DiskFormat) -> PathBuf {
    input.with_extension(format.extension())
}

/// [`Converter`] backed by `qemu-img convert`.
#[derive(Debug, Clone)]
pub struct QemuImgConverter {
    program: String,
    timeout: Duration,
    source: DiskFormat,
    target: DiskFormat,
}

impl QemuImgConverter {
    /// Converter from VMDK to QCOW2.
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            source: DiskFormat::Vmdk,
            target: DiskFormat::Qcow2,
        }
    }

    /// Build from the `tools` settings section.
    pub fn from_settings(tools: &ToolSettings) -> Self {
        Self::new(&tools.qemu_img, tools.convert_timeout())
    }

    fn command(&self, input: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.program)
            .arg("convert")
            .arg("-f")
            .arg(self.source.tool_name())
            .arg("-O")
            .arg(self.target.tool_name())
            .arg("-p")
            .arg(input.as_os_str())
            .arg(output.as_os_str())
            .timeout(self.timeout)
    }
}

impl Converter for QemuImgConverter {
    fn convert(
        &self,
        artifact: &StagedArtifact,
        progress: &mut dyn FnMut(&str),
    ) -> PhaseResult<StagedArtifact> {
        if artifact.format != self.source {
            return Err(PhaseFailure::conversion_tool_failed(format!(
                "expected a {} input, got {} ('{}')",
                self.source,
                artifact.format,
                artifact.path.display()
            )));
        }

        let output = derive_output_path(&artifact.path, self.target);
        let cmd = self.command(&artifact.path, &output);

        info!(vm = %artifact.vm_name, "converting disk: {}", cmd);

        let result = cmd
            .run(&mut |line| progress(&line.text))
            .map_err(|e| PhaseFailure::conversion_tool_failed(e.to_string()))?;

        if !result.success() {
            return Err(PhaseFailure::conversion_tool_failed(format!(
                "{} {}",
                self.program,
                result.failure_summary()
            )));
        }

        info!(output = %output.display(), elapsed = ?result.elapsed, "conversion complete");
        Ok(StagedArtifact::new(output, self.target, artifact.vm_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_output_path_replaces_extension_only() {
        assert_eq!(
            derive_output_path(Path::new("/tmp/stage/web01/web01.vmdk"), DiskFormat::Qcow2),
            PathBuf::from("/tmp/stage/web01/web01.qcow2")
        );
        assert_eq!(
            derive_output_path(Path::new("/s/db.prod/db.prod-disk1.vmdk"), DiskFormat::Qcow2),
            PathBuf::from("/s/db.prod/db.prod-disk1.qcow2")
        );
    }

    #[test]
    fn test_derive_output_path_is_stable() {
        let input = Path::new("/tmp/stage/web01/web01.vmdk");
        assert_eq!(
            derive_output_path(input, DiskFormat::Qcow2),
            derive_output_path(input, DiskFormat::Qcow2)
        );
    }

    #[test]
    fn test_command_line() {
        let converter = QemuImgConverter::new("qemu-img", Duration::from_secs(10));
        let cmd = converter.command(Path::new("/s/a.vmdk"), Path::new("/s/a.qcow2"));
        assert_eq!(
            cmd.to_string(),
            "qemu-img convert -f vmdk -O qcow2 -p /s/a.vmdk /s/a.qcow2"
        );
    }

    #[test]
    fn test_rejects_wrong_input_format() {
        let converter = QemuImgConverter::new("qemu-img", Duration::from_secs(10));
        let artifact = StagedArtifact::new("/s/web01/web01.qcow2", DiskFormat::Qcow2, "web01");
        let failure = converter.convert(&artifact, &mut |_| {}).unwrap_err();
        assert_eq!(failure.kind, crate::phase::FailureKind::ConversionToolFailed);
    }
}
