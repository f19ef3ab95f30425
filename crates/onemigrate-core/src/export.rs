//! Export phase: pull a VM's disk out of vSphere with `ovftool`.
//!
//! `ovftool` writes an OVF descriptor plus one VMDK per disk into the VM's
//! staging directory. The disk handed to the next phase is picked with the
//! same rule the artifact locator uses.

use std::fs;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use tracing::info;

use crate::config::{SourceCredentials, ToolSettings, VMWARE_PASSWORD_VAR};
use crate::job::{DiskFormat, StagedArtifact};
use crate::locator::locate_in_dir;
use crate::phase::{PhaseFailure, PhaseResult};
use crate::process::ToolCommand;

/// Obtains a raw disk image from the source hypervisor.
pub trait Exporter {
    /// Export `vm_name` into `target_dir` and return the staged raw disk.
    ///
    /// `progress` receives human-readable progress lines as they arrive.
    fn export(
        &self,
        vm_name: &str,
        target_dir: &Path,
        progress: &mut dyn FnMut(&str),
    ) -> PhaseResult<StagedArtifact>;
}

/// [`Exporter`] backed by VMware `ovftool`.
#[derive(Debug, Clone)]
pub struct OvfToolExporter {
    program: String,
    timeout: Duration,
    credentials: Option<SourceCredentials>,
}

impl OvfToolExporter {
    pub fn new(program: impl Into<String>, timeout: Duration, credentials: Option<SourceCredentials>) -> Self {
        Self {
            program: program.into(),
            timeout,
            credentials,
        }
    }

    /// Build from the `tools` settings section.
    pub fn from_settings(tools: &ToolSettings, credentials: Option<SourceCredentials>) -> Self {
        Self::new(&tools.ovftool, tools.export_timeout(), credentials)
    }

    fn command(&self, credentials: &SourceCredentials, vm_name: &str, target_ovf: &Path) -> PhaseResult<ToolCommand> {
        let locator = SourceLocator::new(credentials, vm_name)?;

        let mut cmd = ToolCommand::new(&self.program);
        if !credentials.verify_ssl {
            cmd = cmd.arg("--noSSLVerify");
        }
        Ok(cmd
            .arg("--overwrite")
            .arg("--machineOutput")
            .secret_arg(locator.url, locator.redacted)
            .arg(target_ovf.as_os_str())
            .timeout(self.timeout))
    }
}

impl Exporter for OvfToolExporter {
    fn export(
        &self,
        vm_name: &str,
        target_dir: &Path,
        progress: &mut dyn FnMut(&str),
    ) -> PhaseResult<StagedArtifact> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            PhaseFailure::export_tool_failed(format!(
                "no source credentials: configure the vmware section and set {}",
                VMWARE_PASSWORD_VAR
            ))
        })?;

        fs::create_dir_all(target_dir).map_err(|e| {
            PhaseFailure::export_tool_failed(format!(
                "cannot create staging directory '{}': {}",
                target_dir.display(),
                e
            ))
        })?;

        let target_ovf = target_dir.join(format!("{}.ovf", vm_name));
        let cmd = self.command(credentials, vm_name, &target_ovf)?;

        info!(vm = vm_name, target = %target_dir.display(), "starting export: {}", cmd);

        let output = cmd
            .run(&mut |line| progress(&line.text))
            .map_err(|e| PhaseFailure::export_tool_failed(e.to_string()))?;

        if !output.success() {
            return Err(PhaseFailure::export_tool_failed(format!(
                "{} {}",
                self.program,
                output.failure_summary()
            )));
        }

        let vmdk = locate_in_dir(target_dir, vm_name, DiskFormat::Vmdk)
            .map_err(|e| PhaseFailure::export_tool_failed(e.to_string()))?
            .ok_or_else(|| {
                PhaseFailure::export_tool_failed(format!(
                    "export finished but no .vmdk file found in '{}'",
                    target_dir.display()
                ))
            })?;

        info!(vm = vm_name, disk = %vmdk.display(), elapsed = ?output.elapsed, "export complete");
        Ok(StagedArtifact::new(vmdk, DiskFormat::Vmdk, vm_name))
    }
}

/// `vi://` source locator for `ovftool`, with and without the password.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceLocator {
    url: String,
    redacted: String,
}

impl SourceLocator {
    fn new(credentials: &SourceCredentials, vm_name: &str) -> PhaseResult<Self> {
        let url = build_vi_url(credentials, vm_name, &credentials.password)?;
        let redacted = build_vi_url(credentials, vm_name, "***")?;
        Ok(Self { url, redacted })
    }
}

/// Build `vi://user:password@host[:port]/vm_name` with every part percent-encoded.
fn build_vi_url(credentials: &SourceCredentials, vm_name: &str, password: &str) -> PhaseResult<String> {
    let invalid = |what: &str| PhaseFailure::export_tool_failed(format!("invalid {} for vi:// locator", what));

    let mut url = Url::parse(&format!("vi://{}/", credentials.host)).map_err(|_| invalid("host"))?;
    url.set_username(&credentials.user).map_err(|_| invalid("user"))?;
    url.set_password(Some(password)).map_err(|_| invalid("password"))?;
    if credentials.port != 443 {
        url.set_port(Some(credentials.port)).map_err(|_| invalid("port"))?;
    }
    url.path_segments_mut()
        .map_err(|_| invalid("VM name"))?
        .clear()
        .push(vm_name);

    Ok(url.to_string())
}
