//! Integration tests for the `ovftool` and `qemu-img` adapters.
//!
//! The real tools are replaced by small shell scripts written into a temp
//! directory, so these only run on Unix.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use onemigrate_core::convert::{Converter, QemuImgConverter};
use onemigrate_core::export::{Exporter, OvfToolExporter};
use onemigrate_core::{DiskFormat, FailureKind, SourceCredentials, StagedArtifact};
use tempfile::TempDir;

/// Scripts are exec'd right after being written; running one test at a time
/// keeps another test's fork from holding the write handle open.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod script");
    path.display().to_string()
}

fn credentials() -> SourceCredentials {
    SourceCredentials {
        host: "vcenter.lab".to_string(),
        port: 443,
        user: "administrator@vsphere.local".to_string(),
        password: "hunter2".to_string(),
        verify_ssl: false,
    }
}

fn staged_vmdk(dir: &Path) -> StagedArtifact {
    let vm_dir = dir.join("stage").join("web01");
    fs::create_dir_all(&vm_dir).unwrap();
    let path = vm_dir.join("web01.vmdk");
    fs::write(&path, b"vmdk").unwrap();
    StagedArtifact::new(path, DiskFormat::Vmdk, "web01")
}

// =============================================================================
// Export
// =============================================================================

#[test]
fn test_export_stages_first_disk() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    // Last argument is the target .ovf; write two disks next to it
    let tool = script(
        tmp.path(),
        "ovftool",
        r#"for last; do :; done
dir=$(dirname "$last")
echo "+ PROGRESS 50"
: > "$dir/web01-disk1.vmdk"
: > "$dir/web01-disk2.vmdk"
: > "$last""#,
    );
    let target = tmp.path().join("stage").join("web01");
    let exporter = OvfToolExporter::new(tool, Duration::from_secs(10), Some(credentials()));

    let mut lines = Vec::new();
    let artifact = exporter
        .export("web01", &target, &mut |line| lines.push(line.to_string()))
        .expect("export should succeed");

    assert_eq!(artifact.path, target.join("web01-disk1.vmdk"));
    assert_eq!(artifact.format, DiskFormat::Vmdk);
    assert!(target.join("web01.ovf").exists());
    assert_eq!(lines, vec!["+ PROGRESS 50".to_string()]);
}

#[test]
fn test_export_without_disk_output_fails() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let tool = script(tmp.path(), "ovftool", "exit 0");
    let target = tmp.path().join("stage").join("web01");
    let exporter = OvfToolExporter::new(tool, Duration::from_secs(10), Some(credentials()));

    let failure = exporter.export("web01", &target, &mut |_| {}).unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExportToolFailed);
    assert!(failure.detail.contains("no .vmdk"), "{}", failure.detail);
    assert!(target.is_dir(), "staging directory should be created");
}

#[test]
fn test_export_non_zero_exit_fails() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let tool = script(tmp.path(), "ovftool", "echo boom >&2\nexit 3");
    let target = tmp.path().join("stage").join("web01");
    let exporter = OvfToolExporter::new(tool, Duration::from_secs(10), Some(credentials()));

    let failure = exporter.export("web01", &target, &mut |_| {}).unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExportToolFailed);
    assert!(failure.detail.ends_with("exit status 3: boom"), "{}", failure.detail);
    assert!(!failure.detail.contains("hunter2"));
}

#[test]
fn test_export_receives_source_locator() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let args_file = tmp.path().join("args");
    let tool = script(
        tmp.path(),
        "ovftool",
        &format!(
            r#"for arg; do echo "$arg" >> '{}'; done
exit 1"#,
            args_file.display()
        ),
    );
    let target = tmp.path().join("stage").join("web01");
    let exporter = OvfToolExporter::new(tool, Duration::from_secs(10), Some(credentials()));

    exporter.export("web01", &target, &mut |_| {}).unwrap_err();

    let args = fs::read_to_string(&args_file).expect("tool should record its arguments");
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(&args[..3], &["--noSSLVerify", "--overwrite", "--machineOutput"]);
    assert!(args[3].starts_with("vi://administrator%40vsphere.local:hunter2@vcenter.lab/web01"));
    assert_eq!(PathBuf::from(args[4]), target.join("web01.ovf"));
}

// =============================================================================
// Convert
// =============================================================================

#[test]
fn test_convert_writes_sibling_qcow2() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let tool = script(
        tmp.path(),
        "qemu-img",
        r#"for last; do :; done
printf '(50.00/100%%)\r(100.00/100%%)\n'
: > "$last""#,
    );
    let input = staged_vmdk(tmp.path());
    let converter = QemuImgConverter::new(tool, Duration::from_secs(10));

    let mut lines = Vec::new();
    let output = converter
        .convert(&input, &mut |line| lines.push(line.to_string()))
        .expect("conversion should succeed");

    assert_eq!(output.path, input.path.with_extension("qcow2"));
    assert_eq!(output.format, DiskFormat::Qcow2);
    assert_eq!(output.vm_name, "web01");
    assert!(output.path.exists());
    assert_eq!(lines, vec!["(50.00/100%)", "(100.00/100%)"]);
}

#[test]
fn test_convert_non_zero_exit_fails() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let tool = script(tmp.path(), "qemu-img", "echo 'Could not open input' >&2\nexit 1");
    let input = staged_vmdk(tmp.path());
    let converter = QemuImgConverter::new(tool, Duration::from_secs(10));

    let failure = converter.convert(&input, &mut |_| {}).unwrap_err();

    assert_eq!(failure.kind, FailureKind::ConversionToolFailed);
    assert!(
        failure.detail.ends_with("exit status 1: Could not open input"),
        "{}",
        failure.detail
    );
}

#[test]
fn test_convert_timeout_kills_tool() {
    let _serial = serial();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let tool = script(tmp.path(), "qemu-img", "exec sleep 30");
    let input = staged_vmdk(tmp.path());
    let converter = QemuImgConverter::new(tool, Duration::from_millis(300));

    let started = Instant::now();
    let failure = converter.convert(&input, &mut |_| {}).unwrap_err();

    assert_eq!(failure.kind, FailureKind::ConversionToolFailed);
    assert!(failure.detail.contains("timed out after 300ms"), "{}", failure.detail);
    assert!(started.elapsed() < Duration::from_secs(10), "tool was not killed");
}
