//! Integration tests for staged artifact discovery.

use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, SystemTime};

use onemigrate_core::locator::{locate, locate_in_dir};
use onemigrate_core::DiskFormat;
use tempfile::TempDir;

fn touch(path: &Path, modified: SystemTime) {
    fs::write(path, b"disk").expect("Failed to write file");
    File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(modified))
        .expect("Failed to set mtime");
}

#[test]
fn test_locate_absent_vm_directory() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let found = locate(root.path(), "web01", DiskFormat::Vmdk).expect("locate failed");
    assert!(found.is_none());
}

#[test]
fn test_locate_absent_staging_root() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let missing = root.path().join("does-not-exist");
    let found = locate(&missing, "web01", DiskFormat::Vmdk).expect("locate failed");
    assert!(found.is_none());
}

#[test]
fn test_locate_single_disk() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("web01.vmdk"), b"disk").unwrap();
    fs::write(dir.join("web01.ovf"), b"<Envelope/>").unwrap();

    let artifact = locate(root.path(), "web01", DiskFormat::Vmdk)
        .expect("locate failed")
        .expect("disk should be found");
    assert_eq!(artifact.path, dir.join("web01.vmdk"));
    assert_eq!(artifact.format, DiskFormat::Vmdk);
    assert_eq!(artifact.vm_name, "web01");
}

#[test]
fn test_locate_matches_extension_case_insensitively() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("WEB01.VMDK"), b"disk").unwrap();

    let found = locate_in_dir(&dir, "web01", DiskFormat::Vmdk).expect("locate failed");
    assert_eq!(found, Some(dir.join("WEB01.VMDK")));
}

#[test]
fn test_locate_ignores_subdirectories() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir_all(dir.join("old.vmdk")).unwrap();
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(dir.join("nested").join("web01.vmdk"), b"disk").unwrap();

    let found = locate_in_dir(&dir, "web01", DiskFormat::Vmdk).expect("locate failed");
    assert!(found.is_none());
}

#[test]
fn test_most_recently_modified_wins() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();

    let base = SystemTime::now() - Duration::from_secs(3600);
    touch(&dir.join("web01-a.vmdk"), base);
    touch(&dir.join("web01-export.vmdk"), base + Duration::from_secs(60));
    touch(&dir.join("web01-z.vmdk"), base + Duration::from_secs(30));

    let found = locate_in_dir(&dir, "web01", DiskFormat::Vmdk).expect("locate failed");
    assert_eq!(found, Some(dir.join("web01-export.vmdk")));
}

#[test]
fn test_multi_disk_export_picks_first_disk() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();

    // ovftool writes disks in order, so the last one is the newest
    let base = SystemTime::now() - Duration::from_secs(3600);
    touch(&dir.join("web01-disk1.vmdk"), base);
    touch(&dir.join("web01-disk2.vmdk"), base + Duration::from_secs(60));
    touch(&dir.join("web01-disk3.vmdk"), base + Duration::from_secs(120));

    let artifact = locate(root.path(), "web01", DiskFormat::Vmdk)
        .expect("locate failed")
        .expect("disk should be found");
    assert_eq!(artifact.path, dir.join("web01-disk1.vmdk"));
}

#[test]
fn test_plain_vm_name_disk_is_preferred() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();

    let base = SystemTime::now() - Duration::from_secs(3600);
    touch(&dir.join("web01.vmdk"), base);
    touch(&dir.join("web01-disk1.vmdk"), base + Duration::from_secs(60));
    touch(&dir.join("scratch.vmdk"), base + Duration::from_secs(120));

    let found = locate_in_dir(&dir, "web01", DiskFormat::Vmdk).expect("locate failed");
    assert_eq!(found, Some(dir.join("web01.vmdk")));
}

#[test]
fn test_equal_mtimes_pick_smallest_name() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();

    let when = SystemTime::now() - Duration::from_secs(600);
    touch(&dir.join("web01-b.vmdk"), when);
    touch(&dir.join("web01-a.vmdk"), when);
    touch(&dir.join("web01-c.vmdk"), when);

    let found = locate_in_dir(&dir, "web01", DiskFormat::Vmdk).expect("locate failed");
    assert_eq!(found, Some(dir.join("web01-a.vmdk")));
}

#[test]
fn test_locate_qcow2_beside_vmdk() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let dir = root.path().join("web01");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("web01.vmdk"), b"disk").unwrap();
    fs::write(dir.join("web01.qcow2"), b"disk").unwrap();

    let vmdk = locate_in_dir(&dir, "web01", DiskFormat::Vmdk).unwrap();
    let qcow2 = locate_in_dir(&dir, "web01", DiskFormat::Qcow2).unwrap();
    assert_eq!(vmdk, Some(dir.join("web01.vmdk")));
    assert_eq!(qcow2, Some(dir.join("web01.qcow2")));
}
