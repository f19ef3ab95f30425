//! Staged artifact discovery.
//!
//! Disks for a VM live under `{staging_root}/{vm_name}/`. When more than one
//! file matches the requested extension, the conventional first-disk names
//! `{vm_name}.ext` and `{vm_name}-disk1.ext` (what `ovftool` writes) win.
//! Otherwise the most recently modified file wins, and equal modification
//! times fall back to the lexicographically smallest file name so the choice
//! never depends on directory listing order.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::{DiskFormat, StagedArtifact};

/// Locate the staged disk of `format` for `vm_name` under `staging_root`.
///
/// Returns `Ok(None)` if the VM's staging directory is absent or holds no
/// matching file.
///
/// # Errors
///
/// Returns an error if the staging directory exists but cannot be read.
pub fn locate(
    staging_root: &Path,
    vm_name: &str,
    format: DiskFormat,
) -> Result<Option<StagedArtifact>> {
    let dir = staging_root.join(vm_name);
    let found = locate_in_dir(&dir, vm_name, format)?;

    match &found {
        Some(path) => debug!(path = %path.display(), %format, "located staged artifact"),
        None => debug!(dir = %dir.display(), %format, "no staged artifact"),
    }

    Ok(found.map(|path| StagedArtifact::new(path, format, vm_name)))
}

/// Pick the preferred disk of `vm_name` with the extension of `format`
/// directly inside `dir`.
pub fn locate_in_dir(dir: &Path, vm_name: &str, format: DiskFormat) -> Result<Option<PathBuf>> {
    let candidates = list_candidates(dir, format)?;
    let count = candidates.len();
    let picked = select_preferred(candidates, vm_name, format);
    if count > 1 {
        if let Some(path) = &picked {
            warn!(
                dir = %dir.display(),
                count,
                picked = %path.display(),
                "multiple .{} files staged",
                format.extension()
            );
        }
    }
    Ok(picked)
}

/// File names that mark the first disk of `vm_name`, most preferred first.
fn conventional_names(vm_name: &str, format: DiskFormat) -> [String; 2] {
    let ext = format.extension();
    [
        format!("{}.{}", vm_name, ext).to_lowercase(),
        format!("{}-disk1.{}", vm_name, ext).to_lowercase(),
    ]
}

/// A matching file and its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
}

fn list_candidates(dir: &Path, format: DiskFormat) -> Result<Vec<Candidate>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(e, dir)),
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(e, dir))?;
        let path = entry.path();

        if DiskFormat::from_path(&path) != Some(format) {
            continue;
        }

        // Follows symlinks so a linked disk counts as a regular file
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push(Candidate { path, modified });
    }

    Ok(candidates)
}

fn select_preferred(candidates: Vec<Candidate>, vm_name: &str, format: DiskFormat) -> Option<PathBuf> {
    for name in conventional_names(vm_name, format) {
        let conventional = candidates.iter().find(|c| {
            c.path
                .file_name()
                .is_some_and(|f| f.to_string_lossy().to_lowercase() == name)
        });
        if let Some(candidate) = conventional {
            return Some(candidate.path.clone());
        }
    }

    candidates
        .into_iter()
        .max_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| b.path.file_name().cmp(&a.path.file_name()))
        })
        .map(|c| c.path)
}
