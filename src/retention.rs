//! Retention of artifacts in the store.
//!
//! `trim` keeps the newest `max` artifacts; `cleanup` removes everything in
//! the store that is neither an artifact nor the access marker. Deletion is
//! best effort: one entry failing never stops the rest, and failures are
//! collected in the returned [`DeleteReport`].

use crate::error::SitebakError;
use crate::naming::{artifact_timestamp, is_artifact};
use crate::paths::ACCESS_MARKER;
use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A completed backup in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Time in the name; file times only for names that carry none
    pub created: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl DeleteReport {
    pub fn merge(&mut self, other: DeleteReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// The deleted paths, or `PartialDeleteFailure` if anything was left
    pub fn into_result(self) -> Result<Vec<PathBuf>> {
        if self.failed.is_empty() {
            Ok(self.deleted)
        } else {
            Err(SitebakError::PartialDeleteFailure {
                failures: self.failed,
            })
        }
    }
}

/// Artifacts in the store, oldest first (name timestamp, then name).
///
/// File times are not trusted for order: copying across filesystems
/// resets them.
pub fn list_artifacts(store: &Path) -> Result<Vec<Artifact>> {
    let reader = match fs::read_dir(store) {
        Ok(reader) => reader,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut artifacts = Vec::new();
    for entry in reader.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_artifact(&name) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let created = match artifact_timestamp(&name) {
            Some(timestamp) => SystemTime::from(timestamp),
            None => metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(UNIX_EPOCH),
        };

        artifacts.push(Artifact {
            name,
            path: entry.path(),
            size: metadata.len(),
            created,
        });
    }

    artifacts.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
    Ok(artifacts)
}

/// Delete the oldest artifacts until at most `max` remain
pub fn trim(store: &Path, max: usize) -> Result<DeleteReport> {
    let artifacts = list_artifacts(store)?;
    let mut report = DeleteReport::default();

    if artifacts.len() <= max {
        return Ok(report);
    }

    let excess = artifacts.len() - max;
    for artifact in artifacts.into_iter().take(excess) {
        debug!(artifact = %artifact.name, "removing old artifact");
        report.merge(remove_tree(&artifact.path));
    }

    Ok(report)
}

/// Delete every store entry that is not an artifact or the access marker
pub fn cleanup(store: &Path) -> DeleteReport {
    cleanup_except(store, None)
}

/// Like [`cleanup`], but also spares the top-level entry `keep`
pub fn cleanup_except(store: &Path, keep: Option<&Path>) -> DeleteReport {
    let mut report = DeleteReport::default();

    let reader = match fs::read_dir(store) {
        Ok(reader) => reader,
        Err(e) => {
            debug!(store = %store.display(), error = %e, "nothing to clean up");
            return report;
        }
    };

    for entry in reader.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ACCESS_MARKER || is_artifact(&name) {
            continue;
        }
        let path = entry.path();
        if keep == Some(path.as_path()) {
            debug!(path = %path.display(), "kept during cleanup");
            continue;
        }
        report.merge(remove_tree(&path));
    }

    if !report.is_clean() {
        warn!(failed = report.failed.len(), "cleanup left entries behind");
    }
    report
}

/// Remove a file, or a directory and everything below it, children
/// before their parent. Symlinks are removed, never followed.
pub fn remove_tree(root: &Path) -> DeleteReport {
    let mut report = DeleteReport::default();

    for entry in WalkDir::new(root).contents_first(true).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error().map(|io| io.kind()) != Some(io::ErrorKind::NotFound) {
                    warn!(error = %e, "cannot inspect entry");
                    if let Some(path) = e.path() {
                        report.failed.push(path.to_path_buf());
                    }
                }
                continue;
            }
        };

        let path = entry.path();
        let removed = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };

        match removed {
            Ok(()) => report.deleted.push(entry.into_path()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot delete entry");
                report.failed.push(entry.into_path());
            }
        }
    }

    report
}

/// Delete one artifact by name
pub fn delete_artifact(store: &Path, name: &str) -> Result<PathBuf> {
    let path = find_artifact(store, name)?;
    fs::remove_file(&path)?;
    Ok(path)
}

/// Locate an artifact by its bare file name
pub fn find_artifact(store: &Path, name: &str) -> Result<PathBuf> {
    if !is_artifact(name) || name.contains(&['/', '\\'][..]) {
        return Err(SitebakError::BackupNotFound {
            name: name.to_string(),
        });
    }

    let path = store.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(SitebakError::BackupNotFound {
            name: name.to_string(),
        })
    }
}

/// Combined size of every artifact in the store
pub fn total_size(store: &Path) -> Result<u64> {
    Ok(list_artifacts(store)?.iter().map(|a| a.size).sum())
}
