//! Location of the backup store.
//!
//! Exactly one directory is authoritative. It is chosen from the explicit
//! override, the previously recorded path and the default under the content
//! root, in that order, skipping any that cannot be written.

use crate::config::Config;
use crate::naming::{is_artifact, resolve_collision};
use crate::retention::{cleanup_except, remove_tree};
use crate::utils::{is_writable, parent_is_writable};
use crate::walker::enumerate;
use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Deny-all marker kept in every store
pub const ACCESS_MARKER: &str = ".htaccess";
const MARKER_CONTENTS: &str = "deny from all\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    Override,
    Stored,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPath {
    pub path: PathBuf,
    pub source: PathSource,
    /// A store that is not writable means backups are impossible
    pub writable: bool,
}

impl BackupPath {
    /// Pick the store directory, creating it when its parent allows.
    ///
    /// Falls back to the default even when that is not writable; the
    /// caller decides what an unwritable store means.
    pub fn resolve(config: &Config, stored: Option<&Path>) -> BackupPath {
        let candidates = [
            (config.storage_path.as_deref(), PathSource::Override),
            (stored, PathSource::Stored),
        ];

        for (candidate, source) in candidates {
            let Some(path) = candidate else { continue };
            if prepare(path) {
                debug!(path = %path.display(), ?source, "using backup store");
                return BackupPath {
                    path: path.to_path_buf(),
                    source,
                    writable: true,
                };
            }
            warn!(path = %path.display(), ?source, "backup store is not writable, skipping");
        }

        let path = config.default_storage_path();
        let writable = prepare(&path);
        BackupPath {
            path,
            source: PathSource::Default,
            writable,
        }
    }
}

/// Where the store should live: the configured path when it can be used,
/// otherwise the default
pub fn target_store(config: &Config) -> PathBuf {
    match &config.storage_path {
        Some(path) if prepare(path) => path.clone(),
        Some(path) => {
            warn!(path = %path.display(), "configured store is not writable, using the default");
            config.default_storage_path()
        }
        None => config.default_storage_path(),
    }
}

/// Create the directory if possible and make sure the marker is present.
/// Returns whether the directory is writable afterwards.
pub fn prepare(dir: &Path) -> bool {
    if !dir.exists() && parent_is_writable(dir) {
        if let Err(e) = create_store_dir(dir) {
            warn!(dir = %dir.display(), error = %e, "could not create backup store");
            return false;
        }
    }

    if !is_writable(dir) {
        return false;
    }

    if let Err(e) = ensure_marker(dir) {
        warn!(dir = %dir.display(), error = %e, "could not write access marker");
    }
    true
}

#[cfg(unix)]
fn create_store_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_store_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir(dir)
}

/// Write the access marker unless one already exists.
/// Returns whether a marker was written.
pub fn ensure_marker(dir: &Path) -> io::Result<bool> {
    let marker = dir.join(ACCESS_MARKER);
    if marker.exists() {
        return Ok(false);
    }

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)
    {
        Ok(mut file) => {
            io::Write::write_all(&mut file, MARKER_CONTENTS.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Move the store from `from` to `to`.
///
/// Returns `Ok(false)` without touching anything when the destination
/// cannot be made writable or the source is not a directory. The source
/// tree is only removed once every entry has been moved. A source nested
/// inside the destination is emptied into it, then removed along with the
/// directories left empty above it.
pub fn relocate(from: &Path, to: &Path) -> Result<bool> {
    if from == to {
        return Ok(from.is_dir());
    }

    if to.starts_with(from) {
        warn!(from = %from.display(), to = %to.display(), "cannot move a store into itself");
        return Ok(false);
    }

    if from.is_dir() && !to.exists() && parent_is_writable(to) {
        create_store_dir(to)?;
    }

    if !is_writable(to) || !from.is_dir() {
        debug!(from = %from.display(), to = %to.display(), "relocation not possible");
        return Ok(false);
    }

    let containing = from
        .strip_prefix(to)
        .ok()
        .and_then(|rest| rest.components().next())
        .map(|first| to.join(first));

    let report = cleanup_except(to, containing.as_deref());
    if !report.is_clean() {
        warn!(failed = report.failed.len(), "destination cleanup was incomplete");
    }

    let mut moved = 0usize;
    let mut stuck = Vec::new();
    for entry in fs::read_dir(from)?.flatten() {
        let name = entry.file_name();
        let source = entry.path();
        let mut target = to.join(&name);

        if target.exists() {
            if name == ACCESS_MARKER {
                continue;
            }
            if is_artifact(&name.to_string_lossy()) {
                target = resolve_collision(&target)?;
            } else {
                debug!(
                    entry = %source.display(),
                    "dropping stray entry already present at destination"
                );
                continue;
            }
        }

        match move_entry(&source, &target) {
            Ok(()) => moved += 1,
            Err(e) => {
                warn!(entry = %source.display(), error = %e, "could not move entry");
                stuck.push(source);
            }
        }
    }

    ensure_marker(to)?;

    if !stuck.is_empty() {
        warn!(
            count = stuck.len(),
            from = %from.display(),
            "leaving old store in place, some entries could not be moved"
        );
        return Ok(false);
    }

    let removal = remove_tree(from);
    if !removal.is_clean() {
        warn!(from = %from.display(), "old store could not be fully removed");
    }
    if let Some(top) = containing.as_deref() {
        remove_empty_parents(from, top);
    }

    info!(from = %from.display(), to = %to.display(), moved, "relocated backup store");
    Ok(true)
}

/// Remove the directories between `dir` and `top` (inclusive) while empty
fn remove_empty_parents(dir: &Path, top: &Path) {
    let mut current = dir.parent();
    while let Some(parent) = current {
        if !parent.starts_with(top) || fs::remove_dir(parent).is_err() {
            break;
        }
        current = parent.parent();
    }
}

/// Rename, falling back to copy and delete across filesystems
fn move_entry(source: &Path, target: &Path) -> io::Result<()> {
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }

    let metadata = fs::symlink_metadata(source)?;
    if metadata.is_dir() {
        copy_tree(source, target)?;
    } else {
        fs::copy(source, target)?;
    }

    let removal = remove_tree(source);
    if removal.is_clean() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "copied but could not remove the source",
        ))
    }
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in enumerate(source, None) {
        let Ok(relative) = entry.path.strip_prefix(source) else {
            continue;
        };
        let destination = target.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&destination)?;
        } else if entry.is_file() {
            fs::copy(&entry.path, &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn names(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn config_for(root: &Path) -> Config {
        Config::new(root, root.join("state"))
    }

    #[test]
    fn test_resolve_default_creates_store_with_marker() {
        let dir = tempdir().unwrap();
        let resolved = BackupPath::resolve(&config_for(dir.path()), None);

        assert_eq!(resolved.source, PathSource::Default);
        assert!(resolved.writable);
        assert_eq!(resolved.path, dir.path().join("backups"));
        let marker = fs::read_to_string(resolved.path.join(ACCESS_MARKER)).unwrap();
        assert_eq!(marker, "deny from all\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_store_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = dir.path().join("store");
        assert!(prepare(&store));
        let mode = fs::metadata(&store).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_resolve_precedence() {
        let dir = tempdir().unwrap();
        let stored = dir.path().join("stored");
        let override_dir = dir.path().join("override");

        let mut config = config_for(dir.path());
        assert_eq!(
            BackupPath::resolve(&config, Some(&stored)).source,
            PathSource::Stored
        );

        config.storage_path = Some(override_dir.clone());
        let resolved = BackupPath::resolve(&config, Some(&stored));
        assert_eq!(resolved.source, PathSource::Override);
        assert_eq!(resolved.path, override_dir);
    }

    #[test]
    fn test_resolve_skips_unwritable_candidates() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a dir").unwrap();

        let mut config = config_for(dir.path());
        config.storage_path = Some(blocker.join("override"));
        let resolved = BackupPath::resolve(&config, Some(&blocker.join("stored")));

        assert_eq!(resolved.source, PathSource::Default);
        assert!(resolved.writable);
    }

    #[test]
    fn test_resolve_reports_unwritable_default() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a dir").unwrap();

        let resolved = BackupPath::resolve(&config_for(&blocker), None);
        assert_eq!(resolved.source, PathSource::Default);
        assert!(!resolved.writable);
    }

    #[test]
    fn test_target_store() {
        let dir = tempdir().unwrap();
        let mut config = config_for(dir.path());
        assert_eq!(target_store(&config), dir.path().join("backups"));

        config.storage_path = Some(dir.path().join("custom"));
        assert_eq!(target_store(&config), dir.path().join("custom"));

        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        config.storage_path = Some(blocker.join("custom"));
        assert_eq!(target_store(&config), dir.path().join("backups"));
    }

    #[test]
    fn test_ensure_marker_never_overwrites() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ACCESS_MARKER), "custom rules").unwrap();

        assert!(!ensure_marker(dir.path()).unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join(ACCESS_MARKER)).unwrap(),
            "custom rules"
        );
    }

    #[test]
    fn test_relocate_moves_artifacts_and_removes_source() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        assert!(prepare(&old));
        fs::write(old.join("backup-20261015T010000.tar.gz"), "one").unwrap();
        fs::write(old.join("backup-20261015T020000.tar.gz"), "two").unwrap();

        assert!(relocate(&old, &new).unwrap());
        assert!(!old.exists());
        assert_eq!(
            names(&new),
            BTreeSet::from([
                ACCESS_MARKER.to_string(),
                "backup-20261015T010000.tar.gz".to_string(),
                "backup-20261015T020000.tar.gz".to_string(),
            ])
        );
        assert_eq!(
            fs::read_to_string(new.join("backup-20261015T020000.tar.gz")).unwrap(),
            "two"
        );
    }

    #[test]
    fn test_relocate_out_of_nested_store() {
        let dir = tempdir().unwrap();
        let outer = dir.path().join("backups");
        let nested = outer.join("custom");
        assert!(prepare(&outer));
        assert!(prepare(&nested));
        fs::write(nested.join("backup-20261015T010000.tar.gz"), "one").unwrap();
        fs::write(outer.join("stray.txt"), "x").unwrap();

        assert!(relocate(&nested, &outer).unwrap());
        assert!(!nested.exists());
        assert_eq!(
            names(&outer),
            BTreeSet::from([
                ACCESS_MARKER.to_string(),
                "backup-20261015T010000.tar.gz".to_string(),
            ])
        );
        assert_eq!(
            fs::read_to_string(outer.join("backup-20261015T010000.tar.gz")).unwrap(),
            "one"
        );
    }

    #[test]
    fn test_relocate_out_of_deeply_nested_store() {
        let dir = tempdir().unwrap();
        let outer = dir.path().join("backups");
        let nested = outer.join("sites").join("main");
        assert!(prepare(&outer));
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("backup-20261015T010000.tar.gz"), "one").unwrap();

        assert!(relocate(&nested, &outer).unwrap());
        assert!(!outer.join("sites").exists());
        assert!(outer.join("backup-20261015T010000.tar.gz").exists());
    }

    #[test]
    fn test_relocate_round_trip() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        assert!(prepare(&a));
        fs::write(a.join("backup-20261015T010000.tar.gz"), "one").unwrap();
        fs::create_dir(a.join("nested")).unwrap();
        fs::write(a.join("nested").join("inner.txt"), "x").unwrap();
        let before = names(&a);

        assert!(relocate(&a, &b).unwrap());
        assert!(relocate(&b, &a).unwrap());

        assert_eq!(names(&a), before);
        assert!(a.join("nested").join("inner.txt").exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_relocate_cleans_destination_first() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        assert!(prepare(&old));
        fs::create_dir(&new).unwrap();
        fs::write(new.join("garbage.tmp"), "junk").unwrap();
        fs::write(new.join("backup-20261014T010000.tar.gz"), "existing").unwrap();
        fs::write(old.join("backup-20261015T010000.tar.gz"), "moved").unwrap();

        assert!(relocate(&old, &new).unwrap());
        let listed = names(&new);
        assert!(!listed.contains("garbage.tmp"));
        assert!(listed.contains("backup-20261014T010000.tar.gz"));
        assert!(listed.contains("backup-20261015T010000.tar.gz"));
    }

    #[test]
    fn test_relocate_keeps_colliding_artifacts() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::create_dir(&old).unwrap();
        fs::create_dir(&new).unwrap();
        fs::write(old.join("backup-20261015T010000.tar.gz"), "old copy").unwrap();
        fs::write(new.join("backup-20261015T010000.tar.gz"), "new copy").unwrap();

        assert!(relocate(&old, &new).unwrap());
        assert_eq!(
            fs::read_to_string(new.join("backup-20261015T010000_0001.tar.gz")).unwrap(),
            "old copy"
        );
    }

    #[test]
    fn test_relocate_noop_cases() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        fs::create_dir(&old).unwrap();
        fs::write(old.join("backup-20261015T010000.tar.gz"), "one").unwrap();

        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        assert!(!relocate(&old, &blocker.join("new")).unwrap());
        assert!(old.join("backup-20261015T010000.tar.gz").exists());

        assert!(!relocate(&dir.path().join("missing"), &dir.path().join("new")).unwrap());
        assert!(!relocate(&old, &old.join("inner")).unwrap());
        assert!(old.join("backup-20261015T010000.tar.gz").exists());
    }

    #[test]
    fn test_copy_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("a").join("b")).unwrap();
        fs::write(src.join("a").join("b").join("f.txt"), "deep").unwrap();

        copy_tree(&src, &dir.path().join("dst")).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("dst/a/b/f.txt")).unwrap(),
            "deep"
        );
    }
}
