use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl WalkEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Lazy depth-first, pre-order listing of everything under a root.
///
/// The store directory is skipped along with everything below it.
/// Symlinks are reported but never followed, so link cycles cannot recurse.
/// A directory that cannot be read contributes no entries.
pub struct FileWalker {
    skip: Option<PathBuf>,
    inner: walkdir::IntoIter,
}

impl FileWalker {
    pub fn new(root: &Path, skip: Option<&Path>) -> Self {
        FileWalker {
            skip: skip.map(Path::to_path_buf),
            inner: WalkDir::new(root).min_depth(1).follow_links(false).into_iter(),
        }
    }

    fn is_skipped(&self, path: &Path) -> bool {
        self.skip.as_deref() == Some(path)
    }
}

impl Iterator for FileWalker {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            let file_type = entry.file_type();
            if self.is_skipped(entry.path()) {
                if file_type.is_dir() {
                    self.inner.skip_current_dir();
                }
                continue;
            }

            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };

            return Some(WalkEntry {
                path: entry.into_path(),
                kind,
            });
        }
    }
}

/// Walk `root`, leaving out the store directory
pub fn enumerate(root: &Path, store: Option<&Path>) -> FileWalker {
    FileWalker::new(root, store)
}
