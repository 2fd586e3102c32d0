use crate::error::SitebakError;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of in-flight artifact files; never counted as artifacts
pub const TEMP_PREFIX: &str = ".sitebak_temp_";

/// Unit table used when rendering sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnits {
    /// Powers of 1000: kB, MB, ...
    Si,
    /// Powers of 1024: KiB, MiB, ...
    Binary,
}

impl SizeUnits {
    fn table(self) -> (&'static [&'static str], f64) {
        match self {
            SizeUnits::Si => (&["B", "kB", "MB", "GB", "TB", "PB"], 1000.0),
            SizeUnits::Binary => (&["B", "KiB", "MiB", "GiB", "TiB", "PiB"], 1024.0),
        }
    }
}

/// Scale down while the magnitude is at least 1024, for either table,
/// never past `max_unit` when it names a unit of the table
fn scale(bytes: f64, units: SizeUnits, max_unit: Option<&str>) -> (f64, &'static str) {
    let (names, base) = units.table();
    let last = max_unit
        .and_then(|unit| names.iter().position(|name| name.eq_ignore_ascii_case(unit)))
        .unwrap_or(names.len() - 1);
    let mut size = bytes;
    let mut index = 0;

    while size >= 1024.0 && index < last {
        size /= base;
        index += 1;
    }

    (size, names[index])
}

/// Format byte size with two decimals, e.g. `1.50 MB`
pub fn format_size(bytes: u64, units: SizeUnits) -> String {
    let (size, unit) = scale(bytes as f64, units, None);
    format!("{size:.2} {unit}")
}

/// Like [`format_size`], but stops at `max_unit` (e.g. `"MB"`), so
/// `format_size_capped(5_000_000_000, SizeUnits::Si, "MB")` is `5000.00 MB`
pub fn format_size_capped(bytes: u64, units: SizeUnits, max_unit: &str) -> String {
    let (size, unit) = scale(bytes as f64, units, Some(max_unit));
    format!("{size:.2} {unit}")
}

/// Format byte size truncated to a whole number, e.g. `1 MB`
pub fn format_size_whole(bytes: u64, units: SizeUnits) -> String {
    let (size, unit) = scale(bytes as f64, units, None);
    format!("{} {unit}", size.trunc() as u64)
}

/// A directory is writable if a scratch file can be created inside it
pub fn is_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }

    let scratch = dir.join(format!(".sitebak_check_{}", std::process::id()));
    match fs::File::create(&scratch) {
        Ok(_) => {
            let _ = fs::remove_file(&scratch);
            true
        }
        Err(_) => false,
    }
}

/// Whether `dir` could be created (its parent is a writable directory)
pub fn parent_is_writable(dir: &Path) -> bool {
    dir.parent().map(is_writable).unwrap_or(false)
}

/// Temporary sibling path used while an artifact is being written
pub fn temp_artifact_path(final_path: &Path) -> Result<PathBuf> {
    let parent = final_path.parent().unwrap_or(Path::new("."));
    let filename = final_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SitebakError::validation("Invalid artifact filename"))?;

    let temp_name = format!("{TEMP_PREFIX}{}_{filename}", std::process::id());
    Ok(parent.join(temp_name))
}

pub fn is_temp_artifact(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

/// Replace `path` with `contents` through a temporary sibling and a rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SitebakError::validation("Invalid state filename"))?;
    let temp_path = parent.join(format!(".{filename}.{}.tmp", std::process::id()));

    if let Err(e) = fs::write(&temp_path, contents) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Remove leftover temporary artifacts from a store
pub fn cleanup_temp_files(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_temp_artifact(&name.to_string_lossy()) && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}
