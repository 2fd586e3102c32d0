use crate::error::SitebakError;
use crate::utils::is_temp_artifact;
use crate::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

pub const ARTIFACT_EXTENSION: &str = ".tar.gz";

/// Sortable timestamp embedded in every artifact name
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// `<prefix>-<timestamp>.tar.gz`; lexical order equals creation order
pub fn artifact_name(prefix: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{prefix}-{}{ARTIFACT_EXTENSION}",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

/// Path of the next artifact in `store`, avoiding existing names
pub fn generate_artifact_path(
    store: &Path,
    prefix: &str,
    timestamp: &DateTime<Utc>,
) -> Result<PathBuf> {
    resolve_collision(&store.join(artifact_name(prefix, timestamp)))
}

/// Resolve filename collisions by adding a zero-padded counter.
///
/// The counter follows an underscore so a suffixed name still sorts after
/// the unsuffixed one.
pub fn resolve_collision(base_path: &Path) -> Result<PathBuf> {
    if !base_path.exists() {
        return Ok(base_path.to_path_buf());
    }

    let parent = base_path.parent().unwrap_or(Path::new("."));
    let filename = base_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SitebakError::validation("Invalid artifact filename"))?;
    let stem = filename
        .strip_suffix(ARTIFACT_EXTENSION)
        .ok_or_else(|| SitebakError::validation("Not an artifact filename"))?;

    for counter in 1..=9999 {
        let new_path = parent.join(format!("{stem}_{counter:04}{ARTIFACT_EXTENSION}"));
        if !new_path.exists() {
            return Ok(new_path);
        }
    }

    Err(SitebakError::validation("Too many artifact collisions (>9999)"))
}

/// Timestamp embedded in an artifact name, ignoring a collision suffix.
///
/// `None` for names this crate did not generate.
pub fn artifact_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(ARTIFACT_EXTENSION)?;
    let (_, stamp) = stem.rsplit_once('-')?;
    let stamp = match stamp.split_once('_') {
        Some((stamp, counter)) if counter.bytes().all(|b| b.is_ascii_digit()) => stamp,
        Some(_) => return None,
        None => stamp,
    };

    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether a store entry name is a completed artifact
pub fn is_artifact(name: &str) -> bool {
    name.ends_with(ARTIFACT_EXTENSION)
        && name.len() > ARTIFACT_EXTENSION.len()
        && !name.starts_with('.')
        && !is_temp_artifact(name)
}

/// Name of the database dump entry inside an artifact
pub fn dump_entry_name(database: &str) -> String {
    let safe: String = database
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("database-{safe}.sql")
}
