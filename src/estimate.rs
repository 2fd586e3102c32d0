//! Size estimate of a prospective backup.
//!
//! Raw database and file sizes are divided by a fixed factor to approximate
//! the compressed artifact. The result is cached in state for a week.

use crate::config::Config;
use crate::database::Database;
use crate::state::{CachedEstimate, PersistedState};
use crate::utils::{format_size_whole, SizeUnits};
use crate::walker::enumerate;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Typical ratio between raw and compressed size
pub const COMPRESSION_FACTOR: f64 = 1.9;

pub const CACHE_TTL_DAYS: i64 = 7;

/// Compute the estimate without consulting the cache.
///
/// A failing database counts as empty and an unreadable file counts as
/// zero bytes.
pub fn compute(config: &Config, store: Option<&Path>, database: Option<&dyn Database>) -> u64 {
    let mut bytes: u64 = 0;

    if config.mode.includes_database() {
        if let Some(database) = database {
            match database.data_length() {
                Ok(length) => bytes += length,
                Err(e) => warn!(error = %e, "could not size the database, counting it as empty"),
            }
        }
    }

    if config.mode.includes_files() {
        for entry in enumerate(&config.content_root, store).filter(|e| e.is_file()) {
            bytes += fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        }
    }

    (bytes as f64 / COMPRESSION_FACTOR) as u64
}

/// Cached estimate, recomputed and stored when missing or expired
pub fn estimate(
    config: &Config,
    store: Option<&Path>,
    database: Option<&dyn Database>,
    state: &mut PersistedState,
    now: DateTime<Utc>,
) -> u64 {
    if let Some(cached) = state.estimate.filter(|cached| cached.is_fresh(now)) {
        debug!(bytes = cached.bytes, "using cached size estimate");
        return cached.bytes;
    }

    let bytes = compute(config, store, database);
    state.estimate = Some(CachedEstimate {
        bytes,
        expires_at: now + Duration::days(CACHE_TTL_DAYS),
    });
    bytes
}

pub fn invalidate(state: &mut PersistedState) {
    state.estimate = None;
}

/// Whole-number rendering used for estimates, e.g. `12 MB`
pub fn render(bytes: u64, units: SizeUnits) -> String {
    format_size_whole(bytes, units)
}
