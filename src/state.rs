use crate::config::BackupMode;
use crate::error::SitebakError;
use crate::schedule::Schedule;
use crate::utils::write_atomic;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const STATE_FILE: &str = "state.json";

/// Version written into state so upgrades can be detected
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEstimate {
    pub bytes: u64,
    pub expires_at: DateTime<Utc>,
}

impl CachedEstimate {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// What the engine remembers between invocations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub storage_path: Option<PathBuf>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimate: Option<CachedEstimate>,
    pub schedule: Option<Schedule>,
    pub mode: Option<BackupMode>,
    pub excludes: Option<String>,
    pub version: Option<String>,
}

/// `state.json` inside the state directory
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(state_dir: &Path) -> Self {
        StateFile {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state starts over from the default
    pub fn load(&self) -> Result<PersistedState> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PersistedState::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&contents) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable state");
                Ok(PersistedState::default())
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| SitebakError::validation(format!("encoding state: {e}")))?;
        write_atomic(&self.path, &json)
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
