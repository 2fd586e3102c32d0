use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Interrupt state shared between a backup run and the Ctrl-C handler.
///
/// The run registers every temporary file it is writing; on interrupt the
/// handler deletes whatever is still registered so no partial artifact
/// survives.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    interrupted: Arc<AtomicBool>,
    lock_token: Arc<Mutex<Option<DateTime<Utc>>>>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::SeqCst);
    }

    /// Token of the run lock while this process holds it
    pub fn lock_token(&self) -> Option<DateTime<Utc>> {
        self.lock_token.lock().map(|token| *token).unwrap_or(None)
    }

    pub fn set_lock_token(&self, token: Option<DateTime<Utc>>) {
        if let Ok(mut held) = self.lock_token.lock() {
            *held = token;
        }
    }

    /// Track a temporary file until the returned guard completes
    pub fn register(&self, temp_path: PathBuf) -> InFlightGuard {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(temp_path.clone());
        }
        InFlightGuard {
            temp_path,
            context: self.clone(),
            completed: false,
        }
    }

    pub fn in_flight(&self) -> Vec<PathBuf> {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete every registered temporary file; returns how many were removed
    pub fn cleanup_in_flight(&self) -> usize {
        let mut removed = 0;
        for path in self.in_flight() {
            if !path.exists() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed incomplete artifact");
                    removed += 1;
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "could not remove incomplete artifact"
                ),
            }
        }

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.clear();
        }
        removed
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(path);
        }
    }
}

/// Keeps a temporary file registered while it is being written
pub struct InFlightGuard {
    temp_path: PathBuf,
    context: RunContext,
    completed: bool,
}

impl InFlightGuard {
    /// The file was renamed into place or deleted by its owner
    pub fn complete(mut self) {
        self.context.forget(&self.temp_path);
        self.completed = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // After an interrupt the handler owns cleanup of whatever is left
        if !self.completed && !self.context.is_interrupted() {
            self.context.forget(&self.temp_path);
        }
    }
}
