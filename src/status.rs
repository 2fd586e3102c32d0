//! Job status and the run lock.
//!
//! At most one backup runs at a time. The lock lives in a [`StatusStore`]
//! so the check-and-set is atomic across processes. A running job refreshes
//! it as it works; a lock not refreshed within its TTL is treated as
//! abandoned by a crashed run.

use crate::error::SitebakError;
use crate::utils::write_atomic;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const LOCK_FILE: &str = "running.lock";
pub const STATUS_FILE: &str = "status.json";

/// Phase text shown as soon as a run starts
pub const STARTED_MESSAGE: &str = "Backup started";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running {
        phase: String,
        started_at: DateTime<Utc>,
    },
    Complete {
        at: DateTime<Utc>,
    },
    Error {
        message: String,
        at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Running { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            JobState::Idle => "Idle".to_string(),
            JobState::Running { phase, started_at } => {
                format!("Running: {phase} (since {})", started_at.to_rfc3339())
            }
            JobState::Complete { at } => format!("Complete at {}", at.to_rfc3339()),
            JobState::Error { message, at } => {
                format!("Failed at {}: {message}", at.to_rfc3339())
            }
        }
    }
}

/// Who holds the run lock and when it last showed signs of life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockInfo {
    /// Time the lock was taken; doubles as the holder's token
    pub acquired_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(now: DateTime<Utc>) -> Self {
        LockInfo {
            acquired_at: now,
            refreshed_at: now,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        is_stale(self.refreshed_at, now, ttl)
    }
}

/// Durable home of the run lock and the visible job state
pub trait StatusStore {
    /// Take the run lock unless a live one is held, with `now` as its
    /// token. Must be atomic with respect to other callers; a lock not
    /// refreshed within `ttl` may be taken over.
    fn try_acquire(&self, now: DateTime<Utc>, ttl: Duration) -> Result<bool>;

    fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Push the refresh time of the lock taken at `token` forward.
    /// Returns false when that lock is no longer held.
    fn refresh(&self, token: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool>;

    fn update(&self, state: &JobState) -> Result<()>;

    /// Record the final state and drop the lock taken at `token`. A lock
    /// now held by someone else is left alone, state included, and false
    /// is returned.
    fn release(&self, token: DateTime<Utc>, final_state: &JobState) -> Result<bool>;

    /// Current state; readable without holding the lock
    fn peek(&self) -> Result<JobState>;
}

fn is_stale(since: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    (now - since)
        .to_std()
        .map(|age| age > ttl)
        .unwrap_or(false)
}

#[derive(Debug)]
struct Slot {
    lock: Option<LockInfo>,
    state: JobState,
}

/// In-process store; clones share the same slot
#[derive(Debug, Clone)]
pub struct MemoryStatusStore {
    slot: Arc<Mutex<Slot>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        MemoryStatusStore {
            slot: Arc::new(Mutex::new(Slot {
                lock: None,
                state: JobState::Idle,
            })),
        }
    }

    fn with_slot<T>(&self, f: impl FnOnce(&mut Slot) -> T) -> Result<T> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SitebakError::validation("status store poisoned"))?;
        Ok(f(&mut slot))
    }
}

impl Default for MemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore for MemoryStatusStore {
    fn try_acquire(&self, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        self.with_slot(|slot| match slot.lock {
            Some(lock) if !lock.is_stale(now, ttl) => false,
            _ => {
                slot.lock = Some(LockInfo::new(now));
                true
            }
        })
    }

    fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.with_slot(|slot| slot.lock)
    }

    fn refresh(&self, token: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        self.with_slot(|slot| match slot.lock.as_mut() {
            Some(lock) if lock.acquired_at == token => {
                lock.refreshed_at = lock.refreshed_at.max(now);
                true
            }
            _ => false,
        })
    }

    fn update(&self, state: &JobState) -> Result<()> {
        self.with_slot(|slot| slot.state = state.clone())
    }

    fn release(&self, token: DateTime<Utc>, final_state: &JobState) -> Result<bool> {
        self.with_slot(|slot| match slot.lock {
            Some(lock) if lock.acquired_at != token => false,
            _ => {
                slot.state = final_state.clone();
                slot.lock = None;
                true
            }
        })
    }

    fn peek(&self) -> Result<JobState> {
        self.with_slot(|slot| slot.state.clone())
    }
}

/// Store backed by `running.lock` and `status.json` in a state directory.
///
/// The lock file is created with `create_new`, so exactly one process
/// wins. Its first line is the RFC 3339 time it was taken, the second the
/// time of the last refresh.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStatusStore { dir: dir.into() }
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    fn create_lock(&self, now: DateTime<Utc>) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())?;
        file.write_all(encode_lock(&LockInfo::new(now)).as_bytes())?;
        file.sync_all()
    }

    /// Move a stale lock aside and confirm it is the one we judged stale
    fn break_stale_lock(&self, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        let aside = self
            .dir
            .join(format!("{LOCK_FILE}.stale.{}", std::process::id()));

        match fs::rename(self.lock_path(), &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Another process may have replaced or refreshed the lock between
        // our read and the rename; put a live lock back
        match read_lock(&aside)? {
            Some(lock) if !lock.is_stale(now, ttl) => {
                if fs::hard_link(&aside, self.lock_path()).is_err() {
                    debug!("live lock was re-taken while restoring");
                }
            }
            _ => warn!(lock = %self.lock_path().display(), "removed stale run lock"),
        }

        let _ = fs::remove_file(&aside);
        Ok(())
    }
}

fn encode_lock(lock: &LockInfo) -> String {
    format!(
        "{}\n{}\n",
        lock.acquired_at.to_rfc3339(),
        lock.refreshed_at.to_rfc3339()
    )
}

fn parse_time(line: Option<&str>) -> Option<DateTime<Utc>> {
    let time = DateTime::parse_from_rfc3339(line?.trim()).ok()?;
    Some(time.with_timezone(&Utc))
}

/// Contents of a lock file. A missing refresh line means the lock was
/// never refreshed; unreadable contents fall back to the modification time.
fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = contents.lines();
    if let Some(acquired_at) = parse_time(lines.next()) {
        let refreshed_at = parse_time(lines.next()).unwrap_or(acquired_at);
        return Ok(Some(LockInfo {
            acquired_at,
            refreshed_at,
        }));
    }

    let modified = fs::metadata(path)?.modified()?;
    Ok(Some(LockInfo::new(DateTime::<Utc>::from(modified))))
}

impl StatusStore for FileStatusStore {
    fn try_acquire(&self, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;

        for _ in 0..2 {
            match self.create_lock(now) {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_lock(&self.lock_path())? {
                        Some(lock) if !lock.is_stale(now, ttl) => return Ok(false),
                        _ => self.break_stale_lock(now, ttl)?,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(false)
    }

    fn lock_info(&self) -> Result<Option<LockInfo>> {
        read_lock(&self.lock_path())
    }

    fn refresh(&self, token: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        match read_lock(&self.lock_path())? {
            Some(mut lock) if lock.acquired_at == token => {
                lock.refreshed_at = lock.refreshed_at.max(now);
                write_atomic(&self.lock_path(), encode_lock(&lock).as_bytes())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn update(&self, state: &JobState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| SitebakError::validation(format!("encoding status: {e}")))?;
        write_atomic(&self.status_path(), &json)
    }

    fn release(&self, token: DateTime<Utc>, final_state: &JobState) -> Result<bool> {
        if let Some(lock) = read_lock(&self.lock_path())? {
            if lock.acquired_at != token {
                return Ok(false);
            }
        }

        self.update(final_state)?;
        match fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn peek(&self) -> Result<JobState> {
        let contents = match fs::read(self.status_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(JobState::Idle),
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&contents).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable status file, reporting idle");
            JobState::Idle
        }))
    }
}

/// The single-slot job state machine on top of a store
pub struct JobStatus<S> {
    store: S,
    ttl: Duration,
    /// Token of the lock this instance took in `start`
    held: Mutex<Option<DateTime<Utc>>>,
}

impl<S: StatusStore> JobStatus<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        JobStatus {
            store,
            ttl,
            held: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn held(&self) -> Option<DateTime<Utc>> {
        self.held.lock().map(|held| *held).unwrap_or(None)
    }

    fn set_held(&self, token: Option<DateTime<Utc>>) {
        if let Ok(mut held) = self.held.lock() {
            *held = token;
        }
    }

    /// Take the run lock and enter `Running`
    pub fn start(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.store.try_acquire(now, self.ttl)? {
            return Err(self.already_running()?);
        }
        self.set_held(Some(now));

        self.store.update(&JobState::Running {
            phase: STARTED_MESSAGE.to_string(),
            started_at: now,
        })
    }

    /// `AlreadyRunning` describing the current holder of the lock
    pub fn already_running(&self) -> Result<SitebakError> {
        let started_at = self
            .store
            .lock_info()?
            .map(|lock| lock.acquired_at.to_rfc3339())
            .unwrap_or_else(|| "at an unknown time".to_string());
        Ok(SitebakError::AlreadyRunning { started_at })
    }

    /// Token of the lock taken by [`start`](Self::start), while it is held
    pub fn token(&self) -> Option<DateTime<Utc>> {
        self.held()
    }

    /// Replace the visible phase text of the running job and refresh the
    /// lock. Once the lock is lost the new holder's state is left alone.
    pub fn set_phase(&self, message: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(token) = self.held() else {
            return Err(SitebakError::validation("No backup is running"));
        };
        let started_at = match self.store.peek()? {
            JobState::Running { started_at, .. } => started_at,
            _ => token,
        };

        if !self.heartbeat(now)? {
            return Ok(());
        }
        self.store.update(&JobState::Running {
            phase: message.to_string(),
            started_at,
        })
    }

    /// Keep the lock of a long run from going stale. Returns false when
    /// the lock has been lost to another run.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(token) = self.held() else {
            return Ok(false);
        };
        let kept = self.store.refresh(token, now)?;
        if !kept {
            warn!("run lock was taken over by another run");
        }
        Ok(kept)
    }

    /// Enter `Complete` or `Error` and release the lock
    pub fn finish(
        &self,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(token) = self.held() else {
            return Err(SitebakError::validation("No backup is running"));
        };
        let state = match outcome {
            Ok(()) => JobState::Complete { at: now },
            Err(message) => JobState::Error { message, at: now },
        };

        self.set_held(None);
        if !self.store.release(token, &state)? {
            warn!("run lock is held by another run, leaving its status alone");
        }
        Ok(())
    }

    /// Run `f` holding the run lock, leaving the visible state untouched.
    /// Returns `None` without running `f` when a backup holds the lock.
    pub fn with_lock<T>(&self, now: DateTime<Utc>, f: impl FnOnce() -> T) -> Result<Option<T>> {
        let visible = self.store.peek()?;
        self.locked(now, visible, f)
    }

    /// Like [`with_lock`](Self::with_lock), but the job is `Idle` afterwards
    pub fn reset_with_lock<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce() -> T,
    ) -> Result<Option<T>> {
        self.locked(now, JobState::Idle, f)
    }

    fn locked<T>(
        &self,
        now: DateTime<Utc>,
        final_state: JobState,
        f: impl FnOnce() -> T,
    ) -> Result<Option<T>> {
        if !self.store.try_acquire(now, self.ttl)? {
            return Ok(None);
        }

        let out = f();
        self.store.release(now, &final_state)?;
        Ok(Some(out))
    }

    pub fn current(&self) -> Result<JobState> {
        self.store.peek()
    }

    /// Whether a live run holds the lock; an expired lock does not count
    pub fn is_running(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.store.lock_info()? {
            Some(lock) => !lock.is_stale(now, self.ttl),
            None => false,
        })
    }

    /// Clear a `Running` state left behind by a run that died.
    /// Returns whether anything was reset.
    pub fn reset_stale(&self, now: DateTime<Utc>) -> Result<bool> {
        if self.is_running(now)? {
            return Ok(false);
        }

        match self.store.lock_info()? {
            Some(lock) => self.store.release(lock.acquired_at, &JobState::Idle),
            None if self.store.peek()?.is_running() => {
                self.store.update(&JobState::Idle)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
