//! The operations the command line exposes, composed from the components.

use crate::backup::{Archiver, BackupSummary, Phase, PhaseListener};
use crate::config::Config;
use crate::database::{CommandDatabase, Database};
use crate::error::SitebakError;
use crate::estimate;
use crate::excludes::{Classified, ExcludeRules};
use crate::paths::{target_store, BackupPath};
use crate::reconcile::{self, Action};
use crate::retention::{self, Artifact, DeleteReport};
use crate::signal::RunContext;
use crate::state::{PersistedState, StateFile, ENGINE_VERSION};
use crate::status::{FileStatusStore, JobState, JobStatus, StatusStore};
use crate::utils::cleanup_temp_files;
use crate::Result;
use chrono::{DateTime, Local, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Mirrors phase changes into the job status and keeps the run lock fresh
struct StatusSink<'a, S> {
    status: &'a JobStatus<S>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl<'a, S: StatusStore> StatusSink<'a, S> {
    fn new(status: &'a JobStatus<S>, started_at: DateTime<Utc>) -> Self {
        StatusSink {
            status,
            started_at,
            clock: Instant::now(),
        }
    }

    /// Run start plus the time elapsed since
    fn now(&self) -> DateTime<Utc> {
        self.started_at
            + chrono::Duration::from_std(self.clock.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl<S: StatusStore> PhaseListener for StatusSink<'_, S> {
    fn on_phase_change(&mut self, phase: &Phase) {
        if phase.is_terminal() {
            return;
        }
        if let Err(e) = self.status.set_phase(&phase.message(), self.now()) {
            warn!(error = %e, "could not record phase");
        }
    }

    fn on_progress(&mut self, files: usize) {
        if let Err(e) = self.status.heartbeat(self.now()) {
            warn!(error = %e, files, "could not refresh the run lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: JobState,
    pub running: bool,
    pub store: BackupPath,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

pub struct Engine<S = FileStatusStore> {
    config: Config,
    state_file: StateFile,
    state: PersistedState,
    status: JobStatus<S>,
    database: Option<Box<dyn Database>>,
    listeners: Vec<Box<dyn PhaseListener>>,
    context: RunContext,
}

impl Engine<FileStatusStore> {
    /// Engine with the file-backed job status in the state directory
    pub fn open(config: Config) -> Result<Self> {
        let database = match &config.database {
            Some(database) => Some(Box::new(CommandDatabase::new(database)?) as Box<dyn Database>),
            None => None,
        };
        let store = FileStatusStore::new(&config.state_dir);
        Engine::with_parts(config, store, database)
    }
}

impl<S: StatusStore> Engine<S> {
    pub fn with_parts(
        config: Config,
        store: S,
        database: Option<Box<dyn Database>>,
    ) -> Result<Self> {
        let config = normalize(config)?;
        let state_file = StateFile::new(&config.state_dir);
        let state = state_file.load()?;
        let status = JobStatus::new(store, config.lock_ttl);

        Ok(Engine {
            config,
            state_file,
            state,
            status,
            database,
            listeners: Vec::new(),
            context: RunContext::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn job_status(&self) -> &JobStatus<S> {
        &self.status
    }

    pub fn add_listener(&mut self, listener: Box<dyn PhaseListener>) {
        self.listeners.push(listener);
    }

    /// Share interrupt state with a signal handler
    pub fn set_context(&mut self, context: RunContext) {
        self.context = context;
    }

    /// Upgrade handling and reconciliation; runs at the start of every
    /// invocation
    pub fn prepare(&mut self, now: DateTime<Utc>) -> Result<Vec<Action>> {
        self.handle_upgrade(now)?;

        let target = target_store(&self.config);
        let local_now = now.with_timezone(&Local);
        let actions = reconcile::plan(&self.state, &self.config, &target, &local_now);
        let applied = reconcile::apply(&actions, &mut self.state, &self.config, &self.status, now)?;

        if !applied.is_empty() {
            debug!(?applied, "reconciled state");
        }
        self.state_file.save(&self.state)?;
        Ok(applied)
    }

    fn handle_upgrade(&mut self, now: DateTime<Utc>) -> Result<()> {
        let recorded = self.state.version.clone();
        match recorded.as_deref() {
            Some(version) if version == ENGINE_VERSION => return Ok(()),
            Some(version) => {
                info!(from = version, to = ENGINE_VERSION, "upgrading");
                let store = self.store();
                if store.writable {
                    match self.status.with_lock(now, || retention::cleanup(&store.path))? {
                        Some(report) if !report.is_clean() => {
                            warn!(failed = report.failed.len(), "upgrade cleanup was incomplete")
                        }
                        Some(_) => {}
                        None => warn!("a backup is running, skipping upgrade cleanup"),
                    }
                }
                self.status.reset_stale(now)?;
                estimate::invalidate(&mut self.state);
            }
            None => debug!("first run, recording engine version"),
        }

        self.state.version = Some(ENGINE_VERSION.to_string());
        Ok(())
    }

    /// Where artifacts live right now
    pub fn store(&self) -> BackupPath {
        BackupPath::resolve(&self.config, self.state.storage_path.as_deref())
    }

    /// Run one backup: archive, then trim the store
    pub fn run(&mut self, now: DateTime<Utc>) -> Result<BackupSummary> {
        let store = self.store();
        if !store.writable {
            return Err(SitebakError::StorageUnwritable { path: store.path });
        }

        self.status.start(now)?;
        self.context.set_lock_token(self.status.token());

        let outcome = self.run_locked(&store.path, now);

        let finished_at = match &outcome {
            Ok(summary) => {
                now + chrono::Duration::from_std(summary.duration)
                    .unwrap_or_else(|_| chrono::Duration::zero())
            }
            Err(_) => now,
        };
        let released = self.status.finish(
            outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()),
            finished_at,
        );
        self.context.set_lock_token(None);

        let summary = outcome?;
        released?;

        self.state.completed_at = Some(finished_at);
        self.state.storage_path = Some(store.path);
        if let Some(schedule) = self.state.schedule.as_mut() {
            if schedule.is_due(finished_at) {
                schedule.advance(&finished_at.with_timezone(&Local));
            }
        }
        self.state_file.save(&self.state)?;

        Ok(summary)
    }

    fn run_locked(&mut self, store: &Path, now: DateTime<Utc>) -> Result<BackupSummary> {
        let leftovers = cleanup_temp_files(store)?;
        if leftovers > 0 {
            info!(count = leftovers, "removed leftovers of an interrupted run");
        }

        let excludes = ExcludeRules::new(&self.config.excludes, &self.config.content_root);
        let invalid = excludes.classify().invalid;
        if !invalid.is_empty() {
            warn!(rules = ?invalid, "exclude rules match nothing");
        }

        let mut archiver = Archiver::new(&self.config, store, &excludes)
            .with_context(self.context.clone());
        if let Some(database) = self.database.as_deref() {
            archiver = archiver.with_database(database);
        }

        let mut sink = StatusSink::new(&self.status, now);
        let mut listeners: Vec<&mut dyn PhaseListener> = vec![&mut sink];
        for listener in self.listeners.iter_mut() {
            listeners.push(listener.as_mut());
        }

        let summary = archiver.run(&mut listeners, now)?;

        // The artifact is in place; a failing trim only leaves extra backups
        match retention::trim(store, self.config.max_backups) {
            Ok(report) => {
                if let Err(e) = report.into_result() {
                    warn!(error = %e, "retention could not delete every old artifact");
                }
            }
            Err(e) => warn!(error = %e, "could not list the store for retention"),
        }

        Ok(summary)
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<StatusReport> {
        Ok(StatusReport {
            state: self.status.current()?,
            running: self.status.is_running(now)?,
            store: self.store(),
            completed_at: self.state.completed_at,
            next_run: self.state.schedule.map(|s| s.next_run),
        })
    }

    /// Cached size estimate of the next backup
    pub fn estimate(&mut self, now: DateTime<Utc>) -> Result<u64> {
        let store = self.store();
        let bytes = estimate::estimate(
            &self.config,
            Some(&store.path),
            self.database.as_deref(),
            &mut self.state,
            now,
        );
        self.state_file.save(&self.state)?;
        Ok(bytes)
    }

    /// Artifacts, oldest first
    pub fn list(&self) -> Result<Vec<Artifact>> {
        retention::list_artifacts(&self.store().path)
    }

    pub fn total_size(&self) -> Result<u64> {
        retention::total_size(&self.store().path)
    }

    /// Copy an artifact out of the store; `dest` may be a directory
    pub fn download(&self, name: &str, dest: &Path) -> Result<PathBuf> {
        let source = retention::find_artifact(&self.store().path, name)?;
        let target = if dest.is_dir() {
            dest.join(name)
        } else {
            dest.to_path_buf()
        };
        fs::copy(&source, &target)?;
        Ok(target)
    }

    pub fn delete(&mut self, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
        let store = self.store().path;
        let deleted = self
            .status
            .with_lock(now, || retention::delete_artifact(&store, name))?;
        match deleted {
            Some(result) => result,
            None => Err(self.already_running()?),
        }
    }

    /// Exclude rules split into valid and invalid
    pub fn excludes(&self) -> Classified {
        ExcludeRules::new(&self.config.excludes, &self.config.content_root).classify()
    }

    /// Cancel the schedule, clean the store and forget status and estimate
    pub fn uninstall(&mut self, now: DateTime<Utc>) -> Result<DeleteReport> {
        let store = self.store();
        let report = match self
            .status
            .reset_with_lock(now, || retention::cleanup(&store.path))?
        {
            Some(report) => report,
            None => return Err(self.already_running()?),
        };

        self.state.schedule = None;
        estimate::invalidate(&mut self.state);
        self.state_file.save(&self.state)?;

        info!(store = %store.path.display(), "uninstalled");
        Ok(report)
    }

    fn already_running(&self) -> Result<SitebakError> {
        self.status.already_running()
    }
}

/// Absolute content root, and absolute store and state paths
fn normalize(mut config: Config) -> Result<Config> {
    config.content_root = fs::canonicalize(&config.content_root).map_err(|e| {
        SitebakError::config(format!(
            "content_root {} is not usable: {e}",
            config.content_root.display()
        ))
    })?;

    let cwd = std::env::current_dir()?;
    if let Some(path) = config.storage_path.take() {
        let absolute = if path.is_absolute() { path } else { cwd.join(path) };
        config.storage_path = Some(fs::canonicalize(&absolute).unwrap_or(absolute));
    }
    if config.state_dir.is_relative() {
        config.state_dir = cwd.join(&config.state_dir);
    }

    Ok(config)
}
