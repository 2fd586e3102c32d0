//! Bring recorded state in line with the current configuration.
//!
//! [`plan`] compares the two and lists what has to change; [`apply`]
//! carries the actions out. Once applied, planning again with the same
//! configuration yields nothing.

use crate::config::Config;
use crate::paths::relocate;
use crate::schedule::Schedule;
use crate::state::PersistedState;
use crate::status::{JobStatus, StatusStore};
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CancelSchedule,
    InstallSchedule(Schedule),
    /// Move the store; only planned when the old directory exists
    Relocate { from: PathBuf, to: PathBuf },
    /// Record a store path that needs no move
    RecordPath(PathBuf),
    /// The backup set changed; drop the cached estimate and record the new set
    InvalidateEstimate,
}

/// Actions needed to move from `state` to `config`, with the store
/// belonging at `target`
pub fn plan<Tz: TimeZone>(
    state: &PersistedState,
    config: &Config,
    target: &Path,
    now: &DateTime<Tz>,
) -> Vec<Action> {
    let mut actions = Vec::new();

    let wanted = config
        .automatic_backups
        .then(|| config.effective_schedule_time());
    match (state.schedule, wanted) {
        (Some(_), None) => actions.push(Action::CancelSchedule),
        (None, Some(time)) => actions.push(Action::InstallSchedule(Schedule::daily(time, now))),
        (Some(installed), Some(time)) if installed.time != time => {
            actions.push(Action::InstallSchedule(Schedule::daily(time, now)))
        }
        _ => {}
    }

    match &state.storage_path {
        Some(recorded) if recorded == target => {}
        Some(recorded) if recorded.is_dir() => actions.push(Action::Relocate {
            from: recorded.clone(),
            to: target.to_path_buf(),
        }),
        _ => actions.push(Action::RecordPath(target.to_path_buf())),
    }

    if state.mode != Some(config.mode)
        || state.excludes.as_deref() != Some(config.excludes.as_str())
    {
        actions.push(Action::InvalidateEstimate);
    }

    actions
}

/// Carry out `actions`, returning the ones that took effect.
///
/// A relocation needs the run lock; while a backup is running it is left
/// for a later invocation.
pub fn apply<S: StatusStore>(
    actions: &[Action],
    state: &mut PersistedState,
    config: &Config,
    status: &JobStatus<S>,
    now: DateTime<Utc>,
) -> Result<Vec<Action>> {
    let mut applied = Vec::new();

    for action in actions {
        match action {
            Action::CancelSchedule => {
                info!("automatic backups disabled, cancelling schedule");
                state.schedule = None;
            }
            Action::InstallSchedule(schedule) => {
                info!(
                    time = %schedule.time,
                    next_run = %schedule.next_run,
                    "installing daily schedule"
                );
                state.schedule = Some(*schedule);
            }
            Action::Relocate { from, to } => match status.with_lock(now, || relocate(from, to))? {
                None => {
                    warn!("a backup is running, store relocation postponed");
                    continue;
                }
                Some(moved) => {
                    if !moved? {
                        warn!(
                            from = %from.display(),
                            to = %to.display(),
                            "store could not be relocated"
                        );
                        continue;
                    }
                    state.storage_path = Some(to.clone());
                }
            },
            Action::RecordPath(path) => state.storage_path = Some(path.clone()),
            Action::InvalidateEstimate => {
                state.estimate = None;
                state.mode = Some(config.mode);
                state.excludes = Some(config.excludes.clone());
            }
        }
        applied.push(action.clone());
    }

    Ok(applied)
}

/// Plan and apply in one step
pub fn reconcile<S: StatusStore>(
    state: &mut PersistedState,
    config: &Config,
    target: &Path,
    status: &JobStatus<S>,
    now: DateTime<Utc>,
) -> Result<Vec<Action>> {
    let actions = plan(state, config, target, &now);
    apply(&actions, state, config, status, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupMode;
    use crate::paths::{prepare, target_store};
    use crate::state::CachedEstimate;
    use crate::status::MemoryStatusStore;
    use chrono::NaiveTime;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn status() -> JobStatus<MemoryStatusStore> {
        JobStatus::new(MemoryStatusStore::new(), Duration::from_secs(7200))
    }

    /// State as left behind by a previous reconcile of `config`
    fn settled(config: &Config, path: &Path) -> PersistedState {
        PersistedState {
            storage_path: Some(path.to_path_buf()),
            schedule: config
                .automatic_backups
                .then(|| Schedule::daily(config.effective_schedule_time(), &now())),
            mode: Some(config.mode),
            excludes: Some(config.excludes.clone()),
            ..PersistedState::default()
        }
    }

    #[test]
    fn test_first_run_installs_default_schedule() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path().join("state"));
        let target = config.default_storage_path();

        let actions = plan(&PersistedState::default(), &config, &target, &now());
        assert_eq!(
            actions,
            vec![
                Action::InstallSchedule(Schedule::daily(time(23, 0), &now())),
                Action::RecordPath(target.clone()),
                Action::InvalidateEstimate,
            ]
        );
    }

    #[test]
    fn test_schedule_changes() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path(), dir.path().join("state"));
        let target = config.default_storage_path();
        let state = settled(&config, &target);
        assert!(plan(&state, &config, &target, &now()).is_empty());

        config.automatic_backups = false;
        assert_eq!(
            plan(&state, &config, &target, &now()),
            vec![Action::CancelSchedule]
        );

        config.automatic_backups = true;
        config.schedule_time = Some(time(3, 30));
        assert_eq!(
            plan(&state, &config, &target, &now()),
            vec![Action::InstallSchedule(Schedule::daily(time(3, 30), &now()))]
        );
    }

    #[test]
    fn test_drifted_schedule_returns_to_default() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path().join("state"));
        let target = config.default_storage_path();
        let mut state = settled(&config, &target);
        state.schedule = Some(Schedule::daily(time(4, 0), &now()));

        assert_eq!(
            plan(&state, &config, &target, &now()),
            vec![Action::InstallSchedule(Schedule::daily(time(23, 0), &now()))]
        );
    }

    #[test]
    fn test_newly_enabled_schedule() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path().join("state"));
        let target = config.default_storage_path();
        let mut state = settled(&config, &target);
        state.schedule = None;

        assert_eq!(
            plan(&state, &config, &target, &now()),
            vec![Action::InstallSchedule(Schedule::daily(time(23, 0), &now()))]
        );
    }

    #[test]
    fn test_relocation_to_new_path() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        assert!(prepare(&old));
        fs::write(old.join("backup-20261015T010000.tar.gz"), "one").unwrap();
        fs::write(old.join("backup-20261015T020000.tar.gz"), "two").unwrap();

        let mut config = Config::new(dir.path(), dir.path().join("state"));
        let mut state = settled(&config, &old);
        config.storage_path = Some(new.clone());
        let target = target_store(&config);
        let status = status();

        let applied = reconcile(&mut state, &config, &target, &status, now()).unwrap();
        assert_eq!(
            applied,
            vec![Action::Relocate {
                from: old.clone(),
                to: new.clone()
            }]
        );
        assert!(!old.exists());
        assert!(new.join("backup-20261015T010000.tar.gz").exists());
        assert!(new.join("backup-20261015T020000.tar.gz").exists());
        assert_eq!(state.storage_path, Some(new.clone()));

        assert!(reconcile(&mut state, &config, &target, &status, now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unwritable_path_relocates_to_default() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        assert!(prepare(&old));
        fs::write(old.join("backup-20261015T010000.tar.gz"), "one").unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let mut config = Config::new(dir.path(), dir.path().join("state"));
        let mut state = settled(&config, &old);
        config.storage_path = Some(blocker.join("store"));
        let target = target_store(&config);
        assert_eq!(target, config.default_storage_path());

        reconcile(&mut state, &config, &target, &status(), now()).unwrap();
        assert!(config
            .default_storage_path()
            .join("backup-20261015T010000.tar.gz")
            .exists());
        assert_eq!(state.storage_path, Some(config.default_storage_path()));
    }

    #[test]
    fn test_relocation_postponed_while_running() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        assert!(prepare(&old));
        let mut config = Config::new(dir.path(), dir.path().join("state"));
        let mut state = settled(&config, &old);
        config.storage_path = Some(dir.path().join("new"));
        let target = target_store(&config);

        let status = status();
        status.start(now()).unwrap();

        let applied = reconcile(&mut state, &config, &target, &status, now()).unwrap();
        assert!(applied.is_empty());
        assert!(old.exists());
        assert_eq!(state.storage_path, Some(old));
        assert!(status.current().unwrap().is_running());
    }

    #[test]
    fn test_missing_old_store_is_just_recorded() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path().join("state"));
        let target = config.default_storage_path();
        let mut state = settled(&config, &dir.path().join("vanished"));

        let applied = reconcile(&mut state, &config, &target, &status(), now()).unwrap();
        assert_eq!(applied, vec![Action::RecordPath(target.clone())]);
        assert_eq!(state.storage_path, Some(target));
    }

    #[test]
    fn test_backup_set_change_invalidates_estimate() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path(), dir.path().join("state"));
        let target = config.default_storage_path();
        let mut state = settled(&config, &target);
        state.estimate = Some(CachedEstimate {
            bytes: 10,
            expires_at: now(),
        });

        config.mode = BackupMode::FilesOnly;
        config.excludes = "*.log".to_string();
        let applied = reconcile(&mut state, &config, &target, &status(), now()).unwrap();

        assert_eq!(applied, vec![Action::InvalidateEstimate]);
        assert_eq!(state.estimate, None);
        assert_eq!(state.mode, Some(BackupMode::FilesOnly));
        assert_eq!(state.excludes.as_deref(), Some("*.log"));
    }
}
