//! The archiver: one run produces one `.tar.gz` artifact in the store.
//!
//! The archive is written under a temporary name and renamed into place
//! only after the compressor has been finished and the file synced, so a
//! run that dies half way never leaves something that looks like a
//! completed backup.

use crate::config::{BackupMode, Config};
use crate::database::Database;
use crate::error::SitebakError;
use crate::excludes::ExcludeRules;
use crate::naming::{dump_entry_name, generate_artifact_path};
use crate::signal::{InFlightGuard, RunContext};
use crate::utils::{format_size, temp_artifact_path, SizeUnits, TEMP_PREFIX};
use crate::walker::{enumerate, EntryKind};
use crate::Result;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a run, reported to every listener in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Started,
    DumpingDatabase,
    Archiving,
    Complete { artifact: PathBuf },
    Failed { message: String },
}

impl Phase {
    /// Human readable status text
    pub fn message(&self) -> String {
        match self {
            Phase::Started => "Backup started".to_string(),
            Phase::DumpingDatabase => "Dumping database".to_string(),
            Phase::Archiving => "Creating archive".to_string(),
            Phase::Complete { artifact } => format!("Backup complete: {}", artifact.display()),
            Phase::Failed { message } => format!("Backup failed: {message}"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete { .. } | Phase::Failed { .. })
    }
}

/// Files archived between two progress reports
pub const PROGRESS_INTERVAL: usize = 256;

/// Receives phase changes synchronously from the archiver
pub trait PhaseListener {
    fn on_phase_change(&mut self, phase: &Phase);

    /// Called every [`PROGRESS_INTERVAL`] files while archiving
    fn on_progress(&mut self, _files: usize) {}
}

/// Writes every phase to the log
pub struct LogListener;

impl PhaseListener for LogListener {
    fn on_phase_change(&mut self, phase: &Phase) {
        match phase {
            Phase::Failed { .. } => warn!("{}", phase.message()),
            _ => info!("{}", phase.message()),
        }
    }
}

fn notify(listeners: &mut [&mut dyn PhaseListener], phase: &Phase) {
    for listener in listeners.iter_mut() {
        listener.on_phase_change(phase);
    }
}

fn notify_progress(listeners: &mut [&mut dyn PhaseListener], files: usize) {
    for listener in listeners.iter_mut() {
        listener.on_progress(files);
    }
}

#[derive(Debug)]
pub struct BackupSummary {
    pub artifact: PathBuf,
    pub files: usize,
    pub bytes: u64,
    pub database: bool,
    pub duration: Duration,
}

impl BackupSummary {
    pub fn summary(&self) -> String {
        let size = fs::metadata(&self.artifact).map(|m| m.len()).unwrap_or(0);
        let contents = match (self.database, self.files) {
            (true, 0) => "database".to_string(),
            (true, files) => format!("database and {files} files"),
            (false, files) => format!("{files} files"),
        };
        format!(
            "Created backup: {} ({contents}, {})",
            self.artifact.display(),
            format_size(size, SizeUnits::Si)
        )
    }
}

#[derive(Default)]
struct Counts {
    files: usize,
    bytes: u64,
    database: bool,
}

type ArchiveBuilder = tar::Builder<GzEncoder<BufWriter<File>>>;

pub struct Archiver<'a> {
    content_root: &'a Path,
    store: &'a Path,
    mode: BackupMode,
    prefix: &'a str,
    excludes: &'a ExcludeRules,
    database: Option<&'a dyn Database>,
    context: RunContext,
}

impl<'a> Archiver<'a> {
    /// `store` must already exist and be writable
    pub fn new(config: &'a Config, store: &'a Path, excludes: &'a ExcludeRules) -> Self {
        Archiver {
            content_root: &config.content_root,
            store,
            mode: config.mode,
            prefix: &config.archive_prefix,
            excludes,
            database: None,
            context: RunContext::new(),
        }
    }

    pub fn with_database(mut self, database: &'a dyn Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    /// Produce one artifact, reporting each phase to `listeners`
    pub fn run(
        &self,
        listeners: &mut [&mut dyn PhaseListener],
        now: DateTime<Utc>,
    ) -> Result<BackupSummary> {
        let started = Instant::now();
        notify(listeners, &Phase::Started);

        match self.write_artifact(listeners, now) {
            Ok((artifact, counts)) => {
                notify(
                    listeners,
                    &Phase::Complete {
                        artifact: artifact.clone(),
                    },
                );
                Ok(BackupSummary {
                    artifact,
                    files: counts.files,
                    bytes: counts.bytes,
                    database: counts.database,
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                notify(
                    listeners,
                    &Phase::Failed {
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    fn write_artifact(
        &self,
        listeners: &mut [&mut dyn PhaseListener],
        now: DateTime<Utc>,
    ) -> Result<(PathBuf, Counts)> {
        let database = match (self.mode.includes_database(), self.database) {
            (true, Some(database)) => Some(database),
            (true, None) if self.mode == BackupMode::DatabaseOnly => {
                return Err(SitebakError::config(
                    "database_only requires a configured database",
                ))
            }
            (true, None) => {
                debug!("no database configured, archiving files only");
                None
            }
            (false, _) => None,
        };

        let final_path = generate_artifact_path(self.store, self.prefix, &now)?;
        let temp_path = temp_artifact_path(&final_path)?;

        let dump = match database {
            Some(database) => {
                notify(listeners, &Phase::DumpingDatabase);
                Some(self.dump_database(database)?)
            }
            None => None,
        };

        let guard = self.context.register(temp_path.clone());

        notify(listeners, &Phase::Archiving);
        let written = self.write_archive(&temp_path, dump.as_ref(), listeners);

        if let Some((dump_path, dump_guard)) = dump {
            let _ = fs::remove_file(&dump_path);
            dump_guard.complete();
        }

        let counts = match written {
            Ok(counts) => counts,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                guard.complete();
                return Err(e);
            }
        };

        let renamed = fs::rename(&temp_path, &final_path);
        if renamed.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        guard.complete();
        renamed.map_err(|e| SitebakError::archive_write(&final_path, e))?;

        info!(artifact = %final_path.display(), files = counts.files, "artifact written");
        Ok((final_path, counts))
    }

    /// Dump the database into a temporary file in the store
    fn dump_database(&self, database: &dyn Database) -> Result<(PathBuf, InFlightGuard)> {
        let dump_path = self.store.join(format!(
            "{TEMP_PREFIX}{}_{}",
            std::process::id(),
            dump_entry_name(database.name())
        ));
        let guard = self.context.register(dump_path.clone());

        let result = File::create(&dump_path)
            .map_err(|e| SitebakError::archive_write(&dump_path, e))
            .and_then(|file| {
                let mut out = BufWriter::new(file);
                database.dump(&mut out).map_err(|e| match e {
                    SitebakError::Io(e) => SitebakError::archive_write(&dump_path, e),
                    other => other,
                })?;
                let file = out
                    .into_inner()
                    .map_err(|e| SitebakError::archive_write(&dump_path, e.into_error()))?;
                file.sync_all()
                    .map_err(|e| SitebakError::archive_write(&dump_path, e))
            });

        match result {
            Ok(()) => Ok((dump_path, guard)),
            Err(e) => {
                let _ = fs::remove_file(&dump_path);
                guard.complete();
                Err(e)
            }
        }
    }

    fn write_archive(
        &self,
        temp_path: &Path,
        dump: Option<&(PathBuf, InFlightGuard)>,
        listeners: &mut [&mut dyn PhaseListener],
    ) -> Result<Counts> {
        let write_err = |e: io::Error| SitebakError::archive_write(temp_path, e);

        let file = File::create(temp_path).map_err(write_err)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut counts = Counts::default();

        if let (Some((dump_path, _)), Some(database)) = (dump, self.database) {
            builder
                .append_path_with_name(dump_path, dump_entry_name(database.name()))
                .map_err(write_err)?;
            counts.database = true;
        }

        if self.mode.includes_files() {
            self.append_files(&mut builder, &mut counts, &write_err, listeners)?;
        }

        let encoder = builder.into_inner().map_err(write_err)?;
        let buffered = encoder.finish().map_err(write_err)?;
        let file = buffered
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?;
        file.sync_all().map_err(write_err)?;

        Ok(counts)
    }

    fn append_files(
        &self,
        builder: &mut ArchiveBuilder,
        counts: &mut Counts,
        write_err: &dyn Fn(io::Error) -> SitebakError,
        listeners: &mut [&mut dyn PhaseListener],
    ) -> Result<()> {
        for entry in enumerate(self.content_root, Some(self.store)) {
            if self.context.is_interrupted() {
                return Err(SitebakError::Interrupted);
            }

            if self.excludes.is_excluded(&entry.path) {
                debug!(path = %entry.path.display(), "excluded");
                continue;
            }

            let Ok(relative) = entry.path.strip_prefix(self.content_root) else {
                continue;
            };

            match entry.kind {
                EntryKind::Dir => {
                    if fs::metadata(&entry.path).is_err() {
                        continue;
                    }
                    builder
                        .append_dir(relative, &entry.path)
                        .map_err(write_err)?;
                }
                EntryKind::File => {
                    let mut file = match File::open(&entry.path) {
                        Ok(file) => file,
                        Err(e) => {
                            warn!(
                                path = %entry.path.display(),
                                error = %e,
                                "skipping unreadable file"
                            );
                            continue;
                        }
                    };
                    builder
                        .append_file(relative, &mut file)
                        .map_err(write_err)?;
                    counts.files += 1;
                    counts.bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
                    if counts.files % PROGRESS_INTERVAL == 0 {
                        notify_progress(listeners, counts.files);
                    }
                }
                EntryKind::Symlink => {
                    builder
                        .append_path_with_name(&entry.path, relative)
                        .map_err(write_err)?;
                }
                EntryKind::Other => {
                    debug!(path = %entry.path.display(), "skipping special file");
                }
            }
        }
        Ok(())
    }
}
