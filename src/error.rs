use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SitebakError {
    #[error("Configuration invalid: {message}")]
    ConfigurationInvalid { message: String },

    #[error("Backup storage is not writable: {path}")]
    StorageUnwritable { path: PathBuf },

    #[error("A backup is already running (started {started_at})")]
    AlreadyRunning { started_at: String },

    #[error("Database dump failed: {message}")]
    DumpFailed { message: String },

    #[error("Could not write archive {path}: {source}")]
    ArchiveWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not delete {} of the requested entries", .failures.len())]
    PartialDeleteFailure { failures: Vec<PathBuf> },

    #[error("Backup not found: {name}")]
    BackupNotFound { name: String },

    #[error("Operation interrupted by user")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {message}")]
    Validation { message: String },
}

impl SitebakError {
    /// Create a configuration error with a custom message
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            message: message.into(),
        }
    }

    /// Create a validation error with a custom message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn dump(message: impl Into<String>) -> Self {
        Self::DumpFailed {
            message: message.into(),
        }
    }

    pub fn archive_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArchiveWriteFailed {
            path: path.into(),
            source,
        }
    }

    /// Errors that abort a run but leave the engine usable for a retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SitebakError::AlreadyRunning { .. }
                | SitebakError::DumpFailed { .. }
                | SitebakError::ArchiveWriteFailed { .. }
                | SitebakError::PartialDeleteFailure { .. }
        )
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SitebakError::Interrupted => 130,
            SitebakError::ConfigurationInvalid { .. } => 2,
            SitebakError::Validation { .. } => 2,
            SitebakError::AlreadyRunning { .. } => 3,
            _ => 1,
        }
    }

    /// Provide helpful suggestions for resolving the error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            SitebakError::StorageUnwritable { path } => vec![
                format!("Make {} writable by the backup user", path.display()),
                "Set a different storage path with `sitebak set path <dir>`".to_string(),
            ],
            SitebakError::AlreadyRunning { .. } => vec![
                "Wait for the running backup to finish".to_string(),
                "Check progress with `sitebak status`".to_string(),
            ],
            SitebakError::ArchiveWriteFailed { .. } => vec![
                "Free up disk space".to_string(),
                "Lower max_backups to keep fewer archives".to_string(),
            ],
            SitebakError::DumpFailed { .. } => vec![
                "Check database_dump_command in the configuration".to_string(),
                "Run with files_only = true to skip the database".to_string(),
            ],
            SitebakError::ConfigurationInvalid { .. } => vec![
                "Inspect the effective configuration with `sitebak config`".to_string(),
            ],
            _ => vec![],
        }
    }
}
