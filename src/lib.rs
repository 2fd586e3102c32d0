pub mod backup;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod excludes;
pub mod naming;
pub mod paths;
#[cfg(feature = "progress")]
pub mod progress;
pub mod reconcile;
pub mod retention;
pub mod schedule;
pub mod signal;
pub mod state;
pub mod status;
pub mod utils;
pub mod walker;

pub use backup::{Archiver, BackupSummary, LogListener, Phase, PhaseListener};
pub use config::{dump_config, get_config_path, load_config, update_setting, BackupMode, Config};
pub use engine::{Engine, StatusReport};
pub use error::SitebakError;
pub use excludes::ExcludeRules;
pub use paths::{BackupPath, PathSource};
#[cfg(feature = "progress")]
pub use progress::{ProgressConfig, SpinnerListener};
pub use retention::{Artifact, DeleteReport};
pub use signal::RunContext;
pub use status::{
    FileStatusStore, JobState, JobStatus, LockInfo, MemoryStatusStore, StatusStore,
};
pub use utils::{format_size, SizeUnits};

/// Main library result type
pub type Result<T> = std::result::Result<T, SitebakError>;
