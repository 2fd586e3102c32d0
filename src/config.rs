use crate::error::SitebakError;
use crate::Result;
use chrono::NaiveTime;
use configparser::ini::Ini;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// INI section holding every setting
pub const SECTION: &str = "sitebak";

pub const DEFAULT_MAX_BACKUPS: usize = 10;
pub const DEFAULT_LOCK_TTL_MINUTES: u64 = 120;
pub const DEFAULT_ARCHIVE_PREFIX: &str = "backup";
pub const DEFAULT_STORE_DIR: &str = "backups";

/// Keys accepted in the INI file and by `sitebak set`
pub const KNOWN_KEYS: &[&str] = &[
    "content_root",
    "path",
    "max_backups",
    "files_only",
    "database_only",
    "excludes",
    "disable_automatic_backup",
    "daily_schedule_time",
    "email",
    "database_name",
    "database_dump_command",
    "state_dir",
    "lock_ttl_minutes",
    "archive_prefix",
];

/// Default time of day for the automatic backup
pub fn default_schedule_time() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// What a run puts into the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    Full,
    FilesOnly,
    DatabaseOnly,
}

impl BackupMode {
    pub fn includes_database(self) -> bool {
        self != BackupMode::FilesOnly
    }

    pub fn includes_files(self) -> bool {
        self != BackupMode::DatabaseOnly
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub name: String,
    pub dump_command: String,
}

/// Effective configuration for one invocation.
///
/// Built once by [`resolve_effective_config`]; every component takes this
/// value and never reads a raw settings source itself.
#[derive(Debug, Clone)]
pub struct Config {
    pub content_root: PathBuf,
    /// Explicit storage override; `None` means the default store
    pub storage_path: Option<PathBuf>,
    pub max_backups: usize,
    pub mode: BackupMode,
    /// Raw comma separated exclude rules
    pub excludes: String,
    pub automatic_backups: bool,
    /// Custom daily schedule time; `None` means the default
    pub schedule_time: Option<NaiveTime>,
    pub email: Option<String>,
    pub database: Option<DatabaseConfig>,
    pub state_dir: PathBuf,
    pub lock_ttl: Duration,
    pub archive_prefix: String,
}

impl Config {
    /// A full-mode configuration with every other value at its default
    pub fn new(content_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Config {
            content_root: content_root.into(),
            storage_path: None,
            max_backups: DEFAULT_MAX_BACKUPS,
            mode: BackupMode::Full,
            excludes: String::new(),
            automatic_backups: true,
            schedule_time: None,
            email: None,
            database: None,
            state_dir: state_dir.into(),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_MINUTES * 60),
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
        }
    }

    pub fn default_storage_path(&self) -> PathBuf {
        self.content_root.join(DEFAULT_STORE_DIR)
    }

    pub fn effective_schedule_time(&self) -> NaiveTime {
        self.schedule_time.unwrap_or_else(default_schedule_time)
    }
}

/// One layer of raw settings (defaults, stored file, or overrides).
///
/// Empty values count as unset so a higher layer can fall through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub content_root: Option<String>,
    pub path: Option<String>,
    pub max_backups: Option<String>,
    pub files_only: Option<String>,
    pub database_only: Option<String>,
    pub excludes: Option<String>,
    pub disable_automatic_backup: Option<String>,
    pub daily_schedule_time: Option<String>,
    pub email: Option<String>,
    pub database_name: Option<String>,
    pub database_dump_command: Option<String>,
    pub state_dir: Option<String>,
    pub lock_ttl_minutes: Option<String>,
    pub archive_prefix: Option<String>,
}

impl Settings {
    /// Built-in defaults; the content root is the working directory
    pub fn defaults() -> Self {
        let content_root = std::env::current_dir()
            .map(|dir| dir.to_string_lossy().into_owned())
            .ok();

        Settings {
            content_root,
            max_backups: Some(DEFAULT_MAX_BACKUPS.to_string()),
            state_dir: Some(default_state_dir().to_string_lossy().into_owned()),
            lock_ttl_minutes: Some(DEFAULT_LOCK_TTL_MINUTES.to_string()),
            archive_prefix: Some(DEFAULT_ARCHIVE_PREFIX.to_string()),
            ..Settings::default()
        }
    }

    /// Build a layer from a key lookup, e.g. an INI section or the environment
    pub fn from_lookup(mut lookup: impl FnMut(&str) -> Option<String>) -> Self {
        Settings {
            content_root: lookup("content_root"),
            path: lookup("path"),
            max_backups: lookup("max_backups"),
            files_only: lookup("files_only"),
            database_only: lookup("database_only"),
            excludes: lookup("excludes"),
            disable_automatic_backup: lookup("disable_automatic_backup"),
            daily_schedule_time: lookup("daily_schedule_time"),
            email: lookup("email"),
            database_name: lookup("database_name"),
            database_dump_command: lookup("database_dump_command"),
            state_dir: lookup("state_dir"),
            lock_ttl_minutes: lookup("lock_ttl_minutes"),
            archive_prefix: lookup("archive_prefix"),
        }
    }

    /// Overrides from `SITEBAK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(env_key(key)).ok())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let slot = match key {
            "content_root" => &mut self.content_root,
            "path" => &mut self.path,
            "max_backups" => &mut self.max_backups,
            "files_only" => &mut self.files_only,
            "database_only" => &mut self.database_only,
            "excludes" => &mut self.excludes,
            "disable_automatic_backup" => &mut self.disable_automatic_backup,
            "daily_schedule_time" => &mut self.daily_schedule_time,
            "email" => &mut self.email,
            "database_name" => &mut self.database_name,
            "database_dump_command" => &mut self.database_dump_command,
            "state_dir" => &mut self.state_dir,
            "lock_ttl_minutes" => &mut self.lock_ttl_minutes,
            "archive_prefix" => &mut self.archive_prefix,
            _ => return Err(SitebakError::config(format!("Unknown setting: {key}"))),
        };
        *slot = Some(value.into());
        Ok(())
    }
}

/// Environment variable name for a settings key
pub fn env_key(key: &str) -> String {
    format!("SITEBAK_{}", key.to_uppercase())
}

/// Merge the three layers into the effective configuration.
///
/// Precedence is overrides, then stored settings, then defaults. Setting
/// both `files_only` and `database_only` is rejected rather than producing
/// an empty backup.
pub fn resolve_effective_config(
    defaults: &Settings,
    stored: &Settings,
    overrides: &Settings,
) -> Result<Config> {
    let layers = [overrides, stored, defaults];

    let content_root = pick(&layers, |s| &s.content_root)
        .map(PathBuf::from)
        .ok_or_else(|| SitebakError::config("content_root is not set"))?;
    let state_dir = pick(&layers, |s| &s.state_dir)
        .map(PathBuf::from)
        .ok_or_else(|| SitebakError::config("state_dir is not set"))?;

    let mut config = Config::new(content_root, state_dir);

    config.storage_path = pick(&layers, |s| &s.path).map(PathBuf::from);

    if let Some(value) = pick(&layers, |s| &s.max_backups) {
        config.max_backups = value
            .parse()
            .map_err(|_| SitebakError::config(format!("Invalid max_backups: {value}")))?;
    }

    let files_only = pick_bool(pick(&layers, |s| &s.files_only), "files_only")?;
    let database_only = pick_bool(pick(&layers, |s| &s.database_only), "database_only")?;
    config.mode = match (files_only, database_only) {
        (true, true) => {
            return Err(SitebakError::config(
                "files_only and database_only cannot both be enabled",
            ))
        }
        (true, false) => BackupMode::FilesOnly,
        (false, true) => BackupMode::DatabaseOnly,
        (false, false) => BackupMode::Full,
    };

    config.excludes = pick(&layers, |s| &s.excludes).unwrap_or_default();
    config.automatic_backups = !pick_bool(
        pick(&layers, |s| &s.disable_automatic_backup),
        "disable_automatic_backup",
    )?;

    if let Some(value) = pick(&layers, |s| &s.daily_schedule_time) {
        config.schedule_time = Some(parse_schedule_time(&value)?);
    }

    config.email = pick(&layers, |s| &s.email).and_then(|email| {
        if is_valid_email(&email) {
            Some(email)
        } else {
            warn!(%email, "ignoring invalid notification email");
            None
        }
    });

    config.database = match pick(&layers, |s| &s.database_dump_command) {
        Some(dump_command) => Some(DatabaseConfig {
            name: pick(&layers, |s| &s.database_name)
                .unwrap_or_else(|| "database".to_string()),
            dump_command,
        }),
        None => None,
    };
    if config.mode == BackupMode::DatabaseOnly && config.database.is_none() {
        return Err(SitebakError::config(
            "database_only requires database_dump_command",
        ));
    }

    if let Some(value) = pick(&layers, |s| &s.lock_ttl_minutes) {
        let minutes: u64 = value
            .parse()
            .map_err(|_| SitebakError::config(format!("Invalid lock_ttl_minutes: {value}")))?;
        let seconds = minutes
            .checked_mul(60)
            .ok_or_else(|| SitebakError::config(format!("lock_ttl_minutes too large: {value}")))?;
        config.lock_ttl = Duration::from_secs(seconds);
    }

    if let Some(prefix) = pick(&layers, |s| &s.archive_prefix) {
        if prefix.contains(&['/', '\\'][..]) || prefix.starts_with('.') {
            return Err(SitebakError::config(format!("Invalid archive_prefix: {prefix}")));
        }
        config.archive_prefix = prefix;
    }

    Ok(config)
}

/// First non-empty value of a field, searching layers in order
fn pick(layers: &[&Settings], field: fn(&Settings) -> &Option<String>) -> Option<String> {
    layers.iter().find_map(|layer| {
        field(layer)
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn pick_bool(value: Option<String>, key: &str) -> Result<bool> {
    match value {
        None => Ok(false),
        Some(value) => parse_bool(&value)
            .ok_or_else(|| SitebakError::config(format!("Invalid boolean for {key}: {value}"))),
    }
}

/// Parse a boolean value from INI string
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `HH:MM` time of day
pub fn parse_schedule_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| SitebakError::config(format!("Invalid daily_schedule_time: {value}")))
}

fn is_valid_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

/// Load the stored settings layer from an INI file; a missing file is empty
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let mut conf = Ini::new();
    conf.load(path)
        .map_err(|e| SitebakError::config(format!("Failed to parse config file: {e}")))?;

    Ok(Settings::from_lookup(|key| conf.get(SECTION, key)))
}

/// Load defaults, the INI file and environment overrides, then resolve
pub fn load_config(path: &Path) -> Result<Config> {
    let stored = load_settings(path)?;
    resolve_effective_config(&Settings::defaults(), &stored, &Settings::from_env())
}

/// Write one key into the INI file, creating it if needed
pub fn update_setting(path: &Path, key: &str, value: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(SitebakError::config(format!("Unknown setting: {key}")));
    }

    let mut conf = Ini::new();
    if path.exists() {
        conf.load(path)
            .map_err(|e| SitebakError::config(format!("Failed to parse config file: {e}")))?;
    }
    conf.set(SECTION, key, Some(value.to_string()));

    // Catch values that would make every later invocation fail
    let stored = Settings::from_lookup(|k| conf.get(SECTION, k));
    resolve_effective_config(&Settings::defaults(), &stored, &Settings::default())?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    conf.write(path)?;
    Ok(())
}

/// Get the configuration file path for the current platform
pub fn get_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return Ok(PathBuf::from(appdata).join("sitebak").join("config.ini"));
        }
    }

    if let Some(config_dir) = std::env::var_os("XDG_CONFIG_HOME") {
        Ok(PathBuf::from(config_dir).join("sitebak").join("config.ini"))
    } else if let Some(home) = std::env::var_os("HOME") {
        Ok(PathBuf::from(home)
            .join(".config")
            .join("sitebak")
            .join("config.ini"))
    } else {
        Err(SitebakError::config("Could not determine config directory"))
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(data_dir) = std::env::var_os("XDG_DATA_HOME") {
        PathBuf::from(data_dir).join("sitebak")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("sitebak")
    } else if let Some(appdata) = std::env::var_os("APPDATA") {
        PathBuf::from(appdata).join("sitebak").join("state")
    } else {
        std::env::temp_dir().join("sitebak")
    }
}

/// Create a sample configuration file
pub fn create_sample_config() -> String {
    r#"[sitebak]
# Directory tree to back up
content_root = /var/www/site

# Where archives are stored (defaults to <content_root>/backups)
# path = /srv/backups

# Number of archives to keep
max_backups = 10

# Back up only files, or only the database (not both)
files_only = false
database_only = false

# Comma separated rules: globs (*.log) or paths (wp-content/cache)
excludes =

# Daily automatic backup
disable_automatic_backup = false
daily_schedule_time = 23:00

# Command whose stdout is the database dump
# database_name = site
# database_dump_command = mysqldump --single-transaction site
"#
    .to_string()
}

/// Display the effective configuration in a user-friendly format
pub fn dump_config(config: &Config, config_path: &Path) {
    println!("sitebak Configuration");
    println!("=====================");
    println!();

    if config_path.exists() {
        println!("Config file: {} (found)", config_path.display());
    } else {
        println!(
            "Config file: {} (not found, using defaults)",
            config_path.display()
        );
    }
    println!();

    let storage = config
        .storage_path
        .clone()
        .unwrap_or_else(|| config.default_storage_path());
    let database = config
        .database
        .as_ref()
        .map(|db| format!("{} ({})", db.name, db.dump_command))
        .unwrap_or_else(|| "none".to_string());

    println!("Effective Settings:");
    println!("-------------------");
    println!("content_root         = {}", config.content_root.display());
    println!("path                 = {}", storage.display());
    println!("max_backups          = {}", config.max_backups);
    println!("mode                 = {:?}", config.mode);
    println!("excludes             = {}", config.excludes);
    println!("automatic_backups    = {}", config.automatic_backups);
    println!(
        "daily_schedule_time  = {}",
        config.effective_schedule_time().format("%H:%M")
    );
    println!("email                = {}", config.email.as_deref().unwrap_or("none"));
    println!("database             = {database}");
    println!("state_dir            = {}", config.state_dir.display());
    println!("lock_ttl_minutes     = {}", config.lock_ttl.as_secs() / 60);
    println!("archive_prefix       = {}", config.archive_prefix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn base() -> Settings {
        let mut defaults = Settings::default();
        defaults.content_root = Some("/var/www/site".to_string());
        defaults.state_dir = Some("/var/lib/sitebak".to_string());
        defaults.max_backups = Some("10".to_string());
        defaults
    }

    fn layer(pairs: &[(&str, &str)]) -> Settings {
        let mut settings = Settings::default();
        for (key, value) in pairs {
            settings.set(key, *value).unwrap();
        }
        settings
    }

    #[test]
    fn test_defaults_only() {
        let config =
            resolve_effective_config(&base(), &Settings::default(), &Settings::default()).unwrap();
        assert_eq!(config.content_root, PathBuf::from("/var/www/site"));
        assert_eq!(config.storage_path, None);
        assert_eq!(config.default_storage_path(), PathBuf::from("/var/www/site/backups"));
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.mode, BackupMode::Full);
        assert!(config.automatic_backups);
        assert_eq!(config.effective_schedule_time(), default_schedule_time());
        assert_eq!(config.lock_ttl, Duration::from_secs(120 * 60));
    }

    #[test]
    fn test_override_beats_stored() {
        let stored = layer(&[("path", "/srv/stored"), ("max_backups", "5")]);
        let overrides = layer(&[("path", "/srv/override")]);
        let config = resolve_effective_config(&base(), &stored, &overrides).unwrap();
        assert_eq!(config.storage_path, Some(PathBuf::from("/srv/override")));
        assert_eq!(config.max_backups, 5);
    }

    #[test]
    fn test_empty_override_falls_through() {
        let stored = layer(&[("path", "/srv/stored")]);
        let overrides = layer(&[("path", "  ")]);
        let config = resolve_effective_config(&base(), &stored, &overrides).unwrap();
        assert_eq!(config.storage_path, Some(PathBuf::from("/srv/stored")));
    }

    #[test]
    fn test_mode_flags() {
        let files = layer(&[("files_only", "yes")]);
        let config = resolve_effective_config(&base(), &files, &Settings::default()).unwrap();
        assert_eq!(config.mode, BackupMode::FilesOnly);
        assert!(!config.mode.includes_database());
        assert!(config.mode.includes_files());

        let db = layer(&[
            ("database_only", "1"),
            ("database_dump_command", "mysqldump site"),
        ]);
        let config = resolve_effective_config(&base(), &db, &Settings::default()).unwrap();
        assert_eq!(config.mode, BackupMode::DatabaseOnly);
        assert!(!config.mode.includes_files());
    }

    #[test]
    fn test_both_modes_rejected() {
        let stored = layer(&[("files_only", "true")]);
        let overrides = layer(&[("database_only", "true")]);
        let result = resolve_effective_config(&base(), &stored, &overrides);
        assert!(matches!(
            result,
            Err(SitebakError::ConfigurationInvalid { .. })
        ));
    }

    #[test]
    fn test_database_only_needs_dump_command() {
        let stored = layer(&[("database_only", "true")]);
        let result = resolve_effective_config(&base(), &stored, &Settings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("max_backups", "lots"),
            ("files_only", "maybe"),
            ("daily_schedule_time", "25:99"),
            ("lock_ttl_minutes", "-1"),
            ("archive_prefix", "../escape"),
        ] {
            let stored = layer(&[(key, value)]);
            let result = resolve_effective_config(&base(), &stored, &Settings::default());
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn test_lock_ttl_minutes() {
        let stored = layer(&[("lock_ttl_minutes", "30")]);
        let config = resolve_effective_config(&base(), &stored, &Settings::default()).unwrap();
        assert_eq!(config.lock_ttl, Duration::from_secs(30 * 60));

        let huge = u64::MAX.to_string();
        let stored = layer(&[("lock_ttl_minutes", huge.as_str())]);
        match resolve_effective_config(&base(), &stored, &Settings::default()) {
            Err(SitebakError::ConfigurationInvalid { message }) => {
                assert!(message.contains("too large"))
            }
            other => panic!("Expected ConfigurationInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_schedule_time_and_email() {
        let stored = layer(&[("daily_schedule_time", "03:30"), ("email", "not-an-email")]);
        let config = resolve_effective_config(&base(), &stored, &Settings::default()).unwrap();
        assert_eq!(
            config.schedule_time,
            Some(NaiveTime::from_hms_opt(3, 30, 0).unwrap())
        );
        assert_eq!(config.email, None);

        let stored = layer(&[("email", "ops@example.com")]);
        let config = resolve_effective_config(&base(), &stored, &Settings::default()).unwrap();
        assert_eq!(config.email.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn test_disable_automatic_backup() {
        let overrides = layer(&[("disable_automatic_backup", "on")]);
        let config = resolve_effective_config(&base(), &Settings::default(), &overrides).unwrap();
        assert!(!config.automatic_backups);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("OFF"), Some(false));
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool(""), None);
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_env_keys() {
        assert_eq!(env_key("path"), "SITEBAK_PATH");
        assert_eq!(env_key("max_backups"), "SITEBAK_MAX_BACKUPS");
        assert_eq!(env_key("daily_schedule_time"), "SITEBAK_DAILY_SCHEDULE_TIME");

        let env = Settings::from_lookup(|key| {
            (env_key(key) == "SITEBAK_EXCLUDES").then(|| "*.log".to_string())
        });
        assert_eq!(env.excludes.as_deref(), Some("*.log"));
        assert_eq!(env.path, None);
    }

    #[test]
    fn test_load_settings_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.ini");
        fs::write(
            &path,
            "[sitebak]\nmax_backups = 3\nexcludes = *.log, cache\n[other]\nmax_backups = 99\n",
        )
        .unwrap();

        let stored = load_settings(&path).unwrap();
        assert_eq!(stored.max_backups.as_deref(), Some("3"));
        assert_eq!(stored.excludes.as_deref(), Some("*.log, cache"));
        assert_eq!(stored.path, None);
    }

    #[test]
    fn test_load_settings_missing_file() {
        let dir = tempdir().unwrap();
        let stored = load_settings(&dir.path().join("missing.ini")).unwrap();
        assert_eq!(stored, Settings::default());
    }

    #[test]
    fn test_update_setting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        update_setting(&path, "max_backups", "4").unwrap();
        update_setting(&path, "excludes", "*.tmp").unwrap();

        let stored = load_settings(&path).unwrap();
        assert_eq!(stored.max_backups.as_deref(), Some("4"));
        assert_eq!(stored.excludes.as_deref(), Some("*.tmp"));

        assert!(update_setting(&path, "colour", "blue").is_err());
        assert!(update_setting(&path, "max_backups", "many").is_err());
        let stored = load_settings(&path).unwrap();
        assert_eq!(stored.max_backups.as_deref(), Some("4"));
    }

    #[test]
    fn test_create_sample_config() {
        let sample = create_sample_config();
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.ini");
        fs::write(&path, &sample).unwrap();

        let stored = load_settings(&path).unwrap();
        assert_eq!(stored.max_backups.as_deref(), Some("10"));
        assert_eq!(stored.daily_schedule_time.as_deref(), Some("23:00"));
    }
}
