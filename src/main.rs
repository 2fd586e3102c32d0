use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use clap::{Arg, ArgAction, ArgMatches, Command};
use sitebak::config::{
    create_sample_config, dump_config, get_config_path, load_config, update_setting,
};
use sitebak::estimate::render;
use sitebak::reconcile::Action;
use sitebak::utils::format_size_capped;
use sitebak::{
    format_size, Engine, FileStatusStore, JobState, LogListener, PathSource, RunContext,
    SitebakError, SizeUnits, StatusStore,
};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    let result = run();
    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(error) => {
            eprintln!("Error: {error:#}");

            let Some(known) = error.downcast_ref::<SitebakError>() else {
                process::exit(1);
            };

            if known.is_recoverable() {
                eprintln!("Existing backups were left untouched.");
            }

            // Show suggestions if available
            let suggestions = known.suggestions();
            if !suggestions.is_empty() {
                eprintln!("\nSuggestions:");
                for suggestion in suggestions {
                    eprintln!("  - {suggestion}");
                }
            }

            process::exit(known.exit_code());
        }
    }
}

fn cli() -> Command {
    Command::new("sitebak")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scheduled backups of a content tree and its database")
        .long_about(
            "sitebak packages a content tree and an optional database dump into\n\
             timestamped archives and keeps a bounded history of them.\n\
             Example: sitebak run → backups/backup-20261015T230000.tar.gz",
        )
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file to use instead of the default location")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show detailed progress information")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress all output except errors")
                .global(true)
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose"),
        )
        .subcommand(Command::new("run").about("Create a backup now"))
        .subcommand(Command::new("status").about("Show the current job status and store"))
        .subcommand(
            Command::new("estimate")
                .about("Estimate the size of the next backup")
                .arg(
                    Arg::new("binary")
                        .long("binary")
                        .help("Use binary units (KiB, MiB)")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("list").about("List stored backups, oldest first"))
        .subcommand(
            Command::new("download")
                .about("Copy a backup out of the store")
                .arg(Arg::new("name").required(true).value_name("NAME"))
                .arg(
                    Arg::new("dest")
                        .required(true)
                        .value_name("DEST")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a stored backup")
                .arg(Arg::new("name").required(true).value_name("NAME")),
        )
        .subcommand(
            Command::new("set")
                .about("Write a setting into the configuration file")
                .arg(Arg::new("key").required(true).value_name("KEY"))
                .arg(Arg::new("value").required(true).value_name("VALUE")),
        )
        .subcommand(
            Command::new("config")
                .about("Display the effective configuration")
                .arg(
                    Arg::new("sample")
                        .long("sample")
                        .help("Print a commented sample configuration file instead")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("excludes").about("Show valid and invalid exclude rules"))
        .subcommand(Command::new("reconcile").about("Apply configuration changes to the store"))
        .subcommand(
            Command::new("uninstall")
                .about("Cancel the schedule and remove everything but the backups"),
        )
}

fn log_directive(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "info"
    } else {
        "warn"
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_env("SITEBAK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_directive(verbose, quiet)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> anyhow::Result<i32> {
    let matches = cli().get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    init_logging(verbose, quiet);

    let config_path = match matches.get_one::<PathBuf>("config") {
        Some(path) => path.clone(),
        None => get_config_path()?,
    };

    let Some((name, sub)) = matches.subcommand() else {
        return Err(
            SitebakError::validation("No command given. Use --help for usage information.").into(),
        );
    };

    // These two work on the settings alone
    if name == "set" {
        let key = required(sub, "key")?;
        let value = required(sub, "value")?;
        update_setting(&config_path, key, value)
            .with_context(|| format!("could not update {}", config_path.display()))?;
        if !quiet {
            println!("{key} = {value}");
        }
        return Ok(0);
    }

    if name == "config" && sub.get_flag("sample") {
        print!("{}", create_sample_config());
        return Ok(0);
    }

    let config = load_config(&config_path)
        .with_context(|| format!("could not load {}", config_path.display()))?;

    if name == "config" {
        dump_config(&config, &config_path);
        return Ok(0);
    }

    let mut engine = Engine::open(config)?;
    let applied = engine.prepare(Utc::now())?;

    match name {
        "run" => run_backup(&mut engine, verbose, quiet),
        "status" => {
            let report = engine.status(Utc::now())?;
            println!("State:       {}", report.state.describe());
            let source = match report.store.source {
                PathSource::Override => "override",
                PathSource::Stored => "stored",
                PathSource::Default => "default",
            };
            println!(
                "Store:       {} ({source}{})",
                report.store.path.display(),
                if report.store.writable { "" } else { ", not writable" }
            );
            println!("Last backup: {}", local_or_never(report.completed_at));
            println!("Next run:    {}", local_or_never(report.next_run));
            Ok(0)
        }
        "estimate" => {
            let units = if sub.get_flag("binary") {
                SizeUnits::Binary
            } else {
                SizeUnits::Si
            };
            let bytes = engine.estimate(Utc::now())?;
            println!("{}", render(bytes, units));
            Ok(0)
        }
        "list" => {
            let artifacts = engine.list()?;
            if artifacts.is_empty() {
                if !quiet {
                    println!("No backups in {}", engine.store().path.display());
                }
                return Ok(0);
            }
            // One unit for the whole column so sizes compare at a glance
            for artifact in &artifacts {
                let created: DateTime<Local> = artifact.created.into();
                println!(
                    "{}  {:>12}  {}",
                    created.format("%Y-%m-%d %H:%M:%S"),
                    format_size_capped(artifact.size, SizeUnits::Si, "MB"),
                    artifact.name
                );
            }
            if !quiet {
                println!(
                    "{} backups, {} total",
                    artifacts.len(),
                    format_size(engine.total_size()?, SizeUnits::Si)
                );
            }
            Ok(0)
        }
        "download" => {
            let artifact = required(sub, "name")?;
            let dest = sub
                .get_one::<PathBuf>("dest")
                .ok_or_else(|| SitebakError::validation("missing destination"))?;
            let copied = engine.download(artifact, dest)?;
            if !quiet {
                println!("Copied {artifact} to {}", copied.display());
            }
            Ok(0)
        }
        "delete" => {
            let artifact = required(sub, "name")?;
            let deleted = engine.delete(artifact, Utc::now())?;
            if !quiet {
                println!("Deleted {}", deleted.display());
            }
            Ok(0)
        }
        "excludes" => {
            let classified = engine.excludes();
            println!("Valid:   {}", classified.valid.join(", "));
            println!("Invalid: {}", classified.invalid.join(", "));
            Ok(if classified.invalid.is_empty() { 0 } else { 1 })
        }
        "reconcile" => {
            if applied.is_empty() {
                if !quiet {
                    println!("Nothing to do");
                }
            } else {
                for action in &applied {
                    println!("{}", describe_action(action));
                }
            }
            Ok(0)
        }
        "uninstall" => {
            let report = engine.uninstall(Utc::now())?;
            if !quiet {
                println!("Removed {} entries from the store", report.deleted.len());
            }
            for path in &report.failed {
                eprintln!("Could not remove {}", path.display());
            }
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        other => Err(SitebakError::validation(format!("Unknown command: {other}")).into()),
    }
}

fn run_backup(engine: &mut Engine, verbose: bool, quiet: bool) -> anyhow::Result<i32> {
    let context = RunContext::new();
    engine.set_context(context.clone());
    setup_signal_handler(context, engine.config().state_dir.clone())?;

    engine.add_listener(Box::new(LogListener));
    #[cfg(feature = "progress")]
    {
        use sitebak::{ProgressConfig, SpinnerListener};
        if !quiet {
            engine.add_listener(Box::new(SpinnerListener::new(ProgressConfig::auto_detect())));
        }
    }

    let summary = engine.run(Utc::now())?;

    if verbose {
        println!("Created: {}", summary.artifact.display());
        println!("  Files: {}", summary.files);
        println!("  Size: {}", format_size(summary.bytes, SizeUnits::Si));
        println!("  Database: {}", if summary.database { "yes" } else { "no" });
        println!("  Duration: {:.2}s", summary.duration.as_secs_f64());
    } else if !quiet {
        println!("{}", summary.summary());
    }

    Ok(0)
}

fn setup_signal_handler(context: RunContext, state_dir: PathBuf) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        context.set_interrupted(true);
        eprintln!("\nInterrupted by user. Cleaning up...");

        context.cleanup_in_flight();
        if let Some(token) = context.lock_token() {
            let interrupted = JobState::Error {
                message: "interrupted".to_string(),
                at: Utc::now(),
            };
            if let Err(e) = FileStatusStore::new(&state_dir).release(token, &interrupted) {
                eprintln!("Could not release the run lock: {e}");
            }
        }

        process::exit(SitebakError::Interrupted.exit_code());
    })
    .context("Error setting Ctrl-C handler")
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> anyhow::Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| SitebakError::validation(format!("missing {id}")).into())
}

fn local_or_never(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| {
        t.with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_else(|| "never".to_string())
}

fn describe_action(action: &Action) -> String {
    match action {
        Action::CancelSchedule => "Cancelled the daily schedule".to_string(),
        Action::InstallSchedule(schedule) => format!(
            "Scheduled daily backups at {} (next {})",
            schedule.time.format("%H:%M"),
            local_or_never(Some(schedule.next_run))
        ),
        Action::Relocate { from, to } => {
            format!("Moved the store from {} to {}", from.display(), to.display())
        }
        Action::RecordPath(path) => format!("Store is {}", path.display()),
        Action::InvalidateEstimate => "Backup set changed, estimate will be recomputed".to_string(),
    }
}
