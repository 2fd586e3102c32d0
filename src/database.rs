use crate::config::DatabaseConfig;
use crate::error::SitebakError;
use crate::Result;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// The database half of a backup
pub trait Database {
    /// Name used for the dump entry inside the artifact
    fn name(&self) -> &str;

    /// Bytes of table data, used by the size estimate
    fn data_length(&self) -> Result<u64>;

    /// Write a full dump to `out`. A failure to write to `out` is
    /// reported as `Io`, a failure to produce the dump as `DumpFailed`.
    fn dump(&self, out: &mut dyn Write) -> Result<()>;
}

/// Runs an external dump command (e.g. `mysqldump ...`) through the shell
/// and streams its stdout, so quoting in the command works as typed
#[derive(Debug, Clone)]
pub struct CommandDatabase {
    name: String,
    command: String,
}

/// Notes whether the wrapped writer failed, so a failed copy can be blamed
/// on the right side
struct WatchedWriter<'a> {
    inner: &'a mut dyn Write,
    failed: bool,
}

impl Write for WatchedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).map_err(|e| {
            self.failed = true;
            e
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|e| {
            self.failed = true;
            e
        })
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}

impl CommandDatabase {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let command = config.dump_command.trim();
        if command.is_empty() {
            return Err(SitebakError::config("database_dump_command is empty"));
        }

        Ok(CommandDatabase {
            name: config.name.clone(),
            command: command.to_string(),
        })
    }

    /// Errors writing to `out` come back as `Io`; everything on the
    /// command's side is `DumpFailed`
    fn run(&self, out: &mut dyn Write) -> Result<u64> {
        debug!(command = %self.command, "starting database dump");
        let mut child = shell(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SitebakError::dump(format!("could not start {}: {e}", self.command)))?;

        // Drain stderr on its own thread so a chatty command cannot block stdout
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let mut watched = WatchedWriter {
            inner: out,
            failed: false,
        };
        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, &mut watched),
            None => Ok(0),
        };
        if copied.is_err() {
            let _ = child.kill();
        }

        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let status = child
            .wait()
            .map_err(|e| SitebakError::dump(format!("{} did not exit: {e}", self.command)))?;

        let copied = match (copied, watched.failed) {
            (Ok(copied), _) => copied,
            (Err(e), true) => return Err(e.into()),
            (Err(e), false) => {
                return Err(SitebakError::dump(format!("reading dump output: {e}")))
            }
        };
        if !status.success() {
            return Err(SitebakError::dump(format!(
                "{} exited with {status}: {}",
                self.command,
                stderr.trim()
            )));
        }

        Ok(copied)
    }
}

impl Database for CommandDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    /// The length of a dump; the command offers no table statistics.
    ///
    /// This runs the whole dump into a sink, so it costs as much as the
    /// dump itself. The estimate caches the result.
    fn data_length(&self) -> Result<u64> {
        self.run(&mut io::sink())
    }

    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        self.run(out).map(|_| ())
    }
}
