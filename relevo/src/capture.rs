//! Child output capture.
//!
//! Each instance's stdout and stderr pipes are consumed line by line; every
//! line becomes one record tagged with the instance id and a timestamp,
//! appended to the owning app's log sinks.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::warn;

use crate::config::{AppConfig, LoggerConfig};
use crate::logfile::RotatingFile;

/// Per-app stdout/stderr sinks shared by all of the app's instances.
#[derive(Debug)]
pub struct AppSinks {
    app: String,
    stdout: Mutex<RotatingFile>,
    stderr: Mutex<RotatingFile>,
}

impl AppSinks {
    /// Opens the app's sinks at their configured (or defaulted) paths.
    ///
    /// Config validation guarantees both paths are set.
    pub fn new(config: &AppConfig, logger: &LoggerConfig) -> Self {
        let stdout_path = config.stdout_log_file.clone().unwrap_or_default();
        let stderr_path = config.stderr_log_file.clone().unwrap_or_default();
        Self {
            app: config.name.clone(),
            stdout: Mutex::new(RotatingFile::new(stdout_path, logger)),
            stderr: Mutex::new(RotatingFile::new(stderr_path, logger)),
        }
    }

    fn append(&self, sink: &Mutex<RotatingFile>, instance: u32, line: &str) {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(sink, "[{instance}/{now}] {line}") {
            warn!(app = %self.app, instance, error = %e, "log write error");
        }
    }
}

/// Spawns the two reader tasks draining an instance's output pipes.
pub fn spawn_line_readers(
    instance: u32,
    stdout: ChildStdout,
    stderr: ChildStderr,
    sinks: Arc<AppSinks>,
) {
    let out_sinks = Arc::clone(&sinks);
    tokio::spawn(async move {
        read_lines(stdout, |line| out_sinks.append(&out_sinks.stdout, instance, line)).await;
    });
    tokio::spawn(async move {
        read_lines(stderr, |line| sinks.append(&sinks.stderr, instance, line)).await;
    });
}

/// Reads `\n`-terminated lines until EOF, trimming a trailing `\r`.
async fn read_lines<R>(reader: R, mut record: impl FnMut(&str))
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let mut line = buf.as_slice();
                if line.last() == Some(&b'\n') {
                    line = &line[..line.len() - 1];
                }
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                record(&String::from_utf8_lossy(line));
            }
            Err(e) => {
                warn!(error = %e, "pipe read error");
                return;
            }
        }
    }
}
