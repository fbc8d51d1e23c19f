//! Size-rotating append-only log files.
//!
//! Used for the per-app child output sinks and, when configured, the daemon
//! log itself. Rotation renames the live file to `<name>.1`, shifting older
//! backups up, then prunes backups beyond the configured count or age.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggerConfig;

/// An append-only log file that rotates itself at a size threshold.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    max_kept: u32,
    max_age_days: u32,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    /// Creates a sink at `path` with the logger's rotation settings.
    ///
    /// The file is opened lazily on first write; parent directories are
    /// created as needed.
    pub fn new(path: PathBuf, logger: &LoggerConfig) -> Self {
        Self {
            path,
            max_size: logger.max_log_size_bytes(),
            max_kept: logger.max_logs_kept,
            max_age_days: logger.max_log_age,
            file: None,
            written: 0,
        }
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.written = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(format!(".{index}"));
        PathBuf::from(os)
    }

    fn highest_backup_index(&self) -> u32 {
        let mut index = 0;
        while self.backup_path(index + 1).exists() {
            index += 1;
        }
        index
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        for index in (1..=self.highest_backup_index()).rev() {
            let _ = fs::rename(self.backup_path(index), self.backup_path(index + 1));
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.prune();
        self.written = 0;
        Ok(())
    }

    fn prune(&self) {
        let highest = self.highest_backup_index();
        for index in 1..=highest {
            let path = self.backup_path(index);
            let too_many = self.max_kept > 0 && index > self.max_kept;
            let too_old = self.max_age_days > 0
                && fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .is_some_and(|age| {
                        age > Duration::from_secs(u64::from(self.max_age_days) * 24 * 3600)
                    });
            if too_many || too_old {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size && self.written > 0 {
            self.rotate()?;
        }
        let n = self.ensure_open()?.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Clonable handle over a shared [`RotatingFile`], usable as a
/// `tracing-subscriber` writer.
#[derive(Debug, Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedWriter {
    /// Wraps a sink for shared use.
    pub fn new(file: RotatingFile) -> Self {
        Self {
            inner: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
