//! Append-only relay log.
//!
//! Every step of a webhook cycle is written as one timestamped line:
//!
//! ```text
//! [2024-05-01 13:37:00] Received webhook data: {"id":123} (client verified: SUCCESS)
//! ```
//!
//! The sink is injected into the handler state, so the request path never
//! deals with paths, directories or permissions. Entries are also mirrored
//! to `tracing`.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use crate::Config;

/// Timestamp format used for log entries and diagnostics.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const LOG_CHANNEL_CAPACITY: usize = 4096;

/// Destination for relay log entries.
///
/// Implementations must write each entry atomically and stamp entries in
/// the order they are appended: concurrent requests may append at the same
/// time, lines must never interleave and timestamps never go backwards.
pub trait LogSink: Send + Sync {
    /// Append one entry. Failures are reported, never propagated.
    fn append(&self, message: &str);
}

/// Current local time in the log timestamp format.
pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Render a single entry, without the trailing newline.
///
/// Line breaks inside the message are escaped so one entry is one line.
pub fn format_entry(timestamp: &str, message: &str) -> String {
    if message.contains(['\n', '\r']) {
        let escaped = message.replace('\r', "\\r").replace('\n', "\\n");
        format!("[{}] {}", timestamp, escaped)
    } else {
        format!("[{}] {}", timestamp, message)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves the data usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// File Sink
// =============================================================================

enum Command {
    Entry(String),
    Flush(mpsc::SyncSender<()>),
}

/// Where and how the log file is created.
#[derive(Debug, Clone)]
struct LogFile {
    path: PathBuf,
    dir_mode: u32,
    file_mode: u32,
}

impl LogFile {
    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                let mut builder = DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(self.dir_mode);
                }
                builder.create(parent)?;
                info!(directory = %parent.display(), "relay_log_directory_created");
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.file_mode);
        }

        let file = options.open(&self.path)?;
        if !file.metadata()?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("relay log must be a regular file: {}", self.path.display()),
            ));
        }

        info!(path = %self.path.display(), "relay_log_opened");
        Ok(file)
    }
}

/// Log sink backed by a file and a dedicated writer thread.
///
/// The file (and any missing parent directory) is created when the sink is
/// built, so configuration problems surface at startup. `append` only
/// enqueues; the writer thread stamps and writes entries in queue order.
/// A full queue drops the file entry (it is still in `tracing`). If a write
/// fails the writer reopens the file for the next entry.
pub struct FileLogSink {
    path: PathBuf,
    sender: mpsc::SyncSender<Command>,
    dropped: AtomicU64,
}

impl FileLogSink {
    /// Create directories, open the file and start the writer thread.
    ///
    /// Missing parent directories get `dir_mode` and a new file gets
    /// `file_mode` (unix only; the process umask still applies).
    pub fn open(path: impl Into<PathBuf>, dir_mode: u32, file_mode: u32) -> Result<Self> {
        let log_file = LogFile {
            path: path.into(),
            dir_mode,
            file_mode,
        };
        let file = log_file
            .open()
            .with_context(|| format!("Failed to open relay log {}", log_file.path.display()))?;

        let path = log_file.path.clone();
        let (sender, receiver) = mpsc::sync_channel(LOG_CHANNEL_CAPACITY);

        std::thread::Builder::new()
            .name("efi-relay-log".to_string())
            .spawn(move || log_writer(log_file, file, receiver))
            .context("Failed to spawn relay log writer")?;

        Ok(Self {
            path,
            sender,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(&config.log_file, config.log_dir_mode, config.log_file_mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until every entry appended so far has been written.
    ///
    /// Meant for shutdown and tests, not for the request path.
    pub fn flush(&self) {
        let (ack, done) = mpsc::sync_channel(1);
        if self.sender.send(Command::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

impl LogSink for FileLogSink {
    fn append(&self, message: &str) {
        info!(entry = %message, "relay_log_entry");

        match self.sender.try_send(Command::Entry(message.to_string())) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(
                        dropped = dropped,
                        path = %self.path.display(),
                        "relay_log_queue_full"
                    );
                }
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                warn!(path = %self.path.display(), "relay_log_writer_stopped");
            }
        }
    }
}

fn log_writer(log_file: LogFile, file: File, receiver: mpsc::Receiver<Command>) {
    let mut file = Some(file);

    for command in receiver {
        match command {
            Command::Entry(message) => {
                // Stamped here so file order and timestamp order agree.
                let mut line = format_entry(&timestamp(), &message);
                line.push('\n');

                if file.is_none() {
                    match log_file.open() {
                        Ok(reopened) => file = Some(reopened),
                        Err(e) => {
                            warn!(
                                path = %log_file.path.display(),
                                error = %e,
                                "relay_log_reopen_failed"
                            );
                            continue;
                        }
                    }
                }

                if let Some(handle) = file.as_mut() {
                    if let Err(e) = handle.write_all(line.as_bytes()) {
                        warn!(
                            path = %log_file.path.display(),
                            error = %e,
                            "relay_log_write_failed"
                        );
                        file = None;
                    }
                }
            }
            Command::Flush(ack) => {
                if let Some(handle) = file.as_mut() {
                    let _ = handle.flush();
                }
                let _ = ack.send(());
            }
        }
    }
}

// =============================================================================
// Memory Sink
// =============================================================================

/// Log sink that keeps entries in memory.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Number of entries containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.contains(needle))
            .count()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, message: &str) {
        info!(entry = %message, "relay_log_entry");

        let mut entries = lock(&self.entries);
        entries.push(format_entry(&timestamp(), message));
    }
}
