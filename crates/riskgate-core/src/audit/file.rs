//! File-backed audit sink.
//!
//! Writes JSON-lines through a dedicated writer thread fed by a
//! bounded channel, with buffered I/O and size-based rotation. Reads
//! (query/stats) go straight to the files and tolerate corrupt lines.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::TrySendError;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::AuditConfig;
use crate::error::{Result, ScoreError};

use super::{AuditFilter, AuditRecord, AuditSink, AuditStats};

/// Flush interval for the buffered writer.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Flush after this many records.
const FLUSH_RECORD_COUNT: usize = 100;

enum WriterCommand {
    Write(Box<AuditRecord>),
    Flush(std::sync::mpsc::Sender<()>),
    Shutdown,
}

struct WriterState {
    writer: BufWriter<File>,
    log_path: PathBuf,
    max_file_bytes: u64,
    max_rotated_files: usize,
    records_since_flush: usize,
    last_flush: Instant,
}

impl WriterState {
    fn write_record(&mut self, record: &AuditRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{json}")?;
        self.records_since_flush += 1;

        if self.records_since_flush >= FLUSH_RECORD_COUNT
            || self.last_flush.elapsed() >= FLUSH_INTERVAL
        {
            self.flush()?;
        }

        if let Ok(meta) = fs::metadata(&self.log_path) {
            if meta.len() >= self.max_file_bytes {
                self.flush()?;
                self.rotate()?;
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.records_since_flush = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        let max = self.max_rotated_files;
        if max == 0 {
            return Ok(());
        }

        let oldest = rotated_path(&self.log_path, max);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        // Shift .N -> .N+1 from the highest down to avoid overwrites.
        for i in (1..max).rev() {
            let from = rotated_path(&self.log_path, i);
            let to = rotated_path(&self.log_path, i + 1);
            if from.exists() {
                fs::rename(&from, &to)?;
            }
        }

        if self.log_path.exists() {
            fs::rename(&self.log_path, rotated_path(&self.log_path, 1))?;
        }

        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        self.writer = BufWriter::new(new_file);

        Ok(())
    }
}

/// JSON-lines audit log with a dedicated writer thread.
pub struct FileAuditSink {
    log_path: PathBuf,
    config: AuditConfig,
    sender: std::sync::mpsc::SyncSender<WriterCommand>,
    writer_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FileAuditSink {
    /// Open (or create) the audit log and spawn the writer thread.
    pub fn new(log_path: PathBuf, config: AuditConfig) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (sender, receiver) =
            std::sync::mpsc::sync_channel::<WriterCommand>(config.queue_capacity.max(1));

        let mut state = WriterState {
            writer: BufWriter::new(file),
            log_path: log_path.clone(),
            max_file_bytes: config.max_file_bytes.max(1),
            max_rotated_files: config.max_rotated_files,
            records_since_flush: 0,
            last_flush: Instant::now(),
        };

        let writer_handle = std::thread::spawn(move || {
            while let Ok(cmd) = receiver.recv() {
                match cmd {
                    WriterCommand::Write(record) => {
                        if let Err(e) = state.write_record(&record) {
                            warn!(error = %e, "failed to write audit record");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        if let Err(e) = state.flush() {
                            warn!(error = %e, "failed to flush audit log");
                        }
                        let _ = done.send(());
                    }
                    WriterCommand::Shutdown => break,
                }
            }
            let _ = state.flush();
        });

        Ok(Self {
            log_path,
            config,
            sender,
            writer_handle: Mutex::new(Some(writer_handle)),
        })
    }

    /// Flush pending writes and wait for the writer to confirm.
    pub fn flush(&self) {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        if self.sender.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
        }
    }

    /// Flush and stop the writer thread.
    pub fn shutdown(&self) {
        self.flush();
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Ok(mut guard) = self.writer_handle.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }

    /// Records matching `filter` from the current file, newest first.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        self.flush();

        let file = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Skip corrupt lines.
            let record: AuditRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if filter.matches(&record) {
                records.push(record);
            }
        }

        records.reverse();
        if filter.limit > 0 && records.len() > filter.limit {
            records.truncate(filter.limit);
        }
        Ok(records)
    }

    /// Summary over the current and rotated files.
    pub fn stats(&self) -> Result<AuditStats> {
        self.flush();

        let mut records = Vec::new();
        for i in (1..=self.config.max_rotated_files).rev() {
            let path = rotated_path(&self.log_path, i);
            if path.exists() {
                read_records_from_file(&path, &mut records);
            }
        }
        if self.log_path.exists() {
            read_records_from_file(&self.log_path, &mut records);
        }

        Ok(compute_stats(&records))
    }
}

impl AuditSink for FileAuditSink {
    fn log(&self, record: &AuditRecord) -> Result<()> {
        // try_send keeps the caller from ever blocking on disk; a full
        // queue drops the record.
        match self
            .sender
            .try_send(WriterCommand::Write(Box::new(record.clone())))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ScoreError::AuditQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ScoreError::PipelineClosed),
        }
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Ok(mut guard) = self.writer_handle.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

fn read_records_from_file(path: &Path, records: &mut Vec<AuditRecord>) {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return,
    };
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => continue,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<AuditRecord>(line) {
            records.push(record);
        }
    }
}

pub(crate) fn rotated_path(base: &Path, n: usize) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".{n}"));
    PathBuf::from(s)
}

fn compute_stats(records: &[AuditRecord]) -> AuditStats {
    let mut stats = AuditStats {
        total_events: records.len() as u64,
        ..Default::default()
    };
    let mut users = HashSet::new();
    for r in records {
        let tier = format!("{:?}", r.risk_tier).to_lowercase();
        *stats.by_tier.entry(tier).or_insert(0) += 1;
        let decision = format!("{:?}", r.decision).to_lowercase();
        *stats.by_decision.entry(decision).or_insert(0) += 1;
        if r.degraded.is_some() {
            stats.degraded += 1;
        }
        if r.cold_start {
            stats.cold_start += 1;
        }
        users.insert(r.user_id.as_str());
    }
    stats.unique_users = users.len() as u64;
    stats
}
