use super::event::{AuditDraft, AuditEventKind, AuditRecord};
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const AUDIT_LOG_FILE: &str = "audit.log";
const DEFAULT_SINK_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to append to audit log {path}: {source}")]
    Append {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode audit record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Bounded buffer between the emitter and the external log shipper. A full
/// queue drops the oldest entry rather than blocking the run; drops are
/// counted and later surfaced as an audit event of their own.
#[derive(Debug)]
pub struct BoundedSinkQueue {
    capacity: usize,
    state: Mutex<SinkState>,
}

#[derive(Debug, Default)]
struct SinkState {
    queue: VecDeque<AuditRecord>,
    dropped: u64,
}

impl BoundedSinkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }

    pub fn push(&self, record: AuditRecord) {
        let mut state = self.state.lock().expect("sink queue poisoned");
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            state.dropped = state.dropped.saturating_add(1);
        }
        state.queue.push_back(record);
    }

    /// Drain everything currently queued; called by the shipper worker.
    pub fn drain(&self) -> Vec<AuditRecord> {
        let mut state = self.state.lock().expect("sink queue poisoned");
        state.queue.drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.lock().expect("sink queue poisoned").dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("sink queue poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single choke point for audit events in a run. Appends one JSON
/// object per line to `audit.log`, assigns strictly increasing sequence
/// numbers starting at 1, and mirrors every record into the sink queue.
pub struct AuditEmitter {
    path: PathBuf,
    file: fs::File,
    next_seq: u64,
    sink: Option<std::sync::Arc<BoundedSinkQueue>>,
    sink_drops_reported: u64,
}

impl AuditEmitter {
    /// Open (or create) the audit log for `run_dir`. When the log already
    /// has entries, sequencing continues after the last persisted record so
    /// resume never reuses a number.
    pub fn open(
        run_dir: &Path,
        sink: Option<std::sync::Arc<BoundedSinkQueue>>,
    ) -> Result<Self, AuditError> {
        let path = run_dir.join(AUDIT_LOG_FILE);
        let last_seq = read_last_seq(&path)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            file,
            next_seq: last_seq + 1,
            sink,
            sink_drops_reported: 0,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.path
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append a draft as the next record. `now` is epoch seconds; the
    /// caller owns the clock so tests stay reproducible.
    pub fn emit(&mut self, draft: AuditDraft, now: i64) -> Result<u64, AuditError> {
        let record = AuditRecord {
            seq: self.next_seq,
            timestamp: format_timestamp(now),
            event: draft.event,
            details: draft.details,
            actor: draft.actor,
            cost: draft.cost,
        };
        let seq = record.seq;
        self.write_record(&record)?;
        self.next_seq += 1;

        if let Some(sink) = self.sink.clone() {
            sink.push(record);
            let dropped = sink.dropped_count();
            if dropped > self.sink_drops_reported {
                let newly_dropped = dropped - self.sink_drops_reported;
                self.sink_drops_reported = dropped;
                let mut details = Map::new();
                details.insert(
                    "reason".to_string(),
                    Value::String("audit_sink_overflow".to_string()),
                );
                details.insert("dropped_events".to_string(), Value::from(newly_dropped));
                let overflow = AuditRecord {
                    seq: self.next_seq,
                    timestamp: format_timestamp(now),
                    event: AuditEventKind::WorkflowError,
                    details,
                    actor: None,
                    cost: None,
                };
                self.write_record(&overflow)?;
                self.next_seq += 1;
                // The overflow report goes to the sink outside the drop
                // check; any drop it causes is counted on the next emit.
                sink.push(overflow);
            }
        }
        Ok(seq)
    }

    fn write_record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record).map_err(AuditError::Encode)?;
        writeln!(self.file, "{line}").map_err(|source| AuditError::Append {
            path: self.path.display().to_string(),
            source,
        })?;
        if record.event.requires_fsync() {
            self.file.sync_all().map_err(|source| AuditError::Append {
                path: self.path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn emit_all(&mut self, drafts: Vec<AuditDraft>, now: i64) -> Result<(), AuditError> {
        for draft in drafts {
            self.emit(draft, now)?;
        }
        Ok(())
    }
}

fn format_timestamp(now: i64) -> String {
    DateTime::from_timestamp(now, 0)
        .map(|ts| ts.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| format!("epoch:{now}"))
}

fn read_last_seq(path: &Path) -> Result<u64, AuditError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(AuditError::Open {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let mut last = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| AuditError::Open {
            path: path.display().to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<AuditRecord>(&line) {
            last = last.max(record.seq);
        }
    }
    Ok(last)
}

/// Read a full audit log back as ordered records. Used to assemble the
/// audit trail carried by a governed result.
pub fn read_audit_log(run_dir: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let path = run_dir.join(AUDIT_LOG_FILE);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AuditError::Open {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| AuditError::Open {
            path: path.display().to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str::<AuditRecord>(&line).map_err(AuditError::Encode)?);
    }
    Ok(records)
}
