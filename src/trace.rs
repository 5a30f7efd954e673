//! Audit trail for scoring and refinement runs, written as JSON lines.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::judge::Role;
use crate::pass::PassAudit;
use crate::refine::Dimension;

/// Per-role summary of one scoring round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleRoundSummary {
    pub role: Role,
    pub score: f64,
    pub loss: f64,
    pub mean_strength: f64,
    pub monotonicity_violations: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A judge response failed validation; a repair follows if attempts remain.
    JudgeInvalid {
        role: Role,
        attempt: u32,
        reason: String,
    },
    JudgeRecovered {
        role: Role,
        repairs: u32,
    },
    JudgeNeutralFallback {
        role: Role,
        reason: String,
    },
    RoundScored {
        pattern_id: String,
        round: u8,
        anchors: usize,
        roles: Vec<RoleRoundSummary>,
    },
    Densified {
        pattern_id: String,
        center: f64,
        added: usize,
        reasons: Vec<String>,
    },
    PassDecided {
        pattern_id: String,
        audit: PassAudit,
    },
    IterationCommitted {
        index: usize,
        iteration: usize,
        phase: String,
        status: String,
        pattern_id: String,
        mean_score: Option<f64>,
        passed: bool,
    },
    RolledBack {
        index: usize,
        pattern_id: String,
        dimension: Dimension,
        baseline: f64,
        current: f64,
    },
    SweepStarted {
        dimension: Dimension,
        base_score: f64,
    },
    SweepFinished {
        dimension: Dimension,
        attempts: usize,
        passed: bool,
    },
    RunFinished {
        terminal: String,
        passed: bool,
        final_score: Option<f64>,
        records: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(run_id: Option<Uuid>, event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id,
            event,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("audit channel closed")]
    Closed,
    #[error("audit worker failed: {0}")]
    Join(String),
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Record an event, logging instead of failing when the sink is gone.
pub(crate) fn emit(sink: Option<&dyn AuditSink>, run_id: Option<Uuid>, event: AuditEvent) {
    if let Some(sink) = sink {
        if let Err(err) = sink.record(AuditRecord::new(run_id, event)) {
            tracing::warn!(error = %err, "audit record dropped");
        }
    }
}

#[derive(Clone)]
pub struct JsonlAuditSink {
    sender: mpsc::Sender<AuditRecord>,
}

pub struct AuditWorker {
    handle: Option<std::thread::JoinHandle<Result<(), AuditError>>>,
}

impl AuditWorker {
    /// Wait for the writer to drain. All senders must be dropped first.
    pub fn join(mut self) -> Result<(), AuditError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(AuditError::Join("audit worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, AuditWorker), AuditError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<AuditRecord>();
        let handle = std::thread::spawn(move || write_audit_loop(file, receiver));
        Ok((
            Self { sender },
            AuditWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.sender.send(record).map_err(|_| AuditError::Closed)
    }
}

fn write_audit_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<AuditRecord>,
) -> Result<(), AuditError> {
    let mut writer = BufWriter::new(file);
    for record in receiver {
        let line = serde_json::to_string(&record).map_err(|e| AuditError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// In-memory sink, handy for inspecting a run after the fact.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .map_err(|_| AuditError::Closed)?
            .push(record);
        Ok(())
    }
}
