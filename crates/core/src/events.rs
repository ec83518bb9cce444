use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Cooperative cancellation flag, checked at least once per file by
/// long-running operations.
pub type CancelFlag = Arc<AtomicBool>;

pub(crate) fn is_cancelled(flag: Option<&CancelFlag>) -> bool {
    flag.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOperation {
    Detect,
    Duplication,
    Repair,
    IntegrityCheck,
    IntegrityRepair,
    Rebalance,
    Lifecycle,
}

/// Structured progress event emitted by long-running engine operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub seq: u64,
    pub operation: EngineOperation,
    pub phase: String,
    pub current_path: Option<String>,
    pub processed: u64,
    pub errors: u64,
    pub timestamp: String,
}

/// Receiver for engine events. Injected at construction; the engine keeps
/// no other process-wide state.
pub trait EngineSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EngineSink for NoopSink {
    fn emit(&self, _event: &EngineEvent) {}
}

/// Forwards events to the `tracing` subscriber at info level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EngineSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        tracing::info!(
            seq = event.seq,
            operation = ?event.operation,
            phase = %event.phase,
            path = event.current_path.as_deref().unwrap_or(""),
            processed = event.processed,
            errors = event.errors,
            "engine progress"
        );
    }
}

/// Buffers events for inspection; used by tests and embedders that render
/// their own progress.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }
}

impl EngineSink for CollectingSink {
    fn emit(&self, event: &EngineEvent) {
        self.events.lock().expect("sink poisoned").push(event.clone());
    }
}

/// Per-operation event sequencer.
pub(crate) struct Emitter<'a> {
    sink: &'a dyn EngineSink,
    operation: EngineOperation,
    seq: u64,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(sink: &'a dyn EngineSink, operation: EngineOperation) -> Self {
        Emitter {
            sink,
            operation,
            seq: 0,
        }
    }

    pub(crate) fn emit(
        &mut self,
        phase: &str,
        current_path: Option<&Path>,
        processed: u64,
        errors: u64,
    ) {
        self.seq = self.seq.saturating_add(1);
        self.sink.emit(&EngineEvent {
            seq: self.seq,
            operation: self.operation,
            phase: phase.to_string(),
            current_path: current_path.map(|path| path.to_string_lossy().to_string()),
            processed,
            errors,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
    }
}
