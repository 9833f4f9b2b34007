//! Structured event stream.
//!
//! Discrete, typed events emitted while a suite runs. Events are written as
//! newline-delimited JSON, each carrying the run id and a monotonically
//! increasing sequence number so consumers can merge and order streams.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event variants
// ---------------------------------------------------------------------------

/// A discrete event emitted during a run.
///
/// Serialized with a `"type"` tag so consumers can dispatch on the kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A suite document was parsed and is about to run.
    SuiteStarted {
        /// When the suite started.
        timestamp: DateTime<Utc>,
        /// Suite source name.
        source: String,
        /// Active test mode.
        mode: String,
        /// Number of blocks selected to run.
        blocks: usize,
    },

    /// A block is about to run.
    BlockStarted {
        /// When the block started.
        timestamp: DateTime<Utc>,
        /// 1-based block ordinal.
        ordinal: usize,
        /// Block title.
        title: String,
    },

    /// The server-under-test reached readiness.
    ServerStarted {
        /// When readiness was observed.
        timestamp: DateTime<Utc>,
        /// Process id, if known.
        pid: Option<u32>,
        /// Log generation that started.
        generation: u64,
        /// Address readiness was probed at.
        listen: String,
    },

    /// The server-under-test accepted a new configuration.
    ServerReloaded {
        /// When the reload settled.
        timestamp: DateTime<Utc>,
        /// Process id, if known.
        pid: Option<u32>,
        /// Log generation that started.
        generation: u64,
    },

    /// The server-under-test was stopped and reaped.
    ServerStopped {
        /// When the process was reaped.
        timestamp: DateTime<Utc>,
        /// Process id, if known.
        pid: Option<u32>,
        /// Human-readable stop reason.
        reason: String,
    },

    /// A block produced its verdict.
    BlockFinished {
        /// When the verdict was recorded.
        timestamp: DateTime<Utc>,
        /// 1-based block ordinal.
        ordinal: usize,
        /// Block title.
        title: String,
        /// Overall pass/fail.
        passed: bool,
        /// Number of mismatches in the verdict.
        mismatches: usize,
        /// Wall time spent on the block.
        duration_ms: u64,
    },

    /// The suite finished (normally or with a fatal error).
    SuiteFinished {
        /// When the suite finished.
        timestamp: DateTime<Utc>,
        /// Suite source name.
        source: String,
        /// Blocks that passed.
        passed: usize,
        /// Blocks that failed.
        failed: usize,
        /// Suite-level fatal error, if the run was halted.
        fatal: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EventEnvelope {
    sequence: u64,
    run_id: Uuid,
    #[serde(flatten)]
    event: Event,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Thread-safe, buffered JSONL event writer.
///
/// Serialization or I/O failures are dropped: observability must never
/// change the outcome of a test run.
pub struct EventEmitter {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
    sequence: AtomicU64,
    run_id: Uuid,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("run_id", &self.run_id)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// Creates an emitter that writes to the given writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            sequence: AtomicU64::new(0),
            run_id: Uuid::new_v4(),
        }
    }

    /// Creates an emitter that silently discards all events.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// Creates an emitter that writes to a file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// The id stamped on every event of this run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Emits an event as a single JSONL line.
    pub fn emit(&self, event: Event) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope {
            sequence,
            run_id: self.run_id,
            event,
        };

        if let Ok(mut w) = self.writer.lock() {
            if let Ok(line) = serde_json::to_string(&envelope) {
                let _ = writeln!(w, "{line}");
                let _ = w.flush();
            }
        }
    }

    /// Returns the number of events emitted so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::noop()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
