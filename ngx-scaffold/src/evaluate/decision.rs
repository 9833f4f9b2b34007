//! Startup decision table.
//!
//! `must_die` inverts what a successful startup means. The inversion is a
//! single pure function so the rest of the evaluator never has to know
//! about it.

use crate::lifecycle::StartupOutcome;

use super::{Expectation, Mismatch};

/// Whether request/response evaluation should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The server is up as expected; send the request.
    Continue,
    /// Skip the request and response checks. Log checks still run.
    ShortCircuit,
}

/// Outcome of [`startup_decision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupDecision {
    /// What happens next.
    pub flow: Flow,
    /// Mismatches decided by the startup alone.
    pub mismatches: Vec<Mismatch>,
}

/// Maps `(startup outcome, must_die)` to the next step.
///
/// | outcome | `must_die` | flow          | mismatch |
/// |---------|------------|---------------|----------|
/// | ready   | no         | Continue      | none     |
/// | ready   | yes        | ShortCircuit  | MustDie  |
/// | failed  | no         | ShortCircuit  | Startup  |
/// | failed  | yes        | ShortCircuit  | none     |
#[must_use]
pub fn startup_decision(outcome: &StartupOutcome, must_die: bool) -> StartupDecision {
    match (outcome, must_die) {
        (StartupOutcome::Failed(_), true) => StartupDecision {
            flow: Flow::ShortCircuit,
            mismatches: Vec::new(),
        },
        (StartupOutcome::Failed(failure), false) => StartupDecision {
            flow: Flow::ShortCircuit,
            mismatches: vec![Mismatch::new(
                Expectation::Startup,
                "server accepting connections",
                failure.to_string(),
                "the server failed to start",
            )],
        },
        (ready, true) => StartupDecision {
            flow: Flow::ShortCircuit,
            mismatches: vec![Mismatch::new(
                Expectation::MustDie,
                "server startup failure",
                format!("server {}", describe_ready(ready)),
                "the block declares must_die but the server came up",
            )],
        },
        (_, false) => StartupDecision {
            flow: Flow::Continue,
            mismatches: Vec::new(),
        },
    }
}

const fn describe_ready(outcome: &StartupOutcome) -> &'static str {
    match outcome {
        StartupOutcome::Started => "started",
        StartupOutcome::Reused => "was already running",
        StartupOutcome::Reloaded => "reloaded",
        StartupOutcome::Failed(_) => "failed",
    }
}
