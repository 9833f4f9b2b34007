//! TAP-style reporter.
//!
//! One plan line per suite, one `ok` / `not ok` line per block, mismatch
//! diagnostics as `#` comments, and `Bail out!` when a suite cannot go on.

use std::io::{self, Write};
use std::time::Duration;

use crate::evaluate::BlockOutcome;

/// Longest excerpt of expected/actual text printed per mismatch.
const EXCERPT_LIMIT: usize = 300;

/// Totals for one suite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteSummary {
    /// Suite source name.
    pub source: String,
    /// Blocks that passed.
    pub passed: usize,
    /// Blocks that failed.
    pub failed: usize,
    /// Selected blocks that never ran because the suite stopped early.
    pub not_run: usize,
    /// Suite-level fatal error, if the suite was halted.
    pub fatal: Option<String>,
    /// Wall time.
    pub duration: Duration,
}

impl SuiteSummary {
    /// Blocks that produced a verdict.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.passed + self.failed
    }

    /// Whether every selected block ran and passed.
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.failed == 0 && self.not_run == 0 && self.fatal.is_none()
    }
}

/// Writes the TAP stream.
#[derive(Debug)]
pub struct Reporter<W: Write> {
    out: W,
    counter: usize,
}

impl<W: Write> Reporter<W> {
    /// Creates a reporter writing to `out`.
    pub const fn new(out: W) -> Self {
        Self { out, counter: 0 }
    }

    /// Starts a suite: a comment naming it plus the plan.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the output cannot be written.
    pub fn plan(&mut self, source: &str, blocks: usize) -> io::Result<()> {
        self.counter = 0;
        writeln!(self.out, "# {source}")?;
        writeln!(self.out, "1..{blocks}")?;
        self.out.flush()
    }

    /// Reports one block.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the output cannot be written.
    pub fn block(&mut self, outcome: &BlockOutcome) -> io::Result<()> {
        self.counter += 1;
        let status = if outcome.passed() { "ok" } else { "not ok" };
        writeln!(
            self.out,
            "{status} {} - {}",
            self.counter,
            outcome.verdict.title()
        )?;

        for mismatch in outcome.verdict.mismatches() {
            writeln!(
                self.out,
                "#   {}: expected {}, got {}",
                mismatch.expectation,
                excerpt(&mismatch.expected),
                excerpt(&mismatch.actual)
            )?;
            if !mismatch.diagnostic.is_empty() {
                writeln!(self.out, "#     {}", mismatch.diagnostic)?;
            }
        }
        if let Some(report) = &outcome.instrumentation {
            for finding in &report.findings {
                writeln!(self.out, "#   instrumentation: {}", excerpt(finding))?;
            }
        }
        for note in outcome.verdict.notes() {
            writeln!(self.out, "#   note: {note}")?;
        }
        self.out.flush()
    }

    /// Aborts the stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the output cannot be written.
    pub fn bail_out(&mut self, reason: &str) -> io::Result<()> {
        writeln!(self.out, "Bail out! {reason}")?;
        self.out.flush()
    }

    /// Closes a suite with its totals.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the output cannot be written.
    pub fn summary(&mut self, summary: &SuiteSummary) -> io::Result<()> {
        let mut line = format!(
            "# {}: {} passed, {} failed",
            summary.source, summary.passed, summary.failed
        );
        if summary.not_run > 0 {
            line.push_str(&format!(", {} not run", summary.not_run));
        }
        line.push_str(&format!(
            " ({})",
            humantime::format_duration(Duration::from_millis(
                u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX)
            ))
        ));
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }

    /// Consumes the reporter, returning the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// One-line rendering of possibly long, multi-line text.
fn excerpt(text: &str) -> String {
    let escaped = text.escape_debug().to_string();
    if escaped.chars().count() <= EXCERPT_LIMIT {
        return escaped;
    }
    let head: String = escaped.chars().take(EXCERPT_LIMIT).collect();
    format!("{head}... ({} chars total)", escaped.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{Expectation, InstrumentationReport, Mismatch, Verdict};

    fn outcome(mismatches: Vec<Mismatch>, notes: Vec<String>) -> BlockOutcome {
        BlockOutcome {
            verdict: Verdict::new(1, "TEST 1: hello", mismatches, notes),
            instrumentation: None,
            duration: Duration::from_millis(12),
        }
    }

    fn render(f: impl FnOnce(&mut Reporter<Vec<u8>>)) -> String {
        let mut reporter = Reporter::new(Vec::new());
        f(&mut reporter);
        String::from_utf8(reporter.into_inner()).unwrap()
    }

    #[test]
    fn test_passing_block() {
        let text = render(|r| {
            r.plan("t/basic.t", 1).unwrap();
            r.block(&outcome(vec![], vec![])).unwrap();
        });
        assert_eq!(text, "# t/basic.t\n1..1\nok 1 - TEST 1: hello\n");
    }

    #[test]
    fn test_failing_block_lists_mismatches() {
        let mismatch = Mismatch::new(
            Expectation::Status,
            "200",
            "404",
            "the server answered with a different status",
        );
        let text = render(|r| {
            r.block(&outcome(vec![mismatch], vec!["overlap".to_string()]))
                .unwrap();
        });
        assert!(text.starts_with("not ok 1 - TEST 1: hello\n"));
        assert!(text.contains("#   error_code: expected 200, got 404\n"));
        assert!(text.contains("#     the server answered with a different status\n"));
        assert!(text.contains("#   note: overlap\n"));
    }

    #[test]
    fn test_instrumentation_fails_passing_verdict() {
        let mut out = outcome(vec![], vec![]);
        out.instrumentation = Some(InstrumentationReport {
            findings: vec!["definitely lost: 16 bytes in 1 blocks".to_string()],
        });
        let text = render(|r| r.block(&out).unwrap());
        assert!(text.starts_with("not ok 1"));
        assert!(text.contains("#   instrumentation: definitely lost"));
    }

    #[test]
    fn test_counter_restarts_per_suite() {
        let text = render(|r| {
            r.plan("a.t", 1).unwrap();
            r.block(&outcome(vec![], vec![])).unwrap();
            r.plan("b.t", 1).unwrap();
            r.block(&outcome(vec![], vec![])).unwrap();
        });
        assert_eq!(text.matches("ok 1 -").count(), 2);
    }

    #[test]
    fn test_bail_out_and_summary() {
        let summary = SuiteSummary {
            source: "t/a.t".to_string(),
            passed: 2,
            failed: 1,
            not_run: 3,
            fatal: Some("recovery failed".to_string()),
            duration: Duration::from_millis(1500),
        };
        let text = render(|r| {
            r.bail_out("recovery failed").unwrap();
            r.summary(&summary).unwrap();
        });
        assert!(text.starts_with("Bail out! recovery failed\n"));
        assert!(text.contains("# t/a.t: 2 passed, 1 failed, 3 not run (1s 500ms)"));
        assert!(!summary.all_passed());
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn test_excerpt_escapes_and_truncates() {
        assert_eq!(excerpt("a\nb"), "a\\nb");
        let long = "x".repeat(EXCERPT_LIMIT + 10);
        let short = excerpt(&long);
        assert!(short.ends_with(&format!("... ({} chars total)", EXCERPT_LIMIT + 10)));
    }
}
