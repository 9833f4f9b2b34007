//! Expectation evaluator.
//!
//! Turns everything observed during a block into a [`Verdict`]. Every rule
//! runs independently and every divergence is collected, so one run
//! reports all of them. Nothing here performs I/O.

pub mod decision;

use std::time::Duration;

use ngx_scaffold_core::{HeaderExpectation, TestBlock, TextMatcher};

use crate::driver::{CapturedResponse, WellFormedness};
use crate::lifecycle::{LogSnapshot, StartupOutcome};
use crate::mock::MockReport;

pub use decision::{Flow, StartupDecision, startup_decision};

/// The kind of expectation a mismatch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expectation {
    /// The server had to start and did not.
    Startup,
    /// The server had to fail to start and did not.
    MustDie,
    /// The harness could not set the block up (render, spawn, mock bind).
    Setup,
    /// The connection to the server could not be established.
    Transport,
    /// The client deadline expired without `abort`.
    ClientTimeout,
    /// The response is structurally broken.
    MalformedResponse,
    /// Status code.
    Status,
    /// `response_body` / `response_body_like`.
    ResponseBody,
    /// `response_headers`.
    ResponseHeader,
    /// `error_log`.
    ErrorLog,
    /// `no_error_log`.
    NoErrorLog,
    /// `grep_error_log_out`.
    GrepErrorLog,
    /// A mock backend received an unexpected query.
    MockQuery,
}

impl Expectation {
    /// Stable label for diagnostics and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::MustDie => "must_die",
            Self::Setup => "setup",
            Self::Transport => "transport",
            Self::ClientTimeout => "client_timeout",
            Self::MalformedResponse => "malformed_response",
            Self::Status => "error_code",
            Self::ResponseBody => "response_body",
            Self::ResponseHeader => "response_headers",
            Self::ErrorLog => "error_log",
            Self::NoErrorLog => "no_error_log",
            Self::GrepErrorLog => "grep_error_log",
            Self::MockQuery => "mock_query",
        }
    }
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One divergence between what was declared and what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Which rule failed.
    pub expectation: Expectation,
    /// What was declared.
    pub expected: String,
    /// What was observed.
    pub actual: String,
    /// Human explanation.
    pub diagnostic: String,
}

impl Mismatch {
    /// Creates a mismatch.
    #[must_use]
    pub fn new(
        expectation: Expectation,
        expected: impl Into<String>,
        actual: impl Into<String>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            expectation,
            expected: expected.into(),
            actual: actual.into(),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Pass/fail for one block with every mismatch found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    ordinal: usize,
    title: String,
    mismatches: Vec<Mismatch>,
    notes: Vec<String>,
}

impl Verdict {
    /// A verdict that passes iff `mismatches` is empty.
    #[must_use]
    pub fn new(
        ordinal: usize,
        title: impl Into<String>,
        mismatches: Vec<Mismatch>,
        notes: Vec<String>,
    ) -> Self {
        Self {
            ordinal,
            title: title.into(),
            mismatches,
            notes,
        }
    }

    /// Block ordinal.
    #[must_use]
    pub const fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Block title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether no mismatch was found.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Mismatches in rule order.
    #[must_use]
    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }

    /// Observations that do not affect the outcome.
    #[must_use]
    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

/// Result of scanning an instrumentation tool's report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationReport {
    /// Problems the tool reported.
    pub findings: Vec<String>,
}

impl InstrumentationReport {
    /// Whether the tool reported nothing.
    #[must_use]
    pub fn clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Everything recorded about one block.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    /// Functional verdict.
    pub verdict: Verdict,
    /// Independent signal from an instrumented run, if any.
    pub instrumentation: Option<InstrumentationReport>,
    /// Wall time spent on the block.
    pub duration: Duration,
}

impl BlockOutcome {
    /// Passed iff the verdict passed and instrumentation found nothing.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict.passed() && self.instrumentation.as_ref().is_none_or(InstrumentationReport::clean)
    }
}

/// Everything the evaluator looks at.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    /// The block being judged.
    pub block: &'a TestBlock,
    /// Startup outcome, or `None` if setup failed before startup.
    pub startup: Option<&'a StartupOutcome>,
    /// Captured response, if a request was sent.
    pub response: Option<&'a CapturedResponse>,
    /// Log output of this block.
    pub logs: &'a LogSnapshot,
    /// Reports of the block's mock listeners.
    pub mocks: &'a [MockReport],
    /// Harness-side setup failure, if any.
    pub setup_error: Option<&'a str>,
}

/// Judges one block.
#[must_use]
pub fn evaluate(input: &EvaluationInput<'_>) -> Verdict {
    let block = input.block;
    let mut mismatches = Vec::new();
    let mut notes = Vec::new();

    if let Some(error) = input.setup_error {
        mismatches.push(Mismatch::new(
            Expectation::Setup,
            "block setup to succeed",
            error,
            "the harness could not prepare the block",
        ));
    }

    let flow = input.startup.map_or(Flow::ShortCircuit, |outcome| {
        let decision = startup_decision(outcome, block.must_die());
        mismatches.extend(decision.mismatches);
        decision.flow
    });

    if flow == Flow::Continue {
        if let Some(response) = input.response {
            check_response(block, response, &mut mismatches, &mut notes);
        }
        for report in input.mocks {
            for m in &report.mismatches {
                mismatches.push(Mismatch::new(
                    Expectation::MockQuery,
                    m.expected.clone(),
                    m.actual.clone(),
                    format!("mock {} backend, exchange {}", m.protocol, m.exchange),
                ));
            }
        }
    }

    check_logs(block, input.logs, &mut mismatches, &mut notes);

    Verdict::new(block.ordinal(), block.display_name(), mismatches, notes)
}

fn check_response(
    block: &TestBlock,
    response: &CapturedResponse,
    mismatches: &mut Vec<Mismatch>,
    notes: &mut Vec<String>,
) {
    if let Some(error) = &response.transport_error {
        mismatches.push(Mismatch::new(
            Expectation::Transport,
            "a connection to the server",
            error.clone(),
            "the request could not be sent",
        ));
        return;
    }

    if let Some(phase) = response.timed_out {
        let waited = humantime::format_duration(round_ms(response.elapsed));
        if block.abort() {
            notes.push(format!("client timed out after {waited} while {phase} (abort)"));
        } else {
            mismatches.push(Mismatch::new(
                Expectation::ClientTimeout,
                "a complete response",
                format!("timed out after {waited} while {phase}"),
                "declare abort if the timeout is expected",
            ));
        }
    }

    if block.ignore_response() {
        return;
    }

    // A timed-out read is already reported; its truncation is no news.
    if response.timed_out.is_none() {
        if let WellFormedness::Malformed(problem) = &response.well_formedness {
            mismatches.push(Mismatch::new(
                Expectation::MalformedResponse,
                "a well-formed response",
                problem.to_string(),
                "declare ignore_response to skip this check",
            ));
        }
    }

    let expected_status = block
        .error_code()
        .or_else(|| response.timed_out.is_none().then_some(200));
    if let Some(expected) = expected_status {
        if response.status() != Some(expected) {
            mismatches.push(Mismatch::new(
                Expectation::Status,
                expected.to_string(),
                response
                    .status()
                    .map_or_else(|| "no status line".to_string(), |s| s.to_string()),
                "status code differs",
            ));
        }
    }

    if let Some(matcher) = block.expected_body() {
        if !matcher.matches(response.body()) {
            mismatches.push(Mismatch::new(
                Expectation::ResponseBody,
                matcher.describe(),
                format!("{:?}", String::from_utf8_lossy(response.body())),
                "response body differs",
            ));
        }
    }

    for expectation in block.response_headers() {
        let found = |name: &str| response.parsed.as_ref().and_then(|p| p.header(name));
        match expectation {
            HeaderExpectation::Equals { name, value } => {
                if found(name) != Some(value.as_str()) {
                    mismatches.push(Mismatch::new(
                        Expectation::ResponseHeader,
                        format!("{name}: {value}"),
                        found(name).map_or_else(|| format!("no {name} header"), |v| format!("{name}: {v}")),
                        "response header differs",
                    ));
                }
            }
            HeaderExpectation::Absent { name } => {
                if let Some(v) = found(name) {
                    mismatches.push(Mismatch::new(
                        Expectation::ResponseHeader,
                        format!("no {name} header"),
                        format!("{name}: {v}"),
                        "header must be absent",
                    ));
                }
            }
        }
    }
}

fn check_logs(
    block: &TestBlock,
    logs: &LogSnapshot,
    mismatches: &mut Vec<Mismatch>,
    notes: &mut Vec<String>,
) {
    let text = logs.text();

    for required in block.error_log() {
        if !required.is_match(&text) {
            mismatches.push(Mismatch::new(
                Expectation::ErrorLog,
                required.describe(),
                "not found in log tail",
                "required log line missing",
            ));
        }
    }

    for forbidden in block.no_error_log() {
        if let Some(line) = text.lines().find(|line| forbidden.is_match(line)) {
            mismatches.push(Mismatch::new(
                Expectation::NoErrorLog,
                format!("no {}", forbidden.describe()),
                line.to_string(),
                "forbidden log line present",
            ));
        }
    }

    for required in block.error_log() {
        for forbidden in block.no_error_log() {
            if overlaps(required, forbidden) {
                notes.push(format!(
                    "error_log {} overlaps no_error_log {}; both were checked",
                    required.describe(),
                    forbidden.describe()
                ));
            }
        }
    }

    if let Some(pattern) = block.grep_error_log() {
        let collected: String = pattern
            .find_all(&text)
            .into_iter()
            .map(|m| m + "\n")
            .collect();
        match block.grep_error_log_out() {
            Some(expected) if !expected.matches(collected.as_bytes()) => {
                mismatches.push(Mismatch::new(
                    Expectation::GrepErrorLog,
                    expected.describe(),
                    format!("{collected:?}"),
                    format!("matches of {} in the log tail differ", pattern.describe()),
                ));
            }
            Some(_) => {}
            None => notes.push(format!(
                "grep_error_log {} collected {collected:?} with nothing to compare",
                pattern.describe()
            )),
        }
    }
}

/// Whether a required and a forbidden matcher can match the same text.
fn overlaps(required: &TextMatcher, forbidden: &TextMatcher) -> bool {
    match (required, forbidden) {
        (TextMatcher::Literal(a), TextMatcher::Literal(b)) => a.contains(b.as_str()) || b.contains(a.as_str()),
        (TextMatcher::Literal(text), pattern @ TextMatcher::Pattern(_))
        | (pattern @ TextMatcher::Pattern(_), TextMatcher::Literal(text)) => pattern.is_match(text),
        (TextMatcher::Pattern(a), TextMatcher::Pattern(b)) => a == b,
    }
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ngx_scaffold_core::{ParseOptions, parse_suite};

    use super::*;
    use crate::driver::response;
    use crate::driver::TimeoutPhase;
    use crate::lifecycle::StartupFailure;
    use crate::mock::MockMismatch;

    fn block(doc: &str) -> TestBlock {
        parse_suite("t.t", doc, &ParseOptions::default())
            .unwrap()
            .suite
            .blocks
            .remove(0)
    }

    fn captured(raw: &[u8]) -> CapturedResponse {
        let (parsed, well_formedness) = response::parse(raw, false);
        CapturedResponse {
            request: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            raw: raw.to_vec(),
            parsed,
            well_formedness,
            timed_out: None,
            transport_error: None,
            io_note: None,
            elapsed: Duration::from_millis(5),
        }
    }

    fn logs(text: &str) -> LogSnapshot {
        LogSnapshot {
            generation: 1,
            files: vec![(PathBuf::from("logs/error.log"), text.to_string())],
        }
    }

    fn run(
        b: &TestBlock,
        startup: &StartupOutcome,
        response: Option<&CapturedResponse>,
        log: &str,
    ) -> Verdict {
        let logs = logs(log);
        evaluate(&EvaluationInput {
            block: b,
            startup: Some(startup),
            response,
            logs: &logs,
            mocks: &[],
            setup_error: None,
        })
    }

    fn kinds(v: &Verdict) -> Vec<Expectation> {
        v.mismatches().iter().map(|m| m.expectation).collect()
    }

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nX-Foo: bar\r\n\r\nhello\n";
    const TRUNCATED_CHUNKED: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello\n\r\n";

    #[test]
    fn test_passing_block() {
        let b = block(
            "=== TEST 1: ok\n--- request\nGET /t\n--- response_body\nhello\n--- response_headers\nX-Foo: bar\n!X-Missing\n--- no_error_log\n[error]\n",
        );
        let r = captured(OK);
        let v = run(&b, &StartupOutcome::Started, Some(&r), "[notice] fine\n");
        assert!(v.passed(), "{:?}", v.mismatches());
        assert_eq!(v.ordinal(), 1);
        assert_eq!(v.title(), "TEST 1: ok");
    }

    #[test]
    fn test_all_mismatches_are_collected() {
        let b = block(
            "=== TEST 1\n--- request\nGET /t\n--- response_body\nbye\n--- error_code: 404\n--- error_log\nmissing line\n--- no_error_log\n[error]\n",
        );
        let r = captured(OK);
        let v = run(&b, &StartupOutcome::Started, Some(&r), "[error] boom\n");
        assert_eq!(
            kinds(&v),
            vec![
                Expectation::Status,
                Expectation::ResponseBody,
                Expectation::ErrorLog,
                Expectation::NoErrorLog
            ]
        );
        assert_eq!(v.mismatches()[3].actual, "[error] boom");
    }

    #[test]
    fn test_must_die_passes_when_startup_fails_and_log_matches() {
        let b = block(
            "=== TEST 1\n--- config\n--- must_die\n--- error_log\nI am dying!\n",
        );
        let failed = StartupOutcome::Failed(StartupFailure::Exited { code: Some(1) });
        let v = run(&b, &failed, None, "[emerg] I am dying!\n");
        assert!(v.passed(), "{:?}", v.mismatches());

        let v = run(&b, &failed, None, "[emerg] something else\n");
        assert_eq!(kinds(&v), vec![Expectation::ErrorLog]);

        let v = run(&b, &StartupOutcome::Started, None, "[emerg] I am dying!\n");
        assert_eq!(kinds(&v), vec![Expectation::MustDie]);
    }

    #[test]
    fn test_must_die_short_circuits_response_checks() {
        let b = block("=== TEST 1\n--- request\nGET /\n--- must_die\n--- error_code: 200\n");
        let failed = StartupOutcome::Failed(StartupFailure::Exited { code: Some(1) });
        let r = captured(b"garbage");
        assert!(run(&b, &failed, Some(&r), "").passed());
    }

    #[test]
    fn test_malformed_response_detected_without_ignore_response() {
        let b = block("=== TEST 1\n--- request\nGET /t\n");
        let r = captured(TRUNCATED_CHUNKED);
        let v = run(&b, &StartupOutcome::Started, Some(&r), "");
        assert_eq!(kinds(&v), vec![Expectation::MalformedResponse]);
        assert!(v.mismatches()[0].actual.contains("last chunk"));
    }

    #[test]
    fn test_ignore_response_never_reports_malformed() {
        let b = block("=== TEST 1\n--- request\nGET /t\n--- ignore_response\n");
        for raw in [TRUNCATED_CHUNKED, b"garbage".as_slice(), b"".as_slice()] {
            let r = captured(raw);
            let v = run(&b, &StartupOutcome::Started, Some(&r), "");
            assert!(v.passed(), "{raw:?}: {:?}", v.mismatches());
        }
    }

    #[test]
    fn test_timeout_without_abort_fails() {
        let b = block("=== TEST 1\n--- request\nGET /t\n--- timeout: 0.2\n");
        let mut r = captured(b"");
        r.timed_out = Some(TimeoutPhase::Read);
        let v = run(&b, &StartupOutcome::Started, Some(&r), "");
        assert_eq!(kinds(&v), vec![Expectation::ClientTimeout]);
    }

    #[test]
    fn test_timeout_with_abort_is_neutral() {
        let b = block(
            "=== TEST 1\n--- request\nGET /t\n--- timeout: 0.2\n--- abort\n--- error_log\nclient prematurely closed connection\n--- no_error_log\ndone\n",
        );
        let mut r = captured(b"");
        r.timed_out = Some(TimeoutPhase::Read);
        let v = run(
            &b,
            &StartupOutcome::Started,
            Some(&r),
            "[info] client prematurely closed connection\n",
        );
        assert!(v.passed(), "{:?}", v.mismatches());
        assert_eq!(v.notes().len(), 1);

        let v = run(&b, &StartupOutcome::Started, Some(&r), "[info] done\n");
        assert_eq!(kinds(&v), vec![Expectation::ErrorLog, Expectation::NoErrorLog]);
    }

    #[test]
    fn test_transport_error() {
        let b = block("=== TEST 1\n--- request\nGET /t\n");
        let mut r = captured(b"");
        r.transport_error = Some("connection refused".to_string());
        let v = run(&b, &StartupOutcome::Started, Some(&r), "");
        assert_eq!(kinds(&v), vec![Expectation::Transport]);
    }

    #[test]
    fn test_header_mismatches() {
        let b = block(
            "=== TEST 1\n--- request\nGET /t\n--- response_headers\nX-Foo: baz\n!X-Foo\nX-Other: 1\n",
        );
        let r = captured(OK);
        let v = run(&b, &StartupOutcome::Started, Some(&r), "");
        assert_eq!(v.mismatches().len(), 3);
        assert_eq!(v.mismatches()[2].actual, "no X-Other header");
    }

    #[test]
    fn test_grep_error_log() {
        let b = block(
            "=== TEST 1\n--- config\n--- grep_error_log eval\nqr/conn \\d+/\n--- grep_error_log_out\nconn 1\nconn 2\n",
        );
        assert!(run(&b, &StartupOutcome::Started, None, "a conn 1 b\nconn 2\n").passed());
        let v = run(&b, &StartupOutcome::Started, None, "conn 1\n");
        assert_eq!(kinds(&v), vec![Expectation::GrepErrorLog]);
    }

    #[test]
    fn test_overlap_is_noted_and_both_apply() {
        let b = block("=== TEST 1\n--- config\n--- error_log\nupstream timed out\n--- no_error_log\ntimed out\n");
        let v = run(&b, &StartupOutcome::Started, None, "upstream timed out\n");
        assert_eq!(kinds(&v), vec![Expectation::NoErrorLog]);
        assert_eq!(v.notes().len(), 1);
        assert!(v.notes()[0].contains("overlaps"));
    }

    #[test]
    fn test_mock_mismatches_surface() {
        let b = block("=== TEST 1\n--- config\n");
        let logs = logs("");
        let reports = [MockReport {
            mismatches: vec![MockMismatch {
                protocol: "tcp",
                exchange: 1,
                expected: "\"ping\"".to_string(),
                actual: "pung".to_string(),
            }],
            ..MockReport::default()
        }];
        let v = evaluate(&EvaluationInput {
            block: &b,
            startup: Some(&StartupOutcome::Reused),
            response: None,
            logs: &logs,
            mocks: &reports,
            setup_error: None,
        });
        assert_eq!(kinds(&v), vec![Expectation::MockQuery]);
    }

    #[test]
    fn test_setup_error_fails_block() {
        let b = block("=== TEST 1\n--- config\n");
        let logs = logs("");
        let v = evaluate(&EvaluationInput {
            block: &b,
            startup: None,
            response: None,
            logs: &logs,
            mocks: &[],
            setup_error: Some("failed to bind mock tcp listener"),
        });
        assert_eq!(kinds(&v), vec![Expectation::Setup]);
    }

    #[test]
    fn test_block_outcome_includes_instrumentation() {
        let verdict = Verdict::new(1, "t", Vec::new(), Vec::new());
        let mut outcome = BlockOutcome {
            verdict,
            instrumentation: Some(InstrumentationReport::default()),
            duration: Duration::ZERO,
        };
        assert!(outcome.passed());
        outcome.instrumentation = Some(InstrumentationReport {
            findings: vec!["definitely lost: 16 bytes".to_string()],
        });
        assert!(!outcome.passed());
    }
}
