//! Suite run loop.
//!
//! A [`Harness`] owns the server lifecycle controller and the active test
//! mode for a whole run. Blocks run strictly one after another; a block's
//! failure is contained to its verdict unless the server cannot be
//! recovered.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ngx_scaffold_core::{ParseOptions, ParseOutput, Strictness, Suite, TestBlock, parse_suite};

use crate::capture::{CaptureDirection, CaptureWriter};
use crate::config::{ClientSettings, HarnessConfig};
use crate::driver::{self, CapturedResponse};
use crate::error::{LifecycleError, ScaffoldError};
use crate::evaluate::{self, BlockOutcome, EvaluationInput, Flow, startup_decision};
use crate::lifecycle::{Controller, LaunchSpec, LogSnapshot, StartupOutcome, render};
use crate::mock::{self, MockSet};
use crate::mode::{self, TestMode};
use crate::observability::{Event, EventEmitter, metrics};
use crate::report::{Reporter, SuiteSummary};

/// Harness-provided variables substituted as `$NAME` in block payloads.
#[must_use]
pub fn suite_variables(listen: SocketAddr, prefix: &Path) -> IndexMap<String, String> {
    let mut variables = IndexMap::new();
    variables.insert("SCAFFOLD_SERVER_PORT".to_string(), listen.port().to_string());
    variables.insert("SCAFFOLD_SERVER_ADDR".to_string(), listen.ip().to_string());
    variables.insert("SCAFFOLD_SERVROOT".to_string(), prefix.display().to_string());
    variables.insert(
        "SCAFFOLD_HTML_DIR".to_string(),
        render::html_dir(prefix).display().to_string(),
    );
    variables
}

/// Parser options for a run.
#[must_use]
pub fn parse_options(strict: bool, variables: IndexMap<String, String>) -> ParseOptions {
    ParseOptions {
        strictness: if strict {
            Strictness::Strict
        } else {
            Strictness::Lenient
        },
        variables,
    }
}

/// Reads and parses one suite document, logging lenient-mode warnings.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or the parse error.
pub fn load_suite(path: &Path, options: &ParseOptions) -> Result<ParseOutput, ScaffoldError> {
    let text = std::fs::read_to_string(path)?;
    let output = parse_suite(&path.display().to_string(), &text, options)?;
    for warning in &output.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    Ok(output)
}

/// Runs suites against one server-under-test.
pub struct Harness {
    client: ClientSettings,
    mode: Box<dyn TestMode>,
    controller: Controller,
    events: EventEmitter,
    capture: Option<CaptureWriter>,
    cancel: CancellationToken,
    fail_fast: bool,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("mode", &self.mode.kind())
            .field("controller", &self.controller)
            .field("fail_fast", &self.fail_fast)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Builds the mode, the launch command and the controller.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error if the command cannot be split or the
    /// server root cannot be prepared.
    pub fn new(config: &HarnessConfig, events: EventEmitter) -> Result<Self, ScaffoldError> {
        let mode = mode::build(&config.mode);
        let mut launch = LaunchSpec::from_command(&config.server.command, &config.server.env)?;
        mode.decorate_launch(&mut launch)?;
        let controller = Controller::new(&config.server, launch, mode.timeout_multiplier())?;
        info!(
            mode = %mode.kind(),
            servroot = %controller.prefix().display(),
            listen = %controller.listen(),
            "harness ready"
        );
        Ok(Self {
            client: config.client.clone(),
            mode,
            controller,
            events,
            capture: None,
            cancel: CancellationToken::new(),
            fail_fast: false,
        })
    }

    /// Records request/response bytes of every block.
    #[must_use]
    pub fn with_capture(mut self, capture: CaptureWriter) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Stops between blocks once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stops a suite at its first failing block.
    #[must_use]
    pub const fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// The lifecycle controller.
    #[must_use]
    pub const fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Variables for suites run by this harness.
    #[must_use]
    pub fn variables(&self) -> IndexMap<String, String> {
        suite_variables(self.controller.listen(), self.controller.prefix())
    }

    /// Runs every selected block of `suite`, reporting as it goes.
    ///
    /// The server is stopped when the suite ends, however it ends.
    ///
    /// # Errors
    ///
    /// Returns [`ScaffoldError::Fatal`] if the server could not be
    /// recovered, [`ScaffoldError::Interrupted`] if the run was cancelled,
    /// or an I/O error if the report cannot be written.
    pub async fn run_suite<W: Write>(
        &mut self,
        suite: &Suite,
        reporter: &mut Reporter<W>,
    ) -> Result<SuiteSummary, ScaffoldError> {
        let started = Instant::now();
        let selected = suite.selected();
        let mut summary = SuiteSummary {
            source: suite.source_name.clone(),
            ..SuiteSummary::default()
        };

        info!(source = %suite.source_name, blocks = selected.len(), "suite started");
        self.events.emit(Event::SuiteStarted {
            timestamp: Utc::now(),
            source: suite.source_name.clone(),
            mode: self.mode.kind().to_string(),
            blocks: selected.len(),
        });

        let result = self
            .run_blocks(&selected, reporter, &mut summary)
            .await;
        self.stop_server("suite finished").await;

        if let Err(ScaffoldError::Fatal(reason)) = &result {
            summary.fatal = Some(reason.clone());
        }
        summary.duration = started.elapsed();
        self.events.emit(Event::SuiteFinished {
            timestamp: Utc::now(),
            source: suite.source_name.clone(),
            passed: summary.passed,
            failed: summary.failed,
            fatal: summary.fatal.clone(),
        });
        reporter.summary(&summary)?;
        info!(
            source = %suite.source_name,
            passed = summary.passed,
            failed = summary.failed,
            "suite finished"
        );
        result.map(|()| summary)
    }

    async fn run_blocks<W: Write>(
        &mut self,
        selected: &[&TestBlock],
        reporter: &mut Reporter<W>,
        summary: &mut SuiteSummary,
    ) -> Result<(), ScaffoldError> {
        reporter.plan(&summary.source, selected.len())?;
        for (index, block) in selected.iter().enumerate() {
            let remaining = selected.len() - index;
            if self.cancel.is_cancelled() {
                summary.not_run = remaining;
                return Err(ScaffoldError::Interrupted);
            }

            let outcome = match self.run_block(block).await {
                Ok(outcome) => outcome,
                Err(ScaffoldError::Fatal(reason)) => {
                    error!(block = %block.display_name(), %reason, "server could not be recovered");
                    summary.not_run = remaining;
                    reporter.bail_out(&reason)?;
                    return Err(ScaffoldError::Fatal(reason));
                }
                Err(e) => {
                    summary.not_run = remaining;
                    return Err(e);
                }
            };

            reporter.block(&outcome)?;
            if outcome.passed() {
                summary.passed += 1;
            } else {
                summary.failed += 1;
                if self.fail_fast {
                    summary.not_run = remaining - 1;
                    info!("stopping at first failure");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Runs one block to its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ScaffoldError::Fatal`] only if the server could not be
    /// recovered. Every other failure is a mismatch in the verdict.
    pub async fn run_block(&mut self, block: &TestBlock) -> Result<BlockOutcome, ScaffoldError> {
        let started = Instant::now();
        let title = block.display_name();
        debug!(ordinal = block.ordinal(), %title, line = block.line(), "block started");
        self.events.emit(Event::BlockStarted {
            timestamp: Utc::now(),
            ordinal: block.ordinal(),
            title: title.clone(),
        });

        let mut setup_error = None;
        let startup = match self.bring_up(block).await {
            Ok(outcome) => Some(outcome),
            Err(LifecycleError::RecoveryFailed(reason)) => {
                return Err(ScaffoldError::Fatal(reason));
            }
            Err(e) => {
                warn!(%title, error = %e, "block setup failed");
                setup_error = Some(e.to_string());
                None
            }
        };

        let mut mocks = None;
        let mut response = None;
        let proceed = startup
            .as_ref()
            .is_some_and(|outcome| startup_decision(outcome, block.must_die()).flow == Flow::Continue);
        if proceed {
            match mock::serve(block).await {
                Ok(set) => {
                    mocks = Some(set);
                    response = self.exchange(block).await;
                }
                Err(e) => {
                    warn!(%title, error = %e, "mock listener setup failed");
                    setup_error = Some(e.to_string());
                }
            }
        }

        let settle = self.controller.scaled(self.client.log_settle) + block.wait().unwrap_or_default();
        tokio::time::sleep(settle).await;
        let logs = self.snapshot(&mut setup_error);

        let mock_reports = mocks.as_ref().map(MockSet::reports).unwrap_or_default();
        let verdict = evaluate::evaluate(&EvaluationInput {
            block,
            startup: startup.as_ref(),
            response: response.as_ref(),
            logs: &logs,
            mocks: &mock_reports,
            setup_error: setup_error.as_deref(),
        });
        if let Some(set) = mocks {
            set.shutdown().await;
        }

        let mut instrumentation = None;
        if block.must_die() || self.mode.stops_after_block() {
            self.stop_server("block finished").await;
            if self.mode.stops_after_block() {
                let tail = self.controller.snapshot().unwrap_or_default();
                instrumentation = self.mode.inspect(block, &tail);
            }
        }

        let outcome = BlockOutcome {
            verdict,
            instrumentation,
            duration: started.elapsed(),
        };
        self.record(block, &outcome, response.as_ref());
        Ok(outcome)
    }

    async fn bring_up(&mut self, block: &TestBlock) -> Result<StartupOutcome, LifecycleError> {
        let hints = self.mode.render_hints();
        let config = self.controller.configure(block, &hints)?;
        let outcome = self.mode.prepare(&mut self.controller, &config, block).await?;
        match &outcome {
            StartupOutcome::Started => self.events.emit(Event::ServerStarted {
                timestamp: Utc::now(),
                pid: self.controller.pid(),
                generation: self.controller.generation(),
                listen: self.controller.listen().to_string(),
            }),
            StartupOutcome::Reloaded => self.events.emit(Event::ServerReloaded {
                timestamp: Utc::now(),
                pid: self.controller.pid(),
                generation: self.controller.generation(),
            }),
            StartupOutcome::Reused => {
                debug!(generation = self.controller.generation(), "server reused");
            }
            StartupOutcome::Failed(failure) => {
                debug!(%failure, must_die = block.must_die(), "server did not start");
            }
        }
        Ok(outcome)
    }

    async fn exchange(&self, block: &TestBlock) -> Option<CapturedResponse> {
        let timeout = self
            .controller
            .scaled(block.timeout().unwrap_or(self.client.timeout));
        let response = driver::send(block, self.controller.listen(), timeout).await?;
        debug!(
            status = ?response.status(),
            bytes = response.raw.len(),
            elapsed = ?response.elapsed,
            timed_out = ?response.timed_out,
            "response captured"
        );
        Some(response)
    }

    fn snapshot(&mut self, setup_error: &mut Option<String>) -> LogSnapshot {
        match self.controller.snapshot() {
            Ok(logs) => logs,
            Err(e) => {
                warn!(error = %e, "cannot read server logs");
                setup_error.get_or_insert_with(|| format!("cannot read server logs: {e}"));
                LogSnapshot::default()
            }
        }
    }

    fn record(&self, block: &TestBlock, outcome: &BlockOutcome, response: Option<&CapturedResponse>) {
        let passed = outcome.passed();
        metrics::record_block(passed, outcome.duration);
        for mismatch in outcome.verdict.mismatches() {
            metrics::record_mismatch(mismatch.expectation.label());
            debug!(
                expectation = %mismatch.expectation,
                expected = %mismatch.expected,
                actual = %mismatch.actual,
                "mismatch"
            );
        }

        if let (Some(capture), Some(response)) = (&self.capture, response) {
            let title = outcome.verdict.title();
            let written = capture
                .record(block.ordinal(), title, CaptureDirection::Request, &response.request)
                .and_then(|()| {
                    capture.record(block.ordinal(), title, CaptureDirection::Response, &response.raw)
                });
            if let Err(e) = written {
                warn!(error = %e, "traffic capture failed");
            }
        }

        self.events.emit(Event::BlockFinished {
            timestamp: Utc::now(),
            ordinal: block.ordinal(),
            title: outcome.verdict.title().to_string(),
            passed,
            mismatches: outcome.verdict.mismatches().len(),
            duration_ms: duration_ms(outcome.duration),
        });
        info!(
            ordinal = block.ordinal(),
            title = outcome.verdict.title(),
            passed,
            duration_ms = duration_ms(outcome.duration),
            "block finished"
        );
    }

    async fn stop_server(&mut self, reason: &str) {
        let pid = self.controller.pid();
        self.controller.stop(reason).await;
        if pid.is_some() {
            self.events.emit(Event::ServerStopped {
                timestamp: Utc::now(),
                pid,
                reason: reason.to_string(),
            });
        }
    }

    /// Stops the server. Idempotent.
    pub async fn shutdown(&mut self) {
        self.stop_server("shutdown").await;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
