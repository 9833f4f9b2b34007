//! Instrumented mode: the server runs under a memory checker.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use ngx_scaffold_core::TestBlock;

use crate::config::{InstrumentedSettings, ModeKind};
use crate::error::LifecycleError;
use crate::evaluate::InstrumentationReport;
use crate::lifecycle::{Controller, LaunchSpec, LogSnapshot, RenderHints, RenderedConfig, StartupOutcome};

use super::{TestMode, restart_on_change};

static DEFINITELY_LOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"definitely lost: ([\d,]+) bytes in ([\d,]+) blocks").expect("valid regex")
});
static ERROR_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR SUMMARY: ([\d,]+) errors").expect("valid regex"));
static INVALID_ACCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(Invalid (?:read|write|free\(\)) of size \d+|Conditional jump or move depends on uninitialised value|Use of uninitialised value)")
        .expect("valid regex")
});

/// Wraps the command, turns off the master process, widens timeouts and
/// reads the tool's report from stderr after every block.
#[derive(Debug, Clone)]
pub struct InstrumentedMode {
    settings: InstrumentedSettings,
}

impl InstrumentedMode {
    /// Creates the mode.
    #[must_use]
    pub const fn new(settings: InstrumentedSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TestMode for InstrumentedMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Instrumented
    }

    fn timeout_multiplier(&self) -> f64 {
        self.settings.timeout_multiplier
    }

    fn render_hints(&self) -> RenderHints {
        // A single process keeps the tool's report in one place.
        RenderHints {
            master_process: false,
            event_mechanism: None,
        }
    }

    fn decorate_launch(&self, launch: &mut LaunchSpec) -> Result<(), LifecycleError> {
        launch.wrap(&self.settings.wrapper)
    }

    async fn prepare(
        &self,
        controller: &mut Controller,
        config: &RenderedConfig,
        block: &TestBlock,
    ) -> Result<StartupOutcome, LifecycleError> {
        restart_on_change(controller, config, block).await
    }

    fn stops_after_block(&self) -> bool {
        // Leak summaries are only printed at exit.
        true
    }

    fn inspect(&self, block: &TestBlock, tail: &LogSnapshot) -> Option<InstrumentationReport> {
        if block.no_check_leak() {
            return None;
        }
        let stderr = tail.file("stderr.log").unwrap_or_default();
        Some(scan_report(stderr))
    }
}

/// Extracts findings from a valgrind-style report.
#[must_use]
pub fn scan_report(text: &str) -> InstrumentationReport {
    let mut findings = Vec::new();
    for caps in DEFINITELY_LOST.captures_iter(text) {
        if count(&caps[1]) > 0 {
            findings.push(caps[0].to_string());
        }
    }
    for m in INVALID_ACCESS.find_iter(text) {
        findings.push(m.as_str().to_string());
    }
    for caps in ERROR_SUMMARY.captures_iter(text) {
        if count(&caps[1]) > 0 {
            findings.push(caps[0].to_string());
        }
    }
    InstrumentationReport { findings }
}

fn count(digits: &str) -> u64 {
    digits.replace(',', "").parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ngx_scaffold_core::{ParseOptions, parse_suite};

    use super::*;

    const CLEAN: &str = "==1== HEAP SUMMARY:\n==1==     definitely lost: 0 bytes in 0 blocks\n==1== ERROR SUMMARY: 0 errors from 0 contexts (suppressed: 0 from 0)\n";
    const LEAKY: &str = "==1== Invalid read of size 8\n==1==    at 0x1: ngx_foo\n==1==     definitely lost: 1,024 bytes in 2 blocks\n==1== ERROR SUMMARY: 3 errors from 3 contexts\n";

    #[test]
    fn test_clean_report() {
        assert!(scan_report(CLEAN).clean());
        assert!(scan_report("").clean());
    }

    #[test]
    fn test_findings_are_extracted() {
        let report = scan_report(LEAKY);
        assert_eq!(report.findings.len(), 3);
        assert_eq!(report.findings[0], "definitely lost: 1,024 bytes in 2 blocks");
        assert_eq!(report.findings[1], "Invalid read of size 8");
        assert!(report.findings[2].starts_with("ERROR SUMMARY: 3 errors"));
    }

    #[test]
    fn test_no_check_leak_skips_inspection() {
        let mode = InstrumentedMode::new(InstrumentedSettings::default());
        let tail = LogSnapshot {
            generation: 1,
            files: vec![(PathBuf::from("/s/logs/stderr.log"), LEAKY.to_string())],
        };
        let doc = "=== TEST 1\n--- config\n--- no_check_leak\n=== TEST 2\n--- config\n";
        let suite = parse_suite("t.t", doc, &ParseOptions::default()).unwrap().suite;
        assert!(mode.inspect(&suite.blocks[0], &tail).is_none());
        assert!(!mode.inspect(&suite.blocks[1], &tail).unwrap().clean());
    }

    #[test]
    fn test_launch_is_wrapped() {
        let mode = InstrumentedMode::new(InstrumentedSettings::default());
        let mut launch =
            LaunchSpec::from_command("nginx -c {conf}", &indexmap::IndexMap::new()).unwrap();
        mode.decorate_launch(&mut launch).unwrap();
        assert_eq!(launch.argv()[0], "valgrind");
        assert!(!mode.render_hints().master_process);
        assert!(mode.stops_after_block());
    }
}
