//! `run` command handler.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CaptureWriter;
use crate::cli::args::RunArgs;
use crate::cli::commands::expand_paths;
use crate::config;
use crate::error::ScaffoldError;
use crate::observability::{EventEmitter, init_metrics};
use crate::report::Reporter;
use crate::runner::{Harness, load_suite, parse_options};

/// Runs every suite under `args.paths`.
///
/// All suites are parsed before the server is started for the first time,
/// so a broken document never leaves a half-run behind.
///
/// # Errors
///
/// Returns a config or parse error before anything runs,
/// [`ScaffoldError::Fatal`] if the server could not be recovered,
/// [`ScaffoldError::Interrupted`] on cancellation, and
/// [`ScaffoldError::TestsFailed`] if any block failed.
pub async fn run(args: &RunArgs, cancel: CancellationToken) -> Result<(), ScaffoldError> {
    if let Some(port) = args.metrics_port {
        init_metrics(Some(port))?;
        info!(port, "Prometheus metrics endpoint started");
    }

    let loaded = config::load(args.config.as_deref(), &args.overrides())?;
    for warning in &loaded.warnings {
        warn!(
            location = warning.location.as_deref().unwrap_or("<unknown>"),
            "{}",
            warning.message
        );
    }
    let config = loaded.config;

    let files = expand_paths(&args.paths)?;
    if files.is_empty() {
        return Err(ScaffoldError::Usage("no test files found".to_string()));
    }

    let events = match &args.events {
        Some(path) => EventEmitter::from_file(path)?,
        None => EventEmitter::noop(),
    };
    let mut harness = Harness::new(&config, events)?
        .with_cancel(cancel)
        .fail_fast(args.fail_fast);
    if let Some(dir) = &args.capture_dir {
        let capture = CaptureWriter::new(dir)?;
        info!(path = %capture.path().display(), "capturing traffic");
        harness = harness.with_capture(capture);
    }

    let options = parse_options(config.parser.strict, harness.variables());
    let suites = files
        .iter()
        .map(|path| load_suite(path, &options).map(|output| output.suite))
        .collect::<Result<Vec<_>, _>>()?;

    let mut reporter = Reporter::new(std::io::stdout());
    let mut failed = 0;
    let mut total = 0;
    for suite in &suites {
        let summary = harness.run_suite(suite, &mut reporter).await?;
        failed += summary.failed + summary.not_run;
        total += summary.total() + summary.not_run;
    }
    harness.shutdown().await;

    if failed > 0 {
        return Err(ScaffoldError::TestsFailed { failed, total });
    }
    Ok(())
}
