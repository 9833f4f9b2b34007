//! `validate` command handler.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use ngx_scaffold_core::ParseError;

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::cli::commands::expand_paths;
use crate::config::{self, Overrides};
use crate::error::ScaffoldError;
use crate::runner::{load_suite, parse_options, suite_variables};

#[derive(Debug, Serialize)]
struct FileReport {
    file: String,
    valid: bool,
    blocks: usize,
    warnings: Vec<String>,
    error: Option<String>,
}

/// Parses every suite without starting anything.
///
/// Every file is checked, then the first parse error (if any) is returned.
///
/// # Errors
///
/// Returns an I/O error if a file cannot be read, a config error if the
/// configuration is invalid, or the first parse error found.
pub fn run(args: &ValidateArgs) -> Result<(), ScaffoldError> {
    let overrides = Overrides {
        strict: args.strict,
        ..Overrides::default()
    };
    let config = config::load(args.config.as_deref(), &overrides)?.config;
    let variables = suite_variables(config.server.listen, &config.server.servroot);
    let options = parse_options(config.parser.strict, variables);

    let mut reports = Vec::new();
    let mut first_error: Option<ParseError> = None;
    for path in expand_paths(&args.paths)? {
        let report = match load_suite(&path, &options) {
            Ok(output) => FileReport {
                file: path.display().to_string(),
                valid: true,
                blocks: output.suite.blocks.len(),
                warnings: output.warnings.iter().map(ToString::to_string).collect(),
                error: None,
            },
            Err(ScaffoldError::Parse(e)) => {
                let report = invalid(&path, &e);
                first_error.get_or_insert(e);
                report
            }
            Err(e) => return Err(e),
        };
        reports.push(report);
    }

    match args.format {
        OutputFormat::Human => {
            for report in &reports {
                print_human(report);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => {
            info!(files = reports.len(), "all suites valid");
            Ok(())
        }
    }
}

fn invalid(path: &Path, error: &ParseError) -> FileReport {
    FileReport {
        file: path.display().to_string(),
        valid: false,
        blocks: 0,
        warnings: Vec::new(),
        error: Some(error.to_string()),
    }
}

fn print_human(report: &FileReport) {
    match &report.error {
        None => {
            println!("{}: ok ({} blocks)", report.file, report.blocks);
            for warning in &report.warnings {
                println!("  warning: {warning}");
            }
        }
        Some(error) => println!("{}: invalid\n  {error}", report.file),
    }
}
