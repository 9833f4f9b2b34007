//! CLI command dispatch and handlers
//!
//! Routes parsed CLI arguments to the appropriate command handler.

pub mod completions;
pub mod list;
pub mod run;
pub mod validate;
pub mod version;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::cli::args::{Cli, Commands};
use crate::error::ScaffoldError;

/// Dispatch a parsed CLI invocation to the appropriate command handler.
///
/// # Errors
///
/// Returns an error if the dispatched command handler fails.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<(), ScaffoldError> {
    match cli.command {
        Commands::Run(args) => run::run(&args, cancel).await,
        Commands::Validate(args) => validate::run(&args),
        Commands::List(args) => list::run(&args),
        Commands::Completions(args) => {
            completions::run(&args);
            Ok(())
        }
        Commands::Version(args) => {
            version::run(&args);
            Ok(())
        }
    }
}

/// Expands directories to the `*.t` files below them, sorted.
///
/// Files are kept as given, in command-line order.
///
/// # Errors
///
/// Returns an I/O error for a path that does not exist.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ScaffoldError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(suites_in(path)?);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(ScaffoldError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file not found: {}", path.display()),
            )));
        }
    }
    Ok(files)
}

fn suites_in(dir: &Path) -> Result<Vec<PathBuf>, ScaffoldError> {
    let pattern = dir.join("**").join("*.t");
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern)
        .map_err(|e| ScaffoldError::Usage(format!("bad path {}: {e}", dir.display())))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}
