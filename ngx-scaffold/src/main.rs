//! `ngx-scaffold` - data-driven test scaffold for nginx-style servers

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use ngx_scaffold::cli::args::{Cli, OutputFormat};
use ngx_scaffold::cli::commands;
use ngx_scaffold::error::{ExitCode, ScaffoldError};
use ngx_scaffold::observability::{LogFormat, init_logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = match cli.log_format {
        OutputFormat::Human => LogFormat::Human,
        OutputFormat::Json => LogFormat::Json,
    };
    init_logging(format, cli.verbose, cli.quiet, cli.color);

    // First signal: finish the current block, stop the server, report.
    // Second signal: exit immediately.
    let cancel = CancellationToken::new();
    let signal_code = Arc::new(AtomicI32::new(ExitCode::INTERRUPTED));
    {
        let cancel = cancel.clone();
        let signal_code = Arc::clone(&signal_code);
        tokio::spawn(async move {
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                eprintln!("warning: cannot register SIGTERM handler");
                return;
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => signal_code.store(ExitCode::TERMINATED, Ordering::SeqCst),
            }
            eprintln!("\nStopping after the current block... (press Ctrl+C again to force)");
            cancel.cancel();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => std::process::exit(ExitCode::INTERRUPTED),
                _ = sigterm.recv() => std::process::exit(ExitCode::TERMINATED),
            }
        });
    }

    match commands::dispatch(cli, cancel).await {
        Ok(()) => std::process::exit(ExitCode::SUCCESS),
        Err(ScaffoldError::Interrupted) => {
            eprintln!("interrupted");
            std::process::exit(signal_code.load(Ordering::SeqCst));
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
