//! CLI argument definitions
//!
//! All Clap derive structs for `ngx-scaffold` command-line parsing.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config::{ModeKind, Overrides};

// ============================================================================
// Root CLI
// ============================================================================

/// Data-driven test scaffold for nginx-style servers.
#[derive(Parser, Debug)]
#[command(name = "ngx-scaffold", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except errors from the run itself.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output control.
    #[arg(long, default_value = "auto", global = true, env = "NGX_SCAFFOLD_COLOR")]
    pub color: ColorChoice,

    /// Log output format (logs go to stderr).
    #[arg(long, default_value = "human", global = true)]
    pub log_format: OutputFormat,
}

// ============================================================================
// Commands
// ============================================================================

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run test suites against the server-under-test.
    Run(RunArgs),

    /// Parse suites without starting anything.
    Validate(ValidateArgs),

    /// List the blocks of each suite and their sections.
    List(ListArgs),

    /// Generate shell completion scripts.
    Completions(CompletionsArgs),

    /// Display version information.
    Version(VersionArgs),
}

/// Arguments for `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Suite files, or directories searched for `*.t` files.
    #[arg(default_value = "t")]
    pub paths: Vec<PathBuf>,

    /// Path to the harness configuration file.
    #[arg(short, long, env = "NGX_SCAFFOLD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Test mode.
    #[arg(short, long, env = "NGX_SCAFFOLD_MODE")]
    pub mode: Option<ModeKind>,

    /// Server command line (`{prefix}` and `{conf}` are substituted).
    #[arg(long, env = "NGX_SCAFFOLD_SERVER_COMMAND")]
    pub server_command: Option<String>,

    /// Port the server listens on.
    #[arg(short, long, env = "NGX_SCAFFOLD_PORT")]
    pub port: Option<u16>,

    /// Reject unknown sections.
    #[arg(long)]
    pub strict: bool,

    /// Write structured JSONL events to this file.
    #[arg(long, env = "NGX_SCAFFOLD_EVENTS")]
    pub events: Option<PathBuf>,

    /// Directory to capture request/response traffic.
    #[arg(long, env = "NGX_SCAFFOLD_CAPTURE_DIR")]
    pub capture_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "NGX_SCAFFOLD_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Interception library preloaded in fault-injecting mode.
    #[arg(long, env = "NGX_SCAFFOLD_PRELOAD")]
    pub preload: Option<PathBuf>,

    /// Output pattern after which writes are refused in fault-injecting mode.
    #[arg(long, env = "NGX_SCAFFOLD_WRITE_TIMEOUT_PATTERN")]
    pub write_timeout_pattern: Option<String>,

    /// Event mechanism rendered in fault-injecting mode.
    #[arg(long, env = "NGX_SCAFFOLD_EVENT_TYPE")]
    pub event_type: Option<String>,

    /// Stop each suite at its first failing block.
    #[arg(long)]
    pub fail_fast: bool,
}

impl RunArgs {
    /// Command-line values that take precedence over the config file.
    #[must_use]
    pub fn overrides(&self) -> Overrides {
        Overrides {
            mode: self.mode,
            server_command: self.server_command.clone(),
            port: self.port,
            preload: self.preload.clone(),
            write_timeout_pattern: self.write_timeout_pattern.clone(),
            event_type: self.event_type.clone(),
            strict: self.strict,
        }
    }
}

/// Arguments for `validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Suite files or directories to validate.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Path to the harness configuration file.
    #[arg(short, long, env = "NGX_SCAFFOLD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,

    /// Reject unknown sections.
    #[arg(long)]
    pub strict: bool,
}

/// Arguments for `list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Suite files or directories to list.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

/// Arguments for shell completion generation.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell for completion script.
    pub shell: Shell,
}

/// Arguments for version display.
#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    /// Auto-detect terminal support.
    #[default]
    Auto,
    /// Always use color.
    Always,
    /// Never use color.
    Never,
}

/// Output format for structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

/// Shell type for completion generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    /// Bash shell.
    Bash,
    /// Zsh shell.
    Zsh,
    /// Fish shell.
    Fish,
    /// `PowerShell`.
    #[value(name = "powershell")]
    PowerShell,
    /// Elvish shell.
    Elvish,
}

// ============================================================================
// Tests
// ============================================================================
