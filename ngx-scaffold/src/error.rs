//! Error types for `ngx-scaffold`
//!
//! Errors are layered the way failures propagate through a run: parse and
//! configuration errors abort before anything starts, lifecycle and mock
//! errors are contained to a block unless the server cannot be recovered,
//! and expectation mismatches are never errors at all (they are data on a
//! [`Verdict`](crate::evaluate::Verdict)).

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use ngx_scaffold_core::ParseError;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `ngx-scaffold` CLI operations.
pub struct ExitCode;

impl ExitCode {
    /// Every selected block passed
    pub const SUCCESS: i32 = 0;

    /// One or more blocks failed
    pub const TEST_FAILURE: i32 = 1;

    /// Configuration or suite parse error
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, permission denied)
    pub const IO_ERROR: i32 = 3;

    /// Server-under-test left in an unrecoverable state
    pub const LIFECYCLE_FATAL: i32 = 4;

    /// Usage error (invalid arguments, missing required options)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `ngx-scaffold` operations.
#[derive(Debug, Error)]
pub enum ScaffoldError {
    /// Harness configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Test-suite document failed to parse
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Server lifecycle error outside a block's containment
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The server-under-test could not be recovered; the run is halted
    #[error("fatal: {0}")]
    Fatal(String),

    /// One or more blocks failed
    #[error("{failed} of {total} blocks failed")]
    TestsFailed {
        /// Number of failing blocks
        failed: usize,
        /// Number of blocks run
        total: usize,
    },

    /// Invalid command-line usage
    #[error("usage: {0}")]
    Usage(String),

    /// The run was cancelled by a signal; the server has been stopped
    #[error("interrupted")]
    Interrupted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScaffoldError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Parse(_) | Self::Json(_) => ExitCode::CONFIG_ERROR,
            Self::Lifecycle(_) | Self::Fatal(_) => ExitCode::LIFECYCLE_FATAL,
            Self::TestsFailed { .. } => ExitCode::TEST_FAILURE,
            Self::Usage(_) => ExitCode::USAGE_ERROR,
            Self::Interrupted => ExitCode::INTERRUPTED,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Harness configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed
    #[error("parse error in {path}: {message}")]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Configuration validation failed
    #[error("validation failed for {path}: {}", format_issues(errors))]
    ValidationError {
        /// Path to the configuration file
        path: String,
        /// List of validation issues found
        errors: Vec<ValidationIssue>,
    },

    /// Referenced file not found
    #[error("file not found: {path}")]
    MissingFile {
        /// Path to the missing file
        path: PathBuf,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// Environment variable referenced in configuration is not set
    #[error("environment variable '{var}' not set ({message})")]
    EnvVarNotSet {
        /// Name of the environment variable
        var: String,
        /// Message supplied with `${VAR:?message}`
        message: String,
    },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Validation Types
// ============================================================================

/// A single validation issue found during configuration validation.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Dotted path to the problematic field (e.g. `server.listen`)
    pub path: String,
    /// Description of the validation issue
    pub message: String,
    /// Severity level of the issue
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Prevents the configuration from being used
    Error,
    /// Reported but does not prevent loading
    Warning,
}

// ============================================================================
// Lifecycle Errors
// ============================================================================

/// Server lifecycle errors.
///
/// A startup that does not reach readiness is not an error: it is a
/// [`StartupOutcome`](crate::lifecycle::StartupOutcome) judged against
/// `must_die`. These variants cover the harness failing to do its own job.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The configuration template could not be rendered
    #[error("render failed: {0}")]
    Render(String),

    /// The server command could not be spawned
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Program that failed to start
        command: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A graceful reload did not take effect
    #[error("reload failed: {0}")]
    Reload(String),

    /// A clean restart after an unrecoverable state also failed
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    /// Server root or log I/O failed
    #[error("lifecycle I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Mock Server Errors
// ============================================================================

/// Mock backend server errors. Fatal to the declaring block only.
#[derive(Debug, Error)]
pub enum MockError {
    /// The declared address could not be bound
    #[error("failed to bind mock {protocol} listener on {addr}: {source}")]
    Bind {
        /// `"tcp"` or `"udp"`
        protocol: &'static str,
        /// Declared address
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// I/O error while serving
    #[error("mock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for `ngx-scaffold` operations.
pub type Result<T> = std::result::Result<T, ScaffoldError>;

// ============================================================================
// Tests
// ============================================================================
