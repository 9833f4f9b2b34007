//! Harness configuration loader
//!
//! Loading is a short pipeline:
//! 1. Environment variable expansion (pre-parse, on raw text)
//! 2. YAML parsing into [`HarnessConfig`]
//! 3. Command-line overrides
//! 4. Validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::config::schema::{HarnessConfig, ModeKind};
use crate::error::{ConfigError, Severity, ValidationIssue};

/// Maximum configuration file size in bytes.
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Log levels accepted in `server.log_level`.
const LOG_LEVELS: &[&str] = &[
    "debug", "info", "notice", "warn", "error", "crit", "alert", "emerg",
];

// ============================================================================
// Public API
// ============================================================================

/// Result of loading a configuration file.
#[derive(Debug)]
pub struct LoadResult {
    /// The loaded and validated configuration.
    pub config: HarnessConfig,

    /// Warnings encountered during loading.
    pub warnings: Vec<LoadWarning>,
}

/// Warning during configuration loading.
#[derive(Debug, Clone)]
pub struct LoadWarning {
    /// Warning message.
    pub message: String,

    /// Location where the warning occurred.
    pub location: Option<String>,
}

/// Values from the command line (or their environment variables) that
/// take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--mode` / `NGX_SCAFFOLD_MODE`
    pub mode: Option<ModeKind>,
    /// `--server-command` / `NGX_SCAFFOLD_SERVER_COMMAND`
    pub server_command: Option<String>,
    /// `--port` / `NGX_SCAFFOLD_PORT`
    pub port: Option<u16>,
    /// `--preload` / `NGX_SCAFFOLD_PRELOAD`
    pub preload: Option<PathBuf>,
    /// `--write-timeout-pattern` / `NGX_SCAFFOLD_WRITE_TIMEOUT_PATTERN`
    pub write_timeout_pattern: Option<String>,
    /// `--event-type` / `NGX_SCAFFOLD_EVENT_TYPE`
    pub event_type: Option<String>,
    /// `--strict`
    pub strict: bool,
}

impl Overrides {
    /// Applies every present override to `config`.
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(mode) = self.mode {
            config.mode.kind = mode;
        }
        if let Some(command) = &self.server_command {
            config.server.command.clone_from(command);
        }
        if let Some(port) = self.port {
            config.server.listen.set_port(port);
        }
        if let Some(preload) = &self.preload {
            config.mode.fault_injection.preload = Some(preload.clone());
        }
        if let Some(pattern) = &self.write_timeout_pattern {
            config.mode.fault_injection.write_timeout_pattern = Some(pattern.clone());
        }
        if let Some(event_type) = &self.event_type {
            config.mode.fault_injection.event_mechanism.clone_from(event_type);
        }
        if self.strict {
            config.parser.strict = true;
        }
    }
}

/// Loads the harness configuration.
///
/// With no path the built-in defaults are used. Overrides are applied
/// before validation so an override can fix an otherwise invalid file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read or exceeds the size limit
/// - A `${VAR:?message}` reference is unset
/// - YAML parsing fails
/// - Validation finds any error-severity issue
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<LoadResult, ConfigError> {
    let mut warnings = Vec::new();

    let mut config = match path {
        Some(path) => read_file(path, &mut warnings)?,
        None => HarnessConfig::default(),
    };
    overrides.apply(&mut config);

    let display = path.map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string());
    let issues = validate(&config);
    let (errors, rest): (Vec<_>, Vec<_>) = issues
        .into_iter()
        .partition(|issue| issue.severity == Severity::Error);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationError {
            path: display,
            errors,
        });
    }
    warnings.extend(rest.into_iter().map(|issue| LoadWarning {
        message: issue.message,
        location: Some(issue.path),
    }));

    Ok(LoadResult { config, warnings })
}

fn read_file(path: &Path, warnings: &mut Vec<LoadWarning>) -> Result<HarnessConfig, ConfigError> {
    let metadata = std::fs::metadata(path).map_err(|_| ConfigError::MissingFile {
        path: path.to_path_buf(),
    })?;
    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(ConfigError::InvalidValue {
            field: "file_size".to_string(),
            value: format!("{} bytes", metadata.len()),
            expected: format!("at most {MAX_CONFIG_SIZE} bytes"),
        });
    }

    let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::MissingFile {
        path: path.to_path_buf(),
    })?;
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);

    let mut env_sub = EnvSubstitution::new();
    let substituted = env_sub.substitute(raw, path)?;
    warnings.extend(env_sub.warnings);

    if substituted.trim().is_empty() {
        return Ok(HarnessConfig::default());
    }

    serde_yaml::from_str(&substituted).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        line: e.location().map(|l| l.line()),
        message: e.to_string(),
    })
}

/// Parses a signal name such as `QUIT` or `SIGQUIT`.
///
/// # Errors
///
/// Returns the unrecognised name.
pub fn parse_signal(name: &str) -> Result<Signal, String> {
    let name = name.trim().to_ascii_uppercase();
    let full = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    full.parse::<Signal>().map_err(|_| full)
}

// ============================================================================
// Validation
// ============================================================================

/// Checks a configuration for values that cannot work.
#[must_use]
pub fn validate(config: &HarnessConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut error = |path: &str, message: String| {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message,
            severity: Severity::Error,
        });
    };

    match shlex::split(&config.server.command) {
        Some(argv) if !argv.is_empty() => {}
        Some(_) => error("server.command", "command is empty".to_string()),
        None => error(
            "server.command",
            "command has unbalanced quotes".to_string(),
        ),
    }
    if config.server.listen.port() == 0 {
        error("server.listen", "port must be non-zero".to_string());
    }
    if let Err(name) = parse_signal(&config.server.stop_signal) {
        error("server.stop_signal", format!("unknown signal '{name}'"));
    }
    if !LOG_LEVELS.contains(&config.server.log_level.as_str()) {
        error(
            "server.log_level",
            format!("unknown log level '{}'", config.server.log_level),
        );
    }
    if let Some(template) = &config.server.template {
        if !template.is_file() {
            error(
                "server.template",
                format!("template not found: {}", template.display()),
            );
        }
    }
    for (path, value) in [
        ("server.startup_grace", config.server.startup_grace),
        ("server.stop_timeout", config.server.stop_timeout),
        ("client.timeout", config.client.timeout),
    ] {
        if value == Duration::ZERO {
            error(path, "duration must be non-zero".to_string());
        }
    }
    let multiplier = config.mode.instrumented.timeout_multiplier;
    if !multiplier.is_finite() || multiplier < 1.0 {
        error(
            "mode.instrumented.timeout_multiplier",
            format!("multiplier must be at least 1.0, got {multiplier}"),
        );
    }
    if config.mode.kind == ModeKind::Instrumented
        && shlex::split(&config.mode.instrumented.wrapper).is_none_or(|argv| argv.is_empty())
    {
        error(
            "mode.instrumented.wrapper",
            "wrapper command is empty or malformed".to_string(),
        );
    }

    let fault = &config.mode.fault_injection;
    if !matches!(fault.io_modes.as_str(), "r" | "w" | "rw" | "wr") {
        error(
            "mode.fault_injection.io_modes",
            format!("expected r, w or rw, got '{}'", fault.io_modes),
        );
    }
    if config.mode.kind == ModeKind::FaultInjecting && fault.preload.is_none() {
        issues.push(ValidationIssue {
            path: "mode.fault_injection.preload".to_string(),
            message: "no interception library set; faults will only be emulated if one is \
                      preloaded by other means"
                .to_string(),
            severity: Severity::Warning,
        });
    }
    if !config.server.command.contains("{conf}") {
        issues.push(ValidationIssue {
            path: "server.command".to_string(),
            message: "command has no {conf} placeholder; the rendered config will not be passed"
                .to_string(),
            severity: Severity::Warning,
        });
    }

    issues
}

// ============================================================================
// Environment Variable Substitution
// ============================================================================

/// Pre-parse environment variable substitution.
///
/// Runs on raw YAML text before parsing to preserve type inference.
struct EnvSubstitution {
    warnings: Vec<LoadWarning>,
}

impl EnvSubstitution {
    const fn new() -> Self {
        Self {
            warnings: Vec::new(),
        }
    }

    /// Substitutes environment variables in raw YAML text.
    ///
    /// Supports:
    /// - `${VAR}` expands to the value (empty with a warning if unset)
    /// - `${VAR:-default}` expands to `default` if unset
    /// - `${VAR:?message}` fails if unset
    /// - `$$` is a literal `$`
    fn substitute(&mut self, raw: &str, source_path: &Path) -> Result<String, ConfigError> {
        let mut result = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                result.push(c);
                continue;
            }
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next();
                    let spec = parse_var_spec(&mut chars, source_path)?;
                    match (std::env::var(&spec.name), spec.fallback) {
                        (Ok(value), _) => result.push_str(&value),
                        (Err(_), Some(Fallback::Default(value))) => result.push_str(&value),
                        (Err(_), Some(Fallback::Required(message))) => {
                            return Err(ConfigError::EnvVarNotSet {
                                var: spec.name,
                                message,
                            });
                        }
                        (Err(_), None) => self.warnings.push(LoadWarning {
                            message: format!(
                                "environment variable '{}' is not set, using empty string",
                                spec.name
                            ),
                            location: Some(source_path.display().to_string()),
                        }),
                    }
                }
                _ => result.push(c),
            }
        }

        Ok(result)
    }
}

enum Fallback {
    Default(String),
    Required(String),
}

struct VarSpec {
    name: String,
    fallback: Option<Fallback>,
}

fn unclosed(source_path: &Path, name: &str) -> ConfigError {
    ConfigError::ParseError {
        path: source_path.to_path_buf(),
        line: None,
        message: format!("unclosed environment variable reference: ${{{name}"),
    }
}

/// Parses the inside of `${...}` after the opening brace.
fn parse_var_spec(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    source_path: &Path,
) -> Result<VarSpec, ConfigError> {
    let mut name = String::new();
    while let Some(c) = chars.next() {
        match c {
            '}' => {
                return Ok(VarSpec {
                    name,
                    fallback: None,
                });
            }
            ':' if matches!(chars.peek(), Some('-' | '?')) => {
                let required = chars.next() == Some('?');
                let value = read_until_close(chars).ok_or_else(|| unclosed(source_path, &name))?;
                let fallback = if required {
                    Fallback::Required(value)
                } else {
                    Fallback::Default(value)
                };
                return Ok(VarSpec {
                    name,
                    fallback: Some(fallback),
                });
            }
            other => name.push(other),
        }
    }
    Err(unclosed(source_path, &name))
}

/// Reads up to the matching `}`, allowing nested braces.
fn read_until_close(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<String> {
    let mut value = String::new();
    let mut depth = 1usize;
    for c in chars.by_ref() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(value);
                }
            }
            _ => {}
        }
        value.push(c);
    }
    None
}

// ============================================================================
// Tests
// ============================================================================
