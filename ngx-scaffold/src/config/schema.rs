//! Harness configuration schema.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! usable configuration for a local `nginx` binary on port 1984.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Root of the harness configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Server-under-test launch and lifecycle settings.
    pub server: ServerSettings,
    /// Request driver settings.
    pub client: ClientSettings,
    /// Test mode selection and per-mode settings.
    pub mode: ModeSettings,
    /// Block parser settings.
    pub parser: ParserSettings,
}

// ============================================================================
// Server
// ============================================================================

/// How the server-under-test is launched and managed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Command line with `{prefix}` and `{conf}` placeholders.
    pub command: String,

    /// Address the rendered config listens on and readiness is probed at.
    pub listen: SocketAddr,

    /// Server root holding `conf/`, `logs/` and `html/`.
    pub servroot: PathBuf,

    /// Optional config template replacing the built-in one.
    pub template: Option<PathBuf>,

    /// How long to wait for readiness after spawning.
    #[serde(with = "humantime_duration")]
    pub startup_grace: Duration,

    /// Pause after a reload signal before checking liveness.
    #[serde(with = "humantime_duration")]
    pub reload_settle: Duration,

    /// How long to wait for a graceful stop before `SIGKILL`.
    #[serde(with = "humantime_duration")]
    pub stop_timeout: Duration,

    /// Signal name for graceful stop (e.g. `QUIT`, `TERM`).
    pub stop_signal: String,

    /// Default error log level rendered into the config.
    pub log_level: String,

    /// Extra environment for the server process.
    pub env: IndexMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: "nginx -p {prefix} -c {conf}".to_string(),
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1984)),
            servroot: PathBuf::from("t/servroot"),
            template: None,
            startup_grace: Duration::from_secs(5),
            reload_settle: Duration::from_millis(300),
            stop_timeout: Duration::from_secs(3),
            stop_signal: "QUIT".to_string(),
            log_level: "debug".to_string(),
            env: IndexMap::new(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Request driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Default client timeout, overridden per block by `timeout`.
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,

    /// Pause before reading the log tail so the server can flush.
    #[serde(with = "humantime_duration")]
    pub log_settle: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            log_settle: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Mode
// ============================================================================

/// Which test mode runs the suite.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    /// Restart on config change, reuse otherwise.
    #[default]
    Plain,
    /// One process, reloaded on config change.
    Reload,
    /// Run under a memory instrumentation wrapper.
    Instrumented,
    /// Run with a syscall-interception library preloaded.
    FaultInjecting,
}

impl ModeKind {
    /// Stable name used in logs and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Reload => "reload",
            Self::Instrumented => "instrumented",
            Self::FaultInjecting => "fault-injecting",
        }
    }
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Test mode selection plus per-mode settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModeSettings {
    /// Active mode.
    pub kind: ModeKind,
    /// Settings for [`ModeKind::Instrumented`].
    pub instrumented: InstrumentedSettings,
    /// Settings for [`ModeKind::FaultInjecting`].
    pub fault_injection: FaultInjectionSettings,
}

/// Instrumented mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentedSettings {
    /// Wrapper command prepended to the server command.
    pub wrapper: String,
    /// Factor applied to every timeout.
    pub timeout_multiplier: f64,
}

impl Default for InstrumentedSettings {
    fn default() -> Self {
        Self {
            wrapper: "valgrind -q --leak-check=full --error-exitcode=0".to_string(),
            timeout_multiplier: 3.0,
        }
    }
}

/// Fault-injecting mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultInjectionSettings {
    /// Interception library to preload.
    pub preload: Option<PathBuf>,
    /// Value exported as `MOCKEAGAIN` (`r`, `w` or `rw`).
    pub io_modes: String,
    /// Output pattern after which writes are refused.
    pub write_timeout_pattern: Option<String>,
    /// Event mechanism rendered into the config.
    pub event_mechanism: String,
}

impl Default for FaultInjectionSettings {
    fn default() -> Self {
        Self {
            preload: None,
            io_modes: "w".to_string(),
            write_timeout_pattern: None,
            event_mechanism: "poll".to_string(),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Block parser settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserSettings {
    /// Reject unknown sections instead of dropping them.
    pub strict: bool,
}

/// `serde` adapter for human-readable durations such as `300ms` or `5s`.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
