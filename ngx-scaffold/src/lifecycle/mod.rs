//! Server lifecycle controller.
//!
//! The [`Controller`] owns the server root, the one live
//! [`ServerProcess`] and the [`LogCursor`]. It renders configurations,
//! starts, reloads and stops the server, and hands out log tails. Test
//! modes decide *which* of these to call; the controller only knows *how*.

pub mod log;
pub mod process;
pub mod render;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use ngx_scaffold_core::TestBlock;

use crate::config::{ServerSettings, parse_signal};
use crate::error::LifecycleError;
use crate::observability::metrics;

pub use log::{LogCursor, LogSnapshot};
pub use process::{LaunchSpec, Readiness, ServerProcess, ServerStatus};
pub use render::{DEFAULT_TEMPLATE, RenderContext, RenderHints, RenderedConfig};

/// Why the server did not reach readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupFailure {
    /// The process exited before accepting connections.
    Exited {
        /// Exit code, or `None` if killed by a signal.
        code: Option<i32>,
    },
    /// The process stayed up but never accepted within the grace period.
    NotReady {
        /// How long readiness was awaited.
        waited: Duration,
    },
}

impl std::fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "server exited with code {code}"),
            Self::Exited { code: None } => f.write_str("server was killed by a signal"),
            Self::NotReady { waited } => {
                write!(f, "server not accepting after {}", humantime::format_duration(*waited))
            }
        }
    }
}

/// How the server came to be ready (or not) for a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    /// A new process reached readiness.
    Started,
    /// The running process already serves this configuration.
    Reused,
    /// The running process accepted this configuration via reload.
    Reloaded,
    /// The server did not reach readiness.
    Failed(StartupFailure),
}

impl StartupOutcome {
    /// Whether the server is accepting connections.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Owns the server root, the server process and its log cursor.
#[derive(Debug)]
pub struct Controller {
    prefix: PathBuf,
    listen: SocketAddr,
    template: String,
    log_level: String,
    launch: LaunchSpec,
    stop_signal: Signal,
    startup_grace: Duration,
    reload_settle: Duration,
    stop_timeout: Duration,
    multiplier: f64,
    process: Option<ServerProcess>,
    current: Option<RenderedConfig>,
    cursor: LogCursor,
    generation: u64,
}

impl Controller {
    /// Prepares the server root and reads the template.
    ///
    /// `multiplier` widens the startup, reload and stop waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the server root cannot be created, the template
    /// cannot be read, or the stop signal is unknown.
    pub fn new(
        settings: &ServerSettings,
        launch: LaunchSpec,
        multiplier: f64,
    ) -> Result<Self, LifecycleError> {
        std::fs::create_dir_all(&settings.servroot)?;
        let prefix = std::fs::canonicalize(&settings.servroot)?;
        for dir in ["conf", "logs", "html"] {
            std::fs::create_dir_all(prefix.join(dir))?;
        }

        let template = match &settings.template {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                LifecycleError::Render(format!("cannot read template {}: {e}", path.display()))
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        let stop_signal = parse_signal(&settings.stop_signal)
            .map_err(|name| LifecycleError::Render(format!("unknown stop signal '{name}'")))?;

        let cursor = LogCursor::new(0, tracked_logs(&prefix));
        Ok(Self {
            prefix,
            listen: settings.listen,
            template,
            log_level: settings.log_level.clone(),
            launch,
            stop_signal,
            startup_grace: settings.startup_grace,
            reload_settle: settings.reload_settle,
            stop_timeout: settings.stop_timeout,
            multiplier,
            process: None,
            current: None,
            cursor,
            generation: 0,
        })
    }

    /// Absolute server root.
    #[must_use]
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn listen(&self) -> SocketAddr {
        self.listen
    }

    /// Path the rendered configuration is written to.
    #[must_use]
    pub fn conf_path(&self) -> PathBuf {
        self.prefix.join("conf").join("nginx.conf")
    }

    /// Configuration the live process was started or reloaded with.
    #[must_use]
    pub const fn current_config(&self) -> Option<&RenderedConfig> {
        self.current.as_ref()
    }

    /// Current generation (0 before the first start).
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Process id of the live server, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ServerProcess::pid)
    }

    /// Whether a process is held and has not exited.
    pub fn is_running(&mut self) -> bool {
        self.process
            .as_mut()
            .is_some_and(|p| p.status() == ServerStatus::Running && p.is_alive())
    }

    /// Scales a duration by the mode multiplier.
    #[must_use]
    pub fn scaled(&self, duration: Duration) -> Duration {
        duration.mul_f64(self.multiplier)
    }

    /// Renders the configuration for `block`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Render`] if the template is malformed.
    pub fn configure(
        &self,
        block: &TestBlock,
        hints: &RenderHints,
    ) -> Result<RenderedConfig, LifecycleError> {
        let context = RenderContext {
            prefix: self.prefix.clone(),
            listen: self.listen.to_string(),
            log_level: self.log_level.clone(),
        };
        render::render(&self.template, block, &context, hints)
    }

    /// Starts a fresh generation with `config`.
    ///
    /// Any live process is stopped first. Logs of the previous generation
    /// are truncated so the new generation's cursor starts at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the server root cannot be written or the
    /// command cannot be spawned. A server that dies or never accepts is a
    /// [`StartupOutcome::Failed`], not an error.
    pub async fn start(&mut self, config: &RenderedConfig) -> Result<StartupOutcome, LifecycleError> {
        self.stop("restart").await;

        std::fs::write(self.conf_path(), config.text())?;
        for path in tracked_logs(&self.prefix) {
            std::fs::File::create(path)?;
        }
        self.generation += 1;
        self.cursor.reset(self.generation);
        self.current = Some(config.clone());

        let mut process =
            ServerProcess::spawn(&self.launch, &self.prefix, &self.conf_path(), self.generation)?;
        let grace = self.scaled(self.startup_grace);
        let readiness = process.wait_ready(self.listen, grace).await;
        let outcome = match readiness {
            Readiness::Ready => {
                info!(pid = ?process.pid(), generation = self.generation, "server ready");
                StartupOutcome::Started
            }
            Readiness::Exited(code) => {
                debug!(?code, "server exited before ready");
                StartupOutcome::Failed(StartupFailure::Exited { code })
            }
            Readiness::TimedOut => {
                warn!(?grace, "server not ready within grace period");
                StartupOutcome::Failed(StartupFailure::NotReady { waited: grace })
            }
        };
        metrics::record_server_start(outcome.is_ready());

        self.process = Some(process);
        if !outcome.is_ready() {
            // Reap (or kill) what is left so the port is free.
            self.stop("startup failed").await;
        }
        Ok(outcome)
    }

    /// Applies `config` to the live process with a graceful reload.
    ///
    /// The log cursor is re-baselined at the pre-signal lengths, so output
    /// caused by the reload belongs to the new generation.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Reload`] if there is no live process, the
    /// signal cannot be delivered, or the process is not alive and
    /// accepting after the settle time.
    pub async fn reload(&mut self, config: &RenderedConfig) -> Result<(), LifecycleError> {
        let settle = self.scaled(self.reload_settle);
        let listen = self.listen;
        let conf = self.conf_path();
        let Some(process) = self.process.as_mut() else {
            return Err(LifecycleError::Reload("no server process to reload".to_string()));
        };

        std::fs::write(conf, config.text())?;
        self.generation += 1;
        self.cursor.rebaseline(self.generation);
        process.set_generation(self.generation);

        process
            .signal(Signal::SIGHUP)
            .map_err(|e| LifecycleError::Reload(format!("cannot signal server: {e}")))?;
        tokio::time::sleep(settle).await;

        let serving = process.is_serving(listen).await;
        metrics::record_reload(serving);
        if !serving {
            return Err(LifecycleError::Reload(
                "server not alive and accepting after reload".to_string(),
            ));
        }
        info!(generation = self.generation, "server reloaded");
        self.current = Some(config.clone());
        Ok(())
    }

    /// Stops the live process, if any. Idempotent.
    pub async fn stop(&mut self, reason: &str) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let pid = process.pid();
        process.stop(self.stop_signal, self.scaled(self.stop_timeout)).await;
        self.current = None;
        debug!(?pid, reason, "server stopped");
    }

    /// Reads log output appended since the previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a log file cannot be read.
    pub fn snapshot(&mut self) -> std::io::Result<LogSnapshot> {
        self.cursor.read_new()
    }

    /// Drops unread log output, e.g. late lines of a previous block.
    pub fn skip_log_backlog(&mut self) {
        self.cursor.skip_to_end();
    }
}

fn tracked_logs(prefix: &Path) -> [PathBuf; 2] {
    [
        render::error_log_path(prefix),
        prefix.join("logs").join("stderr.log"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_outcome_readiness() {
        assert!(StartupOutcome::Started.is_ready());
        assert!(StartupOutcome::Reused.is_ready());
        assert!(StartupOutcome::Reloaded.is_ready());
        assert!(!StartupOutcome::Failed(StartupFailure::Exited { code: Some(1) }).is_ready());
    }

    #[test]
    fn test_startup_failure_display() {
        assert_eq!(
            StartupFailure::Exited { code: Some(1) }.to_string(),
            "server exited with code 1"
        );
        assert_eq!(
            StartupFailure::NotReady {
                waited: Duration::from_secs(5)
            }
            .to_string(),
            "server not accepting after 5s"
        );
    }

    #[test]
    fn test_new_prepares_server_root() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            servroot: dir.path().join("servroot"),
            ..ServerSettings::default()
        };
        let launch = LaunchSpec::from_command(&settings.command, &settings.env).unwrap();
        let controller = Controller::new(&settings, launch, 1.0).unwrap();
        for sub in ["conf", "logs", "html"] {
            assert!(controller.prefix().join(sub).is_dir());
        }
        assert!(controller.prefix().is_absolute());
        assert_eq!(controller.generation(), 0);
    }

    #[test]
    fn test_scaled_uses_multiplier() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            servroot: dir.path().to_path_buf(),
            ..ServerSettings::default()
        };
        let launch = LaunchSpec::from_command(&settings.command, &settings.env).unwrap();
        let controller = Controller::new(&settings, launch, 3.0).unwrap();
        assert_eq!(controller.scaled(Duration::from_secs(2)), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_failed_start_is_an_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            servroot: dir.path().to_path_buf(),
            listen: "127.0.0.1:9".parse().unwrap(),
            ..ServerSettings::default()
        };
        let launch = LaunchSpec::from_command(
            "sh -c 'echo \"[emerg] I am dying!\" >> {prefix}/logs/error.log; exit 1'",
            &settings.env,
        )
        .unwrap();
        let mut controller = Controller::new(&settings, launch, 1.0).unwrap();
        let block = ngx_scaffold_core::parse_suite(
            "t.t",
            "=== TEST 1\n--- config\n",
            &ngx_scaffold_core::ParseOptions::default(),
        )
        .unwrap()
        .suite
        .blocks
        .remove(0);
        let config = controller.configure(&block, &RenderHints::default()).unwrap();

        let outcome = controller.start(&config).await.unwrap();
        assert_eq!(
            outcome,
            StartupOutcome::Failed(StartupFailure::Exited { code: Some(1) })
        );
        assert!(!controller.is_running());
        let logs = controller.snapshot().unwrap();
        assert!(logs.text().contains("I am dying!"));
        controller.stop("test").await;
    }
}
