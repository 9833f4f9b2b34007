//! Server-under-test process handle.
//!
//! The server runs in its own process group so that workers it forks are
//! signalled and reaped together with it. A handle that is dropped without
//! [`ServerProcess::stop`] still kills the whole group.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use indexmap::IndexMap;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LifecycleError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Launch specification
// ============================================================================

/// Program, arguments and environment used to start the server.
///
/// Arguments may contain `{prefix}` and `{conf}`, substituted at spawn
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    argv: Vec<String>,
    env: IndexMap<String, String>,
}

impl LaunchSpec {
    /// Splits a shell-style command line.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Render`] if the command is empty or has
    /// unbalanced quotes.
    pub fn from_command(
        command: &str,
        env: &IndexMap<String, String>,
    ) -> Result<Self, LifecycleError> {
        let argv = split_command(command)?;
        Ok(Self {
            argv,
            env: env.clone(),
        })
    }

    /// Prepends a wrapper command (e.g. an instrumentation tool).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Render`] if the wrapper cannot be split.
    pub fn wrap(&mut self, wrapper: &str) -> Result<(), LifecycleError> {
        let mut argv = split_command(wrapper)?;
        argv.append(&mut self.argv);
        self.argv = argv;
        Ok(())
    }

    /// Sets an environment variable for the server.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Arguments with placeholders still in place.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Extra environment.
    #[must_use]
    pub const fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    /// Arguments with `{prefix}` and `{conf}` filled in.
    #[must_use]
    pub fn resolve(&self, prefix: &Path, conf: &Path) -> Vec<String> {
        let prefix = prefix.display().to_string();
        let conf = conf.display().to_string();
        self.argv
            .iter()
            .map(|arg| arg.replace("{prefix}", &prefix).replace("{conf}", &conf))
            .collect()
    }
}

fn split_command(command: &str) -> Result<Vec<String>, LifecycleError> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        Some(_) => Err(LifecycleError::Render("server command is empty".to_string())),
        None => Err(LifecycleError::Render(format!(
            "command has unbalanced quotes: {command}"
        ))),
    }
}

// ============================================================================
// Process
// ============================================================================

/// Observed state of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Spawned, readiness not yet observed.
    Starting,
    /// Accepting connections.
    Running,
    /// Exited or timed out before becoming ready.
    FailedToStart,
    /// Stopped and reaped.
    Exited,
}

/// Result of waiting for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A TCP connect to the listen address succeeded.
    Ready,
    /// The process exited first.
    Exited(Option<i32>),
    /// Neither happened within the grace period.
    TimedOut,
}

/// A spawned server-under-test.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: Option<u32>,
    status: ServerStatus,
    generation: u64,
}

impl ServerProcess {
    /// Spawns the server with stdout/stderr appended to files in
    /// `logs_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Spawn`] if the program cannot be started,
    /// or [`LifecycleError::Io`] if the output files cannot be opened.
    pub fn spawn(
        launch: &LaunchSpec,
        prefix: &Path,
        conf: &Path,
        generation: u64,
    ) -> Result<Self, LifecycleError> {
        let argv = launch.resolve(prefix, conf);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LifecycleError::Render("server command is empty".to_string()))?;

        let logs_dir = prefix.join("logs");
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join("stdout.log"))?;
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join("stderr.log"))?;

        let child = Command::new(program)
            .args(args)
            .envs(launch.env())
            .current_dir(prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LifecycleError::Spawn {
                command: program.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(?pid, generation, program = %program, "server spawned");
        Ok(Self {
            child,
            pid,
            status: ServerStatus::Starting,
            generation,
        })
    }

    /// Process id, if the process has not been reaped.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ServerStatus {
        self.status
    }

    /// Configuration generation this process is serving.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Marks a reload as having started a new generation.
    pub const fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Polls until `addr` accepts, the process exits, or `grace` elapses.
    pub async fn wait_ready(&mut self, addr: SocketAddr, grace: Duration) -> Readiness {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(code) = self.exit_code() {
                self.status = ServerStatus::FailedToStart;
                return Readiness::Exited(code);
            }
            if probe(addr).await {
                // A stale listener from another process can accept too;
                // make sure ours is still alive.
                if let Some(code) = self.exit_code() {
                    self.status = ServerStatus::FailedToStart;
                    return Readiness::Exited(code);
                }
                self.status = ServerStatus::Running;
                return Readiness::Ready;
            }
            if Instant::now() >= deadline {
                self.status = ServerStatus::FailedToStart;
                return Readiness::TimedOut;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Whether the process is alive and `addr` accepts connections.
    pub async fn is_serving(&mut self, addr: SocketAddr) -> bool {
        self.is_alive() && probe(addr).await
    }

    /// Whether the process has not exited.
    pub fn is_alive(&mut self) -> bool {
        self.exit_code().is_none()
    }

    /// `Some(code)` once the process has exited.
    fn exit_code(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to poll server process");
                None
            }
        }
    }

    /// Sends `signal` to the process group.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub fn signal(&self, signal: Signal) -> Result<(), LifecycleError> {
        let Some(pgid) = self.pgid() else {
            return Ok(());
        };
        killpg(pgid, signal).map_err(|errno| LifecycleError::Io(errno.into()))
    }

    fn pgid(&self) -> Option<Pid> {
        self.pid
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw)
    }

    /// Stops the process group: `signal`, then `SIGKILL` after `timeout`.
    ///
    /// Always reaps the leader. Calling it again is a no-op.
    pub async fn stop(&mut self, signal: Signal, timeout: Duration) {
        if self.status == ServerStatus::Exited {
            return;
        }
        if self.is_alive() {
            if let Err(e) = self.signal(signal) {
                debug!(error = %e, "stop signal not delivered");
            }
            if tokio::time::timeout(timeout, self.child.wait()).await.is_err() {
                warn!(pid = ?self.pid, ?timeout, "server ignored stop signal, killing");
                self.kill_group();
            }
        }
        if let Err(e) = self.child.wait().await {
            warn!(error = %e, "failed to reap server process");
        }
        // Workers may outlive the leader.
        self.kill_group();
        self.status = ServerStatus::Exited;
        self.pid = None;
    }

    fn kill_group(&self) {
        if let Some(pgid) = self.pgid() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.status != ServerStatus::Exited {
            self.kill_group();
        }
    }
}

async fn probe(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_resolves_placeholders() {
        let spec = LaunchSpec::from_command("nginx -p {prefix} -c {conf}", &IndexMap::new()).unwrap();
        let argv = spec.resolve(Path::new("/s"), Path::new("/s/conf/nginx.conf"));
        assert_eq!(argv, ["nginx", "-p", "/s", "-c", "/s/conf/nginx.conf"]);
    }

    #[test]
    fn test_launch_spec_wrap_and_env() {
        let mut spec = LaunchSpec::from_command("nginx -c '{conf}'", &IndexMap::new()).unwrap();
        spec.wrap("valgrind -q --leak-check=full").unwrap();
        spec.set_env("MOCKEAGAIN", "w");
        assert_eq!(
            spec.argv(),
            ["valgrind", "-q", "--leak-check=full", "nginx", "-c", "{conf}"]
        );
        assert_eq!(spec.env().get("MOCKEAGAIN").map(String::as_str), Some("w"));
    }

    #[test]
    fn test_launch_spec_rejects_bad_commands() {
        assert!(LaunchSpec::from_command("", &IndexMap::new()).is_err());
        assert!(LaunchSpec::from_command("nginx 'unterminated", &IndexMap::new()).is_err());
    }

    fn prefix() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_reported() {
        let dir = prefix();
        let spec = LaunchSpec::from_command("sh -c 'echo dying >&2; exit 3'", &IndexMap::new())
            .unwrap();
        let mut process =
            ServerProcess::spawn(&spec, dir.path(), &dir.path().join("x.conf"), 1).unwrap();
        let readiness = process
            .wait_ready("127.0.0.1:9".parse().unwrap(), Duration::from_secs(5))
            .await;
        assert_eq!(readiness, Readiness::Exited(Some(3)));
        assert_eq!(process.status(), ServerStatus::FailedToStart);
        process.stop(Signal::SIGTERM, Duration::from_secs(1)).await;

        let stderr = std::fs::read_to_string(dir.path().join("logs/stderr.log")).unwrap();
        assert!(stderr.contains("dying"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = prefix();
        let spec = LaunchSpec::from_command("sleep 30", &IndexMap::new()).unwrap();
        let mut process =
            ServerProcess::spawn(&spec, dir.path(), &dir.path().join("x.conf"), 1).unwrap();
        assert!(process.is_alive());

        process.stop(Signal::SIGTERM, Duration::from_secs(2)).await;
        assert_eq!(process.status(), ServerStatus::Exited);
        assert!(process.pid().is_none());
        process.stop(Signal::SIGTERM, Duration::from_secs(2)).await;
        assert_eq!(process.status(), ServerStatus::Exited);
    }

    #[tokio::test]
    async fn test_ignored_stop_signal_escalates_to_kill() {
        let dir = prefix();
        let spec =
            LaunchSpec::from_command("sh -c 'trap \"\" TERM; sleep 30'", &IndexMap::new()).unwrap();
        let mut process =
            ServerProcess::spawn(&spec, dir.path(), &dir.path().join("x.conf"), 1).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        process.stop(Signal::SIGTERM, Duration::from_millis(200)).await;
        assert_eq!(process.status(), ServerStatus::Exited);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let dir = prefix();
        let spec =
            LaunchSpec::from_command("/nonexistent/ngx-scaffold-server", &IndexMap::new()).unwrap();
        let err = ServerProcess::spawn(&spec, dir.path(), &dir.path().join("x.conf"), 1)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Spawn { .. }));
    }
}
