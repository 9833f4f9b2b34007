//! Shared integration-test helpers: harness configuration, an in-process
//! fake server-under-test and log helpers.
//!
//! The fake server pairs a long-running `sleep` process (what the harness
//! spawns, signals and reaps) with a tokio listener on the configured port
//! (what readiness probes and requests reach).

#![allow(dead_code)]

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use ngx_scaffold::config::{HarnessConfig, ModeKind};
use ngx_scaffold::observability::EventEmitter;
use ngx_scaffold::report::{Reporter, SuiteSummary};
use ngx_scaffold::runner::{Harness, parse_options};
use ngx_scaffold_core::{Suite, parse_suite};

/// A process that stays up until signalled.
pub const SLEEPER: &str = "sleep 60";

/// Returns a port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A harness configuration with short, test-friendly timings.
pub fn config(servroot: &Path, command: &str, port: u16) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.server.command = command.to_string();
    config.server.listen = SocketAddr::from(([127, 0, 0, 1], port));
    config.server.servroot = servroot.to_path_buf();
    config.server.startup_grace = Duration::from_secs(3);
    config.server.reload_settle = Duration::from_millis(150);
    config.server.stop_timeout = Duration::from_secs(1);
    config.server.stop_signal = "TERM".to_string();
    config.client.log_settle = Duration::from_millis(300);
    config
}

/// Same as [`config`] with a different mode.
pub fn config_with_mode(servroot: &Path, command: &str, port: u16, mode: ModeKind) -> HarnessConfig {
    let mut config = config(servroot, command, port);
    config.mode.kind = mode;
    config
}

/// Builds a harness whose events go to `events` (if given).
pub fn harness(config: &HarnessConfig, events: Option<&Path>) -> Harness {
    let emitter = events.map_or_else(EventEmitter::noop, |p| EventEmitter::from_file(p).unwrap());
    Harness::new(config, emitter).unwrap()
}

/// Parses `doc` with the harness's variables, strictly.
pub fn suite(harness: &Harness, doc: &str) -> Suite {
    parse_suite("test.t", doc, &parse_options(true, harness.variables()))
        .unwrap()
        .suite
}

/// Runs `suite` and returns the summary plus the TAP text.
pub async fn run(harness: &mut Harness, suite: &Suite) -> (SuiteSummary, String) {
    let mut reporter = Reporter::new(Vec::new());
    let summary = harness.run_suite(suite, &mut reporter).await.unwrap();
    let tap = String::from_utf8(reporter.into_inner()).unwrap();
    (summary, tap)
}

/// Event types written to a JSONL events file, in order.
pub fn event_types(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["type"].as_str().unwrap().to_string()
        })
        .collect()
}

/// Appends a line to the server's error log.
pub fn append_log(prefix: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(error_log(prefix))
        .unwrap();
    writeln!(file, "{line}").unwrap();
}

/// Path of the server's error log.
pub fn error_log(prefix: &Path) -> PathBuf {
    prefix.join("logs").join("error.log")
}

/// Reads a request head, or `None` if the peer closed without sending one
/// (e.g. a readiness probe).
pub async fn read_head(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return (!head.is_empty()).then_some(head);
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(head);
        }
    }
}

/// Formats a `Content-Length` framed HTTP/1.1 response.
pub fn http_response(status: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

type Handler = Arc<dyn Fn(Vec<u8>, TcpStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process stand-in for the server's request handling.
pub struct FakeServer {
    task: Option<JoinHandle<()>>,
}

impl FakeServer {
    /// Listens on `port`; every request head is passed to `handler`.
    pub async fn start<F>(port: u16, handler: F) -> Self
    where
        F: Fn(Vec<u8>, TcpStream) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let handler: Handler = Arc::new(handler);
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Some(head) = read_head(&mut stream).await {
                        handler(head, stream).await;
                    }
                });
            }
        });
        Self { task: Some(task) }
    }

    /// Stops accepting; the port is released.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
