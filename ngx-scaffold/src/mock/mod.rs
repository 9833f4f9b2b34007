//! Mock backend servers.
//!
//! A block that declares `tcp_listen` or `udp_listen` gets a listener bound
//! before its request is sent. Each listener runs on its own task and
//! talks to the server-under-test only through the network. Query
//! mismatches are collected in a [`MockReport`] rather than failing the
//! listener, and the evaluator turns them into block mismatches.

pub mod routine;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ngx_scaffold_core::TestBlock;

use crate::error::MockError;

pub use routine::{
    Drip, Exchange, HoldOpen, QueryExpectation, ResponseRoutine, ScriptedRoutine, TcpScript,
    WriteThenSleep,
};
pub use udp::UdpScript;

/// State shared between a listener task and its handle.
pub type Shared<T> = Arc<Mutex<T>>;

/// A received query that did not match the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMismatch {
    /// `"tcp"` or `"udp"`.
    pub protocol: &'static str,
    /// 1-based exchange (TCP) or datagram (UDP) index.
    pub exchange: usize,
    /// Description of the expected query.
    pub expected: String,
    /// What arrived, lossily decoded.
    pub actual: String,
}

/// What a mock listener observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockReport {
    /// Address the listener was bound to.
    pub addr: Option<SocketAddr>,
    /// TCP connections accepted.
    pub connections: usize,
    /// UDP datagrams received.
    pub datagrams: usize,
    /// Query mismatches in arrival order.
    pub mismatches: Vec<MockMismatch>,
}

/// A running mock listener.
#[derive(Debug)]
pub struct MockServerHandle {
    protocol: &'static str,
    local_addr: SocketAddr,
    report: Shared<MockReport>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockServerHandle {
    /// `"tcp"` or `"udp"`.
    #[must_use]
    pub const fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Bound address (useful when binding port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A copy of the report so far.
    #[must_use]
    pub fn report(&self) -> MockReport {
        self.report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Cancels the listener and its connections and waits for them.
    pub async fn shutdown(self) -> MockReport {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            debug!(error = %e, "mock listener task ended abnormally");
        }
        debug!(protocol = self.protocol, addr = %self.local_addr, "mock listener stopped");
        self.report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

/// Starts a TCP listener running an arbitrary routine.
///
/// # Errors
///
/// Returns [`MockError::Bind`] if the address cannot be bound.
pub async fn serve_tcp(
    addr: SocketAddr,
    routine: Arc<dyn ResponseRoutine>,
) -> Result<MockServerHandle, MockError> {
    let report = Arc::new(Mutex::new(MockReport::default()));
    serve_tcp_with_report(addr, routine, report).await
}

async fn serve_tcp_with_report(
    addr: SocketAddr,
    routine: Arc<dyn ResponseRoutine>,
    report: Shared<MockReport>,
) -> Result<MockServerHandle, MockError> {
    let cancel = CancellationToken::new();
    let (local_addr, task) = tcp::bind(addr, routine, Arc::clone(&report), cancel.clone()).await?;
    if let Ok(mut r) = report.lock() {
        r.addr = Some(local_addr);
    }
    Ok(MockServerHandle {
        protocol: "tcp",
        local_addr,
        report,
        cancel,
        task,
    })
}

/// Starts a UDP listener answering per `script`.
///
/// # Errors
///
/// Returns [`MockError::Bind`] if the address cannot be bound.
pub async fn serve_udp(addr: SocketAddr, script: UdpScript) -> Result<MockServerHandle, MockError> {
    let report = Arc::new(Mutex::new(MockReport::default()));
    let cancel = CancellationToken::new();
    let (local_addr, task) = udp::bind(addr, script, Arc::clone(&report), cancel.clone()).await?;
    if let Ok(mut r) = report.lock() {
        r.addr = Some(local_addr);
    }
    Ok(MockServerHandle {
        protocol: "udp",
        local_addr,
        report,
        cancel,
        task,
    })
}

/// Every listener a block declared.
#[derive(Debug, Default)]
pub struct MockSet {
    handles: Vec<MockServerHandle>,
}

impl MockSet {
    /// Whether no listener was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Running listeners.
    #[must_use]
    pub fn handles(&self) -> &[MockServerHandle] {
        &self.handles
    }

    /// Reports of every listener so far.
    #[must_use]
    pub fn reports(&self) -> Vec<MockReport> {
        self.handles.iter().map(MockServerHandle::report).collect()
    }

    /// Tears every listener down.
    pub async fn shutdown(self) -> Vec<MockReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            reports.push(handle.shutdown().await);
        }
        reports
    }
}

/// Starts the listeners `block` declares.
///
/// All listeners are bound when this returns. If one fails to bind, the
/// ones already started are torn down.
///
/// # Errors
///
/// Returns [`MockError::Bind`] for the first address that cannot be bound.
pub async fn serve(block: &TestBlock) -> Result<MockSet, MockError> {
    let mut set = MockSet::default();

    if let (Some(addr), Some(script)) = (block.tcp_listen(), TcpScript::from_block(block)) {
        let report = Arc::new(Mutex::new(MockReport::default()));
        let routine = Arc::new(ScriptedRoutine::new(script, Arc::clone(&report)));
        match serve_tcp_with_report(addr.0, routine, report).await {
            Ok(handle) => set.handles.push(handle),
            Err(e) => {
                set.shutdown().await;
                return Err(e);
            }
        }
    }

    if let (Some(addr), Some(script)) = (block.udp_listen(), UdpScript::from_block(block)) {
        match serve_udp(addr.0, script).await {
            Ok(handle) => set.handles.push(handle),
            Err(e) => {
                set.shutdown().await;
                return Err(e);
            }
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};

    use ngx_scaffold_core::{ParseOptions, parse_suite};

    use super::*;

    fn block(doc: &str) -> TestBlock {
        parse_suite("t.t", doc, &ParseOptions::default())
            .unwrap()
            .suite
            .blocks
            .remove(0)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_scripted_tcp_exchange() {
        let port = free_port();
        let b = block(&format!(
            "=== TEST 1\n--- tcp_listen: {port}\n--- tcp_query: ping\n--- tcp_reply: pong\n"
        ));
        let mocks = serve(&b).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let reports = mocks.shutdown().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].connections, 1);
        assert!(reports[0].mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_query_mismatch_is_reported_not_fatal() {
        let port = free_port();
        let b = block(&format!(
            "=== TEST 1\n--- tcp_listen: {port}\n--- tcp_query: ping\n--- tcp_reply: pong\n"
        ));
        let mocks = serve(&b).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"pung").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let reports = mocks.shutdown().await;
        assert_eq!(reports[0].mismatches.len(), 1);
        assert_eq!(reports[0].mismatches[0].actual, "pung");
        assert_eq!(reports[0].mismatches[0].expected, "\"ping\"");
    }

    #[tokio::test]
    async fn test_bind_failure_is_a_mock_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let b = block(&format!("=== TEST 1\n--- tcp_listen: {port}\n--- tcp_reply: x\n"));
        let err = serve(&b).await.unwrap_err();
        assert!(matches!(err, MockError::Bind { protocol: "tcp", .. }));
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let port = {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            s.local_addr().unwrap().port()
        };
        let b = block(&format!(
            "=== TEST 1\n--- udp_listen: {port}\n--- udp_query: hi\n--- udp_reply: there\n"
        ));
        let mocks = serve(&b).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hi", ("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"there");

        let reports = mocks.shutdown().await;
        assert_eq!(reports[0].datagrams, 1);
        assert!(reports[0].mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_hold_open_keeps_connection_until_teardown() {
        let handle = serve_tcp("127.0.0.1:0".parse().unwrap(), Arc::new(HoldOpen))
            .await
            .unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await;
        assert!(read.is_err(), "connection should stay silent");

        handle.shutdown().await;
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_write_then_sleep_and_drip() {
        let handle = serve_tcp(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(WriteThenSleep {
                payload: b"partial".to_vec(),
                sleep: Duration::from_millis(50),
            }),
        )
        .await
        .unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"partial");
        handle.shutdown().await;

        let handle = serve_tcp(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Drip {
                payload: b"slowly".to_vec(),
                chunk: 2,
                interval: Duration::from_millis(10),
            }),
        )
        .await
        .unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"slowly");
        handle.shutdown().await;
    }
}
