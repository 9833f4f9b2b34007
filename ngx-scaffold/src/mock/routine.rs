//! Response routines for mock TCP backends.
//!
//! A routine owns one accepted connection. Scripted blocks use
//! [`ScriptedRoutine`]; programmable backends implement
//! [`ResponseRoutine`] directly or use one of the built-in misbehaviours.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use ngx_scaffold_core::{BodyMatcher, TestBlock};

use super::{MockMismatch, MockReport};

/// How long a scripted backend waits for an expected query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for stray bytes when no query is declared.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);
/// How long a closing backend lingers for the peer's EOF.
const LINGER: Duration = Duration::from_millis(200);

/// Behaviour of a mock backend for one connection.
#[async_trait]
pub trait ResponseRoutine: Send + Sync {
    /// Serves `stream` until done or `cancel` fires.
    async fn respond(&self, stream: TcpStream, cancel: CancellationToken) -> std::io::Result<()>;
}

// ============================================================================
// Built-in misbehaviours
// ============================================================================

/// Reads and discards input, never writes, and keeps the connection open
/// until teardown (emulates a read timeout downstream).
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldOpen;

#[async_trait]
impl ResponseRoutine for HoldOpen {
    async fn respond(&self, mut stream: TcpStream, cancel: CancellationToken) -> std::io::Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                n = stream.read(&mut buf) => {
                    if n? == 0 {
                        cancel.cancelled().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Writes a fixed payload, sleeps, then closes (emulates a partial or
/// slow-to-finish response).
#[derive(Debug, Clone)]
pub struct WriteThenSleep {
    /// Bytes written immediately.
    pub payload: Vec<u8>,
    /// Pause before closing.
    pub sleep: Duration,
}

#[async_trait]
impl ResponseRoutine for WriteThenSleep {
    async fn respond(&self, mut stream: TcpStream, cancel: CancellationToken) -> std::io::Result<()> {
        drain(&mut stream, DRAIN_WINDOW).await;
        stream.write_all(&self.payload).await?;
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(self.sleep) => {}
        }
        close(stream).await
    }
}

/// Writes a payload a few bytes at a time (a slow backend).
#[derive(Debug, Clone)]
pub struct Drip {
    /// Bytes to write.
    pub payload: Vec<u8>,
    /// Bytes per write.
    pub chunk: usize,
    /// Pause between writes.
    pub interval: Duration,
}

#[async_trait]
impl ResponseRoutine for Drip {
    async fn respond(&self, mut stream: TcpStream, cancel: CancellationToken) -> std::io::Result<()> {
        drain(&mut stream, DRAIN_WINDOW).await;
        for piece in self.payload.chunks(self.chunk.max(1)) {
            stream.write_all(piece).await?;
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        close(stream).await
    }
}

// ============================================================================
// Scripted backend
// ============================================================================

/// What a scripted exchange waits for before replying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryExpectation {
    /// Nothing in particular; whatever is already pending is consumed.
    Any,
    /// Bytes that must match.
    Matching(BodyMatcher),
    /// Exactly this many bytes, content unchecked.
    Length(usize),
}

/// One query/reply step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// What to read first.
    pub query: QueryExpectation,
    /// Pieces written in order, each after the reply delay.
    pub reply: Vec<Vec<u8>>,
}

/// A TCP script built from a block's `tcp_*` sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpScript {
    /// Steps in order.
    pub exchanges: Vec<Exchange>,
    /// Sleep before each reply piece.
    pub reply_delay: Option<Duration>,
    /// Sleep after the last reply, before closing.
    pub close_delay: Option<Duration>,
    /// Keep the connection open until teardown.
    pub no_close: bool,
    /// Half-close the write side after replying.
    pub shutdown: bool,
}

impl TcpScript {
    /// Builds the script, or `None` if the block declares no TCP mock.
    #[must_use]
    pub fn from_block(block: &TestBlock) -> Option<Self> {
        block.tcp_listen()?;
        let queries = block.tcp_query();
        let replies = block.tcp_reply();

        let exchanges = if queries.len() > 1 {
            queries
                .iter()
                .enumerate()
                .map(|(i, q)| Exchange {
                    query: QueryExpectation::Matching(q.clone()),
                    reply: replies.get(i).cloned().into_iter().collect(),
                })
                .collect()
        } else {
            let query = match (queries.first(), block.tcp_query_len()) {
                (Some(q), _) => QueryExpectation::Matching(q.clone()),
                (None, Some(len)) => QueryExpectation::Length(len),
                (None, None) => QueryExpectation::Any,
            };
            vec![Exchange {
                query,
                reply: replies.to_vec(),
            }]
        };

        Some(Self {
            exchanges,
            reply_delay: block.tcp_reply_delay(),
            close_delay: block.tcp_close_delay(),
            no_close: block.tcp_no_close(),
            shutdown: block.tcp_shutdown(),
        })
    }
}

/// Replays a [`TcpScript`] on every accepted connection.
#[derive(Debug)]
pub struct ScriptedRoutine {
    script: TcpScript,
    report: Arc<Mutex<MockReport>>,
}

impl ScriptedRoutine {
    /// Creates a routine recording into `report`.
    #[must_use]
    pub const fn new(script: TcpScript, report: Arc<Mutex<MockReport>>) -> Self {
        Self { script, report }
    }

    fn record_mismatch(&self, mismatch: MockMismatch) {
        if let Ok(mut report) = self.report.lock() {
            report.mismatches.push(mismatch);
        }
    }
}

#[async_trait]
impl ResponseRoutine for ScriptedRoutine {
    async fn respond(&self, mut stream: TcpStream, cancel: CancellationToken) -> std::io::Result<()> {
        let mut pending = BytesMut::new();
        for (index, exchange) in self.script.exchanges.iter().enumerate() {
            let received = match &exchange.query {
                QueryExpectation::Any => {
                    drain(&mut stream, DRAIN_WINDOW).await;
                    None
                }
                QueryExpectation::Length(len) => {
                    Some(read_exact_or_eof(&mut stream, &mut pending, *len).await?)
                }
                QueryExpectation::Matching(BodyMatcher::Exact(expected)) => {
                    Some(read_exact_or_eof(&mut stream, &mut pending, expected.len()).await?)
                }
                QueryExpectation::Matching(BodyMatcher::Pattern(pattern)) => {
                    Some(read_until_match(&mut stream, &mut pending, &pattern.0).await?)
                }
            };
            if let (QueryExpectation::Matching(matcher), Some(actual)) = (&exchange.query, received) {
                trace!(index, bytes = actual.len(), "mock query received");
                if !matcher.matches(&actual) {
                    self.record_mismatch(MockMismatch {
                        protocol: "tcp",
                        exchange: index + 1,
                        expected: matcher.describe(),
                        actual: String::from_utf8_lossy(&actual).into_owned(),
                    });
                }
            }

            for piece in &exchange.reply {
                if let Some(delay) = self.script.reply_delay {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                stream.write_all(piece).await?;
            }
        }

        if self.script.shutdown {
            stream.shutdown().await?;
        }
        if self.script.no_close {
            cancel.cancelled().await;
            return Ok(());
        }
        if let Some(delay) = self.script.close_delay {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
        close(stream).await
    }
}

async fn read_exact_or_eof(
    stream: &mut TcpStream,
    pending: &mut BytesMut,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + QUERY_TIMEOUT;
    while pending.len() < len {
        match tokio::time::timeout_at(deadline, stream.read_buf(pending)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
        }
    }
    let take = len.min(pending.len());
    Ok(pending.split_to(take).to_vec())
}

async fn read_until_match(
    stream: &mut TcpStream,
    pending: &mut BytesMut,
    pattern: &regex::Regex,
) -> std::io::Result<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + QUERY_TIMEOUT;
    loop {
        let found = pattern
            .find(&String::from_utf8_lossy(&pending[..]))
            .map(|m| m.end());
        if let Some(end) = found {
            // Lossy decoding can shift offsets past the buffer end.
            let end = end.min(pending.len());
            return Ok(pending.split_to(end).to_vec());
        }
        match tokio::time::timeout_at(deadline, stream.read_buf(pending)).await {
            Ok(Ok(0)) | Err(_) => return Ok(pending.split().to_vec()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Reads whatever arrives within `window`.
async fn drain(stream: &mut TcpStream, window: Duration) {
    let mut buf = [0u8; 4096];
    while let Ok(Ok(n)) = tokio::time::timeout(window, stream.read(&mut buf)).await {
        if n == 0 {
            break;
        }
    }
}

/// Half-closes, waits briefly for the peer to finish, then drops.
///
/// Closing with unread input would send a reset and could discard the
/// reply before the peer reads it.
async fn close(mut stream: TcpStream) -> std::io::Result<()> {
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "mock shutdown failed");
    }
    drain(&mut stream, LINGER).await;
    Ok(())
}
