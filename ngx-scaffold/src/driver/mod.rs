//! Request/response driver.
//!
//! Sends a block's request to the server-under-test and captures whatever
//! comes back within the client deadline. Nothing here raises on network
//! behaviour: timeouts, resets and refused connections are recorded in the
//! [`CapturedResponse`] for the evaluator to judge.

pub mod request;
pub mod response;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use ngx_scaffold_core::TestBlock;

pub use request::WirePayload;
pub use response::{Framing, ParsedResponse, ResponseProblem, WellFormedness};

/// Client timeout when the block declares none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const READ_BUF_SIZE: usize = 8192;

/// Where the client deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing the connection.
    Connect,
    /// Writing the request (including middle delays).
    Write,
    /// Reading the response.
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connect => "connecting",
            Self::Write => "writing the request",
            Self::Read => "reading the response",
        })
    }
}

/// Everything observed while talking to the server for one block.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    /// Bytes actually written.
    pub request: Vec<u8>,
    /// Bytes received.
    pub raw: Vec<u8>,
    /// Structure recovered from `raw`.
    pub parsed: Option<ParsedResponse>,
    /// Structural check result.
    pub well_formedness: WellFormedness,
    /// Set when the client deadline expired.
    pub timed_out: Option<TimeoutPhase>,
    /// Set when the connection could not be established.
    pub transport_error: Option<String>,
    /// Reset or write failure after connecting. Informational only.
    pub io_note: Option<String>,
    /// Time from connect to completion, EOF or deadline.
    pub elapsed: Duration,
}

impl CapturedResponse {
    fn empty() -> Self {
        Self {
            request: Vec::new(),
            raw: Vec::new(),
            parsed: None,
            well_formedness: WellFormedness::Malformed(ResponseProblem::Empty),
            timed_out: None,
            transport_error: None,
            io_note: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Observed status code.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.parsed.as_ref().map(|p| p.status)
    }

    /// Decoded body, or the raw bytes if nothing could be parsed.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.parsed.as_ref().map_or(&self.raw, |p| &p.body)
    }
}

/// Sends `block`'s request to `addr` and captures the response.
///
/// Returns `None` if the block sends nothing. Reading stops when the
/// response is complete by its own framing, at EOF, or at the deadline;
/// dropping the socket at the deadline is what aborts the request on the
/// server side.
pub async fn send(block: &TestBlock, addr: SocketAddr, timeout: Duration) -> Option<CapturedResponse> {
    let payload = request::build(block)?;
    Some(exchange(&payload, addr, timeout, block.raw_request_middle_delay()).await)
}

/// Sends `payload` and captures the response.
pub async fn exchange(
    payload: &WirePayload,
    addr: SocketAddr,
    timeout: Duration,
    middle_delay: Option<Duration>,
) -> CapturedResponse {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut captured = CapturedResponse::empty();

    let mut stream = match timeout_at(deadline, TcpStream::connect(addr)).await {
        Err(_) => {
            captured.timed_out = Some(TimeoutPhase::Connect);
            captured.elapsed = started.elapsed();
            return captured;
        }
        Ok(Err(e)) => {
            captured.transport_error = Some(format!("connect to {addr} failed: {e}"));
            captured.elapsed = started.elapsed();
            return captured;
        }
        Ok(Ok(stream)) => stream,
    };

    'write: for (i, piece) in payload.pieces.iter().enumerate() {
        if i > 0 {
            if let Some(delay) = middle_delay {
                if timeout_at(deadline, tokio::time::sleep(delay)).await.is_err() {
                    captured.timed_out = Some(TimeoutPhase::Write);
                    break 'write;
                }
            }
        }
        match timeout_at(deadline, stream.write_all(piece)).await {
            Err(_) => {
                captured.timed_out = Some(TimeoutPhase::Write);
                break 'write;
            }
            Ok(Err(e)) => {
                // The server may answer and close before the whole request
                // is written; what it sent is still worth reading.
                captured.io_note = Some(format!("write failed: {e}"));
                break 'write;
            }
            Ok(Ok(())) => captured.request.extend_from_slice(piece),
        }
    }
    trace!(bytes = captured.request.len(), "request written");

    if captured.timed_out.is_none() {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut completion = response::Completion::new(payload.head);
        loop {
            match timeout_at(deadline, stream.read(&mut buf)).await {
                Err(_) => {
                    captured.timed_out = Some(TimeoutPhase::Read);
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    captured.raw.extend_from_slice(&buf[..n]);
                    if completion.update(&captured.raw) {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    captured.io_note = Some(format!("read failed: {e}"));
                    break;
                }
            }
        }
    }
    drop(stream);
    captured.elapsed = started.elapsed();

    let (parsed, well_formedness) = response::parse(&captured.raw, payload.head);
    captured.parsed = parsed;
    captured.well_formedness = well_formedness;

    debug!(
        status = ?captured.status(),
        bytes = captured.raw.len(),
        timed_out = ?captured.timed_out,
        elapsed_ms = u64::try_from(captured.elapsed.as_millis()).unwrap_or(u64::MAX),
        "response captured"
    );
    captured
}
