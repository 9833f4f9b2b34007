//! UDP mock listener.
//!
//! Datagram `n` is matched against query `n` and answered with reply `n`.
//! A single reply answers every datagram.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use ngx_scaffold_core::{BodyMatcher, TestBlock};

use crate::error::MockError;

use super::{MockMismatch, MockReport, Shared};

const MAX_DATAGRAM: usize = 65_535;

/// A UDP script built from a block's `udp_*` sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpScript {
    /// Expected datagrams in order.
    pub queries: Vec<BodyMatcher>,
    /// Replies in order.
    pub replies: Vec<Vec<u8>>,
    /// Sleep before each reply.
    pub reply_delay: Option<Duration>,
}

impl UdpScript {
    /// Builds the script, or `None` if the block declares no UDP mock.
    #[must_use]
    pub fn from_block(block: &TestBlock) -> Option<Self> {
        block.udp_listen()?;
        Some(Self {
            queries: block.udp_query().to_vec(),
            replies: block.udp_reply().to_vec(),
            reply_delay: block.udp_reply_delay(),
        })
    }

    fn reply_for(&self, index: usize) -> Option<&[u8]> {
        match self.replies.as_slice() {
            [only] => Some(only.as_slice()),
            replies => replies.get(index).map(Vec::as_slice),
        }
    }
}

/// Binds `addr` and answers datagrams per `script` until `cancel` fires.
///
/// # Errors
///
/// Returns [`MockError::Bind`] if the address cannot be bound.
pub async fn bind(
    addr: SocketAddr,
    script: UdpScript,
    report: Shared<MockReport>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), MockError> {
    let socket = UdpSocket::bind(addr).await.map_err(|source| MockError::Bind {
        protocol: "udp",
        addr,
        source,
    })?;
    let local = socket.local_addr()?;
    debug!(%local, "mock udp socket bound");
    let task = tokio::spawn(serve(socket, script, report, cancel));
    Ok((local, task))
}

/// Errors a later `recv_from` can recover from. On Linux an ICMP port
/// unreachable for an earlier reply surfaces as a reset or refusal.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

async fn serve(socket: UdpSocket, script: UdpScript, report: Shared<MockReport>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut index = 0usize;
    loop {
        let (n, peer) = tokio::select! {
            () = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "mock udp receive failed, retrying");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "mock udp receive failed, stopping");
                    return;
                }
            },
        };
        let datagram = &buf[..n];
        trace!(%peer, bytes = n, index, "mock udp datagram");

        if let Ok(mut report) = report.lock() {
            report.datagrams += 1;
            match script.queries.get(index) {
                Some(expected) if !expected.matches(datagram) => {
                    report.mismatches.push(MockMismatch {
                        protocol: "udp",
                        exchange: index + 1,
                        expected: expected.describe(),
                        actual: String::from_utf8_lossy(datagram).into_owned(),
                    });
                }
                None if !script.queries.is_empty() => {
                    report.mismatches.push(MockMismatch {
                        protocol: "udp",
                        exchange: index + 1,
                        expected: "no further datagrams".to_string(),
                        actual: String::from_utf8_lossy(datagram).into_owned(),
                    });
                }
                _ => {}
            }
        }

        if let Some(reply) = script.reply_for(index) {
            if let Some(delay) = script.reply_delay {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if let Err(e) = socket.send_to(reply, peer).await {
                debug!(error = %e, "mock udp send failed");
            }
        }
        index += 1;
    }
}
