//! TCP mock listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MockError;

use super::routine::ResponseRoutine;
use super::{MockReport, Shared};

/// Binds `addr` and serves every accepted connection with `routine` on
/// its own task until `cancel` fires.
///
/// Binding completes before this returns, so a request sent afterwards
/// always finds the listener.
///
/// # Errors
///
/// Returns [`MockError::Bind`] if the address cannot be bound.
pub async fn bind(
    addr: SocketAddr,
    routine: Arc<dyn ResponseRoutine>,
    report: Shared<MockReport>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), MockError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| MockError::Bind {
        protocol: "tcp",
        addr,
        source,
    })?;
    let local = listener.local_addr()?;
    debug!(%local, "mock tcp listener bound");

    let task = tokio::spawn(accept_loop(listener, routine, report, cancel));
    Ok((local, task))
}

async fn accept_loop(
    listener: TcpListener,
    routine: Arc<dyn ResponseRoutine>,
    report: Shared<MockReport>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "mock tcp connection accepted");
                    if let Ok(mut report) = report.lock() {
                        report.connections += 1;
                    }
                    let routine = Arc::clone(&routine);
                    let cancel = cancel.child_token();
                    connections.spawn(async move {
                        if let Err(e) = routine.respond(stream, cancel).await {
                            debug!(%peer, error = %e, "mock connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "mock tcp accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    // Cancelled routines return promptly; anything else is aborted.
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}
