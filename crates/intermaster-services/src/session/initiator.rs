//! Outbound sessions.

use std::sync::Arc;

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time::Instant;

use intermaster_core::{Identity, Role};

use super::handshake::{handshake_until, HandshakeContext, HandshakeError};
use super::state::HandshakeState;
use crate::connection::ConnectedMaster;

/// Dial `addr` and run an initiator handshake. With `expected` set the
/// peer must prove that identity.
///
/// The TCP connect and the handshake share one deadline of `hx.timeout`.
pub async fn connect(
    addr: &str,
    hx: &HandshakeContext,
    expected: Option<Identity>,
) -> Result<Arc<ConnectedMaster>, HandshakeError> {
    let deadline = Instant::now() + hx.timeout;
    let stream = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(HandshakeError::Io {
                state: HandshakeState::Connecting,
                source,
            })
        }
        Err(_) => {
            return Err(HandshakeError::Timeout {
                state: HandshakeState::Connecting,
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(error = %e, "set_nodelay failed");
    }
    tracing::debug!(addr, "dialed peer");
    handshake_until(stream, Role::Initiator, hx, expected, deadline).await
}

/// Dial every approved, dialable peer in the registry that has no live
/// session. Failures are logged and skipped. Returns the number of
/// sessions established.
pub async fn connect_all(hx: &HandshakeContext) -> usize {
    let own = hx.identity();
    let targets: Vec<_> = hx
        .registry
        .list()
        .into_iter()
        .filter(|m| m.approved && m.identity != own && !hx.connections.contains(&m.identity))
        .filter_map(|m| m.addr.clone().map(|addr| (addr, m)))
        .collect();

    tracing::debug!(peers = targets.len(), "dialing registered peers");
    let attempts = targets.iter().map(|(addr, m)| async move {
        match connect(addr, hx, Some(m.identity)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    peer = %m.identity.fingerprint(),
                    endpoint = %m.url,
                    addr = %addr,
                    state = %e.state(),
                    error = %e,
                    "dial failed"
                );
                false
            }
        }
    });
    join_all(attempts).await.into_iter().filter(|ok| *ok).count()
}
