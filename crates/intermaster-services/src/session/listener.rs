//! Inbound session listener.
//!
//! Accepts TCP connections and runs a responder handshake on each in its
//! own task. A failed handshake never affects the listener or other
//! sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use intermaster_core::Role;

use super::handshake::{handshake, HandshakeContext};

pub struct SessionListener {
    listener: TcpListener,
    hx: Arc<HandshakeContext>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionListener {
    pub fn new(
        listener: TcpListener,
        hx: Arc<HandshakeContext>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            hx,
            shutdown,
        }
    }

    pub async fn bind(
        addr: &str,
        hx: Arc<HandshakeContext>,
        shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, hx, shutdown))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "session listener started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(peer_addr = %peer_addr, "inbound connection");
                    tokio::spawn(respond(stream, peer_addr, self.hx.clone()));
                }
            }
        }
    }
}

async fn respond(stream: TcpStream, peer_addr: SocketAddr, hx: Arc<HandshakeContext>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(error = %e, "set_nodelay failed");
    }
    match handshake(stream, Role::Responder, &hx, None).await {
        Ok(master) => {
            tracing::debug!(peer_addr = %peer_addr, peer = %master.identity.fingerprint(), "inbound session ready");
        }
        Err(e) if e.is_rejection() => {
            tracing::info!(peer_addr = %peer_addr, error = %e, "inbound session refused");
        }
        Err(e) => {
            tracing::warn!(peer_addr = %peer_addr, state = %e.state(), error = %e, "inbound handshake failed");
        }
    }
}
