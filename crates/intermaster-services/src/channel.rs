//! Message channel over an established encrypted stream.
//!
//! One pump task reads records and routes them: replies to the pending
//! call that is waiting for them, calls and resolve requests to a task of
//! their own. One writer task owns the write half and drains the outbox, so
//! a caller that gives up mid-send never leaves half a record on the
//! stream. Outbound calls are correlated by sequence number. When either
//! task ends, for any reason, the channel is closed and every pending call
//! fails with [`RpcError::ChannelClosed`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use intermaster_core::crypto::CryptoError;
use intermaster_core::wire::WireError;
use intermaster_core::Identity;

use crate::auth::{Authentication, SecurityContext};
use crate::resolver::{InboundResolver, ServiceSource};
use crate::rpc::{CallFrame, Rpc, RpcError, Value};
use crate::session::record::{record_prefix, RecordReader, RecordWriter};

pub type BoxedReader = RecordReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type BoxedWriter = RecordWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Encoded messages waiting for the writer task.
const OUTBOX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("record: {0}")]
    Crypto(#[from] CryptoError),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("channel closed")]
    Closed,
}

/// Everything that crosses a channel after the handshake.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChannelMessage {
    Call {
        id: u64,
        oid: u64,
        frame: CallFrame,
    },
    Reply {
        id: u64,
        result: Result<Value, RpcError>,
    },
    Resolve {
        id: u64,
        contract: String,
    },
    Resolved {
        id: u64,
        result: Result<Option<u64>, RpcError>,
    },
}

impl ChannelMessage {
    /// The same answer carrying `error` instead of its result. Requests
    /// are returned unchanged.
    fn into_failure(self, error: RpcError) -> ChannelMessage {
        match self {
            ChannelMessage::Reply { id, .. } => ChannelMessage::Reply {
                id,
                result: Err(error),
            },
            ChannelMessage::Resolved { id, .. } => ChannelMessage::Resolved {
                id,
                result: Err(error),
            },
            request => request,
        }
    }

    fn id(&self) -> u64 {
        match self {
            ChannelMessage::Call { id, .. }
            | ChannelMessage::Reply { id, .. }
            | ChannelMessage::Resolve { id, .. }
            | ChannelMessage::Resolved { id, .. } => *id,
        }
    }
}

pub struct Channel {
    this: Weak<Channel>,
    peer: Identity,
    outbox: mpsc::Sender<Vec<u8>>,
    pending: DashMap<u64, oneshot::Sender<ChannelMessage>>,
    exports: DashMap<u64, Arc<dyn Rpc>>,
    /// Contract name → object id, so repeated resolves share one export.
    resolved: DashMap<String, u64>,
    exporter: Arc<dyn InboundResolver>,
    next_id: AtomicU64,
    next_oid: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Channel {
    /// Start a channel with `peer` and spawn its pump and writer. Must be
    /// called inside a tokio runtime.
    pub fn start(
        peer: Identity,
        reader: BoxedReader,
        writer: BoxedWriter,
        exporter: Arc<dyn InboundResolver>,
    ) -> Arc<Channel> {
        let (closed, _) = watch::channel(false);
        let (outbox, queued) = mpsc::channel(OUTBOX_DEPTH);
        let channel = Arc::new_cyclic(|this| Channel {
            this: this.clone(),
            peer,
            outbox,
            pending: DashMap::new(),
            exports: DashMap::new(),
            resolved: DashMap::new(),
            exporter,
            next_id: AtomicU64::new(1),
            next_oid: AtomicU64::new(1),
            closed,
        });
        let writer_closed = channel.closed.subscribe();
        tokio::spawn(pump(Arc::downgrade(&channel), reader));
        tokio::spawn(drain(Arc::downgrade(&channel), writer, queued, writer_closed));
        channel
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Resolves once the channel has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Err only if the sender is gone, which means we are being dropped.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the channel: fail pending calls now and let the writer task
    /// end our direction of the stream once any record in progress is out.
    /// Idempotent.
    pub async fn close(&self) {
        self.mark_closed();
    }

    fn mark_closed(&self) {
        let was_open = !self.closed.send_replace(true);
        // Dropping the senders fails every waiter with ChannelClosed.
        self.pending.clear();
        self.exports.clear();
        self.resolved.clear();
        if was_open {
            tracing::debug!(peer = %self.peer.fingerprint(), "channel closed");
        }
    }

    /// Make `object` callable by the peer. Returns its object id.
    pub fn export(&self, object: Arc<dyn Rpc>) -> u64 {
        let oid = self.next_oid.fetch_add(1, Ordering::Relaxed);
        self.exports.insert(oid, object);
        oid
    }

    /// A reference to object `oid` on the peer.
    pub fn remote(&self, oid: u64) -> Option<RemoteObject> {
        self.this.upgrade().map(|channel| RemoteObject { channel, oid })
    }

    /// Call method `frame.method` on the peer's object `oid`.
    pub async fn call_object(
        &self,
        oid: u64,
        frame: CallFrame,
    ) -> Result<Value, RpcError> {
        match self.request(|id| ChannelMessage::Call { id, oid, frame }).await? {
            ChannelMessage::Reply { result, .. } => result,
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the peer for its implementation of `contract`.
    pub async fn resolve(&self, contract: &str) -> Result<Option<RemoteObject>, RpcError> {
        let contract = contract.to_string();
        match self.request(|id| ChannelMessage::Resolve { id, contract }).await? {
            ChannelMessage::Resolved { result, .. } => Ok(result?.and_then(|oid| self.remote(oid))),
            other => Err(unexpected(&other)),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> ChannelMessage,
    ) -> Result<ChannelMessage, RpcError> {
        if !self.is_open() {
            return Err(RpcError::ChannelClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // mark_closed sets the flag before clearing, so an insert that
        // raced past the clear is caught here.
        if !self.is_open() {
            self.pending.remove(&id);
            return Err(RpcError::ChannelClosed);
        }

        if let Err(e) = self.send(&build(id)).await {
            self.pending.remove(&id);
            return Err(match e {
                ChannelError::Closed => RpcError::ChannelClosed,
                other => RpcError::transport(other.to_string()),
            });
        }
        rx.await.map_err(|_| RpcError::ChannelClosed)
    }

    /// Queue `message` for the writer task. An oversize message is refused
    /// here, before it can reach the record layer.
    async fn send(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        let bytes = serde_json::to_vec(message)?;
        record_prefix(bytes.len())?;
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.outbox
            .send(bytes)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// The identity calls from the peer run as before any forwarded
    /// identity is applied.
    fn transport_context(&self) -> SecurityContext {
        SecurityContext::new(Authentication::for_master(&self.peer))
    }

    fn handle(&self, record: &[u8]) -> Result<(), ChannelError> {
        let message: ChannelMessage = serde_json::from_slice(record)?;
        match message {
            ChannelMessage::Call { id, oid, frame } => {
                let target = self.exports.get(&oid).map(|e| e.value().clone());
                let cx = self.transport_context();
                self.spawn_reply(async move {
                    let result = match target {
                        Some(target) => target.call(frame, &cx).await,
                        None => Err(RpcError::NoSuchObject { oid }),
                    };
                    ChannelMessage::Reply { id, result }
                });
            }
            ChannelMessage::Resolve { id, contract } => {
                let result = self.export_contract(contract);
                self.spawn_reply(async move { ChannelMessage::Resolved { id, result } });
            }
            reply => {
                let id = reply.id();
                match self.pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        tracing::debug!(peer = %self.peer.fingerprint(), id, "reply for unknown call");
                    }
                }
            }
        }
        Ok(())
    }

    /// Answer a resolve request. The first successful resolve of a
    /// contract is exported; later ones reuse that object id.
    fn export_contract(&self, contract: String) -> Result<Option<u64>, RpcError> {
        if let Some(oid) = self.resolved.get(&contract) {
            return Ok(Some(*oid));
        }
        let Some(object) = self.exporter.resolve(&contract, &self.peer)? else {
            return Ok(None);
        };
        let oid = *self
            .resolved
            .entry(contract)
            .or_insert_with(|| self.export(object));
        Ok(Some(oid))
    }

    /// Run `work` on its own task and send what it produces back to the
    /// peer, unless the channel is gone by then. An answer that cannot be
    /// sent is replaced by a transport error so the caller is not left
    /// waiting.
    fn spawn_reply<F>(&self, work: F)
    where
        F: std::future::Future<Output = ChannelMessage> + Send + 'static,
    {
        let this = self.this.clone();
        tokio::spawn(async move {
            let reply = work.await;
            let Some(channel) = this.upgrade() else {
                return;
            };
            let error = match channel.send(&reply).await {
                Ok(()) | Err(ChannelError::Closed) => return,
                Err(e) => e,
            };
            tracing::warn!(peer = %channel.peer.fingerprint(), id = reply.id(), error = %error, "reply not sendable");
            let fallback = reply.into_failure(RpcError::transport(format!("reply not sendable: {error}")));
            if let Err(e) = channel.send(&fallback).await {
                tracing::debug!(peer = %channel.peer.fingerprint(), error = %e, "failed to send reply");
            }
        });
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("pending", &self.pending.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

fn unexpected(message: &ChannelMessage) -> RpcError {
    RpcError::protocol(format!("unexpected reply {message:?}"))
}

async fn pump(channel: Weak<Channel>, mut reader: BoxedReader) {
    let Some(mut closed) = channel.upgrade().map(|c| c.closed.subscribe()) else {
        return;
    };

    let reason = loop {
        let record = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break "closed locally".to_string(),
            record = reader.recv() => record,
        };
        let record = match record {
            Ok(Some(record)) => record,
            Ok(None) => break "peer closed the stream".to_string(),
            Err(e) => break e.to_string(),
        };
        let Some(ch) = channel.upgrade() else {
            return;
        };
        if let Err(e) = ch.handle(&record) {
            break e.to_string();
        }
    };

    if let Some(ch) = channel.upgrade() {
        tracing::debug!(peer = %ch.peer.fingerprint(), reason = %reason, "channel pump stopped");
        ch.mark_closed();
    }
}

/// Writer task: the only code that touches the write half. Each record is
/// written whole before the close flag is looked at again.
async fn drain(
    channel: Weak<Channel>,
    mut writer: BoxedWriter,
    mut queued: mpsc::Receiver<Vec<u8>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let bytes = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            bytes = queued.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        if let Err(e) = writer.send(&bytes).await {
            if let Some(ch) = channel.upgrade() {
                tracing::debug!(peer = %ch.peer.fingerprint(), error = %e, "channel write failed");
                ch.mark_closed();
            }
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "shutdown after close");
    }
}

#[async_trait]
impl ServiceSource for Channel {
    async fn resolve_remote(&self, contract: &str) -> Result<Option<Arc<dyn Rpc>>, RpcError> {
        if !self.is_open() {
            return Ok(None);
        }
        Ok(self
            .resolve(contract)
            .await?
            .map(|remote| Arc::new(remote) as Arc<dyn Rpc>))
    }
}

/// An object exported by the peer, callable through the channel.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    channel: Arc<Channel>,
    oid: u64,
}

impl RemoteObject {
    pub fn oid(&self) -> u64 {
        self.oid
    }
}

#[async_trait]
impl Rpc for RemoteObject {
    async fn call(&self, frame: CallFrame, _cx: &SecurityContext) -> Result<Value, RpcError> {
        // Only the frame crosses; the caller's identity travels in its
        // context if a forwarding sender put it there.
        self.channel.call_object(self.oid, frame).await
    }
}
