//! Session handshake over a raw byte stream.
//!
//! Both roles run the same sequence after the preamble:
//!
//! 1. `KeyExchangeHello` each way, in the clear; X25519 yields the session
//!    key and the transcript hash.
//! 2. Everything after is sealed records. Each side proves its long-term
//!    key by signing the transcript hash under its own role.
//! 3. Each side sends its public base URL and records the peer in the
//!    registry if it is new.
//! 4. Each side sends its verdict (`OK` or `Unauthorized`) and reads the
//!    peer's. Either refusal ends the handshake.
//!
//! Only then is a [`Channel`] built and the peer entered into the
//! [`ConnectionSet`]. Nothing is visible to other components before that.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use zerocopy::AsBytes;

use intermaster_core::crypto::{verify_identity_proof, CryptoError, KeyExchange};
use intermaster_core::wire::{
    check_endpoint, check_preamble, preamble, IdentityProof, KeyExchangeHello, Verdict, WireError,
    HANDSHAKE_TIMEOUT_SECS, MAX_PREAMBLE_LEN,
};
use intermaster_core::{Identity, IdentityKeypair, Role};

use super::record::{RecordReader, RecordWriter};
use super::state::{HandshakeState, RejectedBy};
use crate::channel::{BoxedReader, BoxedWriter, Channel, ChannelError};
use crate::connection::{ConnectedMaster, ConnectionSet, Registration};
use crate::registry::{PeerRegistry, RegistryError};
use crate::resolver::{InboundResolver, ServiceExporter, ServiceProviders};

/// Everything a handshake needs from the local master.
pub struct HandshakeContext {
    pub keypair: Arc<IdentityKeypair>,
    /// Sent to peers as our base address.
    pub public_url: String,
    pub registry: Arc<dyn PeerRegistry>,
    pub connections: ConnectionSet,
    /// Answers the peer's resolve requests once the channel is up.
    pub exporter: Arc<dyn InboundResolver>,
    /// Bound on steps up to and including the verdict exchange.
    pub timeout: Duration,
}

impl HandshakeContext {
    pub fn new(
        keypair: Arc<IdentityKeypair>,
        public_url: impl Into<String>,
        registry: Arc<dyn PeerRegistry>,
        providers: Arc<ServiceProviders>,
    ) -> Self {
        Self {
            keypair,
            public_url: public_url.into(),
            registry,
            connections: ConnectionSet::new(),
            exporter: Arc::new(ServiceExporter::new(providers)),
            timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("i/o failure while {state}: {source}")]
    Io {
        state: HandshakeState,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation while {state}: {source}")]
    Protocol {
        state: HandshakeState,
        #[source]
        source: WireError,
    },

    #[error("record layer failure while {state}: {source}")]
    Channel {
        state: HandshakeState,
        #[source]
        source: ChannelError,
    },

    #[error("key exchange failed: {0}")]
    KeyExchange(#[source] CryptoError),

    #[error("identity proof rejected: {0}")]
    IdentityProof(#[source] CryptoError),

    #[error("peer proved identity {actual}, expected {expected}")]
    UnexpectedIdentity { expected: Identity, actual: Identity },

    #[error("peer registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("connection refused by {by} approval")]
    Rejected { by: RejectedBy },

    #[error("handshake timed out while {state}")]
    Timeout { state: HandshakeState },
}

impl HandshakeError {
    /// True for a negotiated refusal, as opposed to a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, HandshakeError::Rejected { .. })
    }

    /// The stage the handshake was working towards when it stopped.
    pub fn state(&self) -> HandshakeState {
        match self {
            HandshakeError::Io { state, .. }
            | HandshakeError::Protocol { state, .. }
            | HandshakeError::Channel { state, .. }
            | HandshakeError::Timeout { state } => *state,
            HandshakeError::KeyExchange(_) => HandshakeState::KeyExchanged,
            HandshakeError::IdentityProof(_) | HandshakeError::UnexpectedIdentity { .. } => {
                HandshakeState::IdentityVerified
            }
            HandshakeError::Registry(_) => HandshakeState::NegotiatingEndpoints,
            HandshakeError::Rejected { .. } => HandshakeState::Rejected,
        }
    }
}

fn io(state: HandshakeState) -> impl FnOnce(std::io::Error) -> HandshakeError {
    move |source| HandshakeError::Io { state, source }
}

fn protocol(state: HandshakeState) -> impl FnOnce(WireError) -> HandshakeError {
    move |source| HandshakeError::Protocol { state, source }
}

fn channel(state: HandshakeState) -> impl FnOnce(ChannelError) -> HandshakeError {
    move |source| HandshakeError::Channel { state, source }
}

fn enter(progress: &mut HandshakeState, next: HandshakeState, role: Role) {
    *progress = next;
    tracing::debug!(role = %role, state = %next, "handshake");
}

/// What survives the negotiation and becomes the channel.
struct Negotiated {
    peer: Identity,
    url: String,
    session_id: [u8; 32],
    reader: BoxedReader,
    writer: BoxedWriter,
}

/// Run a handshake over `stream` in `role`.
///
/// With `expected` set, a peer proving any other identity is refused. On
/// success the peer is in `hx.connections`; if a session with the same peer
/// already existed and wins the tie-break, that session is returned and the
/// new one is closed.
pub async fn handshake<S>(
    stream: S,
    role: Role,
    hx: &HandshakeContext,
    expected: Option<Identity>,
) -> Result<Arc<ConnectedMaster>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let deadline = Instant::now() + hx.timeout;
    handshake_until(stream, role, hx, expected, deadline).await
}

/// [`handshake`] against a deadline fixed by the caller, for callers that
/// already spent part of the bound before the stream existed.
pub(crate) async fn handshake_until<S>(
    stream: S,
    role: Role,
    hx: &HandshakeContext,
    expected: Option<Identity>,
    deadline: Instant,
) -> Result<Arc<ConnectedMaster>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut progress = HandshakeState::Connecting;
    let outcome = tokio::time::timeout_at(
        deadline,
        negotiate(stream, role, hx, expected, &mut progress),
    )
    .await;
    let negotiated = match outcome {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout { state: progress }),
    };

    enter(&mut progress, HandshakeState::ChannelEstablished, role);
    let Negotiated {
        peer,
        url,
        session_id,
        reader,
        writer,
    } = negotiated;
    let channel = Channel::start(peer, reader, writer, hx.exporter.clone());
    let initiator = match role {
        Role::Initiator => hx.identity(),
        Role::Responder => peer,
    };
    let master = Arc::new(ConnectedMaster::new(
        peer,
        url,
        channel.clone(),
        session_id,
        initiator,
    ));

    match hx.connections.register(master.clone()) {
        Registration::Inserted => {}
        Registration::Replaced(old) => {
            tracing::info!(peer = %peer.fingerprint(), "new session supersedes existing one");
            tokio::spawn(async move { old.channel.close().await });
        }
        Registration::Kept(existing) => {
            tracing::info!(peer = %peer.fingerprint(), "keeping existing session, closing duplicate");
            channel.close().await;
            return Ok(existing);
        }
    }

    watch_close(hx.connections.clone(), &master);
    tracing::info!(
        peer = %peer.fingerprint(),
        endpoint = %master.url,
        role = %role,
        session_id = hex::encode(&session_id[..8]),
        "session established"
    );
    Ok(master)
}

/// Remove the session from the set when its channel closes.
fn watch_close(connections: ConnectionSet, master: &ConnectedMaster) {
    let channel = master.channel.clone();
    let identity = master.identity;
    let session_id = master.session_id;
    tokio::spawn(async move {
        channel.closed().await;
        if connections.remove_session(&identity, &session_id) {
            tracing::info!(
                peer = %identity.fingerprint(),
                state = %HandshakeState::Closed,
                "session closed"
            );
        }
    });
}

async fn negotiate<S>(
    mut stream: S,
    role: Role,
    hx: &HandshakeContext,
    expected: Option<Identity>,
    progress: &mut HandshakeState,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    use HandshakeState::*;

    // Preamble: the dialing side names the protocol.
    enter(progress, Connecting, role);
    match role {
        Role::Initiator => {
            stream
                .write_all(preamble().as_bytes())
                .await
                .map_err(io(Connecting))?;
        }
        Role::Responder => {
            let line = read_preamble(&mut stream).await?;
            check_preamble(&line).map_err(protocol(Connecting))?;
        }
    }

    enter(progress, KeyExchanged, role);
    let kx = KeyExchange::new(role);
    let hello = KeyExchangeHello::new(role, *kx.public());
    stream.write_all(hello.as_bytes()).await.map_err(io(KeyExchanged))?;
    stream.flush().await.map_err(io(KeyExchanged))?;
    let mut buf = [0u8; std::mem::size_of::<KeyExchangeHello>()];
    stream.read_exact(&mut buf).await.map_err(io(KeyExchanged))?;
    let peer_hello = KeyExchangeHello::parse(&buf, role.peer()).map_err(protocol(KeyExchanged))?;
    let peer_ephemeral = peer_hello.ephemeral;
    let keys = kx
        .complete(&peer_ephemeral)
        .map_err(HandshakeError::KeyExchange)?;

    let session_id = keys.session_id();
    let transcript = *keys.transcript_hash();
    let (sealer, opener) = keys.into_record_cipher();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader: BoxedReader = RecordReader::new(Box::new(read_half), opener);
    let mut writer: BoxedWriter = RecordWriter::new(Box::new(write_half), sealer);

    enter(progress, IdentityVerified, role);
    let proof = IdentityProof {
        public_key: *hx.identity().as_bytes(),
        signature: hx.keypair.prove(role, &transcript),
    };
    writer
        .send(proof.as_bytes())
        .await
        .map_err(channel(IdentityVerified))?;
    let record = next_record(&mut reader, IdentityVerified).await?;
    let peer_proof = IdentityProof::parse(&record).map_err(protocol(IdentityVerified))?;
    let peer = Identity::from_bytes(peer_proof.public_key);
    let signature = peer_proof.signature;
    // The peer signed under its own role; a reflected proof fails here.
    verify_identity_proof(&peer, role.peer(), &transcript, &signature)
        .map_err(HandshakeError::IdentityProof)?;
    if let Some(expected) = expected {
        if expected != peer {
            return Err(HandshakeError::UnexpectedIdentity {
                expected,
                actual: peer,
            });
        }
    }

    enter(progress, NegotiatingEndpoints, role);
    writer
        .send(hx.public_url.as_bytes())
        .await
        .map_err(channel(NegotiatingEndpoints))?;
    let record = next_record(&mut reader, NegotiatingEndpoints).await?;
    let url = String::from_utf8(record).map_err(|e| {
        HandshakeError::Protocol {
            state: NegotiatingEndpoints,
            source: WireError::Endpoint(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    })?;
    check_endpoint(&url).map_err(protocol(NegotiatingEndpoints))?;
    let registered = hx.registry.discovered(&url, &peer)?;

    enter(progress, Approved, role);
    let ours = if registered.approved {
        Verdict::Approved
    } else {
        Verdict::Unauthorized
    };
    writer
        .send(ours.as_str().as_bytes())
        .await
        .map_err(channel(Approved))?;
    let record = next_record(&mut reader, Approved).await?;
    let theirs = Verdict::parse(&String::from_utf8_lossy(&record));

    let rejected_by = match (ours, theirs) {
        (Verdict::Unauthorized, _) => Some(RejectedBy::Local),
        (_, Verdict::Unauthorized) => Some(RejectedBy::Remote),
        _ => None,
    };
    if let Some(by) = rejected_by {
        enter(progress, Rejected, role);
        tracing::warn!(
            peer = %peer.fingerprint(),
            endpoint = %url,
            by = %by,
            "session refused"
        );
        return Err(HandshakeError::Rejected { by });
    }

    Ok(Negotiated {
        peer,
        url,
        session_id,
        reader,
        writer,
    })
}

async fn read_preamble<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, HandshakeError> {
    let mut line = Vec::with_capacity(MAX_PREAMBLE_LEN);
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(io(HandshakeState::Connecting))?;
        if byte == b'\n' {
            break;
        }
        if line.len() == MAX_PREAMBLE_LEN {
            return Err(protocol(HandshakeState::Connecting)(WireError::MissingPreamble));
        }
        line.push(byte);
    }
    String::from_utf8(line)
        .map_err(|_| protocol(HandshakeState::Connecting)(WireError::MissingPreamble))
}

async fn next_record(
    reader: &mut BoxedReader,
    state: HandshakeState,
) -> Result<Vec<u8>, HandshakeError> {
    reader
        .recv()
        .await
        .map_err(channel(state))?
        .ok_or_else(|| HandshakeError::Io {
            state,
            source: std::io::ErrorKind::UnexpectedEof.into(),
        })
}
