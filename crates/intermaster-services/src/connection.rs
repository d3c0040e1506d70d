//! Live sessions, one per peer identity.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use intermaster_core::Identity;

use crate::channel::Channel;
use crate::resolver::{ServiceResolver, ServiceSource};
use crate::rpc::{Capability, RpcError, Stub};

/// A peer with an established channel.
pub struct ConnectedMaster {
    pub identity: Identity,
    /// Base address the peer reported during the handshake.
    pub url: String,
    pub channel: Arc<Channel>,
    /// Identical on both sides of the session.
    pub session_id: [u8; 32],
    /// Identity of whichever side dialed.
    pub initiator: Identity,
    pub established_at: Instant,
    resolver: ServiceResolver,
}

impl ConnectedMaster {
    pub fn new(
        identity: Identity,
        url: String,
        channel: Arc<Channel>,
        session_id: [u8; 32],
        initiator: Identity,
    ) -> Self {
        let resolver = ServiceResolver::new(channel.clone() as Arc<dyn ServiceSource>);
        Self {
            identity,
            url,
            channel,
            session_id,
            initiator,
            established_at: Instant::now(),
            resolver,
        }
    }

    /// The peer's implementation of `C`, or `None` if it offers none.
    pub async fn service<C: Capability + ?Sized>(&self) -> Result<Option<Arc<C>>, RpcError> {
        self.resolver.service::<C>().await
    }

    /// Untyped variant of [`service`](Self::service) for callers that only
    /// know the contract by name.
    pub async fn service_by_name(&self, contract: &str) -> Result<Option<Stub>, RpcError> {
        Ok(self
            .resolver
            .resolve(contract)
            .await?
            .map(|rpc| Stub::new(contract, rpc)))
    }

    /// Order used to pick one session when two exist for the same peer.
    /// Both sides compute the same answer.
    fn rank(&self) -> (Identity, [u8; 32]) {
        (self.initiator, self.session_id)
    }
}

impl fmt::Debug for ConnectedMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedMaster")
            .field("identity", &self.identity)
            .field("url", &self.url)
            .field("session_id", &hex::encode(&self.session_id[..8]))
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Outcome of [`ConnectionSet::register`].
#[derive(Debug)]
pub enum Registration {
    Inserted,
    /// The new session displaced this one, which the caller should close.
    Replaced(Arc<ConnectedMaster>),
    /// An existing session won; the new one should be closed.
    Kept(Arc<ConnectedMaster>),
}

/// Identity → live session. Cheap to clone; all clones share one map.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<DashMap<Identity, Arc<ConnectedMaster>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session, atomically resolving a collision with an
    /// existing session for the same peer: a closed existing session is
    /// always replaced, otherwise the lower `(initiator, session_id)` wins.
    pub fn register(&self, master: Arc<ConnectedMaster>) -> Registration {
        match self.inner.entry(master.identity) {
            Entry::Vacant(v) => {
                v.insert(master);
                Registration::Inserted
            }
            Entry::Occupied(mut o) => {
                let existing = o.get();
                if !existing.channel.is_open() || master.rank() < existing.rank() {
                    Registration::Replaced(o.insert(master))
                } else {
                    Registration::Kept(existing.clone())
                }
            }
        }
    }

    /// Remove the entry for `identity` only if it is still the session
    /// `session_id`. A replaced session closing late leaves its successor
    /// in place.
    pub fn remove_session(&self, identity: &Identity, session_id: &[u8; 32]) -> bool {
        self.inner
            .remove_if(identity, |_, m| m.session_id == *session_id)
            .is_some()
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<ConnectedMaster>> {
        self.inner.get(identity).map(|e| e.value().clone())
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.inner.contains_key(identity)
    }

    /// Point-in-time copy, safe to iterate while sessions come and go.
    pub fn snapshot(&self) -> Vec<Arc<ConnectedMaster>> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
