//! Peer registry: masters this one knows about and whether they are
//! approved.
//!
//! The registry is the one piece of external state a handshake writes:
//! a peer seen for the first time is recorded with [`PeerRegistry::discovered`]
//! before the approval verdict is sent. Persistence is the registry
//! implementation's concern; [`MemoryPeerRegistry`] keeps everything in
//! memory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use intermaster_core::config::RegistryConfig;
use intermaster_core::Identity;

/// A master registered as a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredMaster {
    /// Base address the peer reports for itself.
    pub url: String,
    pub identity: Identity,
    /// Authoritative: a handshake with an unapproved peer is refused.
    pub approved: bool,
    /// Session listener address, when known. Peers discovered through an
    /// inbound handshake have none until an operator supplies one.
    #[serde(default)]
    pub addr: Option<String>,
}

impl RegisteredMaster {
    pub fn new(url: impl Into<String>, identity: Identity, approved: bool) -> Self {
        Self {
            url: url.into(),
            identity,
            approved,
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid peer identity {value:?}")]
    InvalidIdentity { value: String },

    #[error("failed to persist registry: {0}")]
    Persist(String),
}

pub trait PeerRegistry: Send + Sync {
    /// The record matching both `url` and `identity`.
    fn find(&self, url: &str, identity: &Identity) -> Option<RegisteredMaster>;

    /// Add a record, replacing any existing one with the same url or the
    /// same identity. Concurrent adds are serialized.
    fn add(&self, master: RegisteredMaster) -> Result<(), RegistryError>;

    fn list(&self) -> Vec<RegisteredMaster>;

    /// Whether a peer first seen during a handshake starts out approved.
    fn approves_new(&self, _identity: &Identity) -> bool {
        false
    }

    /// Find the record for a peer that just proved `identity` and reported
    /// `url`, creating it if this is the first time.
    fn discovered(&self, url: &str, identity: &Identity) -> Result<RegisteredMaster, RegistryError> {
        if let Some(existing) = self.find(url, identity) {
            return Ok(existing);
        }
        let master = RegisteredMaster::new(url, *identity, self.approves_new(identity));
        self.add(master.clone())?;
        tracing::info!(
            peer = %identity.fingerprint(),
            endpoint = url,
            approved = master.approved,
            "registered newly discovered peer"
        );
        Ok(master)
    }
}

/// In-memory registry with an approval policy: auto-approve everything, or
/// approve an explicit set of identities.
pub struct MemoryPeerRegistry {
    masters: Mutex<Vec<RegisteredMaster>>,
    auto_approve: AtomicBool,
    approved: RwLock<HashSet<Identity>>,
}

impl Default for MemoryPeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPeerRegistry {
    pub fn new() -> Self {
        Self {
            masters: Mutex::new(Vec::new()),
            auto_approve: AtomicBool::new(false),
            approved: RwLock::new(HashSet::new()),
        }
    }

    /// Build from config: the approval policy plus every operator-listed
    /// peer, which counts as approved.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.set_auto_approve(config.auto_approve);

        for hex_key in &config.approved_peers {
            let identity = parse_identity(hex_key)?;
            registry.approve(&identity);
        }
        for peer in &config.peers {
            let identity = parse_identity(&peer.public_key)?;
            registry.approve(&identity);
            registry.add(RegisteredMaster::new(&peer.url, identity, true).with_addr(&peer.addr))?;
            tracing::info!(
                peer = %identity.fingerprint(),
                endpoint = %peer.url,
                "registered peer from config"
            );
        }
        Ok(registry)
    }

    pub fn set_auto_approve(&self, on: bool) {
        self.auto_approve.store(on, Ordering::Relaxed);
    }

    /// Approve `identity` now and whenever it is rediscovered.
    pub fn approve(&self, identity: &Identity) {
        write_set(&self.approved).insert(*identity);
        for m in self.lock().iter_mut().filter(|m| m.identity == *identity) {
            m.approved = true;
        }
        tracing::info!(peer = %identity.fingerprint(), "peer approved");
    }

    /// Withdraw approval. Live sessions are not torn down by this.
    pub fn revoke(&self, identity: &Identity) {
        write_set(&self.approved).remove(identity);
        for m in self.lock().iter_mut().filter(|m| m.identity == *identity) {
            m.approved = false;
        }
        tracing::info!(peer = %identity.fingerprint(), "peer approval revoked");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RegisteredMaster>> {
        self.masters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PeerRegistry for MemoryPeerRegistry {
    fn find(&self, url: &str, identity: &Identity) -> Option<RegisteredMaster> {
        self.lock()
            .iter()
            .find(|m| m.url == url && m.identity == *identity)
            .cloned()
    }

    fn add(&self, mut master: RegisteredMaster) -> Result<(), RegistryError> {
        let mut masters = self.lock();
        // A known dial address survives rediscovery under a new url.
        if master.addr.is_none() {
            master.addr = masters
                .iter()
                .find(|m| m.identity == master.identity)
                .and_then(|m| m.addr.clone());
        }
        masters.retain(|m| m.url != master.url && m.identity != master.identity);
        masters.push(master);
        Ok(())
    }

    fn list(&self) -> Vec<RegisteredMaster> {
        self.lock().clone()
    }

    fn approves_new(&self, identity: &Identity) -> bool {
        self.auto_approve.load(Ordering::Relaxed)
            || self
                .approved
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(identity)
    }
}

fn write_set(set: &RwLock<HashSet<Identity>>) -> std::sync::RwLockWriteGuard<'_, HashSet<Identity>> {
    set.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_identity(hex_key: &str) -> Result<Identity, RegistryError> {
    Identity::from_hex(hex_key).map_err(|_| RegistryError::InvalidIdentity {
        value: hex_key.to_string(),
    })
}
