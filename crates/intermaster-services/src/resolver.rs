//! Service resolution across a channel.
//!
//! The requesting side asks its [`ServiceResolver`] for a contract; the
//! resolver asks the channel, the channel asks the peer, and the peer's
//! [`ServiceExporter`] walks its [`ServiceProviders`] in order. The first
//! instance found is exported back as a live object reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use intermaster_core::Identity;

use crate::rpc::{forward, validate_contract_name, Capability, LocalDispatcher, MethodTable, Rpc, RpcError};

/// What a provider hands back: something that already speaks [`Rpc`], or
/// a plain object described by its method table.
pub enum ServiceInstance {
    Rpc(Arc<dyn Rpc>),
    Object(MethodTable),
}

impl ServiceInstance {
    /// Export a typed implementation of a capability contract.
    pub fn of<C: Capability + ?Sized>(service: Arc<C>) -> Self {
        ServiceInstance::Object(C::export(service))
    }

    pub fn into_rpc(self) -> Arc<dyn Rpc> {
        match self {
            ServiceInstance::Rpc(rpc) => rpc,
            ServiceInstance::Object(table) => Arc::new(LocalDispatcher::new(table)),
        }
    }
}

/// A local source of services for peers.
pub trait ServiceProvider: Send + Sync {
    /// An instance of `contract` for a call coming from `caller`, or `None`
    /// if this provider does not offer it.
    fn get_instance(&self, contract: &str, caller: &Identity) -> Option<ServiceInstance>;
}

/// Offers one fixed implementation of one contract to every caller.
struct FixedService<C: ?Sized> {
    service: Arc<C>,
}

impl<C: Capability + ?Sized> ServiceProvider for FixedService<C> {
    fn get_instance(&self, contract: &str, _caller: &Identity) -> Option<ServiceInstance> {
        (contract == C::NAME).then(|| ServiceInstance::of(self.service.clone()))
    }
}

/// Ordered provider list. Consulted in registration order; the first
/// provider with an instance wins.
#[derive(Default)]
pub struct ServiceProviders {
    providers: RwLock<Vec<Arc<dyn ServiceProvider>>>,
}

impl ServiceProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, provider: Arc<dyn ServiceProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(provider);
    }

    /// Register `service` as the implementation of its contract.
    pub fn provide<C: Capability + ?Sized>(&self, service: Arc<C>) {
        self.push(Arc::new(FixedService { service }));
    }

    pub fn find(&self, contract: &str, caller: &Identity) -> Option<ServiceInstance> {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        providers
            .iter()
            .find_map(|p| p.get_instance(contract, caller))
    }
}

/// Answers a peer's request for a contract. Implemented by
/// [`ServiceExporter`]; called by the channel with the peer's identity.
pub trait InboundResolver: Send + Sync {
    fn resolve(&self, contract: &str, peer: &Identity) -> Result<Option<Arc<dyn Rpc>>, RpcError>;
}

/// The serving half of resolution.
pub struct ServiceExporter {
    providers: Arc<ServiceProviders>,
}

impl ServiceExporter {
    pub fn new(providers: Arc<ServiceProviders>) -> Self {
        Self { providers }
    }
}

impl InboundResolver for ServiceExporter {
    fn resolve(&self, contract: &str, peer: &Identity) -> Result<Option<Arc<dyn Rpc>>, RpcError> {
        validate_contract_name(contract)?;
        let Some(instance) = self.providers.find(contract, peer) else {
            tracing::debug!(contract, peer = %peer.fingerprint(), "no provider for contract");
            return Ok(None);
        };
        tracing::debug!(contract, peer = %peer.fingerprint(), "exporting service");
        Ok(Some(forward::receiver(instance.into_rpc())))
    }
}

/// Where a [`ServiceResolver`] sends its requests. Implemented by the
/// channel.
#[async_trait]
pub trait ServiceSource: Send + Sync {
    /// A live reference to the peer's implementation of `contract`.
    /// `Ok(None)` if the peer has none or there is no open transport.
    async fn resolve_remote(&self, contract: &str) -> Result<Option<Arc<dyn Rpc>>, RpcError>;
}

type Resolution = Result<Option<Arc<dyn Rpc>>, RpcError>;

struct CacheEntry {
    generation: u64,
    resolution: Shared<BoxFuture<'static, Resolution>>,
}

/// Per-peer cache from contract name to resolved reference.
///
/// Single-flight: the first request for a contract starts the resolution
/// and every concurrent request awaits the same one. Results, including
/// "not offered", are kept for the life of the connection. Failures are
/// delivered to everyone who was waiting and then evicted.
pub struct ServiceResolver {
    source: Arc<dyn ServiceSource>,
    cache: DashMap<String, CacheEntry>,
    generation: AtomicU64,
}

impl ServiceResolver {
    pub fn new(source: Arc<dyn ServiceSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Resolve by contract name. The reference forwards the caller's
    /// identity on every call.
    pub async fn resolve(&self, contract: &str) -> Resolution {
        let (generation, resolution) = match self.cache.entry(contract.to_string()) {
            Entry::Occupied(e) => (e.get().generation, e.get().resolution.clone()),
            Entry::Vacant(v) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let source = self.source.clone();
                let name = contract.to_string();
                let resolution = async move {
                    tracing::debug!(contract = %name, "resolving remote service");
                    let found = source.resolve_remote(&name).await?;
                    Ok::<_, RpcError>(found.map(forward::sender))
                }
                .boxed()
                .shared();
                v.insert(CacheEntry {
                    generation,
                    resolution: resolution.clone(),
                });
                (generation, resolution)
            }
        };

        let result = resolution.await;
        if result.is_err() {
            self.cache
                .remove_if(contract, |_, entry| entry.generation == generation);
        }
        result
    }

    /// Resolve and wrap in the contract's typed stub.
    pub async fn service<C: Capability + ?Sized>(&self) -> Result<Option<Arc<C>>, RpcError> {
        Ok(self.resolve(C::NAME).await?.map(C::stub))
    }
}
