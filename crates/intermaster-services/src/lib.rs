//! intermaster-services: RPC between masters and the sessions that carry it.
//!
//! A session is a mutually authenticated, encrypted stream between two
//! masters. Over it runs a [`Channel`] that resolves services by contract
//! name and carries calls to them, forwarding the caller's identity.

pub mod auth;
pub mod channel;
pub mod connection;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod session;

pub use auth::{Authentication, SecurityContext};
pub use channel::{Channel, ChannelError, RemoteObject};
pub use connection::{ConnectedMaster, ConnectionSet, Registration};
pub use registry::{MemoryPeerRegistry, PeerRegistry, RegisteredMaster, RegistryError};
pub use resolver::{
    InboundResolver, ServiceExporter, ServiceInstance, ServiceProvider, ServiceProviders,
    ServiceResolver, ServiceSource,
};
pub use rpc::{Capability, Rpc, RpcError};
pub use session::{
    connect, connect_all, handshake, HandshakeContext, HandshakeError, HandshakeState,
    RejectedBy, SessionListener,
};

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
    pub use futures::future::BoxFuture;
}
