//! intermaster-core: identity, cryptographic primitives, handshake wire
//! format and configuration. All other inter-master crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use crypto::{Identity, IdentityKeypair, Role};
