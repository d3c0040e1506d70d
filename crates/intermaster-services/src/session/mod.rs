//! Session establishment: handshake, inbound listener and outbound dialer.

mod handshake;
mod initiator;
mod listener;
pub mod record;
mod state;

pub use handshake::{handshake, HandshakeContext, HandshakeError};
pub use initiator::{connect, connect_all};
pub use listener::SessionListener;
pub use state::{HandshakeState, RejectedBy};
