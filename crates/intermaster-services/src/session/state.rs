//! Handshake progress.

use std::fmt;

/// Stages of session establishment, in order.
///
/// A failed handshake reports the stage it was working towards when it
/// failed, so a bad identity proof is an `IdentityVerified` failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    Connecting,
    KeyExchanged,
    IdentityVerified,
    NegotiatingEndpoints,
    Approved,
    Rejected,
    ChannelEstablished,
    Closed,
}

impl HandshakeState {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeState::Connecting => "connecting",
            HandshakeState::KeyExchanged => "key-exchanged",
            HandshakeState::IdentityVerified => "identity-verified",
            HandshakeState::NegotiatingEndpoints => "negotiating-endpoints",
            HandshakeState::Approved => "approved",
            HandshakeState::Rejected => "rejected",
            HandshakeState::ChannelEstablished => "channel-established",
            HandshakeState::Closed => "closed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side withheld approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedBy {
    /// Our registry does not approve the peer.
    Local,
    /// The peer's registry does not approve us.
    Remote,
}

impl fmt::Display for RejectedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectedBy::Local => "local",
            RejectedBy::Remote => "remote",
        })
    }
}
