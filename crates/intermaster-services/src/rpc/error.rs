//! Errors a call can end with. Serializable, so a failure raised on the
//! receiving master reaches the caller unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum RpcError {
    /// No method on the receiver accepts this name and these arguments.
    #[error("no method {method:?} accepts the given arguments")]
    NoSuchMethod { method: String },

    /// The invoked method itself failed. Passed through verbatim.
    #[error("{kind}: {message}")]
    Application { kind: String, message: String },

    /// The caller is not allowed to do this.
    #[error("access denied: {message}")]
    Access { message: String },

    /// An argument or return value could not be converted.
    #[error("marshalling failed: {message}")]
    Marshal { message: String },

    #[error("unsupported operation: {message}")]
    Unsupported { message: String },

    /// The remote side has no exported object with this id.
    #[error("no exported object #{oid}")]
    NoSuchObject { oid: u64 },

    #[error("channel closed")]
    ChannelClosed,

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("protocol violation: {message}")]
    Protocol { message: String },
}

impl RpcError {
    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Application {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn access(message: impl Into<String>) -> Self {
        RpcError::Access {
            message: message.into(),
        }
    }

    pub fn marshal(message: impl Into<String>) -> Self {
        RpcError::Marshal {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        RpcError::Unsupported {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
        }
    }

    /// True if the failure came from dispatch rather than from the method.
    pub fn is_no_such_method(&self) -> bool {
        matches!(self, RpcError::NoSuchMethod { .. })
    }
}
