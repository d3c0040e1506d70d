//! Call frames and the context set carried alongside them.

use serde::{Deserialize, Serialize};

use super::Argument;
use crate::auth::Authentication;

/// One method invocation: name, ordered arguments, context set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub method: String,
    pub arguments: Vec<Argument>,
    #[serde(default)]
    pub context: CallContext,
}

impl CallFrame {
    pub fn new(method: impl Into<String>, arguments: Vec<Argument>) -> Self {
        Self {
            method: method.into(),
            arguments,
            context: CallContext::default(),
        }
    }
}

/// Snapshot of a caller's identity, carried across a call boundary.
///
/// Holds names only, never credentials. The receiving side trusts it
/// because the channel it arrived on is authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedIdentity {
    pub principal: String,
    pub authorities: Vec<String>,
}

impl ForwardedIdentity {
    pub fn capture(auth: &Authentication) -> Self {
        Self {
            principal: auth.principal().to_string(),
            authorities: auth.authorities().to_vec(),
        }
    }

    /// Rebuild an authentication from the snapshot. Treated as
    /// authenticated: the sending master vouched for it.
    pub fn to_authentication(&self) -> Authentication {
        Authentication::new(self.principal.clone(), self.authorities.clone())
    }
}

/// A member of a call's context set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextEntry {
    ForwardedIdentity(ForwardedIdentity),
    /// Sent by a newer peer; kept so it is not an error, but ignored.
    #[serde(other)]
    Unknown,
}

impl ContextEntry {
    fn same_kind(&self, other: &ContextEntry) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Unordered set of context entries, at most one per kind.
///
/// Never mutated in place once a frame is built: each forwarding hop makes
/// a new set with [`CallContext::with`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallContext {
    entries: Vec<ContextEntry>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this set with `entry` added, replacing any entry of the
    /// same kind.
    pub fn with(&self, entry: ContextEntry) -> CallContext {
        let mut entries: Vec<ContextEntry> = self
            .entries
            .iter()
            .filter(|e| !e.same_kind(&entry))
            .cloned()
            .collect();
        entries.push(entry);
        CallContext { entries }
    }

    pub fn forwarded_identity(&self) -> Option<&ForwardedIdentity> {
        self.entries.iter().find_map(|e| match e {
            ContextEntry::ForwardedIdentity(f) => Some(f),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }
}
