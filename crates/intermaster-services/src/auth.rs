//! Caller identity as an explicit value.
//!
//! There is no thread-local "current user". Every RPC receives the
//! caller's [`SecurityContext`] as a parameter; impersonation means calling
//! the next layer with a derived context. The caller's own context is never
//! mutated, so nothing needs restoring when the call returns or fails.

use std::fmt;
use std::sync::Arc;

use intermaster_core::Identity;

/// Principal name used when no identity was forwarded.
pub const ANONYMOUS: &str = "anonymous";

/// Principal name of the local master acting on its own behalf.
pub const SYSTEM: &str = "SYSTEM";

/// Authority granted to a peer master's transport identity.
pub const MASTER_AUTHORITY: &str = "master";

/// An authenticated (or anonymous) principal and its authorities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    principal: String,
    authorities: Vec<String>,
    authenticated: bool,
}

impl Authentication {
    pub fn new(principal: impl Into<String>, authorities: Vec<String>) -> Self {
        Self {
            principal: principal.into(),
            authorities,
            authenticated: true,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            principal: ANONYMOUS.to_string(),
            authorities: vec![ANONYMOUS.to_string()],
            authenticated: false,
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM, Vec::new())
    }

    /// The identity a peer master has on our side of a channel, before any
    /// forwarded identity is applied.
    pub fn for_master(identity: &Identity) -> Self {
        Self::new(
            format!("master:{}", identity.fingerprint()),
            vec![MASTER_AUTHORITY.to_string()],
        )
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn authorities(&self) -> &[String] {
        &self.authorities
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_anonymous(&self) -> bool {
        !self.authenticated && self.principal == ANONYMOUS
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.iter().any(|a| a == authority)
    }
}

/// The ambient identity of one execution, passed down every call.
///
/// Cheap to clone. Deriving a new context for impersonation leaves the
/// original untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    auth: Arc<Authentication>,
}

impl SecurityContext {
    pub fn new(auth: Authentication) -> Self {
        Self {
            auth: Arc::new(auth),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Authentication::anonymous())
    }

    pub fn system() -> Self {
        Self::new(Authentication::system())
    }

    pub fn authentication(&self) -> &Authentication {
        &self.auth
    }

    /// A context that acts as `auth`. Scoped by construction: it lives only
    /// as long as the call it is handed to.
    pub fn impersonate(&self, auth: Authentication) -> SecurityContext {
        SecurityContext::new(auth)
    }
}

impl fmt::Display for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.auth.principal())
    }
}
