//! Identity forwarding across a call boundary.
//!
//! [`sender`] snapshots the caller's identity into the frame's context;
//! [`receiver`] runs the inner call as that identity, or as anonymous when
//! no claim is present. Neither touches the caller's own context.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CallFrame, ContextEntry, ForwardedIdentity, Rpc, RpcError, Value};
use crate::auth::{Authentication, SecurityContext};

/// Wrap the calling side of a boundary.
pub fn sender(inner: Arc<dyn Rpc>) -> Arc<dyn Rpc> {
    Arc::new(Sender { inner })
}

/// Wrap the receiving side of a boundary.
pub fn receiver(inner: Arc<dyn Rpc>) -> Arc<dyn Rpc> {
    Arc::new(Receiver { inner })
}

struct Sender {
    inner: Arc<dyn Rpc>,
}

#[async_trait]
impl Rpc for Sender {
    async fn call(&self, mut frame: CallFrame, cx: &SecurityContext) -> Result<Value, RpcError> {
        let auth = cx.authentication();
        // Anonymous callers send no claim; the receiver defaults to anonymous.
        if !auth.is_anonymous() {
            let claim = ForwardedIdentity::capture(auth);
            frame.context = frame.context.with(ContextEntry::ForwardedIdentity(claim));
        }
        self.inner.call(frame, cx).await
    }
}

struct Receiver {
    inner: Arc<dyn Rpc>,
}

#[async_trait]
impl Rpc for Receiver {
    async fn call(&self, frame: CallFrame, cx: &SecurityContext) -> Result<Value, RpcError> {
        let auth = match frame.context.forwarded_identity() {
            Some(claim) => claim.to_authentication(),
            None => Authentication::anonymous(),
        };
        tracing::trace!(transport = %cx, acting_as = auth.principal(), "impersonating");
        let scoped = cx.impersonate(auth);
        self.inner.call(frame, &scoped).await
    }
}
