use std::fmt;
use std::sync::Arc;

use super::{Argument, CallFrame, Rpc, RpcError, Value};
use crate::auth::SecurityContext;

/// Untyped client side of a contract: turns a method name and arguments
/// into a [`CallFrame`] and sends it through an [`Rpc`].
///
/// The typed stubs generated by `capability!` wrap one of these. The frame
/// starts with an empty context; identity forwarding is the job of the
/// `Rpc` this stub was given.
#[derive(Clone)]
pub struct Stub {
    contract: String,
    rpc: Arc<dyn Rpc>,
}

impl Stub {
    pub fn new(contract: impl Into<String>, rpc: Arc<dyn Rpc>) -> Self {
        Self {
            contract: contract.into(),
            rpc,
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn rpc(&self) -> &Arc<dyn Rpc> {
        &self.rpc
    }

    pub async fn invoke(
        &self,
        method: &str,
        arguments: Vec<Argument>,
        cx: &SecurityContext,
    ) -> Result<Value, RpcError> {
        tracing::trace!(contract = %self.contract, method, args = arguments.len(), "invoking");
        self.rpc.call(CallFrame::new(method, arguments), cx).await
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}
