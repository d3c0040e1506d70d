//! Version-tolerant method resolution over a table of local methods.
//!
//! A caller and a receiver built from different versions of a contract
//! rarely agree on exact signatures. Instead of requiring that, every call
//! is scored against every same-name method:
//!
//! - exact arity: 3000
//! - receiver declares more parameters: `2000 - defaulted`
//! - receiver declares fewer parameters: `1000 - dropped`
//!
//! The overlapping prefix must be assignable or the method scores 0. The
//! highest score wins; on a tie the method registered first is kept.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{Argument, CallFrame, Rpc, RpcError, TypeTag, Value};
use crate::auth::SecurityContext;

const EXACT: u32 = 3000;
const DEFAULTED: u32 = 2000;
const DROPPED: u32 = 1000;

/// The body of one method. Receives exactly as many values as the method
/// declares parameters.
pub type Handler =
    Arc<dyn Fn(Vec<Value>, SecurityContext) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeTag,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: TypeTag) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

pub struct MethodDef {
    name: String,
    params: Vec<Param>,
    handler: Handler,
}

impl MethodDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Score this method against a call. 0 means ineligible.
    fn score(&self, method: &str, args: &[Argument]) -> u32 {
        if self.name != method {
            return 0;
        }
        let overlap = self.params.len().min(args.len());
        let prefix_ok = self.params[..overlap]
            .iter()
            .zip(&args[..overlap])
            .all(|(p, a)| a.is_assignable_to(&p.ty));
        if !prefix_ok {
            return 0;
        }

        let declared = self.params.len();
        let supplied = args.len();
        if declared == supplied {
            EXACT
        } else if declared > supplied {
            DEFAULTED.saturating_sub((declared - supplied) as u32)
        } else {
            DROPPED.saturating_sub((supplied - declared) as u32)
        }
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// The publicly invocable methods of one object, in registration order.
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: Vec<MethodDef>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[derive(Default)]
pub struct MethodTableBuilder {
    methods: Vec<MethodDef>,
}

impl MethodTableBuilder {
    pub fn method<F>(mut self, name: &str, params: Vec<Param>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, SecurityContext) -> BoxFuture<'static, Result<Value, RpcError>>
            + Send
            + Sync
            + 'static,
    {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params,
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a method from a plain async function, for hand-written
    /// (dynamic) services that do not go through `capability!`.
    pub fn method_fn<F, Fut>(self, name: &str, params: Vec<Param>, f: F) -> Self
    where
        F: Fn(Vec<Value>, SecurityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.method(name, params, move |args, cx| {
            let fut: BoxFuture<'static, Result<Value, RpcError>> = Box::pin(f(args, cx));
            fut
        })
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            methods: self.methods,
        }
    }
}

/// Implements [`Rpc`] over a local [`MethodTable`].
#[derive(Debug)]
pub struct LocalDispatcher {
    table: MethodTable,
}

impl LocalDispatcher {
    pub fn new(table: MethodTable) -> Self {
        Self { table }
    }

    /// The best-scoring method for this call, if any scores above zero.
    pub fn select(&self, method: &str, args: &[Argument]) -> Option<&MethodDef> {
        let mut best: Option<(&MethodDef, u32)> = None;
        for def in &self.table.methods {
            let score = def.score(method, args);
            if score == 0 {
                continue;
            }
            // Strict comparison: ties keep the earlier registration.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((def, score));
            }
        }
        best.map(|(def, _)| def)
    }
}

#[async_trait]
impl Rpc for LocalDispatcher {
    async fn call(&self, frame: CallFrame, cx: &SecurityContext) -> Result<Value, RpcError> {
        let def = self
            .select(&frame.method, &frame.arguments)
            .ok_or_else(|| RpcError::NoSuchMethod {
                method: frame.method.clone(),
            })?;

        let declared = def.params.len();
        let mut values: Vec<Value> = frame
            .arguments
            .into_iter()
            .take(declared)
            .map(|a| a.value)
            .collect();
        let supplied = values.len();
        values.extend(def.params[supplied..].iter().map(|p| p.ty.default_value()));

        tracing::trace!(
            method = %def.name,
            declared,
            supplied,
            caller = %cx,
            "dispatching"
        );
        (def.handler)(values, cx.clone()).await
    }
}
