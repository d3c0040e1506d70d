//! Transport-agnostic RPC.
//!
//! Everything that can receive a call implements [`Rpc`]: a local
//! [`LocalDispatcher`], a [`RemoteObject`](crate::channel::RemoteObject) on
//! the far side of a channel, or a decorator from [`forward`]. Capability
//! contracts are declared with [`capability!`](crate::capability), which
//! generates the typed client stub and the method table for the receiver.

mod argument;
mod dispatch;
mod error;
pub mod forward;
mod frame;
mod stub;
mod value;

pub use argument::Argument;
pub use dispatch::{Handler, LocalDispatcher, MethodDef, MethodTable, MethodTableBuilder, Param};
pub use error::RpcError;
pub use frame::{CallContext, CallFrame, ContextEntry, ForwardedIdentity};
pub use stub::Stub;
pub use value::{Blob, Marshal, TypeTag, Value};

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::SecurityContext;

/// The one operation every receiver supports.
///
/// `cx` is the identity the call executes as. Decorators change it by
/// passing a derived context inward; they never mutate the caller's.
#[async_trait]
pub trait Rpc: Send + Sync {
    async fn call(&self, frame: CallFrame, cx: &SecurityContext) -> Result<Value, RpcError>;
}

/// A capability contract: a trait object type with a wire name, a way to
/// build a client stub over any [`Rpc`], and a way to export an
/// implementation as a [`MethodTable`].
///
/// Implemented for `dyn Trait` by [`capability!`](crate::capability).
pub trait Capability: Send + Sync + 'static {
    const NAME: &'static str;

    fn stub(rpc: Arc<dyn Rpc>) -> Arc<Self>;

    fn export(this: Arc<Self>) -> MethodTable;
}

/// Contract names are dotted identifiers, e.g. `intermaster.MasterInfo`.
/// Anything else names a concrete type or garbage and cannot be resolved.
pub fn validate_contract_name(name: &str) -> Result<(), RpcError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(RpcError::unsupported(format!(
            "{name:?} is not a capability contract"
        )))
    }
}

/// Declare a capability contract.
///
/// ```ignore
/// capability! {
///     pub trait Greeter => GreeterStub ("example.Greeter") {
///         fn greet(name: String) -> String;
///     }
/// }
/// ```
///
/// Expands to an async trait `Greeter` whose methods take
/// `&SecurityContext` first and return `Result<_, RpcError>`, a
/// `GreeterStub` that forwards every call through an `Arc<dyn Rpc>`, and
/// `impl Capability for dyn Greeter`. Parameter and return types must
/// implement [`Marshal`](crate::rpc::Marshal).
#[macro_export]
macro_rules! capability {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident => $stub:ident ($contract:literal) {
            $(
                $(#[$mmeta:meta])*
                fn $method:ident ( $( $arg:ident : $argty:ty ),* $(,)? ) -> $ret:ty ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[$crate::__private::async_trait]
        $vis trait $name: Send + Sync {
            $(
                $(#[$mmeta])*
                async fn $method(
                    &self,
                    cx: &$crate::auth::SecurityContext,
                    $( $arg: $argty ),*
                ) -> ::std::result::Result<$ret, $crate::rpc::RpcError>;
            )*
        }

        /// Client-side stub generated by `capability!`.
        $vis struct $stub {
            inner: $crate::rpc::Stub,
        }

        #[$crate::__private::async_trait]
        impl $name for $stub {
            $(
                async fn $method(
                    &self,
                    cx: &$crate::auth::SecurityContext,
                    $( $arg: $argty ),*
                ) -> ::std::result::Result<$ret, $crate::rpc::RpcError> {
                    let value = self
                        .inner
                        .invoke(
                            stringify!($method),
                            vec![ $( $crate::rpc::Argument::of(stringify!($arg), $arg) ),* ],
                            cx,
                        )
                        .await?;
                    <$ret as $crate::rpc::Marshal>::from_value(value)
                }
            )*
        }

        impl $crate::rpc::Capability for dyn $name {
            const NAME: &'static str = $contract;

            fn stub(rpc: ::std::sync::Arc<dyn $crate::rpc::Rpc>) -> ::std::sync::Arc<Self> {
                ::std::sync::Arc::new($stub {
                    inner: $crate::rpc::Stub::new($contract, rpc),
                })
            }

            fn export(this: ::std::sync::Arc<Self>) -> $crate::rpc::MethodTable {
                $crate::rpc::MethodTable::builder()
                $(
                    .method(
                        stringify!($method),
                        vec![ $(
                            $crate::rpc::Param::new(
                                stringify!($arg),
                                <$argty as $crate::rpc::Marshal>::type_tag(),
                            )
                        ),* ],
                        {
                            let this = this.clone();
                            move |args: ::std::vec::Vec<$crate::rpc::Value>,
                                  cx: $crate::auth::SecurityContext| {
                                let this = this.clone();
                                let fut: $crate::__private::BoxFuture<
                                    'static,
                                    ::std::result::Result<$crate::rpc::Value, $crate::rpc::RpcError>,
                                > = ::std::boxed::Box::pin(async move {
                                    #[allow(unused_mut, unused_variables)]
                                    let mut args = args.into_iter();
                                    $(
                                        let $arg = <$argty as $crate::rpc::Marshal>::from_value(
                                            args.next().unwrap_or($crate::rpc::Value::Null),
                                        )?;
                                    )*
                                    let out = this.$method(&cx, $( $arg ),*).await?;
                                    ::std::result::Result::<$crate::rpc::Value, $crate::rpc::RpcError>::Ok(
                                        $crate::rpc::Marshal::into_value(out),
                                    )
                                });
                                fut
                            }
                        },
                    )
                )*
                .build()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authentication;

    crate::capability! {
        /// Test contract.
        pub trait Counter => CounterStub ("test.Counter") {
            fn add(a: i64, b: i64) -> i64;
            fn whoami() -> String;
            fn fail(reason: String) -> ();
        }
    }

    struct LocalCounter;

    #[async_trait]
    impl Counter for LocalCounter {
        async fn add(&self, _cx: &SecurityContext, a: i64, b: i64) -> Result<i64, RpcError> {
            Ok(a + b)
        }

        async fn whoami(&self, cx: &SecurityContext) -> Result<String, RpcError> {
            Ok(cx.authentication().principal().to_string())
        }

        async fn fail(&self, _cx: &SecurityContext, reason: String) -> Result<(), RpcError> {
            Err(RpcError::application("CounterError", reason))
        }
    }

    fn exported() -> Arc<dyn Rpc> {
        let table = <dyn Counter as Capability>::export(Arc::new(LocalCounter));
        Arc::new(LocalDispatcher::new(table))
    }

    #[tokio::test]
    async fn stub_round_trips_through_dispatcher() {
        let stub = <dyn Counter as Capability>::stub(exported());
        let cx = SecurityContext::new(Authentication::new("alice", vec![]));

        assert_eq!(stub.add(&cx, 2, 3).await.unwrap(), 5);
        assert_eq!(stub.whoami(&cx).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn application_error_is_not_wrapped() {
        let stub = <dyn Counter as Capability>::stub(exported());
        let err = stub
            .fail(&SecurityContext::system(), "frozen".into())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::application("CounterError", "frozen"));
    }

    #[tokio::test]
    async fn stub_captures_parameter_names() {
        struct Capture(std::sync::Mutex<Option<CallFrame>>);

        #[async_trait]
        impl Rpc for Capture {
            async fn call(&self, frame: CallFrame, _cx: &SecurityContext) -> Result<Value, RpcError> {
                *self.0.lock().unwrap() = Some(frame);
                Ok(Value::Int(0))
            }
        }

        let capture = Arc::new(Capture(std::sync::Mutex::new(None)));
        let stub = <dyn Counter as Capability>::stub(capture.clone());
        stub.add(&SecurityContext::system(), 1, 2).await.unwrap();

        let frame = capture.0.lock().unwrap().take().unwrap();
        assert_eq!(frame.method, "add");
        let names: Vec<_> = frame.arguments.iter().map(|a| a.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(frame.context.is_empty());
    }

    #[test]
    fn contract_names_must_be_dotted_identifiers() {
        assert!(validate_contract_name("intermaster.MasterInfo").is_ok());
        assert!(validate_contract_name("Plain").is_ok());
        assert!(validate_contract_name("").is_err());
        assert!(validate_contract_name("a..b").is_err());
        assert!(validate_contract_name("9lives").is_err());
        assert!(matches!(
            validate_contract_name("Vec<u8>"),
            Err(RpcError::Unsupported { .. })
        ));
    }
}
