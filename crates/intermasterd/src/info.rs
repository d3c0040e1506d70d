//! Built-in `intermaster.MasterInfo` capability.

use std::collections::BTreeMap;

use async_trait::async_trait;

use intermaster_core::Identity;
use intermaster_services::rpc::{Marshal, TypeTag, Value};
use intermaster_services::{ConnectionSet, RpcError, SecurityContext};

intermaster_services::capability! {
    /// What every master tells its peers about itself.
    pub trait MasterInfo => MasterInfoStub ("intermaster.MasterInfo") {
        fn describe() -> MasterDescription;
        fn hello(from: String) -> ();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterDescription {
    pub url: String,
    pub identity: String,
    pub version: String,
}

const DESCRIPTION_TYPE: &str = "intermaster.MasterDescription";

impl Marshal for MasterDescription {
    fn type_tag() -> TypeTag {
        TypeTag::Named(DESCRIPTION_TYPE.into())
    }

    fn into_value(self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("url".into(), self.url.into_value());
        fields.insert("identity".into(), self.identity.into_value());
        fields.insert("version".into(), self.version.into_value());
        Value::record(DESCRIPTION_TYPE, fields)
    }

    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Record {
                type_name,
                mut fields,
            } if type_name == DESCRIPTION_TYPE => Ok(Self {
                url: String::from_value(Value::take_field(&mut fields, "url")?)?,
                identity: String::from_value(Value::take_field(&mut fields, "identity")?)?,
                version: String::from_value(Value::take_field(&mut fields, "version")?)?,
            }),
            other => Err(RpcError::marshal(format!(
                "expected {DESCRIPTION_TYPE}, found {other:?}"
            ))),
        }
    }
}

pub struct LocalMasterInfo {
    url: String,
    identity: Identity,
}

impl LocalMasterInfo {
    pub fn new(url: impl Into<String>, identity: Identity) -> Self {
        Self {
            url: url.into(),
            identity,
        }
    }
}

#[async_trait]
impl MasterInfo for LocalMasterInfo {
    async fn describe(&self, _cx: &SecurityContext) -> Result<MasterDescription, RpcError> {
        Ok(MasterDescription {
            url: self.url.clone(),
            identity: self.identity.to_hex(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn hello(&self, cx: &SecurityContext, from: String) -> Result<(), RpcError> {
        tracing::info!(from = %from, caller = %cx, "hello from peer");
        Ok(())
    }
}

/// Greet every connected peer through its `MasterInfo`. Returns how many
/// answered.
pub async fn say_hello_to_all(connections: &ConnectionSet, own_url: &str) -> usize {
    let cx = SecurityContext::system();
    let mut greeted = 0;
    for master in connections.snapshot() {
        let outcome = match master.service::<dyn MasterInfo>().await {
            Ok(Some(info)) => info.hello(&cx, own_url.to_string()).await,
            Ok(None) => {
                tracing::debug!(peer = %master.identity.fingerprint(), "peer offers no MasterInfo");
                continue;
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => greeted += 1,
            Err(e) => tracing::warn!(
                peer = %master.identity.fingerprint(),
                endpoint = %master.url,
                error = %e,
                "hello failed"
            ),
        }
    }
    greeted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use intermaster_core::IdentityKeypair;
    use intermaster_services::rpc::LocalDispatcher;
    use intermaster_services::Capability;

    fn served() -> Arc<dyn MasterInfo> {
        let local = Arc::new(LocalMasterInfo::new(
            "http://a.example/",
            IdentityKeypair::generate().identity(),
        ));
        let table = <dyn MasterInfo as Capability>::export(local);
        <dyn MasterInfo as Capability>::stub(Arc::new(LocalDispatcher::new(table)))
    }

    #[tokio::test]
    async fn describe_marshals_as_a_record() {
        let info = served();
        let d = info.describe(&SecurityContext::system()).await.unwrap();
        assert_eq!(d.url, "http://a.example/");
        assert_eq!(d.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(d.identity.len(), 64);
    }

    #[tokio::test]
    async fn hello_is_answered() {
        let info = served();
        info.hello(&SecurityContext::anonymous(), "http://b.example/".into())
            .await
            .unwrap();
    }

    #[test]
    fn foreign_record_is_refused() {
        let v = Value::record("other.Type", BTreeMap::new());
        assert!(MasterDescription::from_value(v).is_err());
    }
}
