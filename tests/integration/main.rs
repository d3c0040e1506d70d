//! Inter-master integration test harness.
//!
//! Every test starts its own masters in-process, each with a session
//! listener on an ephemeral 127.0.0.1 port, and talks to them over real TCP.
//!
//!   cargo test --test integration
//!
//! Masters shut their listeners down when dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use intermaster_core::{Identity, IdentityKeypair};
use intermaster_services::{
    connect, ConnectedMaster, HandshakeContext, HandshakeError, MemoryPeerRegistry, RpcError,
    SecurityContext, ServiceProviders, SessionListener,
};

mod rpc;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(5);

/// One master: listener, registry, providers and the handshake context
/// that ties them together.
pub struct Master {
    pub name: String,
    pub hx: Arc<HandshakeContext>,
    pub registry: Arc<MemoryPeerRegistry>,
    pub providers: Arc<ServiceProviders>,
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl Master {
    pub async fn start(name: &str, auto_approve: bool) -> Result<Self> {
        let registry = Arc::new(MemoryPeerRegistry::new());
        registry.set_auto_approve(auto_approve);
        let providers = Arc::new(ServiceProviders::new());
        let hx = Arc::new(
            HandshakeContext::new(
                Arc::new(IdentityKeypair::generate()),
                format!("http://{name}.test/"),
                registry.clone(),
                providers.clone(),
            )
            .with_timeout(WAIT),
        );

        let (shutdown, rx) = broadcast::channel(1);
        let listener = SessionListener::bind("127.0.0.1:0", hx.clone(), rx)
            .await
            .context("failed to bind test listener")?;
        let addr = listener.local_addr()?;
        tokio::spawn(listener.run());

        Ok(Self {
            name: name.to_string(),
            hx,
            registry,
            providers,
            addr,
            shutdown,
        })
    }

    pub fn identity(&self) -> Identity {
        self.hx.identity()
    }

    pub fn url(&self) -> String {
        format!("http://{}.test/", self.name)
    }

    /// Dial `other`, requiring it to prove its identity.
    pub async fn dial(&self, other: &Master) -> Result<Arc<ConnectedMaster>, HandshakeError> {
        connect(&other.addr.to_string(), &self.hx, Some(other.identity())).await
    }

    /// The session with `peer`, once the listener side has registered it.
    pub async fn session_with(&self, peer: &Master) -> Result<Arc<ConnectedMaster>> {
        let id = peer.identity();
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(m) = self.hx.connections.get(&id) {
                return Ok(m);
            }
            if tokio::time::Instant::now() > deadline {
                bail!("{} never registered a session with {}", self.name, peer.name);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_disconnected(&self, peer: &Master) -> Result<()> {
        let id = peer.identity();
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.hx.connections.contains(&id) {
            if tokio::time::Instant::now() > deadline {
                bail!("{} still holds a session with {}", self.name, peer.name);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Two mutually approving masters with a session from `a` to `b`.
pub async fn connected_pair() -> Result<(Master, Master, Arc<ConnectedMaster>)> {
    let a = Master::start("a", true).await?;
    let b = Master::start("b", true).await?;
    let session = a.dial(&b).await.context("handshake a → b")?;
    Ok((a, b, session))
}

// ── Test contract ─────────────────────────────────────────────────────────────

intermaster_services::capability! {
    /// Per-account balances, used to exercise calls across a session.
    pub trait Ledger => LedgerStub ("test.Ledger") {
        fn deposit(account: String, amount: i64) -> i64;
        fn balances() -> BTreeMap<String, i64>;
        fn caller() -> String;
        fn withdraw(account: String, amount: i64) -> i64;
        fn stall() -> ();
    }
}

#[derive(Default)]
pub struct LocalLedger {
    accounts: Mutex<BTreeMap<String, i64>>,
}

#[async_trait]
impl Ledger for LocalLedger {
    async fn deposit(&self, _cx: &SecurityContext, account: String, amount: i64) -> Result<i64, RpcError> {
        let mut accounts = self.accounts.lock().unwrap();
        let balance = accounts.entry(account).or_default();
        *balance += amount;
        Ok(*balance)
    }

    async fn balances(&self, _cx: &SecurityContext) -> Result<BTreeMap<String, i64>, RpcError> {
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn caller(&self, cx: &SecurityContext) -> Result<String, RpcError> {
        Ok(cx.authentication().principal().to_string())
    }

    async fn withdraw(&self, _cx: &SecurityContext, account: String, amount: i64) -> Result<i64, RpcError> {
        let mut accounts = self.accounts.lock().unwrap();
        let balance = accounts.entry(account.clone()).or_default();
        if *balance < amount {
            return Err(RpcError::application(
                "InsufficientFunds",
                format!("{account} holds {balance}, asked for {amount}"),
            ));
        }
        *balance -= amount;
        Ok(*balance)
    }

    async fn stall(&self, _cx: &SecurityContext) -> Result<(), RpcError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}
