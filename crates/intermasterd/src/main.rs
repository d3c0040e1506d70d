//! intermasterd: inter-master session daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use intermaster_core::config::MasterConfig;
use intermaster_services::{
    connect_all, HandshakeContext, MemoryPeerRegistry, ServiceProviders, SessionListener,
};

mod info;
mod keypair;

use info::{LocalMasterInfo, MasterInfo};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MasterConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MasterConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MasterConfig::default()
    });

    // Identity
    let keypair = Arc::new(keypair::load_or_generate(&config.identity.keypair_path)?);
    let identity = keypair.identity();
    tracing::info!(
        identity = %identity,
        fingerprint = %identity.fingerprint(),
        public_url = %config.network.public_url,
        "intermasterd starting"
    );

    // Registry
    let registry = Arc::new(
        MemoryPeerRegistry::from_config(&config.registry)
            .context("invalid registry configuration")?,
    );
    if config.registry.auto_approve {
        tracing::warn!("auto-approve enabled, every discovered peer will be approved");
    }

    // Services offered to peers
    let providers = Arc::new(ServiceProviders::new());
    providers.provide::<dyn MasterInfo>(Arc::new(LocalMasterInfo::new(
        config.network.public_url.clone(),
        identity,
    )));

    let hx = Arc::new(
        HandshakeContext::new(
            keypair,
            config.network.public_url.clone(),
            registry,
            providers,
        )
        .with_timeout(Duration::from_secs(config.network.handshake_timeout_secs)),
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Sessions ─────────────────────────────────────────────────────────────
    let listener = SessionListener::bind(
        &config.network.listen_addr,
        hx.clone(),
        shutdown_tx.subscribe(),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    let listener_task = tokio::spawn(listener.run());

    let connected = connect_all(&hx).await;
    tracing::info!(connected, known = hx.registry.list().len(), "startup dial complete");
    let greeted = info::say_hello_to_all(&hx.connections, &config.network.public_url).await;
    tracing::debug!(greeted, "greeted connected peers");

    let _ = shutdown_rx.recv().await;

    for master in hx.connections.snapshot() {
        master.channel.close().await;
    }
    match listener_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "session listener failed"),
        Err(e) => tracing::error!(error = %e, "session listener task failed"),
    }
    tracing::info!("intermasterd stopped");
    Ok(())
}
