//! parleyd — Parley chat relay daemon.
//!
//! Usage: parleyd [port]
//!
//! The port argument overrides the config file; values outside 1024-65535
//! fall back to 5000 with a warning.

use std::sync::Arc;

use anyhow::{Context, Result};

use parley_core::config::{validate_port, ParleyConfig};
use parley_server::{Broadcaster, Dispatcher, DispatcherSettings, Registry, SharedBroadcaster};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ParleyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ParleyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ParleyConfig::default()
    });

    if let Some(arg) = std::env::args().nth(1) {
        config.server.port = validate_port(&arg);
    }

    let registry = Registry::shared();
    let broadcaster: SharedBroadcaster = registry.clone();
    let addr = config.server.socket_addr();

    let dispatcher = Dispatcher::bind(addr, broadcaster, DispatcherSettings::from(&config.server))
        .await
        .with_context(|| format!("failed to start chat server on {addr}"))?;
    tracing::info!(
        addr = %dispatcher.local_addr(),
        handshake_timeout_secs = config.server.handshake_timeout_secs,
        "waiting for clients to connect"
    );

    // ── Shutdown on ctrl-c ────────────────────────────────────────────────────
    {
        let shutdown = dispatcher.shutdown_handle();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!(
                connected = registry.count(),
                participants = ?registry.names(),
                "shutdown signal received"
            );
            shutdown.shutdown();
        });
    }

    dispatcher.run().await.context("chat server stopped unexpectedly")?;
    Ok(())
}
