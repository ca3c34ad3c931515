//! skirmishd - the Skirmish cluster orchestrator.
//!
//! Fronts a pool of game-server child processes and multiplexes players
//! arriving over reliable UDP and WebSocket onto them, with transparent
//! migration, an in-chat command plane, 1v1 matchmaking, and in-band map
//! delivery.

mod cluster;
mod commands;
mod config;
mod error;
mod ingress;
mod mapsend;
mod matchmaker;
mod server;
mod session;
mod spaces;
#[cfg(test)]
mod testutil;
mod verse;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::ingress::reliable::{ReliableIngress, UdpHost};
use crate::ingress::web::{SnapshotFn, WebIngress};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;

    info!(
        presets = config.cluster.presets.len(),
        servers = config.cluster.servers.len(),
        "starting skirmishd"
    );

    let scope = CancellationToken::new();
    let cluster = Cluster::new(config.cluster.clone(), scope.clone()).await;
    cluster.clone().run().await;

    for block in &config.cluster.ingress.desktop {
        let host = UdpHost::bind(block.port, scope.clone()).await.map_err(|e| {
            error!(port = block.port, error = %e, "failed to bind desktop ingress");
            e
        })?;
        let ingress = ReliableIngress::new(
            host,
            block.command.clone(),
            cluster.connection_sink(),
            scope.clone(),
        );
        tokio::spawn(ingress.poll());
    }

    let (fatal_tx, mut fatal) = mpsc::channel::<std::io::Error>(1);
    if let Some(web) = &config.cluster.ingress.web {
        let listener = TcpListener::bind(("0.0.0.0", web.port)).await.map_err(|e| {
            error!(port = web.port, error = %e, "failed to bind web ingress");
            e
        })?;
        let snapshots: SnapshotFn = {
            let cluster = cluster.clone();
            Arc::new(move || cluster.snapshot())
        };
        let ingress = WebIngress::new(
            web.path.clone(),
            cluster.asset_urls(),
            snapshots,
            cluster.connection_sink(),
            scope.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = ingress.serve(listener).await {
                let _ = fatal_tx.send(e).await;
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt, shutting down"),
        _ = sigterm.recv() => info!("terminated, shutting down"),
        Some(e) = fatal.recv() => {
            error!(error = %e, "web ingress died");
            scope.cancel();
            cluster.servers.shutdown();
            return Err(e.into());
        }
    }

    scope.cancel();
    cluster.servers.shutdown();
    Ok(())
}
