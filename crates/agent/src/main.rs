//! RDT Agent - per-pod cache and memory bandwidth isolation
//!
//! This binary runs as a DaemonSet on each Kubernetes node. It plugs into
//! the container runtime over NRI and places pods into resctrl control
//! groups according to their isolation annotation.

use anyhow::{Context, Result};
use rdt_lib::{
    health::{components, HealthRegistry},
    hooks::{HookRegistry, ResctrlPlugin},
    nri::{NriServer, NriServerOptions, Stub},
    observability::{AgentMetrics, StructuredLogger},
    reconciler::{ReconcileConfig, Reconciler},
    resctrl::StoreConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting rdt-agent");

    let config = config::AgentConfig::load()?;
    info!(node_name = %config.node_name, resctrl_root = %config.resctrl_root.display(), "Agent configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RESCTRL_ENGINE).await;
    health_registry.register(components::NRI_SERVER).await;
    health_registry.register(components::RECONCILER).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    // Engine: detect, rebuild from disk, then register hooks
    let store_config = StoreConfig {
        root: config.resctrl_root.clone(),
        removal_grace: config.removal_grace(),
        removal_policy: config.removal_policy(),
    };
    let plugin = ResctrlPlugin::try_new(store_config, &config.cpuinfo_path, logger.clone())
        .await
        .map(Arc::new);

    let mut hooks = HookRegistry::new();
    let engine = match &plugin {
        Some(plugin) => {
            plugin.register(&mut hooks);
            logger.log_startup(AGENT_VERSION, &format!("{:?}", plugin.engine().capability()));
            Some(plugin.engine().clone())
        }
        None => {
            health_registry
                .set_degraded(components::RESCTRL_ENGINE, "resctrl unsupported on this node")
                .await;
            logger.log_startup(AGENT_VERSION, "none");
            None
        }
    };
    let hooks = Arc::new(hooks);

    let server = Arc::new(
        NriServer::new(
            NriServerOptions {
                plugin_name: config.nri_plugin_name.clone(),
                plugin_idx: config.nri_plugin_idx.clone(),
                events: config.nri_events.clone(),
                failure_policy: config.failure_policy,
            },
            hooks.clone(),
            logger.clone(),
        )
        .context("invalid NRI plugin options")?,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // NRI connection; the agent exits once the runtime drops it
    let stub = Stub::new(
        server.clone(),
        config.nri_plugin_name.clone(),
        config.nri_plugin_idx.clone(),
        config.nri_socket_path.clone(),
    );
    let nri_shutdown = shutdown_tx.subscribe();
    let mut nri_handle = tokio::spawn(async move { stub.run(nri_shutdown).await });

    let reconcile_handle = engine.as_ref().map(|engine| {
        let reconciler = Reconciler::new(
            engine.clone(),
            hooks.clone(),
            Arc::new(server.sandboxes().clone()),
            ReconcileConfig {
                interval: config.reconcile_interval(),
                failure_policy: config.failure_policy,
                removal_policy: config.removal_policy(),
            },
            logger.clone(),
        )
        .with_health(Arc::new(health_registry.clone()));
        tokio::spawn(reconciler.run(shutdown_tx.subscribe()))
    });

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        engine.clone(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Engine rebuilt and adapter started
    health_registry.set_ready(true).await;

    let reason = tokio::select! {
        _ = shutdown_signal() => "signal received",
        result = &mut nri_handle => {
            match result {
                Ok(Ok(())) => warn!("NRI connection closed by runtime"),
                Ok(Err(e)) => error!(error = %e, "NRI connection failed"),
                Err(e) => error!(error = %e, "NRI task panicked"),
            }
            health_registry
                .set_unhealthy(components::NRI_SERVER, "connection to runtime lost")
                .await;
            "NRI connection lost"
        }
    };

    logger.log_shutdown(reason);
    info!(reason, "Shutting down");

    // Subscribers may already be gone
    let _ = shutdown_tx.send(());
    if !nri_handle.is_finished() {
        let _ = nri_handle.await;
    }
    if let Some(handle) = reconcile_handle {
        let _ = handle.await;
    }
    api_handle.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
