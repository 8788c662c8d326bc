// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Mandau Control Node binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mandau_core::config::CoreConfig;
use mandau_core::registry::AgentRegistry;
use mandau_core::server::{self, CoreState};
use mandau_plugin::builtin::{FileAuditPlugin, RbacPlugin};
use mandau_plugin::{Pipeline, PluginHandle, Registry};
use mandau_transport::TlsPaths;

/// Mandau control node: central registry and proxy for host agents.
#[derive(Parser)]
#[command(name = "mandau-core")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, env = "MANDAU_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Certificate path.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Key path.
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA certificate path.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MANDAU_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

fn build_registry(config: &CoreConfig) -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    for (name, enabled) in &config.plugins.enabled {
        if !enabled {
            continue;
        }
        match name.as_str() {
            "rbac-auth" => {
                let rbac = Arc::new(RbacPlugin::new());
                registry.register(
                    PluginHandle::new(rbac.clone())
                        .with_auth(rbac.clone())
                        .with_policy(rbac),
                )?;
            }
            "file-audit" => {
                let audit = Arc::new(FileAuditPlugin::new());
                registry.register(PluginHandle::new(audit.clone()).with_audit(audit))?;
            }
            other => warn!(plugin = other, "unknown plugin in configuration"),
        }
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = CoreConfig::load_or_default(cli.config.clone())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(cert) = cli.cert {
        config.server.tls.cert_path = cert;
    }
    if let Some(key) = cli.key {
        config.server.tls.key_path = key;
    }
    if let Some(ca) = cli.ca {
        config.server.tls.ca_path = ca;
    }

    let plugins = build_registry(&config)?;
    plugins
        .init_all(&config.plugins.configs)
        .await
        .map_err(|e| anyhow::anyhow!("plugin init: {e}"))?;
    let plugins = Arc::new(plugins);

    let tls_paths = TlsPaths::new(
        &config.server.tls.cert_path,
        &config.server.tls.key_path,
        &config.server.tls.ca_path,
    );

    let registry = Arc::new(AgentRegistry::new(
        plugins.clone(),
        tls_paths.clone(),
        Duration::from_secs(config.agent_management.heartbeat_interval_secs),
        Duration::from_secs(config.agent_management.offline_timeout_secs),
    ));

    let listen_addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("parse listen address {}", config.server.listen_addr))?;

    info!(plugins = plugins.list_all().len(), "starting mandau control node");

    let shutdown = CancellationToken::new();

    // Periodic health sweep.
    tokio::spawn(registry.clone().run_sweeper(shutdown.clone()));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    let state = CoreState {
        registry,
        pipeline: Pipeline::new(plugins.clone(), ""),
    };

    let serve_shutdown = shutdown.clone();
    server::serve(state, listen_addr, &tls_paths, async move {
        serve_shutdown.cancelled().await;
    })
    .await?;

    if let Err(e) = plugins.shutdown_all().await {
        error!(error = %e, "plugin shutdown");
    }
    info!("control node stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
