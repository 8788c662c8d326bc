// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Mandau host agent binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mandau_agent::config::AgentConfig;
use mandau_agent::docker::DockerClient;
use mandau_agent::filesystem;
use mandau_agent::heartbeat::CoreLink;
use mandau_agent::operation::Manager as OperationManager;
use mandau_agent::server::{self, AgentState};
use mandau_agent::stack;
use mandau_plugin::builtin::{FileAuditPlugin, LocalSecretsPlugin, RbacPlugin};
use mandau_plugin::{Pipeline, PluginHandle, Registry};
use mandau_transport::TlsPaths;

/// Mandau host agent: wraps one Docker host for the control plane.
#[derive(Parser)]
#[command(name = "mandau-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, env = "MANDAU_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Agent id (loaded from the stack root, or derived, when empty).
    #[arg(long)]
    id: Option<String>,

    /// Listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Control node address.
    #[arg(long)]
    server: Option<String>,

    /// Certificate path.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Key path.
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA certificate path.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Stack root directory.
    #[arg(long)]
    stack_root: Option<PathBuf>,

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

/// Register the built-in plugins named by the configuration's enabled map.
fn build_registry(config: &AgentConfig) -> anyhow::Result<Registry> {
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
            "local-secrets" => {
                let secrets = Arc::new(LocalSecretsPlugin::new());
                registry.register(PluginHandle::new(secrets.clone()).with_secrets(secrets))?;
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

    let mut config = AgentConfig::load_or_default(cli.config.clone())?;

    // Command-line flags override file values.
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(server_addr) = cli.server {
        config.server_connection.core_addr = server_addr;
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
    if let Some(stack_root) = cli.stack_root {
        config.stacks.root_dir = stack_root;
    }
    if let Some(id) = cli.id {
        config.agent.id = id;
    }

    let hostname = if config.agent.hostname.is_empty() {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        config.agent.hostname.clone()
    };

    std::fs::create_dir_all(&config.stacks.root_dir).context("create stack root")?;
    let fs = Arc::new(filesystem::Manager::new(&config.stacks.root_dir));

    // Stable identity: explicit id wins, then the persisted one, then a
    // fresh derivation saved for the next boot.
    let agent_id = if !config.agent.id.is_empty() {
        fs.save_agent_id(&config.agent.id)
            .map_err(|e| anyhow::anyhow!("persist agent id: {e}"))?;
        config.agent.id.clone()
    } else if let Some(saved) = fs.load_agent_id() {
        saved
    } else {
        let derived = format!("agent-{hostname}");
        fs.save_agent_id(&derived)
            .map_err(|e| anyhow::anyhow!("persist agent id: {e}"))?;
        derived
    };

    let docker_socket = (!config.docker.socket.is_empty()).then_some(config.docker.socket.as_str());
    let docker = DockerClient::connect(docker_socket).context("docker client")?;
    docker.ping().await.context("docker ping")?;

    let registry = build_registry(&config)?;
    registry
        .init_all(&config.plugins.configs)
        .await
        .map_err(|e| anyhow::anyhow!("plugin init: {e}"))?;
    let registry = Arc::new(registry);

    let ops = Arc::new(OperationManager::new());
    let stacks = Arc::new(stack::Manager::new(
        &config.stacks.root_dir,
        docker.clone(),
        ops.clone(),
        registry.clone(),
    ));

    let state = AgentState {
        agent_id: agent_id.clone(),
        hostname: hostname.clone(),
        docker,
        ops,
        stacks,
        fs,
        pipeline: Pipeline::new(registry.clone(), agent_id.clone()),
        exec_timeout: Duration::from_secs(config.security.exec_timeout_secs),
    };

    let tls_paths = TlsPaths::new(
        &config.server.tls.cert_path,
        &config.server.tls.key_path,
        &config.server.tls.ca_path,
    );

    let listen_addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("parse listen address {}", config.server.listen_addr))?;

    info!(agent_id = %agent_id, hostname = %hostname,
        stack_root = %config.stacks.root_dir.display(),
        plugins = registry.list_all().len(),
        "starting mandau agent");

    let shutdown = CancellationToken::new();

    // Registration + heartbeat loop against the Control Node.
    let link = CoreLink {
        core_addr: config.server_connection.core_addr.clone(),
        tls_paths: tls_paths.clone(),
        agent_id: agent_id.clone(),
        hostname,
        labels: config.agent.labels.clone(),
        capabilities: vec![
            "docker".to_string(),
            "stack".to_string(),
            "container".to_string(),
            "logs".to_string(),
            "exec".to_string(),
        ],
    };
    let link_shutdown = shutdown.clone();
    tokio::spawn(link.run(link_shutdown));

    // Signal handling for graceful shutdown.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    let serve_shutdown = shutdown.clone();
    server::serve(state, listen_addr, &tls_paths, async move {
        serve_shutdown.cancelled().await;
    })
    .await?;

    if let Err(e) = registry.shutdown_all().await {
        error!(error = %e, "plugin shutdown");
    }
    info!("agent stopped");
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
