// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Control Node RPC surface: the registry endpoints plus the stack proxy.

pub mod core_service;
pub mod stack_proxy;

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tonic::Status;
use tracing::info;

use mandau_api::v1::core_service_server::CoreServiceServer;
use mandau_api::v1::stack_service_server::StackServiceServer;
use mandau_plugin::Pipeline;
use mandau_transport::{server_tls_config, TlsPaths, MAX_MESSAGE_SIZE};

use crate::registry::{AgentRegistry, RegistryError};

/// Shared state behind the Control Node services.
#[derive(Clone)]
pub struct CoreState {
    pub registry: Arc<AgentRegistry>,
    pub pipeline: Pipeline,
}

/// Map registry errors onto the RPC status taxonomy.
pub fn registry_status(err: RegistryError) -> Status {
    match err {
        RegistryError::AgentNotFound(id) => Status::not_found(format!("agent not found: {id}")),
        RegistryError::AgentOffline(id) => Status::unavailable(format!("agent offline: {id}")),
        RegistryError::StackNotFound(id) => {
            Status::not_found(format!("stack not found on any agent: {id}"))
        }
        RegistryError::StackAmbiguous(id) => {
            Status::failed_precondition(format!("stack {id} present on multiple agents"))
        }
        RegistryError::Dial { agent_id, message } => {
            Status::unavailable(format!("dial agent {agent_id}: {message}"))
        }
    }
}

/// Serve the Control Node surface until `shutdown` resolves.
pub async fn serve(
    state: CoreState,
    listen_addr: SocketAddr,
    tls_paths: &TlsPaths,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let tls = server_tls_config(tls_paths)?;

    info!(addr = %listen_addr, "control node listening");

    Server::builder()
        .tls_config(tls)?
        .add_service(
            CoreServiceServer::new(core_service::CoreApi::new(state.clone()))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .add_service(
            StackServiceServer::new(stack_proxy::StackProxy::new(state))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(listen_addr, shutdown)
        .await?;

    Ok(())
}
