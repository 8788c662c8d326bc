// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Agent-side RPC surface.
//!
//! One mTLS listener hosts all five services; every handler runs the shared
//! interceptor pipeline with the resource it derived from its request.

pub mod agent_service;
pub mod container_service;
pub mod convert;
pub mod filesystem_service;
pub mod operations_service;
pub mod stack_service;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tonic::Status;
use tracing::info;

use mandau_api::v1::agent_service_server::AgentServiceServer;
use mandau_api::v1::container_service_server::ContainerServiceServer;
use mandau_api::v1::filesystem_service_server::FilesystemServiceServer;
use mandau_api::v1::operations_service_server::OperationsServiceServer;
use mandau_api::v1::stack_service_server::StackServiceServer;
use mandau_plugin::interface::PluginError;
use mandau_plugin::Pipeline;
use mandau_transport::{server_tls_config, TlsPaths, MAX_MESSAGE_SIZE};

use crate::docker::DockerClient;
use crate::filesystem;
use crate::operation::Manager as OperationManager;
use crate::stack::{self, StackError};

/// Shared state behind every agent-side service.
#[derive(Clone)]
pub struct AgentState {
    pub agent_id: String,
    pub hostname: String,
    pub docker: DockerClient,
    pub ops: Arc<OperationManager>,
    pub stacks: Arc<stack::Manager>,
    pub fs: Arc<filesystem::Manager>,
    pub pipeline: Pipeline,
    pub exec_timeout: Duration,
}

/// Map stack engine errors onto the RPC status taxonomy.
pub fn stack_status(err: StackError) -> Status {
    match err {
        StackError::NotFound(msg) => Status::not_found(msg),
        StackError::Busy(name) => {
            Status::failed_precondition(format!("stack {name} has an operation in flight"))
        }
        StackError::InvalidName(name) => Status::invalid_argument(format!("stack name: {name}")),
        StackError::Compose(e) => Status::invalid_argument(e.to_string()),
        StackError::Secrets(PluginError::SecretNotFound(key)) => {
            Status::not_found(format!("secret not found: {key}"))
        }
        StackError::Secrets(e) => Status::internal(e.to_string()),
        StackError::Docker(e) => Status::internal(e.to_string()),
        StackError::Io { context, source } => Status::internal(format!("{context}: {source}")),
    }
}

/// Map filesystem errors onto the RPC status taxonomy. Escapes are bad
/// requests, not internal faults.
pub fn fs_status(err: filesystem::FsError) -> Status {
    match err {
        filesystem::FsError::OutsideRoot(p) => {
            Status::invalid_argument(format!("path escapes the stack root: {p}"))
        }
        filesystem::FsError::InvalidPath(p) => Status::invalid_argument(format!("invalid path: {p}")),
        filesystem::FsError::NotFound(p) => Status::not_found(p),
        filesystem::FsError::Io { context, source } => {
            Status::internal(format!("{context}: {source}"))
        }
    }
}

/// Serve the agent RPC surface until `shutdown` resolves.
pub async fn serve(
    state: AgentState,
    listen_addr: SocketAddr,
    tls_paths: &TlsPaths,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let tls = server_tls_config(tls_paths)?;

    info!(agent_id = %state.agent_id, addr = %listen_addr, "agent listening");

    Server::builder()
        .tls_config(tls)?
        .add_service(
            AgentServiceServer::new(agent_service::AgentApi::new(state.clone()))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .add_service(
            StackServiceServer::new(stack_service::StackApi::new(state.clone()))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .add_service(
            ContainerServiceServer::new(container_service::ContainerApi::new(state.clone()))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .add_service(
            FilesystemServiceServer::new(filesystem_service::FilesystemApi::new(state.clone()))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .add_service(
            OperationsServiceServer::new(operations_service::OperationsApi::new(state))
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(listen_addr, shutdown)
        .await?;

    Ok(())
}
