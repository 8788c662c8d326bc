// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Stack service proxy.
//!
//! Requests are forwarded to the owning agent over the cached reverse-dial
//! channel with the caller's metadata (and with it the `grpc-timeout`
//! deadline); agent status codes propagate unchanged. Requests that address
//! a stack without naming an agent are resolved from the registry's stack
//! inventory (ambiguity is refused). Server-streams are piped item by item;
//! when the caller goes away the agent-side stream is dropped with it.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status, Streaming};

use mandau_api::v1::stack_service_client::StackServiceClient;
use mandau_api::v1::stack_service_server::StackService;
use mandau_api::v1::{
    ApplyStackRequest, DiffStackRequest, DiffStackResponse, GetStackLogsRequest, GetStackRequest,
    GetStackResponse, ListStacksRequest, ListStacksResponse, LogEntry, OperationEvent,
    RemoveStackRequest,
};
use mandau_plugin::{CallGuard, Resource};
use mandau_transport::MAX_MESSAGE_SIZE;

use super::{registry_status, CoreState};

pub struct StackProxy {
    state: CoreState,
}

impl StackProxy {
    pub fn new(state: CoreState) -> Self {
        Self { state }
    }

    async fn client(&self, agent_id: &str) -> Result<StackServiceClient<Channel>, Status> {
        let channel = self
            .state
            .registry
            .channel(agent_id)
            .await
            .map_err(registry_status)?;
        Ok(StackServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE))
    }

    /// A transport-shaped failure from a forwarded call drops the cached
    /// channel so the next use re-dials; the status itself propagates
    /// unchanged.
    async fn forwarded_err(&self, agent_id: &str, status: Status) -> Status {
        if matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded) {
            self.state.registry.drop_channel(agent_id).await;
        }
        status
    }

    /// The target agent: explicit when the request names one, otherwise
    /// resolved from the stack inventory.
    async fn resolve_agent(&self, agent_id: &str, stack_id: &str) -> Result<String, Status> {
        if !agent_id.is_empty() {
            return Ok(agent_id.to_string());
        }
        self.state
            .registry
            .find_agent_with_stack(stack_id)
            .await
            .map_err(registry_status)
    }
}

/// Rebuild the outbound request carrying the caller's metadata; the
/// `grpc-timeout` deadline rides along in it.
fn with_caller_context<T>(metadata: &MetadataMap, message: T) -> Request<T> {
    let mut outbound = Request::new(message);
    *outbound.metadata_mut() = metadata.clone();
    outbound
}

/// Pipe a server-stream from the agent to the caller until EOF, error, or
/// caller cancellation, then audit with total stream duration.
fn pipe_stream<T: Send + 'static>(
    mut agent_stream: Streaming<T>,
    guard: CallGuard,
) -> ReceiverStream<Result<T, Status>> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut ok = true;
        loop {
            match agent_stream.message().await {
                Ok(Some(item)) => {
                    if tx.send(Ok(item)).await.is_err() {
                        // Caller cancelled; dropping the agent stream tears
                        // down the agent-side call.
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    ok = false;
                    let _ = tx.send(Err(status)).await;
                    break;
                }
            }
        }
        guard.finish(ok).await;
    });
    ReceiverStream::new(rx)
}

#[tonic::async_trait]
impl StackService for StackProxy {
    async fn list_stacks(
        &self,
        request: Request<ListStacksRequest>,
    ) -> Result<Response<ListStacksResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/ListStacks",
                "read",
                Resource::new("stack", ""),
            )
            .await?;

        let this = self;
        let metadata = request.metadata().clone();
        let req = request.into_inner();
        let agent_id = req.agent_id.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let mut client = this.client(&agent_id).await?;
                let response = match client.list_stacks(with_caller_context(&metadata, req)).await {
                    Ok(response) => response.into_inner(),
                    Err(status) => return Err(this.forwarded_err(&agent_id, status).await),
                };

                // Keep the inventory view in lockstep with the response.
                let stack_ids = response.stacks.iter().map(|s| s.id.clone()).collect();
                this.state.registry.update_stacks(&agent_id, stack_ids).await;

                Ok(Response::new(response))
            })
            .await
    }

    async fn get_stack(
        &self,
        request: Request<GetStackRequest>,
    ) -> Result<Response<GetStackResponse>, Status> {
        let stack_id = request.get_ref().stack_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/GetStack",
                "read",
                Resource::new("stack", &stack_id),
            )
            .await?;

        let this = self;
        let metadata = request.metadata().clone();
        let req = request.into_inner();
        self.state
            .pipeline
            .unary(guard, async move {
                let agent_id = this.resolve_agent(&req.agent_id, &req.stack_id).await?;
                let mut client = this.client(&agent_id).await?;
                let response = match client.get_stack(with_caller_context(&metadata, req)).await {
                    Ok(response) => response.into_inner(),
                    Err(status) => return Err(this.forwarded_err(&agent_id, status).await),
                };
                Ok(Response::new(response))
            })
            .await
    }

    type ApplyStackStream = ReceiverStream<Result<OperationEvent, Status>>;

    async fn apply_stack(
        &self,
        request: Request<ApplyStackRequest>,
    ) -> Result<Response<Self::ApplyStackStream>, Status> {
        let stack_name = request.get_ref().stack_name.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/ApplyStack",
                "write",
                Resource::new("stack", &stack_name),
            )
            .await?;

        let metadata = request.metadata().clone();
        let req = request.into_inner();
        if req.agent_id.is_empty() {
            guard.finish(false).await;
            return Err(Status::invalid_argument("agent_id is required"));
        }

        let mut client = match self.client(&req.agent_id).await {
            Ok(client) => client,
            Err(status) => {
                guard.finish(false).await;
                return Err(status);
            }
        };
        let agent_id = req.agent_id.clone();
        let agent_stream = match client.apply_stack(with_caller_context(&metadata, req)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                guard.finish(false).await;
                return Err(self.forwarded_err(&agent_id, status).await);
            }
        };

        Ok(Response::new(pipe_stream(agent_stream, guard)))
    }

    type RemoveStackStream = ReceiverStream<Result<OperationEvent, Status>>;

    async fn remove_stack(
        &self,
        request: Request<RemoveStackRequest>,
    ) -> Result<Response<Self::RemoveStackStream>, Status> {
        let stack_id = request.get_ref().stack_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/RemoveStack",
                "delete",
                Resource::new("stack", &stack_id),
            )
            .await?;

        let metadata = request.metadata().clone();
        let mut req = request.into_inner();
        let agent_id = match self.resolve_agent(&req.agent_id, &req.stack_id).await {
            Ok(agent_id) => agent_id,
            Err(status) => {
                guard.finish(false).await;
                return Err(status);
            }
        };
        req.agent_id = agent_id.clone();

        let mut client = match self.client(&agent_id).await {
            Ok(client) => client,
            Err(status) => {
                guard.finish(false).await;
                return Err(status);
            }
        };
        let agent_stream = match client.remove_stack(with_caller_context(&metadata, req)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                guard.finish(false).await;
                return Err(self.forwarded_err(&agent_id, status).await);
            }
        };

        Ok(Response::new(pipe_stream(agent_stream, guard)))
    }

    async fn diff_stack(
        &self,
        request: Request<DiffStackRequest>,
    ) -> Result<Response<DiffStackResponse>, Status> {
        let stack_name = request.get_ref().stack_name.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/DiffStack",
                "read",
                Resource::new("stack", &stack_name),
            )
            .await?;

        let this = self;
        let metadata = request.metadata().clone();
        let req = request.into_inner();
        self.state
            .pipeline
            .unary(guard, async move {
                let agent_id = this.resolve_agent(&req.agent_id, &req.stack_name).await?;
                let mut client = this.client(&agent_id).await?;
                let response = match client.diff_stack(with_caller_context(&metadata, req)).await {
                    Ok(response) => response.into_inner(),
                    Err(status) => return Err(this.forwarded_err(&agent_id, status).await),
                };
                Ok(Response::new(response))
            })
            .await
    }

    type GetStackLogsStream = ReceiverStream<Result<LogEntry, Status>>;

    async fn get_stack_logs(
        &self,
        request: Request<GetStackLogsRequest>,
    ) -> Result<Response<Self::GetStackLogsStream>, Status> {
        let stack_name = request.get_ref().stack_name.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/GetStackLogs",
                "logs",
                Resource::new("stack", &stack_name),
            )
            .await?;

        let metadata = request.metadata().clone();
        let req = request.into_inner();
        let agent_id = match self.resolve_agent(&req.agent_id, &req.stack_name).await {
            Ok(agent_id) => agent_id,
            Err(status) => {
                guard.finish(false).await;
                return Err(status);
            }
        };

        let mut client = match self.client(&agent_id).await {
            Ok(client) => client,
            Err(status) => {
                guard.finish(false).await;
                return Err(status);
            }
        };
        let agent_stream = match client.get_stack_logs(with_caller_context(&metadata, req)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                guard.finish(false).await;
                return Err(self.forwarded_err(&agent_id, status).await);
            }
        };

        Ok(Response::new(pipe_stream(agent_stream, guard)))
    }
}
