// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Stack service: inventory, apply/remove streaming, diff, logs.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use mandau_api::v1::stack_service_server::StackService;
use mandau_api::v1::{
    ApplyStackRequest, DiffStackRequest, DiffStackResponse, GetStackLogsRequest, GetStackRequest,
    GetStackResponse, ListStacksRequest, ListStacksResponse, LogEntry, OperationEvent,
    RemoveStackRequest,
};
use mandau_api::to_proto_timestamp;
use mandau_plugin::Resource;

use super::{convert, stack_status, AgentState};
use crate::docker::OutputChunk;
use crate::operation::Event;
use crate::stack::ApplyRequest;

pub struct StackApi {
    state: AgentState,
}

impl StackApi {
    pub fn new(state: AgentState) -> Self {
        Self { state }
    }
}

/// Forward operation events to the response channel until the terminal
/// event has been sent, then audit the stream with its full duration.
async fn forward_events(
    mut events: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Result<OperationEvent, Status>>,
    guard: mandau_plugin::CallGuard,
) {
    let mut ok = true;
    while let Some(event) = events.recv().await {
        let terminal = event.state.is_terminal();
        if event.error.is_some() {
            ok = false;
        }
        if tx.send(Ok(convert::operation_event(&event))).await.is_err() {
            // Caller went away; the operation itself carries on.
            break;
        }
        if terminal {
            break;
        }
    }
    guard.finish(ok).await;
}

#[tonic::async_trait]
impl StackService for StackApi {
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

        let state = self.state.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let stacks = state.stacks.list_stacks().await.map_err(stack_status)?;
                Ok(Response::new(ListStacksResponse {
                    stacks: stacks.iter().map(convert::stack).collect(),
                }))
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

        let state = self.state.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let stack = state.stacks.get_stack(&stack_id).await.map_err(stack_status)?;
                Ok(Response::new(GetStackResponse {
                    stack: Some(convert::stack(&stack)),
                }))
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

        let req = request.into_inner();
        let apply = ApplyRequest {
            stack_name: req.stack_name,
            compose_content: req.compose_content,
            env_vars: req.env_vars,
            force_recreate: req.force_recreate,
            services: req.services,
            pull_images: req.pull_images,
        };

        let (op_id, job) = match self.state.stacks.apply_stack(apply).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let status = stack_status(e);
                guard.finish(false).await;
                return Err(status);
            }
        };
        debug!(stack = %stack_name, op = %op_id, "apply accepted");

        // Subscribe before the job runs so the stream observes every event.
        let events = self.state.ops.subscribe(&op_id);
        tokio::spawn(job.run());

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(forward_events(events, tx, guard));
        Ok(Response::new(ReceiverStream::new(rx)))
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

        let remove_volumes = request.get_ref().remove_volumes;
        let (op_id, job) = match self.state.stacks.remove_stack(&stack_id, remove_volumes) {
            Ok(prepared) => prepared,
            Err(e) => {
                let status = stack_status(e);
                guard.finish(false).await;
                return Err(status);
            }
        };
        debug!(stack = %stack_id, op = %op_id, "remove accepted");

        let events = self.state.ops.subscribe(&op_id);
        tokio::spawn(job.run());

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(forward_events(events, tx, guard));
        Ok(Response::new(ReceiverStream::new(rx)))
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

        let state = self.state.clone();
        let new_content = request.into_inner().new_compose_content;
        self.state
            .pipeline
            .unary(guard, async move {
                let diff = state
                    .stacks
                    .diff_stack(&stack_name, &new_content)
                    .await
                    .map_err(stack_status)?;
                Ok(Response::new(convert::diff_result(&diff)))
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

        let req = request.into_inner();
        let stack = match self.state.stacks.get_stack(&stack_name).await {
            Ok(stack) => stack,
            Err(e) => {
                let status = stack_status(e);
                guard.finish(false).await;
                return Err(status);
            }
        };

        // One producer per container, demultiplexed into a single stream and
        // tagged with the owning service.
        let services: HashMap<String, String> = stack
            .containers
            .iter()
            .map(|c| (c.id.clone(), c.service.clone()))
            .collect();

        let (chunk_tx, mut chunk_rx) = mpsc::channel(256);
        for container in &stack.containers {
            self.state
                .docker
                .stream_logs(container.id.clone(), req.follow, req.tail, chunk_tx.clone());
        }
        drop(chunk_tx);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some((container_id, chunk)) = chunk_rx.recv().await {
                let (stream, content) = match chunk {
                    OutputChunk::Stdout(bytes) => ("stdout", bytes),
                    OutputChunk::Stderr(bytes) => ("stderr", bytes),
                };
                let entry = LogEntry {
                    timestamp: Some(to_proto_timestamp(chrono::Utc::now())),
                    stream: stream.to_string(),
                    content,
                    container_id: container_id.clone(),
                    service_name: services.get(&container_id).cloned().unwrap_or_default(),
                };
                if tx.send(Ok(entry)).await.is_err() {
                    break;
                }
            }
            guard.finish(true).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
