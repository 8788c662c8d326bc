// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Operation query, cancellation, and event streaming.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use mandau_api::v1::operations_service_server::OperationsService;
use mandau_api::v1::{
    CancelOperationRequest, CancelOperationResponse, GetOperationRequest, GetOperationResponse,
    ListOperationsRequest, ListOperationsResponse, OperationEvent, StreamOperationRequest,
};
use mandau_plugin::Resource;

use super::{convert, AgentState};
use crate::operation::OperationError;

pub struct OperationsApi {
    state: AgentState,
}

impl OperationsApi {
    pub fn new(state: AgentState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl OperationsService for OperationsApi {
    async fn get_operation(
        &self,
        request: Request<GetOperationRequest>,
    ) -> Result<Response<GetOperationResponse>, Status> {
        let op_id = request.get_ref().operation_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.OperationsService/GetOperation",
                "read",
                Resource::new("operation", &op_id),
            )
            .await?;

        let ops = self.state.ops.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let op = ops
                    .get(&op_id)
                    .ok_or_else(|| Status::not_found(format!("operation not found: {op_id}")))?;
                Ok(Response::new(GetOperationResponse {
                    operation: Some(convert::operation(&op)),
                }))
            })
            .await
    }

    async fn list_operations(
        &self,
        request: Request<ListOperationsRequest>,
    ) -> Result<Response<ListOperationsResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.OperationsService/ListOperations",
                "read",
                Resource::new("operation", ""),
            )
            .await?;

        let ops = self.state.ops.clone();
        let req = request.into_inner();
        self.state
            .pipeline
            .unary(guard, async move {
                let state_filter = req
                    .filter_state
                    .then(|| convert::operation_state_from_proto(req.state()));
                let type_filter = req.r#type;

                let mut operations = ops.list(|op| {
                    (type_filter.is_empty() || op.op_type.as_str() == type_filter)
                        && state_filter.map_or(true, |s| op.state == s)
                });
                operations.sort_by(|a, b| a.created_at.cmp(&b.created_at));

                Ok(Response::new(ListOperationsResponse {
                    operations: operations.iter().map(convert::operation).collect(),
                }))
            })
            .await
    }

    async fn cancel_operation(
        &self,
        request: Request<CancelOperationRequest>,
    ) -> Result<Response<CancelOperationResponse>, Status> {
        let op_id = request.get_ref().operation_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.OperationsService/CancelOperation",
                "write",
                Resource::new("operation", &op_id),
            )
            .await?;

        let ops = self.state.ops.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                match ops.cancel(&op_id) {
                    Ok(()) => Ok(Response::new(CancelOperationResponse { cancelled: true })),
                    Err(OperationError::NotFound(id)) => {
                        Err(Status::not_found(format!("operation not found: {id}")))
                    }
                    Err(OperationError::AlreadyFinished(id)) => Err(Status::failed_precondition(
                        format!("operation already finished: {id}"),
                    )),
                }
            })
            .await
    }

    type StreamOperationStream = ReceiverStream<Result<OperationEvent, Status>>;

    async fn stream_operation(
        &self,
        request: Request<StreamOperationRequest>,
    ) -> Result<Response<Self::StreamOperationStream>, Status> {
        let op_id = request.get_ref().operation_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.OperationsService/StreamOperation",
                "read",
                Resource::new("operation", &op_id),
            )
            .await?;

        let Some(op) = self.state.ops.get(&op_id) else {
            guard.finish(false).await;
            return Err(Status::not_found(format!("operation not found: {op_id}")));
        };

        // Subscribe first, then emit the current snapshot, so nothing
        // between snapshot and subscription can be missed.
        let mut events = self.state.ops.subscribe(&op_id);
        let snapshot = crate::operation::Event {
            operation_id: op.id.clone(),
            state: op.state,
            timestamp: chrono::Utc::now(),
            message: String::new(),
            progress: op.progress,
            error: op.error.clone(),
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let terminal_already = snapshot.state.is_terminal();
            let _ = tx.send(Ok(convert::operation_event(&snapshot))).await;
            if !terminal_already {
                while let Some(event) = events.recv().await {
                    let terminal = event.state.is_terminal();
                    if tx.send(Ok(convert::operation_event(&event))).await.is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            }
            guard.finish(true).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
