// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Container inventory and exec.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tokio_util::sync::CancellationToken;

use mandau_api::from_proto_duration;
use mandau_api::v1::container_service_server::ContainerService;
use mandau_api::v1::{
    ExecContainerRequest, ExecOutput, ListContainersRequest, ListContainersResponse,
};
use mandau_plugin::Resource;

use super::{convert, AgentState};
use crate::docker::{DockerError, OutputChunk};

pub struct ContainerApi {
    state: AgentState,
}

impl ContainerApi {
    pub fn new(state: AgentState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl ContainerService for ContainerApi {
    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.ContainerService/ListContainers",
                "read",
                Resource::new("container", ""),
            )
            .await?;

        let state = self.state.clone();
        let all = request.get_ref().all;
        self.state
            .pipeline
            .unary(guard, async move {
                let containers = state
                    .docker
                    .list_containers(all)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(Response::new(ListContainersResponse {
                    containers: containers.iter().map(convert::container).collect(),
                }))
            })
            .await
    }

    type ExecContainerStream = ReceiverStream<Result<ExecOutput, Status>>;

    async fn exec_container(
        &self,
        request: Request<ExecContainerRequest>,
    ) -> Result<Response<Self::ExecContainerStream>, Status> {
        let container_id = request.get_ref().container_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.ContainerService/ExecContainer",
                "exec",
                Resource::new("container", &container_id),
            )
            .await?;

        let req = request.into_inner();
        if req.command.is_empty() {
            guard.finish(false).await;
            return Err(Status::invalid_argument("command must not be empty"));
        }

        // The configured wall-clock limit caps whatever the caller asks for.
        let limit = req
            .timeout
            .as_ref()
            .map(from_proto_duration)
            .filter(|d| !d.is_zero())
            .unwrap_or(self.state.exec_timeout)
            .min(self.state.exec_timeout);

        let docker = self.state.docker.clone();
        let cancel = CancellationToken::new();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(256);
        let (tx, rx) = mpsc::channel(256);

        let exec_handle = tokio::spawn(async move {
            docker
                .exec(&req.container_id, req.command, limit, cancel, chunk_tx)
                .await
        });

        tokio::spawn(async move {
            let mut ok = true;
            while let Some(chunk) = chunk_rx.recv().await {
                let output = match chunk {
                    OutputChunk::Stdout(bytes) => ExecOutput {
                        stream: "stdout".to_string(),
                        content: bytes,
                        finished: false,
                        exit_code: 0,
                    },
                    OutputChunk::Stderr(bytes) => ExecOutput {
                        stream: "stderr".to_string(),
                        content: bytes,
                        finished: false,
                        exit_code: 0,
                    },
                };
                if tx.send(Ok(output)).await.is_err() {
                    break;
                }
            }

            match exec_handle.await {
                Ok(Ok(exit_code)) => {
                    let _ = tx
                        .send(Ok(ExecOutput {
                            stream: String::new(),
                            content: Vec::new(),
                            finished: true,
                            exit_code,
                        }))
                        .await;
                }
                Ok(Err(DockerError::ExecTimeout(limit))) => {
                    ok = false;
                    let _ = tx
                        .send(Err(Status::deadline_exceeded(format!(
                            "exec timed out after {limit:?}"
                        ))))
                        .await;
                }
                Ok(Err(e)) => {
                    ok = false;
                    let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                }
                Err(join_err) => {
                    ok = false;
                    let _ = tx
                        .send(Err(Status::internal(format!("exec task: {join_err}"))))
                        .await;
                }
            }
            guard.finish(ok).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
