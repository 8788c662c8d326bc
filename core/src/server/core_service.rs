// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Registry endpoints: registration, listing, heartbeat.

use tonic::{Request, Response, Status};

use mandau_api::v1::core_service_server::CoreService;
use mandau_api::v1::{
    Agent, HeartbeatRequest, HeartbeatResponse, ListAgentsRequest, ListAgentsResponse,
    RegisterRequest, RegisterResponse,
};
use mandau_api::{to_proto_duration, to_proto_timestamp};
use mandau_plugin::Resource;

use super::{registry_status, CoreState};

pub struct CoreApi {
    state: CoreState,
}

impl CoreApi {
    pub fn new(state: CoreState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl CoreService for CoreApi {
    async fn register_agent(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req_ref = request.get_ref();
        let resource_id = if req_ref.agent_id.is_empty() {
            req_ref.hostname.clone()
        } else {
            req_ref.agent_id.clone()
        };
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.CoreService/RegisterAgent",
                "write",
                Resource::new("agent", &resource_id),
            )
            .await?;

        let state = self.state.clone();
        let req = request.into_inner();
        self.state
            .pipeline
            .unary(guard, async move {
                let agent_id = state
                    .registry
                    .register(&req.hostname, &req.agent_id, req.labels, req.capabilities)
                    .await;
                Ok(Response::new(RegisterResponse {
                    agent_id,
                    heartbeat_interval: Some(to_proto_duration(
                        state.registry.heartbeat_interval,
                    )),
                }))
            })
            .await
    }

    async fn list_agents(
        &self,
        request: Request<ListAgentsRequest>,
    ) -> Result<Response<ListAgentsResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.CoreService/ListAgents",
                "read",
                Resource::new("agent", ""),
            )
            .await?;

        let state = self.state.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let agents = state
                    .registry
                    .list()
                    .await
                    .into_iter()
                    .map(|a| Agent {
                        id: a.id,
                        hostname: a.hostname,
                        status: a.status.as_str().to_string(),
                        labels: a.labels,
                        capabilities: a.capabilities,
                        last_seen: Some(to_proto_timestamp(a.last_seen)),
                    })
                    .collect();
                Ok(Response::new(ListAgentsResponse { agents }))
            })
            .await
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let agent_id = request.get_ref().agent_id.clone();
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.CoreService/Heartbeat",
                "write",
                Resource::new("agent", &agent_id),
            )
            .await?;

        let state = self.state.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                state
                    .registry
                    .heartbeat(&agent_id)
                    .await
                    .map_err(registry_status)?;
                Ok(Response::new(HeartbeatResponse {
                    status: "healthy".to_string(),
                }))
            })
            .await
    }
}
