// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Agent identity and health endpoints.

use std::collections::HashMap;
use std::time::Duration;

use tonic::{Request, Response, Status};

use mandau_api::to_proto_duration;
use mandau_api::v1::agent_service_server::AgentService;
use mandau_api::v1::{
    CapabilitiesRequest, CapabilitiesResponse, HealthRequest, HealthResponse, HeartbeatRequest,
    HeartbeatResponse, RegisterRequest, RegisterResponse,
};
use mandau_plugin::Resource;

use super::AgentState;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct AgentApi {
    state: AgentState,
}

impl AgentApi {
    pub fn new(state: AgentState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl AgentService for AgentApi {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.AgentService/Register",
                "read",
                Resource::new("agent", &self.state.agent_id),
            )
            .await?;

        let agent_id = self.state.agent_id.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                Ok(Response::new(RegisterResponse {
                    agent_id,
                    heartbeat_interval: Some(to_proto_duration(HEARTBEAT_INTERVAL)),
                }))
            })
            .await
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.AgentService/Heartbeat",
                "read",
                Resource::new("agent", &self.state.agent_id),
            )
            .await?;

        self.state
            .pipeline
            .unary(guard, async move {
                Ok(Response::new(HeartbeatResponse {
                    status: "healthy".to_string(),
                }))
            })
            .await
    }

    async fn get_capabilities(
        &self,
        request: Request<CapabilitiesRequest>,
    ) -> Result<Response<CapabilitiesResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.AgentService/GetCapabilities",
                "read",
                Resource::new("agent", &self.state.agent_id),
            )
            .await?;

        self.state
            .pipeline
            .unary(guard, async move {
                Ok(Response::new(CapabilitiesResponse {
                    capabilities: vec![
                        "stack.apply".to_string(),
                        "stack.remove".to_string(),
                        "container.exec".to_string(),
                        "logs.stream".to_string(),
                        "files.manage".to_string(),
                    ],
                }))
            })
            .await
    }

    async fn get_health(
        &self,
        request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let guard = self
            .state
            .pipeline
            .begin(
                &request,
                "/mandau.v1.AgentService/GetHealth",
                "read",
                Resource::new("agent", &self.state.agent_id),
            )
            .await?;

        let docker = self.state.docker.clone();
        self.state
            .pipeline
            .unary(guard, async move {
                let docker_health = match docker.ping().await {
                    Ok(()) => "healthy",
                    Err(_) => "unhealthy",
                };
                Ok(Response::new(HealthResponse {
                    healthy: docker_health == "healthy",
                    status: HashMap::from([("docker".to_string(), docker_health.to_string())]),
                }))
            })
            .await
    }
}
