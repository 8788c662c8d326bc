// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Control Node link: registration and the heartbeat loop.
//!
//! Heartbeat failures are handled locally. On a transport-shaped error the
//! agent tears its channel down, re-dials under exponential backoff (base
//! 1 s, multiplier 1.6, jitter 0.2, max 10 s), and re-registers; the Control
//! Node accepts the re-registration and flips the agent back to online.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{info, warn};

use mandau_api::from_proto_duration;
use mandau_api::v1::core_service_client::CoreServiceClient;
use mandau_api::v1::{HeartbeatRequest, RegisterRequest};
use mandau_transport::{client_tls_config, endpoint, Backoff, TlsPaths, CORE_SERVER_NAME};

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct CoreLink {
    pub core_addr: String,
    pub tls_paths: TlsPaths,
    pub agent_id: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<String>,
}

impl CoreLink {
    async fn dial(&self) -> anyhow::Result<Channel> {
        let tls = client_tls_config(&self.tls_paths, CORE_SERVER_NAME)?;
        let channel = endpoint(self.core_addr.clone(), tls)?.connect().await?;
        Ok(channel)
    }

    /// Register with the Control Node; returns the heartbeat interval it
    /// asked for.
    async fn register(&self, channel: Channel) -> Result<Duration, Status> {
        let mut client = CoreServiceClient::new(channel);
        let request = RegisterRequest {
            hostname: self.hostname.clone(),
            agent_id: self.agent_id.clone(),
            labels: self.labels.clone(),
            capabilities: self.capabilities.clone(),
        };

        let response = timeout(REGISTER_DEADLINE, client.register_agent(request))
            .await
            .map_err(|_| Status::deadline_exceeded("register timed out"))??
            .into_inner();

        info!(agent_id = %response.agent_id, "registered with control node");
        Ok(response
            .heartbeat_interval
            .as_ref()
            .map(from_proto_duration)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL))
    }

    async fn heartbeat(&self, channel: Channel) -> Result<(), Status> {
        let mut client = CoreServiceClient::new(channel);
        let request = HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            status: HashMap::from([("status".to_string(), "healthy".to_string())]),
        };
        timeout(HEARTBEAT_DEADLINE, client.heartbeat(request))
            .await
            .map_err(|_| Status::deadline_exceeded("heartbeat timed out"))??;
        Ok(())
    }

    /// Run registration plus the heartbeat loop until shutdown. Failed dial
    /// and registration attempts are paced by the shared backoff schedule,
    /// reset once a registration lands.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut channel: Option<Channel> = None;
        let mut period = DEFAULT_HEARTBEAT_INTERVAL;
        let mut backoff = Backoff::new();

        loop {
            // (Re-)establish the link and register.
            if channel.is_none() {
                match self.dial().await {
                    Ok(fresh) => match self.register(fresh.clone()).await {
                        Ok(interval) => {
                            period = interval;
                            channel = Some(fresh);
                            backoff.reset();
                        }
                        Err(e) => {
                            warn!(error = %e, "registration failed, will retry");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "dial control node failed, will retry");
                    }
                }
                if channel.is_none() {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        () = shutdown.cancelled() => return,
                    }
                }
            }

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(ch) = channel.clone() else { break };
                        if let Err(e) = self.heartbeat(ch).await {
                            warn!(error = %e, "heartbeat failed");
                            if should_reconnect(&e) {
                                info!("reconnecting to control node");
                                channel = None;
                                break;
                            }
                        }
                    }
                    () = shutdown.cancelled() => {
                        info!("heartbeat loop stopped");
                        return;
                    }
                }
            }
        }
    }
}

/// Transport-shaped failures warrant a teardown and re-dial; anything else
/// (e.g. `NotFound` from a restarted Control Node that lost our record) is
/// cured by re-registering over a fresh channel too.
fn should_reconnect(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::NotFound
    ) || {
        let message = status.message();
        message.contains("connection refused")
            || message.contains("connection reset")
            || message.contains("broken pipe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_trigger_reconnect() {
        assert!(should_reconnect(&Status::unavailable("gone")));
        assert!(should_reconnect(&Status::deadline_exceeded("slow")));
        assert!(should_reconnect(&Status::internal("connection reset by peer")));
        assert!(should_reconnect(&Status::not_found("agent not found: x")));
        assert!(!should_reconnect(&Status::permission_denied("no")));
    }
}
