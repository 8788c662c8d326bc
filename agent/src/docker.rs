// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Thin typed wrapper over the Docker daemon.
//!
//! Owns the bollard client shared across the agent: container inventory for
//! stacks (by compose project label), image pulls, log streaming, and exec.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{ListContainersOptions, LogOutput, LogsOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker connect: {0}")]
    Connect(String),

    #[error("docker: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),
}

/// The join between a compose service and a Docker container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Short (12 character) container id.
    pub id: String,
    pub name: String,
    pub service: String,
    pub state: String,
    pub status: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// One chunk of container output (logs or exec).
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect to the daemon, honoring an explicit socket path when
    /// configured and falling back to the environment defaults.
    pub fn connect(socket: Option<&str>) -> Result<Self, DockerError> {
        let docker = match socket {
            Some(path) if !path.is_empty() => {
                Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| DockerError::Connect(format!("{path}: {e}")))?
            }
            _ => Docker::connect_with_local_defaults()
                .map_err(|e| DockerError::Connect(e.to_string()))?,
        };
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// All containers (including stopped) belonging to a compose project.
    pub async fn stack_containers(
        &self,
        stack_name: &str,
    ) -> Result<Vec<ContainerInfo>, DockerError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{COMPOSE_PROJECT_LABEL}={stack_name}")],
        )]);
        self.list(Some(filters), true).await
    }

    /// All containers on the host.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>, DockerError> {
        self.list(None, all).await
    }

    async fn list(
        &self,
        filters: Option<HashMap<String, Vec<String>>>,
        all: bool,
    ) -> Result<Vec<ContainerInfo>, DockerError> {
        let options = ListContainersOptions::<String> {
            all,
            filters: filters.unwrap_or_default(),
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;
        let containers = summaries
            .into_iter()
            .map(|c| {
                let labels = c.labels.unwrap_or_default();
                let id = c.id.unwrap_or_default();
                ContainerInfo {
                    id: id.chars().take(12).collect(),
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    service: labels
                        .get(COMPOSE_SERVICE_LABEL)
                        .cloned()
                        .unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    labels,
                }
            })
            .collect();
        Ok(containers)
    }

    /// Pull an image, draining the progress stream. Progress granularity is
    /// the image boundary; byte-level status lines are discarded.
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        debug!(image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    /// Stream a container's logs into a channel as tagged chunks.
    pub fn stream_logs(
        &self,
        container_id: String,
        follow: bool,
        tail: i32,
        tx: mpsc::Sender<(String, OutputChunk)>,
    ) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                tail: if tail > 0 {
                    tail.to_string()
                } else {
                    "all".to_string()
                },
                ..Default::default()
            };

            let mut stream = docker.logs(&container_id, Some(options));
            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) => OutputChunk::Stdout(message.to_vec()),
                    Ok(LogOutput::Console { message }) => OutputChunk::Stdout(message.to_vec()),
                    Ok(LogOutput::StdErr { message }) => OutputChunk::Stderr(message.to_vec()),
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        warn!(container = %container_id, error = %e, "log stream ended");
                        break;
                    }
                };
                if tx.send((container_id.clone(), chunk)).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Run a command in a container, streaming output chunks and returning
    /// the exit code. Bounded by the wall-clock limit and abortable by
    /// token; both abort paths leave the exec to die with the connection.
    pub async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        limit: Duration,
        cancel: CancellationToken,
        tx: mpsc::Sender<OutputChunk>,
    ) -> Result<i32, DockerError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } = started {
            let deadline = tokio::time::sleep(limit);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    item = output.next() => {
                        match item {
                            Some(Ok(LogOutput::StdOut { message }))
                            | Some(Ok(LogOutput::Console { message })) => {
                                let _ = tx.send(OutputChunk::Stdout(message.to_vec())).await;
                            }
                            Some(Ok(LogOutput::StdErr { message })) => {
                                let _ = tx.send(OutputChunk::Stderr(message.to_vec())).await;
                            }
                            Some(Ok(LogOutput::StdIn { .. })) => {}
                            Some(Err(e)) => return Err(DockerError::Api(e)),
                            None => break,
                        }
                    }
                    () = &mut deadline => return Err(DockerError::ExecTimeout(limit)),
                    () = cancel.cancelled() => break,
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(0) as i32)
    }
}
