// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Stack lifecycle engine.
//!
//! Owns the on-disk layout under `stack_root/<name>/`: each stack directory
//! holds `compose.yaml` (or `docker-compose.yaml`) and an optional `.env`
//! mirroring the supplied environment. Mutating operations return an
//! operation id synchronously and run on their own task under the operation
//! manager; reads derive state from the live container inventory every time.
//!
//! One mutating operation per stack is in flight at any instant; the second
//! concurrent writer is rejected. Distinct stacks proceed in parallel.

pub mod compose;
pub mod diff;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use mandau_plugin::interface::PluginError;
use mandau_plugin::Registry;

use crate::docker::{ContainerInfo, DockerClient, DockerError};
use crate::operation::{Manager as OperationManager, OperationType};

pub use compose::{ComposeError, Project};
pub use diff::{DiffAction, DiffResult, ServiceDiff};

const COMPOSE_FILE: &str = "compose.yaml";
const LEGACY_COMPOSE_FILE: &str = "docker-compose.yaml";

#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack not found: {0}")]
    NotFound(String),

    #[error("invalid stack name: {0}")]
    InvalidName(String),

    #[error("stack {0} has an operation in flight")]
    Busy(String),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("secret injection: {0}")]
    Secrets(#[from] PluginError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StackError {
    let context = context.into();
    move |source| StackError::Io { context, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Unknown,
    Running,
    Stopped,
    Error,
    Partial,
}

/// A stack as observed right now: parsed project plus live containers.
#[derive(Debug, Clone)]
pub struct Stack {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub project: Project,
    pub state: StackState,
    pub containers: Vec<ContainerInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// Input to an apply.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub stack_name: String,
    pub compose_content: String,
    pub env_vars: HashMap<String, String>,
    pub force_recreate: bool,
    pub services: Vec<String>,
    pub pull_images: bool,
}

pub struct Manager {
    stack_root: PathBuf,
    docker: DockerClient,
    op_mgr: Arc<OperationManager>,
    plugins: Arc<Registry>,
    busy: Arc<Mutex<HashSet<String>>>,
}

/// Releases the per-stack write lock when the owning operation finishes,
/// whichever path it takes.
#[derive(Debug)]
struct StackLock {
    busy: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for StackLock {
    fn drop(&mut self) {
        self.busy.lock().expect("busy set poisoned").remove(&self.name);
    }
}

/// A prepared apply: the handler subscribes to the operation before calling
/// [`ApplyJob::run`], so no event can be missed.
#[derive(Debug)]
pub struct ApplyJob {
    manager: ManagerHandle,
    op_id: String,
    request: ApplyRequest,
    resolved_env: HashMap<String, String>,
    _lock: StackLock,
}

/// A prepared remove, same contract as [`ApplyJob`].
#[derive(Debug)]
pub struct RemoveJob {
    manager: ManagerHandle,
    op_id: String,
    stack_name: String,
    remove_volumes: bool,
    _lock: StackLock,
}

/// The subset of manager state the background jobs need.
#[derive(Clone, Debug)]
struct ManagerHandle {
    stack_root: PathBuf,
    docker: DockerClient,
    op_mgr: Arc<OperationManager>,
}

impl Manager {
    pub fn new(
        stack_root: impl Into<PathBuf>,
        docker: DockerClient,
        op_mgr: Arc<OperationManager>,
        plugins: Arc<Registry>,
    ) -> Self {
        Self {
            stack_root: stack_root.into(),
            docker,
            op_mgr,
            plugins,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn stack_root(&self) -> &Path {
        &self.stack_root
    }

    /// Enumerate stacks under the root. Entries that fail to load are
    /// logged and skipped, never surfaced.
    pub async fn list_stacks(&self) -> Result<Vec<Stack>, StackError> {
        let read_dir =
            std::fs::read_dir(&self.stack_root).map_err(io_err("read stack root"))?;

        let mut names: Vec<String> = read_dir
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();

        let mut stacks = Vec::with_capacity(names.len());
        for name in names {
            match self.load_stack(&name).await {
                Ok(stack) => stacks.push(stack),
                Err(e) => {
                    debug!(stack = %name, error = %e, "skipping unloadable stack");
                }
            }
        }
        Ok(stacks)
    }

    /// Load one stack; a missing directory is `NotFound`.
    pub async fn get_stack(&self, name: &str) -> Result<Stack, StackError> {
        validate_stack_name(name)?;
        self.load_stack(name).await
    }

    async fn load_stack(&self, name: &str) -> Result<Stack, StackError> {
        let stack_path = self.stack_root.join(name);
        if !stack_path.is_dir() {
            return Err(StackError::NotFound(name.to_string()));
        }

        let compose_path = compose_file_path(&stack_path)
            .ok_or_else(|| StackError::NotFound(format!("{name}: no compose file")))?;
        let content =
            std::fs::read_to_string(&compose_path).map_err(io_err("read compose file"))?;
        let project = compose::parse(name, &content)?;

        // State is derived from the live inventory on every read; an
        // inventory failure degrades the stack to `error` rather than
        // failing the load.
        let (containers, state) = match self.docker.stack_containers(name).await {
            Ok(containers) => {
                let state = derive_state(&containers);
                (containers, state)
            }
            Err(e) => {
                warn!(stack = %name, error = %e, "container inventory failed");
                (Vec::new(), StackState::Error)
            }
        };

        let created_at = std::fs::metadata(&stack_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Stack {
            id: name.to_string(),
            name: name.to_string(),
            path: stack_path,
            project,
            state,
            containers,
            created_at,
            updated_at: Utc::now(),
            labels: HashMap::new(),
        })
    }

    /// Prepare an apply: write the on-disk state, resolve secrets, allocate
    /// the operation, and hand back a job to spawn. Returns `Busy` when a
    /// mutating operation for the same stack is already in flight.
    pub async fn apply_stack(&self, request: ApplyRequest) -> Result<(String, ApplyJob), StackError> {
        validate_stack_name(&request.stack_name)?;
        let lock = self.lock_stack(&request.stack_name)?;

        // Secrets resolve into the compose process environment only; the
        // `.env` mirror keeps the tokens, never the plaintext.
        let mut resolved_env = request.env_vars.clone();
        if let Some(secrets) = self.plugins.secrets() {
            secrets.inject_env(&mut resolved_env).await?;
        }

        let stack_path = self.stack_root.join(&request.stack_name);
        std::fs::create_dir_all(&stack_path).map_err(io_err("create stack dir"))?;
        set_mode(&stack_path, 0o755);

        let compose_path = stack_path.join(COMPOSE_FILE);
        std::fs::write(&compose_path, &request.compose_content)
            .map_err(io_err("write compose file"))?;
        set_mode(&compose_path, 0o644);

        if !request.env_vars.is_empty() {
            let mut env_content = String::new();
            let mut keys: Vec<_> = request.env_vars.keys().collect();
            keys.sort();
            for key in keys {
                env_content.push_str(&format!("{}={}\n", key, request.env_vars[key]));
            }
            let env_path = stack_path.join(".env");
            std::fs::write(&env_path, env_content).map_err(io_err("write env file"))?;
            set_mode(&env_path, 0o644);
        }

        let op_id = self.op_mgr.create(
            OperationType::StackApply,
            HashMap::from([("stack".to_string(), request.stack_name.clone())]),
        );

        let job = ApplyJob {
            manager: self.handle(),
            op_id: op_id.clone(),
            request,
            resolved_env,
            _lock: lock,
        };
        Ok((op_id, job))
    }

    /// Prepare a remove; same locking contract as [`Manager::apply_stack`].
    pub fn remove_stack(
        &self,
        stack_name: &str,
        remove_volumes: bool,
    ) -> Result<(String, RemoveJob), StackError> {
        validate_stack_name(stack_name)?;
        let lock = self.lock_stack(stack_name)?;

        let op_id = self.op_mgr.create(
            OperationType::StackRemove,
            HashMap::from([("stack".to_string(), stack_name.to_string())]),
        );

        let job = RemoveJob {
            manager: self.handle(),
            op_id: op_id.clone(),
            stack_name: stack_name.to_string(),
            remove_volumes,
            _lock: lock,
        };
        Ok((op_id, job))
    }

    /// Pure diff of the on-disk project against candidate content.
    pub async fn diff_stack(
        &self,
        stack_name: &str,
        new_content: &str,
    ) -> Result<DiffResult, StackError> {
        let current = self.get_stack(stack_name).await?;
        let candidate = compose::parse(stack_name, new_content)?;
        Ok(diff::compute(&current.project, &candidate))
    }

    fn lock_stack(&self, name: &str) -> Result<StackLock, StackError> {
        let mut busy = self.busy.lock().expect("busy set poisoned");
        if !busy.insert(name.to_string()) {
            return Err(StackError::Busy(name.to_string()));
        }
        Ok(StackLock {
            busy: self.busy.clone(),
            name: name.to_string(),
        })
    }

    fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            stack_root: self.stack_root.clone(),
            docker: self.docker.clone(),
            op_mgr: self.op_mgr.clone(),
        }
    }
}

impl ApplyJob {
    /// Drive the apply to a terminal state. The caller subscribes to the
    /// operation before invoking this.
    pub async fn run(self) {
        let ApplyJob {
            manager,
            op_id,
            request,
            resolved_env,
            _lock,
        } = self;
        let ops = manager.op_mgr.clone();
        let cancel = ops.cancellation(&op_id).unwrap_or_default();

        ops.set_running(&op_id);
        ops.emit_message(&op_id, "Parsing compose file...");

        let project = match compose::parse(&request.stack_name, &request.compose_content) {
            Ok(project) => project,
            Err(e) => {
                ops.set_failed(&op_id, format!("parse compose: {e}"));
                return;
            }
        };
        ops.set_progress(&op_id, 10);

        if request.pull_images {
            ops.emit_message(&op_id, "Pulling images...");
            let total = project.service_order.len().max(1) as i32;
            for (index, name) in project.service_order.iter().enumerate() {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(image) = project.services[name].image.clone() else {
                    continue;
                };
                if let Err(e) = manager.docker.pull_image(&image).await {
                    ops.set_failed(&op_id, format!("pull {image}: {e}"));
                    return;
                }
                ops.set_progress(&op_id, 10 + 40 * (index as i32 + 1) / total);
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        ops.emit_message(&op_id, "Creating/updating services...");
        ops.set_progress(&op_id, 60);

        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            format!("{}/{COMPOSE_FILE}", request.stack_name),
            "up".to_string(),
            "-d".to_string(),
        ];
        if request.force_recreate {
            args.push("--force-recreate".to_string());
        }
        args.extend(request.services.iter().cloned());

        match manager.run_compose(&args, &resolved_env, &cancel).await {
            Ok(()) => {
                info!(stack = %request.stack_name, "stack applied");
                ops.emit_message(&op_id, "Stack applied successfully");
                ops.set_completed(&op_id);
            }
            Err(ComposeRunError::Cancelled) => {}
            Err(e) => ops.set_failed(&op_id, format!("compose up: {e}")),
        }
    }
}

impl RemoveJob {
    /// Drive the remove to a terminal state.
    pub async fn run(self) {
        let RemoveJob {
            manager,
            op_id,
            stack_name,
            remove_volumes,
            _lock,
        } = self;
        let ops = manager.op_mgr.clone();
        let cancel = ops.cancellation(&op_id).unwrap_or_default();

        ops.set_running(&op_id);
        ops.emit_message(&op_id, "Stopping containers...");

        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            format!("{stack_name}/{COMPOSE_FILE}"),
            "down".to_string(),
        ];
        if remove_volumes {
            args.push("--volumes".to_string());
        }

        match manager.run_compose(&args, &HashMap::new(), &cancel).await {
            Ok(()) => {}
            Err(ComposeRunError::Cancelled) => return,
            Err(e) => {
                ops.set_failed(&op_id, format!("compose down: {e}"));
                return;
            }
        }

        ops.emit_message(&op_id, "Removing stack directory...");
        let stack_path = manager.stack_root.join(&stack_name);
        if let Err(e) = std::fs::remove_dir_all(&stack_path) {
            ops.set_failed(&op_id, format!("remove directory: {e}"));
            return;
        }

        info!(stack = %stack_name, "stack removed");
        ops.emit_message(&op_id, "Stack removed successfully");
        ops.set_completed(&op_id);
    }
}

#[derive(Debug, Error)]
enum ComposeRunError {
    #[error("{0}")]
    Spawn(String),

    #[error("exit status {status}: {output}")]
    Failed { status: i32, output: String },

    #[error("cancelled")]
    Cancelled,
}

impl ManagerHandle {
    /// Invoke the compose runtime with working directory `stack_root` and
    /// the resolved environment, capturing combined output. Cancellation
    /// kills the child (best effort; a mid-flight invocation may still have
    /// taken effect).
    async fn run_compose(
        &self,
        args: &[String],
        env: &HashMap<String, String>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), ComposeRunError> {
        let mut command = tokio::process::Command::new("docker");
        command
            .args(args)
            .current_dir(&self.stack_root)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            output = command.output() => {
                output.map_err(|e| ComposeRunError::Spawn(e.to_string()))?
            }
            () = cancel.cancelled() => return Err(ComposeRunError::Cancelled),
        };

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ComposeRunError::Failed {
                status: output.status.code().unwrap_or(-1),
                output: combined.trim().to_string(),
            });
        }
        Ok(())
    }
}

fn compose_file_path(stack_path: &Path) -> Option<PathBuf> {
    let preferred = stack_path.join(COMPOSE_FILE);
    if preferred.is_file() {
        return Some(preferred);
    }
    let legacy = stack_path.join(LEGACY_COMPOSE_FILE);
    legacy.is_file().then_some(legacy)
}

/// Derive a stack's state from its container inventory.
pub fn derive_state(containers: &[ContainerInfo]) -> StackState {
    if containers.is_empty() {
        return StackState::Stopped;
    }

    let running = containers.iter().filter(|c| c.state == "running").count();
    if running == containers.len() {
        StackState::Running
    } else if running == 0 {
        StackState::Stopped
    } else {
        StackState::Partial
    }
}

/// Stack names become directory names under the root; anything that could
/// escape the root is rejected before touching the filesystem.
pub fn validate_stack_name(name: &str) -> Result<(), StackError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(StackError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_derivation_covers_all_mixes() {
        let running = ContainerInfo {
            id: "aaaaaaaaaaaa".into(),
            name: "web-1".into(),
            service: "web".into(),
            state: "running".into(),
            status: "Up 2 minutes".into(),
            image: "nginx:1.25".into(),
            labels: HashMap::new(),
        };
        let exited = ContainerInfo {
            state: "exited".into(),
            ..running.clone()
        };

        assert_eq!(derive_state(&[]), StackState::Stopped);
        assert_eq!(derive_state(&[running.clone()]), StackState::Running);
        assert_eq!(derive_state(&[exited.clone()]), StackState::Stopped);
        assert_eq!(
            derive_state(&[running, exited]),
            StackState::Partial
        );
    }

    #[test]
    fn hostile_stack_names_are_rejected() {
        for name in ["", ".", "..", "../etc", "a/b", "a\\b", ".hidden", "x\0y"] {
            assert!(validate_stack_name(name).is_err(), "accepted {name:?}");
        }
        assert!(validate_stack_name("web").is_ok());
        assert!(validate_stack_name("my-stack_2").is_ok());
    }
}
