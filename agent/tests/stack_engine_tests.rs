// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Stack engine integration tests.
//!
//! These run against a temporary stack root with no Docker daemon: the
//! engine degrades container inventory to the `error` state and everything
//! on-disk behaves exactly as in production.

use std::collections::HashMap;
use std::sync::Arc;

use mandau_agent::docker::DockerClient;
use mandau_agent::operation::Manager as OperationManager;
use mandau_agent::stack::{ApplyRequest, DiffAction, Manager, StackError};
use mandau_plugin::builtin::LocalSecretsPlugin;
use mandau_plugin::interface::{Plugin, SecretsPlugin};
use mandau_plugin::{PluginHandle, Registry};

const WEB_COMPOSE: &str = "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"80:80\"\n";

fn manager_in(root: &std::path::Path, plugins: Registry) -> Manager {
    let docker = DockerClient::connect(None).expect("docker client handle");
    Manager::new(root, docker, Arc::new(OperationManager::new()), Arc::new(plugins))
}

fn apply_request(name: &str, compose: &str) -> ApplyRequest {
    ApplyRequest {
        stack_name: name.to_string(),
        compose_content: compose.to_string(),
        env_vars: HashMap::new(),
        force_recreate: false,
        services: Vec::new(),
        pull_images: false,
    }
}

#[tokio::test]
async fn apply_writes_the_on_disk_contract() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    let mut request = apply_request("web", WEB_COMPOSE);
    request.env_vars = HashMap::from([
        ("TLS".to_string(), "off".to_string()),
        ("REPLICAS".to_string(), "2".to_string()),
    ]);

    let (op_id, _job) = manager.apply_stack(request).await.unwrap();
    assert!(!op_id.is_empty());

    let stack_dir = root.path().join("web");
    assert_eq!(
        std::fs::read_to_string(stack_dir.join("compose.yaml")).unwrap(),
        WEB_COMPOSE
    );

    let env = std::fs::read_to_string(stack_dir.join(".env")).unwrap();
    assert_eq!(env, "REPLICAS=2\nTLS=off\n");
}

#[tokio::test]
async fn second_concurrent_apply_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    let (_op_id, job) = manager
        .apply_stack(apply_request("web", WEB_COMPOSE))
        .await
        .unwrap();

    // While the first operation is alive, a second writer on the same stack
    // is refused; a different stack proceeds.
    let err = manager
        .apply_stack(apply_request("web", WEB_COMPOSE))
        .await
        .unwrap_err();
    assert!(matches!(err, StackError::Busy(_)));

    manager
        .apply_stack(apply_request("cache", "services:\n  cache:\n    image: redis:7\n"))
        .await
        .unwrap();

    // Dropping the job releases the lock.
    drop(job);
    manager
        .apply_stack(apply_request("web", WEB_COMPOSE))
        .await
        .unwrap();
}

#[tokio::test]
async fn get_stack_on_missing_directory_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    let err = manager.get_stack("ghost").await.unwrap_err();
    assert!(matches!(err, StackError::NotFound(_)));
}

#[tokio::test]
async fn list_stacks_skips_unloadable_entries() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    // A valid stack, a directory without a compose file, and the agent id
    // file that must never be mistaken for a stack.
    let (_op, _job) = manager
        .apply_stack(apply_request("web", WEB_COMPOSE))
        .await
        .unwrap();
    std::fs::create_dir(root.path().join("junk")).unwrap();
    std::fs::write(root.path().join(".agent_id"), "agent-x").unwrap();

    let stacks = manager.list_stacks().await.unwrap();
    let names: Vec<_> = stacks.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["web"]);
}

#[tokio::test]
async fn diff_between_identical_content_is_empty() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    manager
        .apply_stack(apply_request("web", WEB_COMPOSE))
        .await
        .unwrap();

    let diff = manager.diff_stack("web", WEB_COMPOSE).await.unwrap();
    assert!(!diff.has_changes);
    assert!(diff.services.is_empty());
}

#[tokio::test]
async fn diff_reports_image_bump_with_arrow() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    manager
        .apply_stack(apply_request("web", WEB_COMPOSE))
        .await
        .unwrap();

    let candidate = WEB_COMPOSE.replace("nginx:1.25", "nginx:1.26");
    let diff = manager.diff_stack("web", &candidate).await.unwrap();

    assert!(diff.has_changes);
    assert_eq!(diff.services.len(), 1);
    assert_eq!(diff.services[0].name, "web");
    assert_eq!(diff.services[0].action, DiffAction::Update);
    assert_eq!(
        diff.services[0].changes,
        vec!["image: nginx:1.25 \u{2192} nginx:1.26".to_string()]
    );
}

#[tokio::test]
async fn missing_secret_fails_the_apply_before_any_write() {
    let root = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();

    let secrets = Arc::new(LocalSecretsPlugin::new());
    let config: serde_yaml::Value = serde_yaml::from_str(&format!(
        "path: {}",
        store.path().join("secrets.json").display()
    ))
    .unwrap();
    secrets.init(Some(&config)).await.unwrap();

    let mut plugins = Registry::new();
    plugins
        .register(PluginHandle::new(secrets.clone()).with_secrets(secrets.clone()))
        .unwrap();
    let manager = manager_in(root.path(), plugins);

    let mut request = apply_request("web", WEB_COMPOSE);
    request.env_vars = HashMap::from([(
        "DB_PASSWORD".to_string(),
        "${secret:missing}".to_string(),
    )]);

    let err = manager.apply_stack(request).await.unwrap_err();
    assert!(matches!(err, StackError::Secrets(_)));
    assert!(!root.path().join("web").exists());
}

#[tokio::test]
async fn env_mirror_keeps_secret_tokens_out_of_plaintext() {
    let root = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();

    let secrets = Arc::new(LocalSecretsPlugin::new());
    let config: serde_yaml::Value = serde_yaml::from_str(&format!(
        "path: {}",
        store.path().join("secrets.json").display()
    ))
    .unwrap();
    secrets.init(Some(&config)).await.unwrap();
    secrets.set("db_password", b"hunter2").await.unwrap();

    let mut plugins = Registry::new();
    plugins
        .register(PluginHandle::new(secrets.clone()).with_secrets(secrets.clone()))
        .unwrap();
    let manager = manager_in(root.path(), plugins);

    let mut request = apply_request("web", WEB_COMPOSE);
    request.env_vars = HashMap::from([(
        "DB_PASSWORD".to_string(),
        "${secret:db_password}".to_string(),
    )]);

    manager.apply_stack(request).await.unwrap();

    // The on-disk mirror carries the token, never the resolved value.
    let env = std::fs::read_to_string(root.path().join("web/.env")).unwrap();
    assert!(env.contains("${secret:db_password}"));
    assert!(!env.contains("hunter2"));
}

#[tokio::test]
async fn hostile_stack_names_never_touch_the_filesystem() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path(), Registry::new());

    for name in ["../escape", "a/b", ".."] {
        let err = manager
            .apply_stack(apply_request(name, WEB_COMPOSE))
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidName(_)), "accepted {name:?}");
    }

    let entries: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
    assert!(entries.is_empty());
}
