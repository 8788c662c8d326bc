// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! File audit plugin: newline-delimited JSON, one record per line.
//!
//! Records land in `<log_dir>/audit-YYYY-MM-DD.jsonl`. When the current file
//! passes 100 MiB it is renamed with an incrementing suffix and a fresh file
//! is opened. Nothing here may ever fail the audited call: write errors go to
//! stderr and are otherwise swallowed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::interface::{AuditPlugin, Capability, Plugin, PluginConfig, PluginError};
use crate::types::{AuditEntry, AuditFilter};

const DEFAULT_LOG_DIR: &str = "/var/log/mandau";
const ROTATE_BYTES: u64 = 100 * 1024 * 1024;

struct AuditState {
    log_dir: PathBuf,
    current: Option<File>,
    current_path: PathBuf,
}

pub struct FileAuditPlugin {
    state: Mutex<AuditState>,
    rotate_bytes: u64,
}

impl FileAuditPlugin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AuditState {
                log_dir: PathBuf::from(DEFAULT_LOG_DIR),
                current: None,
                current_path: PathBuf::new(),
            }),
            rotate_bytes: ROTATE_BYTES,
        }
    }

    #[cfg(test)]
    fn with_rotate_bytes(rotate_bytes: u64) -> Self {
        let mut plugin = Self::new();
        plugin.rotate_bytes = rotate_bytes;
        plugin
    }

    fn log_file_name() -> String {
        format!("audit-{}.jsonl", Utc::now().format("%Y-%m-%d"))
    }

    fn open_current(state: &mut AuditState) -> std::io::Result<()> {
        let path = state.log_dir.join(Self::log_file_name());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        state.current = Some(file);
        state.current_path = path;
        Ok(())
    }

    /// Rename the full file aside (`audit-DATE.jsonl` -> `audit-DATE.N.jsonl`)
    /// and open a fresh one.
    fn rotate(state: &mut AuditState) {
        if let Some(file) = state.current.take() {
            drop(file);
        }
        let stem = state
            .current_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audit")
            .to_string();
        for n in 1u32.. {
            let candidate = state.log_dir.join(format!("{stem}.{n}.jsonl"));
            if !candidate.exists() {
                if let Err(e) = std::fs::rename(&state.current_path, &candidate) {
                    eprintln!("audit rotate error: {e}");
                }
                break;
            }
        }
        if let Err(e) = Self::open_current(state) {
            eprintln!("audit reopen error: {e}");
        }
    }

    fn should_rotate(&self, state: &AuditState) -> bool {
        state
            .current
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len() > self.rotate_bytes)
            .unwrap_or(false)
    }

    fn read_log_file(path: &Path, filter: &AuditFilter, out: &mut Vec<AuditEntry>) {
        let Ok(data) = std::fs::read_to_string(path) else {
            return;
        };
        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
                continue;
            };
            if Self::matches(&entry, filter) {
                out.push(entry);
            }
        }
    }

    fn matches(entry: &AuditEntry, filter: &AuditFilter) -> bool {
        if let Some(agent_id) = &filter.agent_id {
            if &entry.agent_id != agent_id {
                return false;
            }
        }
        if let Some(principal) = &filter.principal_id {
            match &entry.identity {
                Some(identity) if &identity.principal_id == principal => {}
                _ => return false,
            }
        }
        if let Some(action) = &filter.action {
            if !entry.action.contains(action.as_str()) {
                return false;
            }
        }
        if let Some(start) = &filter.start_time {
            if entry.timestamp < *start {
                return false;
            }
        }
        if let Some(end) = &filter.end_time {
            if entry.timestamp > *end {
                return false;
            }
        }
        true
    }
}

impl Default for FileAuditPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for FileAuditPlugin {
    fn name(&self) -> &str {
        "file-audit"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Audit]
    }

    async fn init(&self, config: Option<&PluginConfig>) -> Result<(), PluginError> {
        let log_dir = config
            .and_then(|c| c.get("log_dir"))
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_LOG_DIR)
            .to_string();

        let mut state = self.state.lock().expect("audit state poisoned");
        state.log_dir = PathBuf::from(&log_dir);
        std::fs::create_dir_all(&state.log_dir)
            .map_err(|e| PluginError::Other(format!("create log dir {log_dir}: {e}")))?;
        Self::open_current(&mut state)
            .map_err(|e| PluginError::Other(format!("open audit log: {e}")))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        let mut state = self.state.lock().expect("audit state poisoned");
        if let Some(file) = state.current.take() {
            drop(file);
        }
        Ok(())
    }
}

#[async_trait]
impl AuditPlugin for FileAuditPlugin {
    async fn log(&self, entry: &AuditEntry) {
        let mut state = self.state.lock().expect("audit state poisoned");

        if state.current.is_none() {
            if let Err(e) = Self::open_current(&mut state) {
                eprintln!("audit open error: {e}");
                return;
            }
        }

        if self.should_rotate(&state) {
            Self::rotate(&mut state);
        }

        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("audit marshal error: {e}");
                return;
            }
        };

        if let Some(file) = state.current.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                eprintln!("audit write error: {e}");
            }
        }
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, PluginError> {
        let log_dir = {
            let state = self.state.lock().expect("audit state poisoned");
            state.log_dir.clone()
        };

        let mut entries = Vec::new();
        let read_dir = std::fs::read_dir(&log_dir)
            .map_err(|e| PluginError::Other(format!("read audit dir: {e}")))?;
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("audit-") && name.ends_with(".jsonl") {
                Self::read_log_file(&path, filter, &mut entries);
            }
        }

        entries.sort_by_key(|e| e.timestamp);
        if filter.limit > 0 && entries.len() > filter.limit {
            entries.truncate(filter.limit);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::types::Identity;

    fn entry(principal: &str, action: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            agent_id: "agent-test".into(),
            identity: Some(Identity::new(principal)),
            action: action.into(),
            resource: "stack:web".into(),
            result: "success".into(),
            duration: Duration::from_millis(5),
            metadata: HashMap::new(),
        }
    }

    async fn init_in(dir: &Path) -> FileAuditPlugin {
        let plugin = FileAuditPlugin::new();
        let config: PluginConfig =
            serde_yaml::from_str(&format!("log_dir: {}", dir.display())).unwrap();
        plugin.init(Some(&config)).await.unwrap();
        plugin
    }

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = init_in(dir.path()).await;

        plugin.log(&entry("a@example.com", "/x/One")).await;
        plugin.log(&entry("b@example.com", "/x/Two")).await;

        let file = dir.path().join(FileAuditPlugin::log_file_name());
        let contents = std::fs::read_to_string(file).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<AuditEntry>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn query_filters_by_principal() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = init_in(dir.path()).await;

        plugin.log(&entry("a@example.com", "/x/One")).await;
        plugin.log(&entry("b@example.com", "/x/Two")).await;

        let found = plugin
            .query(&AuditFilter {
                principal_id: Some("a@example.com".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].action, "/x/One");
    }

    #[tokio::test]
    async fn rotation_starts_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = FileAuditPlugin::with_rotate_bytes(64);
        let config: PluginConfig =
            serde_yaml::from_str(&format!("log_dir: {}", dir.path().display())).unwrap();
        plugin.init(Some(&config)).await.unwrap();

        for _ in 0..8 {
            plugin.log(&entry("a@example.com", "/x/One")).await;
        }

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(files.len() >= 2, "expected a rotated file, got {files:?}");

        // Every record, rotated or current, is still queryable.
        let all = plugin.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 8);
    }

    #[tokio::test]
    async fn logging_never_fails_without_init() {
        // No init: the plugin points at the default directory, which is not
        // writable in tests. log() must still return without panicking.
        let plugin = FileAuditPlugin::new();
        plugin.log(&entry("a@example.com", "/x/One")).await;
    }
}
