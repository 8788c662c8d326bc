// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Scoped filesystem access under the stack root.
//!
//! Every path in a filesystem RPC is validated before any I/O: `..`
//! components and null bytes are rejected lexically, and the final path is
//! canonicalized against the canonicalized root so symlinks cannot carry an
//! operation outside `stack_root`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path escapes the stack root: {0}")]
    OutsideRoot(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    /// Path relative to the stack root.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified_at: DateTime<Utc>,
}

pub struct Manager {
    root: PathBuf,
}

impl Manager {
    pub fn new(stack_root: impl Into<PathBuf>) -> Self {
        Self {
            root: stack_root.into(),
        }
    }

    /// Validate a request path and resolve it under the root.
    ///
    /// `must_exist` controls the symlink check: existing targets are fully
    /// canonicalized, new targets canonicalize their parent directory. In
    /// both cases the result must stay under the canonicalized root.
    fn resolve(&self, path: &str, must_exist: bool) -> Result<PathBuf, FsError> {
        if path.contains('\0') {
            return Err(FsError::InvalidPath("path contains null byte".into()));
        }

        let rel = Path::new(path.trim_start_matches('/'));
        for component in rel.components() {
            match component {
                Component::ParentDir => {
                    warn!(path, "rejected path traversal attempt");
                    return Err(FsError::OutsideRoot(path.to_string()));
                }
                Component::Prefix(_) | Component::RootDir => {
                    return Err(FsError::InvalidPath(path.to_string()));
                }
                Component::CurDir | Component::Normal(_) => {}
            }
        }

        let root = self
            .root
            .canonicalize()
            .map_err(|e| FsError::Io {
                context: "canonicalize stack root".into(),
                source: e,
            })?;
        let joined = root.join(rel);

        let canonical = if must_exist {
            joined
                .canonicalize()
                .map_err(|_| FsError::NotFound(path.to_string()))?
        } else {
            let parent = joined
                .parent()
                .ok_or_else(|| FsError::InvalidPath(path.to_string()))?;
            let canonical_parent = parent
                .canonicalize()
                .map_err(|_| FsError::NotFound(path.to_string()))?;
            canonical_parent.join(joined.file_name().ok_or_else(|| {
                FsError::InvalidPath(path.to_string())
            })?)
        };

        if !canonical.starts_with(&root) {
            warn!(path, "rejected path outside stack root");
            return Err(FsError::OutsideRoot(path.to_string()));
        }
        Ok(canonical)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let resolved = self.resolve(path, true)?;
        std::fs::read(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => FsError::Io {
                context: format!("read {path}"),
                source: e,
            },
        })
    }

    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<u64, FsError> {
        let resolved = self.resolve(path, false)?;
        std::fs::write(&resolved, content).map_err(|e| FsError::Io {
            context: format!("write {path}"),
            source: e,
        })?;
        Ok(content.len() as u64)
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>, FsError> {
        let resolved = self.resolve(path, true)?;
        let root = self.root.canonicalize().map_err(|e| FsError::Io {
            context: "canonicalize stack root".into(),
            source: e,
        })?;

        let read_dir = std::fs::read_dir(&resolved).map_err(|e| FsError::Io {
            context: format!("list {path}"),
            source: e,
        })?;

        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let entry_path = entry.path();
            let rel = entry_path
                .strip_prefix(&root)
                .unwrap_or(&entry_path)
                .to_string_lossy()
                .into_owned();
            entries.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: rel,
                size: metadata.len(),
                is_dir: metadata.is_dir(),
                modified_at: metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn delete(&self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, true)?;
        let root = self.root.canonicalize().map_err(|e| FsError::Io {
            context: "canonicalize stack root".into(),
            source: e,
        })?;
        if resolved == root {
            return Err(FsError::InvalidPath(
                "refusing to delete the stack root".into(),
            ));
        }

        let result = if resolved.is_dir() {
            std::fs::remove_dir_all(&resolved)
        } else {
            std::fs::remove_file(&resolved)
        };
        result.map_err(|e| FsError::Io {
            context: format!("delete {path}"),
            source: e,
        })
    }

    /// Read the persisted agent id, if one exists.
    pub fn load_agent_id(&self) -> Option<String> {
        let contents = std::fs::read_to_string(self.root.join(".agent_id")).ok()?;
        let id = contents.trim();
        (!id.is_empty()).then(|| id.to_string())
    }

    /// Persist the agent id (0600) for reuse across restarts.
    pub fn save_agent_id(&self, id: &str) -> Result<(), FsError> {
        std::fs::create_dir_all(&self.root).map_err(|e| FsError::Io {
            context: "create stack root".into(),
            source: e,
        })?;
        let path = self.root.join(".agent_id");
        std::fs::write(&path, id).map_err(|e| FsError::Io {
            context: "write agent id".into(),
            source: e,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Labels for audit metadata on filesystem calls.
    pub fn audit_labels(path: &str) -> HashMap<String, String> {
        HashMap::from([("path".to_string(), path.to_string())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, Manager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());
        (dir, manager)
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (dir, manager) = manager();
        // Parent must exist for nested writes.
        assert!(matches!(
            manager.write_file("missing/notes.txt", b"x"),
            Err(FsError::NotFound(_))
        ));

        std::fs::create_dir_all(dir.path().join("web")).unwrap();
        manager.write_file("web/notes.txt", b"hello").unwrap();
        assert_eq!(manager.read_file("web/notes.txt").unwrap(), b"hello");
    }

    #[test]
    fn traversal_is_rejected_before_io() {
        let (_dir, manager) = manager();
        for path in ["../etc/passwd", "a/../../b", "..", "web/../../x"] {
            let err = manager.read_file(path).unwrap_err();
            assert!(matches!(err, FsError::OutsideRoot(_)), "accepted {path:?}");
        }
    }

    #[test]
    fn absolute_paths_are_treated_as_root_relative() {
        let (dir, manager) = manager();
        std::fs::write(dir.path().join("file.txt"), b"data").unwrap();
        assert_eq!(manager.read_file("/file.txt").unwrap(), b"data");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let (dir, manager) = manager();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"nope").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = manager.read_file("link/secret").unwrap_err();
        assert!(matches!(err, FsError::OutsideRoot(_)));
    }

    #[test]
    fn list_directory_reports_entries() {
        let (dir, manager) = manager();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        std::fs::write(dir.path().join("web/compose.yaml"), b"services: {}\n").unwrap();

        let entries = manager.list_directory("web").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "compose.yaml");
        assert!(!entries[0].is_dir);
    }

    #[test]
    fn delete_refuses_the_root_itself() {
        let (_dir, manager) = manager();
        assert!(matches!(
            manager.delete(""),
            Err(FsError::InvalidPath(_) | FsError::NotFound(_))
        ));
    }

    #[test]
    fn agent_id_persists() {
        let (_dir, manager) = manager();
        assert!(manager.load_agent_id().is_none());
        manager.save_agent_id("agent-node-a-1700000000").unwrap();
        assert_eq!(
            manager.load_agent_id().as_deref(),
            Some("agent-node-a-1700000000")
        );
    }
}
