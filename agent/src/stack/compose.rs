// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Typed compose file model.
//!
//! The engine only needs the fields it acts on: per-service image/build,
//! ports, environment, volumes, command, and restart policy, plus the
//! top-level network and volume names. Everything else in the file is
//! accepted and ignored. Alternate spellings (list vs. map environments,
//! string vs. list commands, short vs. long port syntax) are normalized so
//! the diff works on materialized values.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("parse compose file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    #[error("service name is not a string")]
    BadServiceName,

    #[error("service {0}: neither image nor build context declared")]
    MissingImage(String),
}

/// A parsed compose project, named after its stack.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    /// Keyed by service name.
    pub services: BTreeMap<String, Service>,
    /// Service names in declaration order; image pulls walk this.
    pub service_order: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ComposeFile {
    /// Kept as a raw mapping so declaration order survives and duplicate
    /// names can be rejected rather than silently merged.
    #[serde(default)]
    services: serde_yaml::Mapping,
    #[serde(default)]
    networks: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    volumes: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub image: Option<String>,
    /// Presence is all the engine checks; building is compose's business.
    #[serde(default)]
    pub build: Option<serde_yaml::Value>,
    #[serde(default)]
    pub ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default)]
    pub volumes: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub labels: Option<Environment>,
    #[serde(default)]
    pub depends_on: Option<serde_yaml::Value>,
}

/// Environment (and labels) come in list form (`KEY=VALUE`) or map form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

/// Commands come as a shell string or an argv list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Argv(Vec<String>),
}

impl Service {
    /// Materialized `KEY=VALUE` environment set, regardless of spelling.
    pub fn environment_set(&self) -> BTreeSet<String> {
        match &self.environment {
            None => BTreeSet::new(),
            Some(Environment::List(items)) => items.iter().cloned().collect(),
            Some(Environment::Map(map)) => map
                .iter()
                .map(|(k, v)| format!("{}={}", k, scalar_to_string(v)))
                .collect(),
        }
    }

    /// Published ports, each normalized to a string.
    pub fn ports_set(&self) -> BTreeSet<String> {
        self.ports.iter().map(scalar_to_string).collect()
    }

    /// Volume mounts, each normalized to a string.
    pub fn volumes_set(&self) -> BTreeSet<String> {
        self.volumes.iter().map(scalar_to_string).collect()
    }

    /// Command as a single comparable string.
    pub fn command_string(&self) -> Option<String> {
        match &self.command {
            None => None,
            Some(Command::Shell(s)) => Some(s.clone()),
            Some(Command::Argv(argv)) => Some(argv.join(" ")),
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Parse compose content into a project named after the stack.
///
/// Validation is deliberately shallow: service names are unique by
/// construction of the map, and every service must declare an image or a
/// build context. Whatever else the file carries is passed through to the
/// compose runtime untouched.
pub fn parse(stack_name: &str, content: &str) -> Result<Project, ComposeError> {
    let file: ComposeFile = serde_yaml::from_str(content)?;

    let mut services = BTreeMap::new();
    let mut service_order = Vec::with_capacity(file.services.len());
    for (key, value) in file.services {
        let name = key
            .as_str()
            .ok_or(ComposeError::BadServiceName)?
            .to_string();
        let service: Service = serde_yaml::from_value(value)?;
        if service.image.as_deref().map_or(true, str::is_empty) && service.build.is_none() {
            return Err(ComposeError::MissingImage(name));
        }
        if services.insert(name.clone(), service).is_some() {
            return Err(ComposeError::DuplicateService(name));
        }
        service_order.push(name);
    }

    Ok(Project {
        name: stack_name.to_string(),
        services,
        service_order,
        networks: file.networks.keys().cloned().collect(),
        volumes: file.volumes.keys().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SERVICES: &str = r#"
services:
  web:
    image: nginx:1.25
    ports:
      - "80:80"
    environment:
      - TLS=off
  cache:
    image: redis:7
    command: ["redis-server", "--appendonly", "yes"]
networks:
  frontend: {}
volumes:
  cache-data: {}
"#;

    #[test]
    fn parses_services_networks_and_volumes() {
        let project = parse("web", TWO_SERVICES).unwrap();
        assert_eq!(project.name, "web");
        assert_eq!(project.services.len(), 2);
        assert_eq!(project.networks, vec!["frontend".to_string()]);
        assert_eq!(project.volumes, vec!["cache-data".to_string()]);
        assert_eq!(
            project.services["web"].image.as_deref(),
            Some("nginx:1.25")
        );
    }

    #[test]
    fn empty_compose_is_valid() {
        let project = parse("empty", "services: {}\n").unwrap();
        assert!(project.services.is_empty());
        assert!(project.service_order.is_empty());
    }

    #[test]
    fn declaration_order_is_preserved() {
        let project = parse(
            "ordered",
            "services:\n  zeta:\n    image: z:1\n  alpha:\n    image: a:1\n",
        )
        .unwrap();
        assert_eq!(project.service_order, vec!["zeta", "alpha"]);
    }

    #[test]
    fn service_without_image_or_build_is_rejected() {
        let err = parse("bad", "services:\n  broken:\n    restart: always\n").unwrap_err();
        assert!(matches!(err, ComposeError::MissingImage(name) if name == "broken"));
    }

    #[test]
    fn build_context_satisfies_image_requirement() {
        let project = parse("built", "services:\n  app:\n    build: .\n").unwrap();
        assert!(project.services["app"].image.is_none());
        assert!(project.services["app"].build.is_some());
    }

    #[test]
    fn environment_map_and_list_forms_materialize_identically() {
        let list_form = parse(
            "a",
            "services:\n  s:\n    image: i\n    environment:\n      - A=1\n      - B=two\n",
        )
        .unwrap();
        let map_form = parse(
            "a",
            "services:\n  s:\n    image: i\n    environment:\n      A: 1\n      B: two\n",
        )
        .unwrap();

        assert_eq!(
            list_form.services["s"].environment_set(),
            map_form.services["s"].environment_set()
        );
    }

    #[test]
    fn command_forms_compare_equal_when_equivalent() {
        let shell = parse("a", "services:\n  s:\n    image: i\n    command: redis-server --save\n")
            .unwrap();
        let argv = parse(
            "a",
            "services:\n  s:\n    image: i\n    command: [\"redis-server\", \"--save\"]\n",
        )
        .unwrap();
        assert_eq!(
            shell.services["s"].command_string(),
            argv.services["s"].command_string()
        );
    }

    #[test]
    fn numeric_ports_normalize_to_strings() {
        let project =
            parse("a", "services:\n  s:\n    image: i\n    ports:\n      - 8080\n").unwrap();
        assert!(project.services["s"].ports_set().contains("8080"));
    }
}
