// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Pure service-level diff between the on-disk project and a candidate.
//!
//! Output ordering is deterministic: UPDATE entries precede CREATE entries
//! precede DELETE entries, lexicographic by service name within each bucket.

use super::compose::{Project, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    None,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ServiceDiff {
    pub name: String,
    pub action: DiffAction,
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub services: Vec<ServiceDiff>,
    pub has_changes: bool,
}

/// Compare the current project against a candidate.
pub fn compute(current: &Project, candidate: &Project) -> DiffResult {
    let mut updates = Vec::new();
    let mut creates = Vec::new();
    let mut deletes = Vec::new();

    // BTreeMap iteration keeps each bucket sorted by service name.
    for (name, new_svc) in &candidate.services {
        match current.services.get(name) {
            Some(old_svc) => {
                let changes = compare_services(old_svc, new_svc);
                if !changes.is_empty() {
                    updates.push(ServiceDiff {
                        name: name.clone(),
                        action: DiffAction::Update,
                        changes,
                    });
                }
            }
            None => creates.push(ServiceDiff {
                name: name.clone(),
                action: DiffAction::Create,
                changes: Vec::new(),
            }),
        }
    }

    for name in current.services.keys() {
        if !candidate.services.contains_key(name) {
            deletes.push(ServiceDiff {
                name: name.clone(),
                action: DiffAction::Delete,
                changes: Vec::new(),
            });
        }
    }

    let mut services = updates;
    services.extend(creates);
    services.extend(deletes);
    let has_changes = !services.is_empty();

    DiffResult {
        services,
        has_changes,
    }
}

fn compare_services(current: &Service, candidate: &Service) -> Vec<String> {
    let mut changes = Vec::new();

    if current.image != candidate.image {
        changes.push(format!(
            "image: {} \u{2192} {}",
            current.image.as_deref().unwrap_or("<build>"),
            candidate.image.as_deref().unwrap_or("<build>")
        ));
    }

    if current.ports_set() != candidate.ports_set() {
        changes.push("ports changed".to_string());
    }

    if current.environment_set() != candidate.environment_set() {
        changes.push("environment changed".to_string());
    }

    if current.volumes_set() != candidate.volumes_set() {
        changes.push("volumes changed".to_string());
    }

    if current.command_string() != candidate.command_string() {
        changes.push("command changed".to_string());
    }

    if current.restart != candidate.restart {
        changes.push("restart policy changed".to_string());
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::super::compose::parse;
    use super::*;

    #[test]
    fn identical_projects_have_no_changes() {
        let content = "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"80:80\"\n";
        let a = parse("web", content).unwrap();
        let b = parse("web", content).unwrap();

        let diff = compute(&a, &b);
        assert!(!diff.has_changes);
        assert!(diff.services.is_empty());
    }

    #[test]
    fn image_bump_yields_exactly_one_update() {
        let current = parse(
            "web",
            "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"80:80\"\n",
        )
        .unwrap();
        let candidate = parse(
            "web",
            "services:\n  web:\n    image: nginx:1.26\n    ports:\n      - \"80:80\"\n",
        )
        .unwrap();

        let diff = compute(&current, &candidate);
        assert!(diff.has_changes);
        assert_eq!(diff.services.len(), 1);
        assert_eq!(diff.services[0].name, "web");
        assert_eq!(diff.services[0].action, DiffAction::Update);
        assert_eq!(
            diff.services[0].changes,
            vec!["image: nginx:1.25 \u{2192} nginx:1.26".to_string()]
        );
    }

    #[test]
    fn added_and_removed_services_are_detected() {
        let current =
            parse("s", "services:\n  old:\n    image: a:1\n  kept:\n    image: b:1\n").unwrap();
        let candidate =
            parse("s", "services:\n  kept:\n    image: b:1\n  fresh:\n    image: c:1\n").unwrap();

        let diff = compute(&current, &candidate);
        assert!(diff.has_changes);
        assert_eq!(diff.services.len(), 2);
        assert_eq!(diff.services[0].name, "fresh");
        assert_eq!(diff.services[0].action, DiffAction::Create);
        assert_eq!(diff.services[1].name, "old");
        assert_eq!(diff.services[1].action, DiffAction::Delete);
    }

    #[test]
    fn updates_precede_creates_precede_deletes() {
        let current = parse(
            "s",
            "services:\n  zeta:\n    image: a:1\n  gone:\n    image: g:1\n",
        )
        .unwrap();
        let candidate = parse(
            "s",
            "services:\n  zeta:\n    image: a:2\n  alpha:\n    image: n:1\n",
        )
        .unwrap();

        let diff = compute(&current, &candidate);
        let order: Vec<_> = diff
            .services
            .iter()
            .map(|d| (d.action, d.name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (DiffAction::Update, "zeta"),
                (DiffAction::Create, "alpha"),
                (DiffAction::Delete, "gone"),
            ]
        );
    }

    #[test]
    fn environment_spelling_differences_do_not_diff() {
        let list = parse(
            "s",
            "services:\n  s:\n    image: i\n    environment:\n      - A=1\n",
        )
        .unwrap();
        let map = parse(
            "s",
            "services:\n  s:\n    image: i\n    environment:\n      A: 1\n",
        )
        .unwrap();

        assert!(!compute(&list, &map).has_changes);
    }

    #[test]
    fn restart_policy_change_is_reported() {
        let current =
            parse("s", "services:\n  s:\n    image: i\n    restart: always\n").unwrap();
        let candidate =
            parse("s", "services:\n  s:\n    image: i\n    restart: unless-stopped\n").unwrap();

        let diff = compute(&current, &candidate);
        assert_eq!(diff.services[0].changes, vec!["restart policy changed"]);
    }
}
