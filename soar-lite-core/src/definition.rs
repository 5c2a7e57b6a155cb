//! Playbook definitions.
//!
//! A playbook is a named set of task definitions and their dependency edges.
//! Definitions are immutable inputs; the engine materializes a runtime
//! [`crate::types::Task`] per definition at the start of a run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One task definition inside a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Connector target for this task, e.g. "revoke_oauth_tokens".
    #[serde(rename = "type")]
    pub task_type: String,
    /// Literal values and `{{…}}` references to context variables or
    /// prior task outputs.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Names of tasks that must complete before this one runs.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Suspend for human approval before dispatch.
    #[serde(default)]
    pub approval_required: bool,
    /// Marks the task's effect as safe to deduplicate across runs.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// A named set of task definitions.
///
/// Tasks are kept in a sorted map so compilation and audit output are
/// deterministic regardless of document order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub playbook_id: String,
    pub tasks: BTreeMap<String, TaskDefinition>,
}

impl Playbook {
    pub fn new(playbook_id: impl Into<String>) -> Self {
        Self {
            playbook_id: playbook_id.into(),
            tasks: BTreeMap::new(),
        }
    }

    /// Add a task definition, replacing any previous one with the same name.
    pub fn with_task(mut self, name: impl Into<String>, definition: TaskDefinition) -> Self {
        self.tasks.insert(name.into(), definition);
        self
    }

    /// Load a playbook from a YAML document.
    pub fn from_yaml_str(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }
}

/// Resolves a playbook identifier plus a rendering context into a concrete
/// playbook. Template rendering and variable substitution live behind this
/// seam, outside the engine core.
#[async_trait]
pub trait PlaybookSource: Send + Sync {
    async fn resolve(&self, playbook_id: &str, context: &Map<String, Value>) -> Option<Playbook>;
}

/// In-memory source over a fixed catalog. Context is ignored; rendering
/// sources layer on top of this seam.
#[derive(Debug, Clone, Default)]
pub struct StaticPlaybookSource {
    playbooks: BTreeMap<String, Playbook>,
}

impl StaticPlaybookSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, playbook: Playbook) {
        self.playbooks.insert(playbook.playbook_id.clone(), playbook);
    }
}

#[async_trait]
impl PlaybookSource for StaticPlaybookSource {
    async fn resolve(&self, playbook_id: &str, _context: &Map<String, Value>) -> Option<Playbook> {
        self.playbooks.get(playbook_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip() {
        let doc = r#"
playbook_id: phishing_response
tasks:
  snapshot:
    type: take_snapshot
    inputs:
      mailbox: "{{mailbox}}"
  rotate:
    type: rotate_credentials
    needs: [snapshot]
    approval_required: true
    idempotency_key: rotate-{{case_id}}
"#;
        let playbook = Playbook::from_yaml_str(doc).unwrap();
        assert_eq!(playbook.playbook_id, "phishing_response");
        assert_eq!(playbook.tasks.len(), 2);

        let rotate = &playbook.tasks["rotate"];
        assert_eq!(rotate.task_type, "rotate_credentials");
        assert_eq!(rotate.needs, vec!["snapshot"]);
        assert!(rotate.approval_required);
        assert!(rotate.idempotency_key.is_some());

        let snapshot = &playbook.tasks["snapshot"];
        assert!(!snapshot.approval_required);
        assert!(snapshot.needs.is_empty());
    }

    #[test]
    fn defaults_apply_to_minimal_definition() {
        let doc = r#"
playbook_id: minimal
tasks:
  only:
    type: noop
"#;
        let playbook = Playbook::from_yaml_str(doc).unwrap();
        let only = &playbook.tasks["only"];
        assert!(only.inputs.is_empty());
        assert!(only.needs.is_empty());
        assert!(!only.approval_required);
        assert!(only.idempotency_key.is_none());
    }

    #[tokio::test]
    async fn static_source_resolves_by_id() {
        let mut source = StaticPlaybookSource::new();
        source.insert(Playbook::new("containment"));

        let ctx = Map::new();
        assert!(source.resolve("containment", &ctx).await.is_some());
        assert!(source.resolve("unknown", &ctx).await.is_none());
    }

    #[test]
    fn builder_replaces_duplicate_names() {
        let def = |t: &str| TaskDefinition {
            task_type: t.into(),
            inputs: Map::new(),
            needs: vec![],
            approval_required: false,
            idempotency_key: None,
        };
        let playbook = Playbook::new("p")
            .with_task("a", def("first"))
            .with_task("a", def("second"));
        assert_eq!(playbook.tasks.len(), 1);
        assert_eq!(playbook.tasks["a"].task_type, "second");
    }
}
