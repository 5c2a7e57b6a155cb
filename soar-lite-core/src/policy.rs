//! Policy guardrails evaluated before and after task execution.
//!
//! Rules run strictly in registration order; the first failing predicate
//! blocks with its rule name and denial message. The gate itself is
//! read-only once constructed and needs no locking.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::PolicyViolation;
use crate::types::{Case, Task};

pub type CasePredicate = Arc<dyn Fn(&Case) -> bool + Send + Sync>;
pub type TaskPredicate = Arc<dyn Fn(&Case, &Task) -> bool + Send + Sync>;

/// When a task rule applies.
///
/// Pre-dispatch rules gate whether the connector may be invoked at all;
/// post-completion rules judge the produced output before the task is
/// allowed to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStage {
    PreDispatch,
    PostCompletion,
}

/// Case-level rule, evaluated once at the start of a run.
#[derive(Clone)]
pub struct CasePolicy {
    pub name: String,
    pub predicate: CasePredicate,
    pub message: String,
}

/// Task-level rule.
#[derive(Clone)]
pub struct TaskPolicy {
    pub name: String,
    pub stage: PolicyStage,
    pub predicate: TaskPredicate,
    pub message: String,
}

/// Ordered set of named predicates over cases and tasks.
#[derive(Clone, Default)]
pub struct PolicyGate {
    case_rules: Vec<CasePolicy>,
    task_rules: Vec<TaskPolicy>,
}

impl PolicyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The baseline rule set: a case must carry a title, and an approved
    /// task must produce output before it may complete. Replaceable —
    /// start from `new()` to opt out.
    pub fn with_default_rules() -> Self {
        let mut gate = Self::new();
        gate.register_case_rule(
            "case-title-present",
            |case| !case.title.trim().is_empty(),
            "Case title is required.",
        );
        gate.register_task_rule(
            "outputs-after-approval",
            PolicyStage::PostCompletion,
            |_case, task| task.approved_by.is_none() || has_output(task),
            "Approved tasks must emit outputs before completion.",
        );
        gate
    }

    pub fn register_case_rule(
        &mut self,
        name: impl Into<String>,
        predicate: impl Fn(&Case) -> bool + Send + Sync + 'static,
        message: impl Into<String>,
    ) {
        self.case_rules.push(CasePolicy {
            name: name.into(),
            predicate: Arc::new(predicate),
            message: message.into(),
        });
    }

    pub fn register_task_rule(
        &mut self,
        name: impl Into<String>,
        stage: PolicyStage,
        predicate: impl Fn(&Case, &Task) -> bool + Send + Sync + 'static,
        message: impl Into<String>,
    ) {
        self.task_rules.push(TaskPolicy {
            name: name.into(),
            stage,
            predicate: Arc::new(predicate),
            message: message.into(),
        });
    }

    /// Run every case rule in registration order.
    pub fn evaluate_case(&self, case: &Case) -> Result<(), PolicyViolation> {
        for rule in &self.case_rules {
            if !(rule.predicate)(case) {
                return Err(PolicyViolation {
                    rule: rule.name.clone(),
                    message: rule.message.clone(),
                });
            }
        }
        Ok(())
    }

    /// Run every task rule for the given stage in registration order.
    pub fn evaluate_task(
        &self,
        case: &Case,
        task: &Task,
        stage: PolicyStage,
    ) -> Result<(), PolicyViolation> {
        for rule in self.task_rules.iter().filter(|r| r.stage == stage) {
            if !(rule.predicate)(case, task) {
                return Err(PolicyViolation {
                    rule: rule.name.clone(),
                    message: rule.message.clone(),
                });
            }
        }
        Ok(())
    }
}

fn has_output(task: &Task) -> bool {
    match &task.output {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Additional pluggable policy layer, distinct from [`PolicyGate`].
/// Evaluates a task-type/name/inputs triple to allow or deny dispatch.
#[async_trait]
pub trait PolicyChecker: Send + Sync {
    async fn check(&self, task_type: &str, task_name: &str, inputs: &Map<String, Value>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskDefinition;
    use serde_json::json;

    fn case() -> Case {
        Case::new("case-1", "Compromised mailbox")
    }

    fn task() -> Task {
        let def = TaskDefinition {
            task_type: "noop".into(),
            inputs: Map::new(),
            needs: vec![],
            approval_required: false,
            idempotency_key: None,
        };
        Task::from_definition("t", &def, "case-1")
    }

    #[test]
    fn default_case_rule_rejects_blank_title() {
        let gate = PolicyGate::with_default_rules();
        assert!(gate.evaluate_case(&case()).is_ok());

        let blank = Case::new("case-2", "   ");
        let violation = gate.evaluate_case(&blank).unwrap_err();
        assert_eq!(violation.rule, "case-title-present");
    }

    #[test]
    fn outputs_after_approval_only_bites_approved_tasks() {
        let gate = PolicyGate::with_default_rules();
        let case = case();

        // Unapproved task with no output: rule does not apply.
        let plain = task();
        assert!(gate
            .evaluate_task(&case, &plain, PolicyStage::PostCompletion)
            .is_ok());

        // Approved task with no output: denied.
        let mut approved = task();
        approved.mark_waiting_approval().unwrap();
        approved.mark_approved("alice").unwrap();
        let violation = gate
            .evaluate_task(&case, &approved, PolicyStage::PostCompletion)
            .unwrap_err();
        assert_eq!(violation.rule, "outputs-after-approval");

        // Approved task with output: allowed.
        approved.mark_running().unwrap();
        approved.mark_completed(json!({"rotated": true})).unwrap();
        assert!(gate
            .evaluate_task(&case, &approved, PolicyStage::PostCompletion)
            .is_ok());
    }

    #[test]
    fn rules_run_in_registration_order() {
        let mut gate = PolicyGate::new();
        gate.register_task_rule(
            "first",
            PolicyStage::PreDispatch,
            |_, _| false,
            "first denies",
        );
        gate.register_task_rule(
            "second",
            PolicyStage::PreDispatch,
            |_, _| false,
            "second denies",
        );

        let violation = gate
            .evaluate_task(&case(), &task(), PolicyStage::PreDispatch)
            .unwrap_err();
        assert_eq!(violation.rule, "first");
    }

    #[test]
    fn stages_are_independent() {
        let mut gate = PolicyGate::new();
        gate.register_task_rule(
            "post-only",
            PolicyStage::PostCompletion,
            |_, _| false,
            "denied",
        );
        assert!(gate
            .evaluate_task(&case(), &task(), PolicyStage::PreDispatch)
            .is_ok());
        assert!(gate
            .evaluate_task(&case(), &task(), PolicyStage::PostCompletion)
            .is_err());
    }

    #[test]
    fn empty_object_output_does_not_satisfy_approval_rule() {
        let gate = PolicyGate::with_default_rules();
        let mut approved = task();
        approved.mark_waiting_approval().unwrap();
        approved.mark_approved("bob").unwrap();
        approved.mark_running().unwrap();
        approved.mark_completed(json!({})).unwrap();
        assert!(gate
            .evaluate_task(&case(), &approved, PolicyStage::PostCompletion)
            .is_err());
    }
}
