//! Runtime data model: cases, tasks, and the task state machine.
//!
//! Tasks are owned and mutated exclusively by the engine; every status change
//! goes through a guarded `mark_*` transition. The ledger only ever receives
//! snapshots of these records, never live references.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::definition::TaskDefinition;
use crate::error::InvalidTransition;

/// Task execution lifecycle.
///
/// `Pending → Running → {Completed | Failed}` is the direct path;
/// approval-gated tasks detour through `WaitingApproval → Approved` before
/// running. `Skipped` (idempotency hit) and `Blocked` (policy denial or
/// missing connector) are terminal alternatives to running at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    WaitingApproval,
    Approved,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingApproval => "waiting_approval",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Blocked
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work materialized from a [`TaskDefinition`] for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub case_id: String,
    /// Name within the playbook, unique per run.
    pub name: String,
    /// Connector target, e.g. "rotate_credentials".
    pub task_type: String,
    pub needs: Vec<String>,
    pub approval_required: bool,
    pub idempotency_key: Option<String>,
    pub status: TaskStatus,
    /// Inputs after reference resolution; empty until resolution runs.
    #[serde(default)]
    pub resolved_inputs: Map<String, Value>,
    /// Set only by [`Task::mark_completed`].
    pub output: Option<Value>,
    /// Set only by [`Task::mark_failed`] / [`Task::mark_blocked`].
    pub error: Option<String>,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Materialize a pending task from its definition.
    pub fn from_definition(name: &str, definition: &TaskDefinition, case_id: &str) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            case_id: case_id.to_string(),
            name: name.to_string(),
            task_type: definition.task_type.clone(),
            needs: definition.needs.clone(),
            approval_required: definition.approval_required,
            idempotency_key: definition.idempotency_key.clone(),
            status: TaskStatus::Pending,
            resolved_inputs: Map::new(),
            output: None,
            error: None,
            approved_by: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, allowed: &[TaskStatus], to: TaskStatus) -> Result<(), InvalidTransition> {
        if !allowed.contains(&self.status) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Suspend the task pending an external approval.
    pub fn mark_waiting_approval(&mut self) -> Result<(), InvalidTransition> {
        self.transition(&[TaskStatus::Pending], TaskStatus::WaitingApproval)
    }

    /// Resume from suspension, recording the approver identity.
    pub fn mark_approved(&mut self, approver: &str) -> Result<(), InvalidTransition> {
        self.transition(&[TaskStatus::WaitingApproval], TaskStatus::Approved)?;
        self.approved_by = Some(approver.to_string());
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), InvalidTransition> {
        self.transition(
            &[TaskStatus::Pending, TaskStatus::Approved],
            TaskStatus::Running,
        )?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, output: Value) -> Result<(), InvalidTransition> {
        self.transition(&[TaskStatus::Running], TaskStatus::Completed)?;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(
            &[TaskStatus::Pending, TaskStatus::Running],
            TaskStatus::Failed,
        )?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Idempotency hit — the effect already happened in a previous run.
    pub fn mark_skipped(&mut self) -> Result<(), InvalidTransition> {
        self.transition(&[TaskStatus::Pending], TaskStatus::Skipped)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Policy denial or missing connector. Applies to pending and approved
    /// tasks (an approved task still faces the policy gate before dispatch).
    pub fn mark_blocked(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(
            &[TaskStatus::Pending, TaskStatus::Approved],
            TaskStatus::Blocked,
        )?;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Case lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

/// An investigation case — the context a playbook runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: CaseStatus,
    /// 1 = highest, 5 = lowest.
    pub priority: u8,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn new(case_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            case_id: case_id.into(),
            title: title.into(),
            description: String::new(),
            status: CaseStatus::Open,
            priority: 3,
            assignee: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn update_status(&mut self, status: CaseStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// The outcome of one playbook run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub case_id: String,
    pub playbook_id: String,
    /// Final task snapshots, keyed by task name.
    pub tasks: HashMap<String, Task>,
    /// Outputs of completed (and idempotently skipped) tasks.
    pub results: HashMap<String, Value>,
}
