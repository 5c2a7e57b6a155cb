//! Error taxonomies for the playbook engine.
//!
//! Compilation errors are total — no partial plan escapes a failed compile.
//! Per-task errors (policy, connector, resolution) are captured into the Task
//! record and never abort sibling tasks; ledger errors are fatal to the run.

use thiserror::Error;

use crate::types::TaskStatus;

/// Graph compilation failures. Raised before any task executes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving task '{task}'")]
    CycleDetected { task: String },
}

/// A template reference that could not be resolved against prior task
/// outputs or context variables. Fails the task, not the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved reference '{{{{{reference}}}}}'")]
    UnresolvedReference { reference: String },
}

/// A policy rule denied execution. Carries the rule name and its
/// human-readable denial message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{rule}: {message}")]
pub struct PolicyViolation {
    pub rule: String,
    pub message: String,
}

/// Raised by connectors; the engine converts these into task failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("connector call failed: {0}")]
    Failed(String),
}

/// Invalid task state machine transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Ledger I/O and integrity-surface errors. Losing an audit entry voids the
/// non-repudiation guarantee, so callers treat these as fatal.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed ledger line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Engine-level errors surfaced to playbook-run and approval callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("case policy denied: {0}")]
    Policy(#[from] PolicyViolation),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("task '{task}' is not awaiting approval (status: {status})")]
    NotAwaitingApproval { task: String, status: TaskStatus },

    #[error("internal: {0}")]
    Internal(String),
}
