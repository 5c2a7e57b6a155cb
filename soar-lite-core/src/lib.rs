//! soar-lite-core: incident-response playbook engine.
//!
//! This crate contains the orchestration and ledger core with NO transport
//! or vendor dependencies:
//! - Playbook definitions and the graph compiler (cycle detection, layering)
//! - The gated task state machine and its concurrent execution driver
//! - Policy guardrails (case and task rules, pluggable external checker)
//! - Idempotency records for cross-run deduplication
//! - The hash-chained, append-only audit ledger with external anchoring
//!
//! Concrete connectors (mailbox providers, identity providers, routers,
//! secret stores) live behind the [`connector::Connector`] seam, outside
//! this crate.

pub mod connector;
pub mod definition;
pub mod engine;
pub mod error;
pub mod graph;
pub mod idempotency;
pub mod ledger;
pub mod policy;
pub mod resolve;
pub mod types;

// Re-export the working surface.
pub use connector::{Connector, ConnectorRegistry};
pub use definition::{Playbook, PlaybookSource, StaticPlaybookSource, TaskDefinition};
pub use engine::{EngineConfig, ExecutionEngine};
pub use error::{
    CompileError, ConnectorError, EngineError, InvalidTransition, LedgerError, PolicyViolation,
    ResolveError,
};
pub use graph::compile_layers;
pub use idempotency::{IdempotencyRecord, IdempotencyStore, MemoryIdempotencyStore};
pub use ledger::{AnchorRecord, AuditEntry, AuditLedger, GENESIS_HASH};
pub use policy::{PolicyChecker, PolicyGate, PolicyStage};
pub use types::{Case, CaseStatus, RunResult, Task, TaskStatus};
