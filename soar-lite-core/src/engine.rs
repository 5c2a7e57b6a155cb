//! The playbook execution engine.
//!
//! Layers execute strictly in compiled order; tasks within a layer are
//! independent by construction and run concurrently behind a bounded
//! semaphore. A task awaiting approval suspends the task, not the engine:
//! it parks in WAITING_APPROVAL and resumes only through [`ExecutionEngine::approve`].
//! Every state transition is recorded in the audit ledger before the run
//! proceeds; a ledger write failure aborts the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connector::ConnectorRegistry;
use crate::definition::Playbook;
use crate::error::{ConnectorError, EngineError};
use crate::graph::compile_layers;
use crate::idempotency::{IdempotencyRecord, IdempotencyStore};
use crate::ledger::AuditLedger;
use crate::policy::{PolicyChecker, PolicyGate, PolicyStage};
use crate::resolve::resolve_inputs;
use crate::types::{Case, RunResult, Task, TaskStatus};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently dispatched tasks within a layer.
    pub max_parallel_tasks: usize,
    /// Optional per-connector-call deadline. `None` waits indefinitely,
    /// matching the source system's behavior.
    pub task_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 8,
            task_timeout: None,
        }
    }
}

/// Drives playbook tasks through the gated state machine, one layer at a
/// time. Owns the Task records for its run exclusively; the ledger only
/// ever sees snapshots.
pub struct ExecutionEngine {
    case: Case,
    registry: ConnectorRegistry,
    gate: PolicyGate,
    checker: Option<Arc<dyn PolicyChecker>>,
    idempotency: Arc<dyn IdempotencyStore>,
    ledger: Arc<AuditLedger>,
    config: EngineConfig,
    tasks: RwLock<HashMap<String, Task>>,
    results: RwLock<HashMap<String, Value>>,
}

impl ExecutionEngine {
    pub fn new(
        case: Case,
        registry: ConnectorRegistry,
        gate: PolicyGate,
        idempotency: Arc<dyn IdempotencyStore>,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        Self {
            case,
            registry,
            gate,
            checker: None,
            idempotency,
            ledger,
            config: EngineConfig::default(),
            tasks: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
        }
    }

    /// Attach an additional pluggable policy layer, evaluated after the
    /// gate's own pre-dispatch rules.
    pub fn with_policy_checker(mut self, checker: Arc<dyn PolicyChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn case(&self) -> &Case {
        &self.case
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    /// Execute a playbook against this engine's case.
    ///
    /// Compilation errors abort before any task executes. Per-task failures
    /// are captured into the Task record; siblings and unrelated branches
    /// continue. Tasks suspended for approval are left in WAITING_APPROVAL
    /// and show up in the returned snapshots.
    pub async fn run(
        &self,
        playbook: &Playbook,
        context: &Map<String, Value>,
        auto_approve: bool,
    ) -> Result<RunResult, EngineError> {
        info!(
            playbook = %playbook.playbook_id,
            case = %self.case.case_id,
            auto_approve,
            "starting playbook run"
        );
        self.ledger
            .append(
                "engine",
                "playbook_started",
                json!({"case_id": self.case.case_id, "playbook_id": playbook.playbook_id}),
            )
            .await?;

        if let Err(violation) = self.gate.evaluate_case(&self.case) {
            self.ledger
                .append(
                    "engine",
                    "policy_denied",
                    json!({
                        "case_id": self.case.case_id,
                        "rule": violation.rule,
                        "message": violation.message,
                    }),
                )
                .await?;
            return Err(EngineError::Policy(violation));
        }

        let layers = match compile_layers(&playbook.tasks) {
            Ok(layers) => {
                self.ledger
                    .append(
                        "engine",
                        "graph_compiled",
                        json!({"layers": layers.len(), "tasks": playbook.tasks.len()}),
                    )
                    .await?;
                layers
            }
            Err(e) => {
                self.ledger
                    .append("engine", "graph_rejected", json!({"error": e.to_string()}))
                    .await?;
                return Err(e.into());
            }
        };

        {
            let mut tasks = self.tasks.write().await;
            tasks.clear();
            self.results.write().await.clear();
            for (name, definition) in &playbook.tasks {
                let task = Task::from_definition(name, definition, &self.case.case_id);
                self.ledger
                    .append(
                        "engine",
                        "task_created",
                        json!({"task": name, "task_id": task.task_id, "type": task.task_type}),
                    )
                    .await?;
                tasks.insert(name.clone(), task);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tasks.max(1)));
        let context = Arc::new(context.clone());

        for (layer_idx, layer) in layers.iter().enumerate() {
            self.ledger
                .append(
                    "engine",
                    "layer_started",
                    json!({"layer": layer_idx, "tasks": layer}),
                )
                .await?;

            let statuses: Arc<HashMap<String, TaskStatus>> = Arc::new(
                self.tasks
                    .read()
                    .await
                    .iter()
                    .map(|(name, task)| (name.clone(), task.status))
                    .collect(),
            );
            let results: Arc<HashMap<String, Value>> =
                Arc::new(self.results.read().await.clone());

            let mut workers = JoinSet::new();
            for name in layer {
                let task = self
                    .tasks
                    .read()
                    .await
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EngineError::TaskNotFound(name.clone()))?;
                let definition = playbook
                    .tasks
                    .get(name)
                    .ok_or_else(|| EngineError::TaskNotFound(name.clone()))?;

                workers.spawn(execute_task(TaskContext {
                    task,
                    inputs: definition.inputs.clone(),
                    case: self.case.clone(),
                    registry: self.registry.clone(),
                    gate: self.gate.clone(),
                    checker: self.checker.clone(),
                    idempotency: Arc::clone(&self.idempotency),
                    ledger: Arc::clone(&self.ledger),
                    statuses: Arc::clone(&statuses),
                    results: Arc::clone(&results),
                    context: Arc::clone(&context),
                    timeout: self.config.task_timeout,
                    auto_approve,
                    semaphore: Arc::clone(&semaphore),
                }));
            }

            while let Some(joined) = workers.join_next().await {
                let (task, output) =
                    joined.map_err(|e| EngineError::Internal(e.to_string()))??;
                if let Some(output) = &output {
                    self.results
                        .write()
                        .await
                        .insert(task.name.clone(), output.clone());
                }
                self.tasks.write().await.insert(task.name.clone(), task);
            }

            self.ledger
                .append("engine", "layer_completed", json!({"layer": layer_idx}))
                .await?;
        }

        self.ledger
            .append(
                "engine",
                "playbook_completed",
                json!({"case_id": self.case.case_id, "playbook_id": playbook.playbook_id}),
            )
            .await?;
        info!(playbook = %playbook.playbook_id, case = %self.case.case_id, "playbook run finished");

        Ok(RunResult {
            case_id: self.case.case_id.clone(),
            playbook_id: playbook.playbook_id.clone(),
            tasks: self.tasks.read().await.clone(),
            results: self.results.read().await.clone(),
        })
    }

    /// Resume a task suspended in WAITING_APPROVAL: record the approver,
    /// then run the policy gate, dispatch, and completion synchronously.
    pub async fn approve(&self, task_name: &str, approver: &str) -> Result<Task, EngineError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_name)
                .ok_or_else(|| EngineError::TaskNotFound(task_name.to_string()))?;
            if task.status != TaskStatus::WaitingApproval {
                return Err(EngineError::NotAwaitingApproval {
                    task: task_name.to_string(),
                    status: task.status,
                });
            }
            task.mark_approved(approver)?;
            task.clone()
        };

        self.ledger
            .append(
                approver,
                "task_approved",
                json!({"task": task_name, "approved_by": approver}),
            )
            .await?;
        info!(task = %task_name, approver, "task approved");

        let (task, output) = execute_gated(
            task,
            &self.case,
            &self.registry,
            &self.gate,
            self.checker.as_ref(),
            &self.idempotency,
            &self.ledger,
            self.config.task_timeout,
        )
        .await?;

        if let Some(output) = &output {
            self.results
                .write()
                .await
                .insert(task.name.clone(), output.clone());
        }
        self.tasks
            .write()
            .await
            .insert(task.name.clone(), task.clone());
        Ok(task)
    }

    pub async fn status(&self, task_name: &str) -> Result<TaskStatus, EngineError> {
        self.tasks
            .read()
            .await
            .get(task_name)
            .map(|task| task.status)
            .ok_or_else(|| EngineError::TaskNotFound(task_name.to_string()))
    }

    /// Snapshots of all tasks currently in `status`, name-sorted.
    pub async fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }
}

/// Everything one task worker needs, cloned out of the engine so workers
/// are independent of the engine's own locks while they run.
struct TaskContext {
    task: Task,
    inputs: Map<String, Value>,
    case: Case,
    registry: ConnectorRegistry,
    gate: PolicyGate,
    checker: Option<Arc<dyn PolicyChecker>>,
    idempotency: Arc<dyn IdempotencyStore>,
    ledger: Arc<AuditLedger>,
    statuses: Arc<HashMap<String, TaskStatus>>,
    results: Arc<HashMap<String, Value>>,
    context: Arc<Map<String, Value>>,
    timeout: Option<Duration>,
    auto_approve: bool,
    semaphore: Arc<Semaphore>,
}

/// One task through the full gate sequence. Returns the final task snapshot
/// and, when it completed (or skipped onto a cached result), the output to
/// publish for later layers.
async fn execute_task(ctx: TaskContext) -> Result<(Task, Option<Value>), EngineError> {
    let TaskContext {
        mut task,
        inputs,
        case,
        registry,
        gate,
        checker,
        idempotency,
        ledger,
        statuses,
        results,
        context,
        timeout,
        auto_approve,
        semaphore,
    } = ctx;

    let _permit = semaphore
        .acquire()
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    // Upstream gate: a dependency that terminated without completing blocks
    // this task; a dependency still suspended leaves it pending.
    for dep in task.needs.clone() {
        match statuses.get(&dep) {
            Some(TaskStatus::Failed | TaskStatus::Blocked) => {
                let reason = format!("upstream task '{dep}' did not complete");
                task.mark_blocked(&reason)?;
                ledger
                    .append(
                        "engine",
                        "task_blocked",
                        json!({"task": task.name, "reason": reason}),
                    )
                    .await?;
                return Ok((task, None));
            }
            Some(
                TaskStatus::Pending
                | TaskStatus::WaitingApproval
                | TaskStatus::Approved
                | TaskStatus::Running,
            ) => {
                debug!(task = %task.name, upstream = %dep, "deferred until upstream resolves");
                return Ok((task, None));
            }
            Some(TaskStatus::Completed | TaskStatus::Skipped) | None => {}
        }
    }

    // Idempotency: the effect already happened in a previous run. The cached
    // output still feeds dependents.
    if let Some(key) = task.idempotency_key.clone() {
        if let Some(record) = idempotency.get(&key).await {
            task.mark_skipped()?;
            ledger
                .append(
                    "engine",
                    "task_skipped_idempotent",
                    json!({"task": task.name, "key": key, "original_task_id": record.task_id}),
                )
                .await?;
            return Ok((task, Some(record.output)));
        }
    }

    // Input resolution. Unresolved references are definition bugs and fail
    // the task before any connector is touched.
    match resolve_inputs(&inputs, &context, &results) {
        Ok(resolved) => task.resolved_inputs = resolved,
        Err(e) => {
            let message = e.to_string();
            task.mark_failed(&message)?;
            ledger
                .append(
                    "engine",
                    "task_failed",
                    json!({"task": task.name, "error": message}),
                )
                .await?;
            return Ok((task, None));
        }
    }

    // Approval gate: suspend the task, not the engine.
    if task.approval_required && !auto_approve {
        task.mark_waiting_approval()?;
        ledger
            .append(
                "engine",
                "task_waiting_approval",
                json!({"task": task.name}),
            )
            .await?;
        return Ok((task, None));
    }

    execute_gated(
        task,
        &case,
        &registry,
        &gate,
        checker.as_ref(),
        &idempotency,
        &ledger,
        timeout,
    )
    .await
}

/// Steps shared by the normal path and the approval resumption path:
/// policy gate, dispatch, completion.
#[allow(clippy::too_many_arguments)]
async fn execute_gated(
    mut task: Task,
    case: &Case,
    registry: &ConnectorRegistry,
    gate: &PolicyGate,
    checker: Option<&Arc<dyn PolicyChecker>>,
    idempotency: &Arc<dyn IdempotencyStore>,
    ledger: &AuditLedger,
    timeout: Option<Duration>,
) -> Result<(Task, Option<Value>), EngineError> {
    if let Err(violation) = gate.evaluate_task(case, &task, PolicyStage::PreDispatch) {
        task.mark_blocked(violation.to_string())?;
        ledger
            .append(
                "engine",
                "task_blocked",
                json!({"task": task.name, "rule": violation.rule, "message": violation.message}),
            )
            .await?;
        return Ok((task, None));
    }

    if let Some(checker) = checker {
        if !checker
            .check(&task.task_type, &task.name, &task.resolved_inputs)
            .await
        {
            let reason = "external policy checker denied execution".to_string();
            task.mark_blocked(&reason)?;
            ledger
                .append(
                    "engine",
                    "task_blocked",
                    json!({"task": task.name, "reason": reason}),
                )
                .await?;
            return Ok((task, None));
        }
    }

    let Some(connector) = registry.get(&task.task_type) else {
        let reason = format!("no connector registered for task type '{}'", task.task_type);
        task.mark_blocked(&reason)?;
        ledger
            .append(
                "engine",
                "task_blocked",
                json!({"task": task.name, "reason": reason}),
            )
            .await?;
        return Ok((task, None));
    };

    task.mark_running()?;
    ledger
        .append(
            "engine",
            "task_started",
            json!({"task": task.name, "type": task.task_type}),
        )
        .await?;

    let call = connector.call(&task.task_type, &task.resolved_inputs);
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Failed(format!(
                "timed out after {}ms",
                limit.as_millis()
            ))),
        },
        None => call.await,
    };

    let output = match outcome {
        Ok(output) => output,
        Err(e) => {
            let message = e.to_string();
            warn!(task = %task.name, error = %message, "connector failed");
            task.mark_failed(&message)?;
            ledger
                .append(
                    "engine",
                    "task_failed",
                    json!({"task": task.name, "error": message}),
                )
                .await?;
            return Ok((task, None));
        }
    };

    // Post-dispatch rules judge the produced output before completion. The
    // preview carries the candidate output; the real record only gains it
    // through mark_completed.
    let mut preview = task.clone();
    preview.output = Some(output.clone());
    if let Err(violation) = gate.evaluate_task(case, &preview, PolicyStage::PostCompletion) {
        task.mark_failed(violation.to_string())?;
        ledger
            .append(
                "engine",
                "task_failed",
                json!({"task": task.name, "rule": violation.rule, "message": violation.message}),
            )
            .await?;
        return Ok((task, None));
    }

    task.mark_completed(output.clone())?;
    if let Some(key) = task.idempotency_key.clone() {
        idempotency
            .put(
                &key,
                IdempotencyRecord {
                    task_id: task.task_id,
                    task_name: task.name.clone(),
                    output: output.clone(),
                    completed_at: task.completed_at.unwrap_or_else(Utc::now),
                },
            )
            .await;
    }
    ledger
        .append("engine", "task_completed", json!({"task": task.name}))
        .await?;
    debug!(task = %task.name, "task completed");

    Ok((task, Some(output)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use crate::definition::TaskDefinition;
    use crate::idempotency::MemoryIdempotencyStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnector {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn call(
            &self,
            operation: &str,
            payload: &Map<String, Value>,
        ) -> Result<Value, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"operation": operation, "echo": payload}))
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn call(
            &self,
            _operation: &str,
            _payload: &Map<String, Value>,
        ) -> Result<Value, ConnectorError> {
            Err(ConnectorError::Failed("simulated outage".into()))
        }
    }

    fn definition(task_type: &str, needs: &[&str]) -> TaskDefinition {
        TaskDefinition {
            task_type: task_type.into(),
            inputs: Map::new(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            approval_required: false,
            idempotency_key: None,
        }
    }

    async fn engine_with(registry: ConnectorRegistry, dir: &tempfile::TempDir) -> ExecutionEngine {
        let ledger = Arc::new(AuditLedger::open(dir.path(), "case-t").await.unwrap());
        ExecutionEngine::new(
            Case::new("case-t", "Unit test case"),
            registry,
            PolicyGate::with_default_rules(),
            Arc::new(MemoryIdempotencyStore::new()),
            ledger,
        )
    }

    #[tokio::test]
    async fn failed_upstream_blocks_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectorRegistry::new();
        registry.register("breaks", Arc::new(FailingConnector));
        registry.register(
            "works",
            Arc::new(CountingConnector {
                calls: Arc::clone(&calls),
            }),
        );

        let playbook = Playbook::new("p")
            .with_task("first", definition("breaks", &[]))
            .with_task("second", definition("works", &["first"]));

        let engine = engine_with(registry, &dir).await;
        let result = engine.run(&playbook, &Map::new(), false).await.unwrap();

        assert_eq!(result.tasks["first"].status, TaskStatus::Failed);
        assert_eq!(result.tasks["second"].status, TaskStatus::Blocked);
        assert!(result.tasks["second"]
            .error
            .as_deref()
            .unwrap()
            .contains("first"));
        // The dependent's connector never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolved_reference_fails_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectorRegistry::new();
        registry.register(
            "works",
            Arc::new(CountingConnector {
                calls: Arc::clone(&calls),
            }),
        );

        let mut def = definition("works", &[]);
        def.inputs
            .insert("x".into(), json!("{{nobody.output.field}}"));
        let playbook = Playbook::new("p").with_task("only", def);

        let engine = engine_with(registry, &dir).await;
        let result = engine.run(&playbook, &Map::new(), false).await.unwrap();

        assert_eq!(result.tasks["only"].status, TaskStatus::Failed);
        assert!(result.tasks["only"]
            .error
            .as_deref()
            .unwrap()
            .contains("unresolved reference"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_connector_blocks_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let playbook = Playbook::new("p").with_task("orphan", definition("no_such_type", &[]));

        let engine = engine_with(ConnectorRegistry::new(), &dir).await;
        let result = engine.run(&playbook, &Map::new(), false).await.unwrap();
        assert_eq!(result.tasks["orphan"].status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn external_checker_denies_before_dispatch() {
        struct DenyAll;
        #[async_trait]
        impl PolicyChecker for DenyAll {
            async fn check(&self, _: &str, _: &str, _: &Map<String, Value>) -> bool {
                false
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectorRegistry::new();
        registry.register(
            "works",
            Arc::new(CountingConnector {
                calls: Arc::clone(&calls),
            }),
        );
        let playbook = Playbook::new("p").with_task("t", definition("works", &[]));

        let engine = engine_with(registry, &dir)
            .await
            .with_policy_checker(Arc::new(DenyAll));
        let result = engine.run(&playbook, &Map::new(), false).await.unwrap();

        assert_eq!(result.tasks["t"].status, TaskStatus::Blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_case_title_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(AuditLedger::open(dir.path(), "case-b").await.unwrap());
        let engine = ExecutionEngine::new(
            Case::new("case-b", "  "),
            ConnectorRegistry::new(),
            PolicyGate::with_default_rules(),
            Arc::new(MemoryIdempotencyStore::new()),
            ledger,
        );

        let playbook = Playbook::new("p").with_task("t", definition("x", &[]));
        let err = engine.run(&playbook, &Map::new(), false).await.unwrap_err();
        assert!(matches!(err, EngineError::Policy(_)));
        assert!(engine.tasks_by_status(TaskStatus::Pending).await.is_empty());
    }

    #[tokio::test]
    async fn compile_error_aborts_before_any_task_exists() {
        let dir = tempfile::tempdir().unwrap();
        let playbook = Playbook::new("p")
            .with_task("a", definition("x", &["b"]))
            .with_task("b", definition("x", &["a"]));

        let engine = engine_with(ConnectorRegistry::new(), &dir).await;
        let err = engine.run(&playbook, &Map::new(), false).await.unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
        assert!(engine.status("a").await.is_err());
    }

    #[tokio::test]
    async fn approve_rejects_tasks_not_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ConnectorRegistry::new();
        registry.register(
            "works",
            Arc::new(CountingConnector {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let playbook = Playbook::new("p").with_task("t", definition("works", &[]));

        let engine = engine_with(registry, &dir).await;
        engine.run(&playbook, &Map::new(), false).await.unwrap();

        let err = engine.approve("t", "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::NotAwaitingApproval { .. }));
        assert!(matches!(
            engine.approve("ghost", "alice").await.unwrap_err(),
            EngineError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn post_completion_violation_fails_after_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectorRegistry::new();
        registry.register(
            "works",
            Arc::new(CountingConnector {
                calls: Arc::clone(&calls),
            }),
        );

        let mut gate = PolicyGate::new();
        gate.register_task_rule(
            "reject-all-output",
            PolicyStage::PostCompletion,
            |_, task| task.output.is_none(),
            "Produced output was rejected.",
        );

        let ledger = Arc::new(AuditLedger::open(dir.path(), "case-post").await.unwrap());
        let engine = ExecutionEngine::new(
            Case::new("case-post", "Post-completion gating"),
            registry,
            gate,
            Arc::new(MemoryIdempotencyStore::new()),
            ledger,
        );

        let playbook = Playbook::new("p").with_task("t", definition("works", &[]));
        let result = engine.run(&playbook, &Map::new(), true).await.unwrap();

        // The connector ran, but the output was rejected before completion.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.tasks["t"].status, TaskStatus::Failed);
        assert!(result.tasks["t"]
            .error
            .as_deref()
            .unwrap()
            .contains("reject-all-output"));
        assert!(result.tasks["t"].output.is_none());
    }

    #[tokio::test]
    async fn connector_timeout_fails_the_task() {
        struct Stalls;
        #[async_trait]
        impl Connector for Stalls {
            async fn call(
                &self,
                _operation: &str,
                _payload: &Map<String, Value>,
            ) -> Result<Value, ConnectorError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut registry = ConnectorRegistry::new();
        registry.register("slow", Arc::new(Stalls));
        let playbook = Playbook::new("p").with_task("t", definition("slow", &[]));

        let engine = engine_with(registry, &dir).await.with_config(EngineConfig {
            max_parallel_tasks: 4,
            task_timeout: Some(Duration::from_millis(50)),
        });
        let result = engine.run(&playbook, &Map::new(), false).await.unwrap();

        assert_eq!(result.tasks["t"].status, TaskStatus::Failed);
        assert!(result.tasks["t"].error.as_deref().unwrap().contains("timed out"));
    }
}
