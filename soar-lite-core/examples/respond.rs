//! Demo: wire a connector registry, run a containment playbook with one
//! approval-gated task, approve it, then verify and anchor the ledger.
//!
//! Run with: cargo run -p soar-lite-core --example respond

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use soar_lite_core::{
    AuditLedger, Case, Connector, ConnectorError, ConnectorRegistry, ExecutionEngine,
    MemoryIdempotencyStore, Playbook, PolicyGate, TaskStatus,
};

/// Stand-in for a real mailbox/identity connector.
struct DemoConnector;

#[async_trait]
impl Connector for DemoConnector {
    async fn call(
        &self,
        operation: &str,
        payload: &Map<String, Value>,
    ) -> Result<Value, ConnectorError> {
        println!("  -> connector: {operation} {}", Value::Object(payload.clone()));
        Ok(json!({"operation": operation, "status": "ok"}))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let playbook = Playbook::from_yaml_str(
        r#"
playbook_id: mailbox_containment
tasks:
  snapshot:
    type: take_snapshot
    inputs:
      mailbox: "{{mailbox}}"
  list_filters:
    type: list_filters
    needs: [snapshot]
    inputs:
      mailbox: "{{mailbox}}"
  rotate:
    type: rotate_credentials
    needs: [snapshot]
    approval_required: true
    inputs:
      evidence: "{{snapshot.output.status}}"
"#,
    )?;

    let mut registry = ConnectorRegistry::new();
    for task_type in ["take_snapshot", "list_filters", "rotate_credentials"] {
        registry.register(task_type, Arc::new(DemoConnector));
    }

    let ledger = Arc::new(AuditLedger::open("var/audit", "demo-case").await?);
    let engine = ExecutionEngine::new(
        Case::new("demo-case", "Suspicious forwarding rules").with_assignee("analyst@example.com"),
        registry,
        PolicyGate::with_default_rules(),
        Arc::new(MemoryIdempotencyStore::new()),
        ledger,
    );

    let mut context = Map::new();
    context.insert("mailbox".into(), json!("victim@example.com"));

    println!("running playbook (rotate requires approval)...");
    let result = engine.run(&playbook, &context, false).await?;
    for (name, task) in &result.tasks {
        println!("  {name}: {}", task.status);
    }

    if engine.status("rotate").await? == TaskStatus::WaitingApproval {
        println!("approving 'rotate' as alice...");
        let approved = engine.approve("rotate", "alice").await?;
        println!("  rotate: {} (approved by {:?})", approved.status, approved.approved_by);
    }

    let ledger = engine.ledger();
    println!("ledger entries: {}", ledger.len().await);
    println!("chain verifies: {}", ledger.verify_chain().await?);
    let anchor = ledger.anchor(json!({"authority": "demo-tsa"})).await?;
    println!("anchored tip: {}", anchor.latest_hash);

    Ok(())
}
