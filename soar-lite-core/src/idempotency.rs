//! Idempotency records: key → completed-task result.
//!
//! Records are created on first successful completion of a task carrying a
//! key, consulted before any later attempt with the same key, and never
//! mutated. The store may be shared across engine instances for cross-run
//! deduplication, so implementations must tolerate concurrent read/insert.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The cached outcome of a previously completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub task_id: Uuid,
    pub task_name: String,
    pub output: Value,
    pub completed_at: DateTime<Utc>,
}

/// Key → record store. Insert-only: a racing double-insert keeps the first
/// record, and both callers observe the key as present afterward.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn contains(&self, key: &str) -> bool;
    async fn get(&self, key: &str) -> Option<IdempotencyRecord>;
    async fn put(&self, key: &str, record: IdempotencyRecord);
}

/// In-memory store for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn contains(&self, key: &str) -> bool {
        self.records.read().await.contains_key(key)
    }

    async fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) {
        self.records
            .write()
            .await
            .entry(key.to_string())
            .or_insert(record);
    }
}
