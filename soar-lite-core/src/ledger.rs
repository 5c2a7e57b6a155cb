//! Tamper-evident, append-only audit ledger.
//!
//! Every entry hashes the canonical serialization of its own fields together
//! with the previous entry's hash, so the tip hash summarizes the entire
//! history: mutating any stored field invalidates every subsequent hash on
//! recompute. Appends are serialized behind one lock and use true
//! append-only I/O with a resident tail (last hash + next index) — the file
//! is never re-read on the write path.
//!
//! On-disk layout, one entry per line:
//! `{canonical json} {64-char lowercase hex sha256}`
//! Anchors live in a sidecar `<ledger>.anchors` file, one JSON record per
//! line, in creation order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LedgerError;

/// Parent hash of the first entry: 64 ASCII zeros.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub details: Value,
    pub parent_hash: String,
    pub hash: String,
}

/// A snapshot binding the chain tip to an external non-repudiation
/// mechanism (timestamp authority, public ledger, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub ledger_id: String,
    pub latest_hash: String,
    pub timestamp: DateTime<Utc>,
    pub anchor_data: Value,
}

struct LedgerInner {
    file: File,
    anchor_file: File,
    entries: Vec<AuditEntry>,
    anchors: Vec<AnchorRecord>,
    last_hash: String,
    next_index: u64,
}

/// Append-only hash-chained event log with independent verification.
pub struct AuditLedger {
    ledger_id: String,
    path: PathBuf,
    inner: Mutex<LedgerInner>,
}

impl AuditLedger {
    /// Open (or create) the ledger for `ledger_id` under `dir`, recovering
    /// the chain tail from the last persisted line.
    pub async fn open(dir: impl AsRef<Path>, ledger_id: &str) -> Result<Self, LedgerError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{ledger_id}.log"));
        let anchor_path = dir.join(format!("{ledger_id}.anchors"));

        let mut entries = Vec::new();
        let mut last_hash = GENESIS_HASH.to_string();
        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry = parse_line(line, lineno + 1)?;
                last_hash = entry.hash.clone();
                entries.push(entry);
            }
        }
        let next_index = entries.len() as u64;

        let mut anchors = Vec::new();
        if tokio::fs::try_exists(&anchor_path).await? {
            let raw = tokio::fs::read_to_string(&anchor_path).await?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: AnchorRecord =
                    serde_json::from_str(line).map_err(|e| LedgerError::Malformed {
                        line: lineno + 1,
                        reason: format!("bad anchor record: {e}"),
                    })?;
                anchors.push(record);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let anchor_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&anchor_path)
            .await?;

        Ok(Self {
            ledger_id: ledger_id.to_string(),
            path,
            inner: Mutex::new(LedgerInner {
                file,
                anchor_file,
                entries,
                anchors,
                last_hash,
                next_index,
            }),
        })
    }

    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    /// Append an entry. The entry is durable on disk before this returns;
    /// a write failure here must be treated as fatal by the caller.
    pub async fn append(
        &self,
        actor: &str,
        action: &str,
        details: Value,
    ) -> Result<AuditEntry, LedgerError> {
        let mut inner = self.inner.lock().await;

        let timestamp = Utc::now();
        let payload = json!({
            "action": action,
            "actor": actor,
            "details": details,
            "index": inner.next_index,
            "parent_hash": inner.last_hash,
            "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        });
        let canonical = serde_json::to_string(&payload)?;
        let hash = sha256_hex(canonical.as_bytes());

        inner
            .file
            .write_all(format!("{canonical} {hash}\n").as_bytes())
            .await?;
        inner.file.flush().await?;

        let entry = AuditEntry {
            index: inner.next_index,
            timestamp,
            actor: actor.to_string(),
            action: action.to_string(),
            details,
            parent_hash: inner.last_hash.clone(),
            hash: hash.clone(),
        };
        inner.last_hash = hash;
        inner.next_index += 1;
        inner.entries.push(entry.clone());

        debug!(ledger = %self.ledger_id, index = entry.index, action, "audit entry appended");
        Ok(entry)
    }

    /// Recompute every entry's hash from the persisted file and confirm the
    /// parent links. An empty (or absent) ledger verifies as true. Never
    /// repairs anything.
    pub async fn verify_chain(&self) -> Result<bool, LedgerError> {
        // Hold the lock so a concurrent append cannot land mid-read.
        let _inner = self.inner.lock().await;

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        let mut expected_parent = GENESIS_HASH.to_string();
        let mut expected_index = 0u64;
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((json_part, stored_hash)) = line.rsplit_once(' ') else {
                return Err(LedgerError::Malformed {
                    line: lineno + 1,
                    reason: "missing hash separator".into(),
                });
            };
            let value: Value = serde_json::from_str(json_part).map_err(|e| {
                LedgerError::Malformed {
                    line: lineno + 1,
                    reason: format!("bad entry json: {e}"),
                }
            })?;

            let canonical = serde_json::to_string(&value)?;
            if sha256_hex(canonical.as_bytes()) != stored_hash {
                warn!(ledger = %self.ledger_id, line = lineno + 1, "entry hash mismatch");
                return Ok(false);
            }

            let parent = value.get("parent_hash").and_then(Value::as_str);
            if parent != Some(expected_parent.as_str()) {
                warn!(ledger = %self.ledger_id, line = lineno + 1, "parent hash mismatch");
                return Ok(false);
            }

            if value.get("index").and_then(Value::as_u64) != Some(expected_index) {
                warn!(ledger = %self.ledger_id, line = lineno + 1, "index out of sequence");
                return Ok(false);
            }

            expected_parent = stored_hash.to_string();
            expected_index += 1;
        }
        Ok(true)
    }

    /// Current chain tip, or the genesis value if the ledger is empty.
    pub async fn latest_hash(&self) -> String {
        self.inner.lock().await.last_hash.clone()
    }

    /// Ordered entries; `limit` keeps only the most recent N.
    pub async fn entries(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        let inner = self.inner.lock().await;
        match limit {
            Some(n) if n < inner.entries.len() => {
                inner.entries[inner.entries.len() - n..].to_vec()
            }
            _ => inner.entries.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Merkle root over the entry hashes, for batch attestation of a chain
    /// segment. The last leaf is duplicated when the count is odd.
    pub async fn merkle_root(&self) -> String {
        let inner = self.inner.lock().await;
        let mut layer: Vec<String> = inner.entries.iter().map(|e| e.hash.clone()).collect();
        drop(inner);

        if layer.is_empty() {
            return sha256_hex(b"");
        }
        while layer.len() > 1 {
            if layer.len() % 2 == 1 {
                layer.push(layer[layer.len() - 1].clone());
            }
            layer = layer
                .chunks(2)
                .map(|pair| sha256_hex(format!("{}{}", pair[0], pair[1]).as_bytes()))
                .collect();
        }
        layer.swap_remove(0)
    }

    /// Bind the current chain tip to external evidence. Anchors accumulate
    /// and are returned in creation order by [`AuditLedger::anchors`].
    pub async fn anchor(&self, anchor_data: Value) -> Result<AnchorRecord, LedgerError> {
        let mut inner = self.inner.lock().await;
        let record = AnchorRecord {
            ledger_id: self.ledger_id.clone(),
            latest_hash: inner.last_hash.clone(),
            timestamp: Utc::now(),
            anchor_data,
        };
        let line = serde_json::to_string(&record)?;
        inner
            .anchor_file
            .write_all(format!("{line}\n").as_bytes())
            .await?;
        inner.anchor_file.flush().await?;
        inner.anchors.push(record.clone());

        debug!(ledger = %self.ledger_id, tip = %record.latest_hash, "chain tip anchored");
        Ok(record)
    }

    pub async fn anchors(&self) -> Vec<AnchorRecord> {
        self.inner.lock().await.anchors.clone()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn parse_line(line: &str, lineno: usize) -> Result<AuditEntry, LedgerError> {
    let malformed = |reason: String| LedgerError::Malformed {
        line: lineno,
        reason,
    };

    let (json_part, hash) = line
        .rsplit_once(' ')
        .ok_or_else(|| malformed("missing hash separator".into()))?;
    if hash.len() != 64 {
        return Err(malformed(format!("hash is {} chars, expected 64", hash.len())));
    }
    let value: Value =
        serde_json::from_str(json_part).map_err(|e| malformed(format!("bad entry json: {e}")))?;

    let field_str = |name: &str| -> Result<String, LedgerError> {
        value
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed(format!("missing field '{name}'")))
    };

    let index = value
        .get("index")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing field 'index'".into()))?;
    let timestamp = DateTime::parse_from_rfc3339(&field_str("timestamp")?)
        .map_err(|e| malformed(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(AuditEntry {
        index,
        timestamp,
        actor: field_str("actor")?,
        action: field_str("action")?,
        details: value.get("details").cloned().unwrap_or(Value::Null),
        parent_hash: field_str("parent_hash")?,
        hash: hash.to_string(),
    })
}
