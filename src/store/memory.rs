// In-memory store backend - tables behind a mutex plus an append-only call log
// Primary backend for tests; the call log is how zero-write guarantees get
// asserted.

use crate::error::{PipelineResult, SaveError};
use crate::metadata::MetadataRegistry;
use crate::store::{StoreAction, StoreAdapter, StoreSession};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One observed call against the store, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    BeginTransaction,
    AssignKey(String),
    ConcurrencyRead { entity_type: String, key: Value },
    Apply { entity_type: String, action: StoreAction },
    Commit,
    Rollback,
}

#[derive(Debug, Default)]
struct MemoryInner {
    // entity type -> encoded key -> row
    tables: HashMap<String, HashMap<String, HashMap<String, Value>>>,
    sequences: HashMap<String, i64>,
    calls: Vec<StoreCall>,
}

struct MemorySession {
    staged: Vec<StagedOp>,
}

enum StagedOp {
    Upsert {
        entity_type: String,
        key: String,
        row: HashMap<String, Value>,
    },
    Remove {
        entity_type: String,
        key: String,
    },
}

impl StoreSession for MemorySession {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Mutex-guarded in-memory backend with per-type key sequences.
pub struct MemoryStore {
    registry: Arc<MetadataRegistry>,
    inner: Mutex<MemoryInner>,
}

fn key_str(key: &Value) -> String {
    key.to_string()
}

impl MemoryStore {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Start the key sequence for a type at a given value. Handy for tests
    /// that assert concrete assigned keys.
    pub fn with_sequence_start(self, entity_type: &str, start: i64) -> Self {
        self.lock().sequences.insert(entity_type.to_string(), start);
        self
    }

    /// Insert a committed row directly, bypassing the transaction surface.
    pub fn seed_row(&self, entity_type: &str, key: Value, row: HashMap<String, Value>) {
        self.lock()
            .tables
            .entry(entity_type.to_string())
            .or_default()
            .insert(key_str(&key), row);
    }

    /// Committed row image, if present.
    pub fn row(&self, entity_type: &str, key: &Value) -> Option<HashMap<String, Value>> {
        self.lock()
            .tables
            .get(entity_type)
            .and_then(|t| t.get(&key_str(key)))
            .cloned()
    }

    pub fn row_count(&self, entity_type: &str) -> usize {
        self.lock().tables.get(entity_type).map_or(0, |t| t.len())
    }

    /// Snapshot of every store call made so far.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    fn session_mut<'a>(session: &'a mut dyn StoreSession) -> PipelineResult<&'a mut MemorySession> {
        session
            .as_any()
            .downcast_mut::<MemorySession>()
            .ok_or_else(|| SaveError::Store(anyhow::anyhow!("session belongs to another store")))
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn begin_transaction(&self) -> PipelineResult<Box<dyn StoreSession>> {
        self.lock().calls.push(StoreCall::BeginTransaction);
        Ok(Box::new(MemorySession { staged: Vec::new() }))
    }

    async fn commit(&self, session: Box<dyn StoreSession>) -> PipelineResult<()> {
        let session = session
            .into_any()
            .downcast::<MemorySession>()
            .map_err(|_| SaveError::Store(anyhow::anyhow!("session belongs to another store")))?;
        let mut inner = self.lock();
        for op in session.staged {
            match op {
                StagedOp::Upsert {
                    entity_type,
                    key,
                    row,
                } => {
                    inner.tables.entry(entity_type).or_default().insert(key, row);
                }
                StagedOp::Remove { entity_type, key } => {
                    if let Some(table) = inner.tables.get_mut(&entity_type) {
                        table.remove(&key);
                    }
                }
            }
        }
        inner.calls.push(StoreCall::Commit);
        Ok(())
    }

    async fn rollback(&self, _session: Box<dyn StoreSession>) -> PipelineResult<()> {
        self.lock().calls.push(StoreCall::Rollback);
        Ok(())
    }

    async fn assign_key(&self, entity_type: &str) -> PipelineResult<Value> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::AssignKey(entity_type.to_string()));
        let next = inner.sequences.entry(entity_type.to_string()).or_insert(1);
        let key = *next;
        *next += 1;
        Ok(Value::from(key))
    }

    async fn current_concurrency_value(
        &self,
        _session: &mut dyn StoreSession,
        entity_type: &str,
        key: &Value,
        field: &str,
    ) -> PipelineResult<Option<Value>> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::ConcurrencyRead {
            entity_type: entity_type.to_string(),
            key: key.clone(),
        });
        Ok(inner
            .tables
            .get(entity_type)
            .and_then(|t| t.get(&key_str(key)))
            .and_then(|row| row.get(field))
            .cloned())
    }

    async fn apply(
        &self,
        session: &mut dyn StoreSession,
        entity_type: &str,
        action: StoreAction,
        key: &Value,
        values: &HashMap<String, Value>,
    ) -> PipelineResult<HashMap<String, Value>> {
        let concurrency_field = self
            .registry
            .get(entity_type)
            .and_then(|meta| meta.concurrency_field.clone());
        let committed = self.row(entity_type, key);

        self.lock().calls.push(StoreCall::Apply {
            entity_type: entity_type.to_string(),
            action,
        });

        let session = Self::session_mut(session)?;
        match action {
            StoreAction::Insert => {
                let mut row = values.clone();
                if let Some(field) = concurrency_field {
                    row.insert(field, Value::from(1));
                }
                session.staged.push(StagedOp::Upsert {
                    entity_type: entity_type.to_string(),
                    key: key_str(key),
                    row: row.clone(),
                });
                Ok(row)
            }
            StoreAction::Update => {
                let mut row = committed.unwrap_or_default();
                for (name, value) in values {
                    row.insert(name.clone(), value.clone());
                }
                if let Some(field) = concurrency_field {
                    let next = row.get(&field).and_then(Value::as_i64).unwrap_or(0) + 1;
                    row.insert(field, Value::from(next));
                }
                session.staged.push(StagedOp::Upsert {
                    entity_type: entity_type.to_string(),
                    key: key_str(key),
                    row: row.clone(),
                });
                Ok(row)
            }
            StoreAction::Delete => {
                session.staged.push(StagedOp::Remove {
                    entity_type: entity_type.to_string(),
                    key: key_str(key),
                });
                Ok(HashMap::new())
            }
        }
    }
}
