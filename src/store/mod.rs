// Store abstraction - the narrow surface between the pipeline and any backend
// The pipeline never sees a concrete ORM or SQL dialect, only this trait.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, StoreCall};
pub use postgres::PostgresStore;

use crate::error::PipelineResult;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;

/// The store-level action for one descriptor in the operation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StoreAction {
    Insert,
    Update,
    Delete,
}

/// Opaque per-request transaction handle. Backends downcast to their own
/// session type.
pub trait StoreSession: Send {
    fn as_any(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Backend contract for the transactional committer.
///
/// Key assignment must be race-free across concurrent callers: each value
/// returned by `assign_key` is never handed to any other caller. How that is
/// guaranteed (sequence, row lock) is the backend's business.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    // Transaction management
    async fn begin_transaction(&self) -> PipelineResult<Box<dyn StoreSession>>;
    async fn commit(&self, session: Box<dyn StoreSession>) -> PipelineResult<()>;
    async fn rollback(&self, session: Box<dyn StoreSession>) -> PipelineResult<()>;

    /// Reserve a permanent key for a new row of the given type.
    async fn assign_key(&self, entity_type: &str) -> PipelineResult<Value>;

    /// Store-current value of a concurrency field, `None` when the row is gone.
    async fn current_concurrency_value(
        &self,
        session: &mut dyn StoreSession,
        entity_type: &str,
        key: &Value,
        field: &str,
    ) -> PipelineResult<Option<Value>>;

    /// Apply one write inside the session. Returns the final row values
    /// (generated columns, bumped version tokens); empty for deletes.
    async fn apply(
        &self,
        session: &mut dyn StoreSession,
        entity_type: &str,
        action: StoreAction,
        key: &Value,
        values: &HashMap<String, Value>,
    ) -> PipelineResult<HashMap<String, Value>>;
}
