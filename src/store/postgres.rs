// Postgres store backend - SQL synthesized from entity-type metadata
// Identifiers (tables, columns, sequences) come from startup metadata, never
// from request input.

use crate::error::{PipelineResult, SaveError};
use crate::metadata::{EntityMetadata, MetadataRegistry};
use crate::store::{StoreAction, StoreAdapter, StoreSession};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, Transaction};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

impl StoreSession for PgSession {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Production backend over a sqlx connection pool.
pub struct PostgresStore {
    pool: PgPool,
    registry: Arc<MetadataRegistry>,
}

impl PostgresStore {
    pub fn new(pool: PgPool, registry: Arc<MetadataRegistry>) -> Self {
        Self { pool, registry }
    }

    pub async fn connect(url: &str, registry: Arc<MetadataRegistry>) -> PipelineResult<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool, registry))
    }

    /// Health check to verify database connectivity.
    pub async fn health_check(&self) -> PipelineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn meta(&self, entity_type: &str) -> PipelineResult<&EntityMetadata> {
        self.registry.expect(entity_type)
    }

    fn session_tx<'a>(
        session: &'a mut dyn StoreSession,
    ) -> PipelineResult<&'a mut Transaction<'static, Postgres>> {
        session
            .as_any()
            .downcast_mut::<PgSession>()
            .and_then(|s| s.tx.as_mut())
            .ok_or_else(|| SaveError::Store(anyhow::anyhow!("session belongs to another store")))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
        Value::Number(n) => query.bind(n.as_f64()),
        Value::String(s) => query.bind(s.as_str()),
        // arrays/objects land in text columns as raw json
        other => query.bind(other.to_string()),
    }
}

fn row_to_values(row: &PgRow) -> HashMap<String, Value> {
    let mut values = HashMap::new();
    for column in row.columns() {
        let name = column.name();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(name) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(name) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(name) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
            v.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(name) {
            v.map(|u| Value::from(u.to_string())).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        values.insert(name.to_string(), value);
    }
    values
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    async fn begin_transaction(&self) -> PipelineResult<Box<dyn StoreSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx: Some(tx) }))
    }

    async fn commit(&self, session: Box<dyn StoreSession>) -> PipelineResult<()> {
        let mut session = session
            .into_any()
            .downcast::<PgSession>()
            .map_err(|_| SaveError::Store(anyhow::anyhow!("session belongs to another store")))?;
        if let Some(tx) = session.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self, session: Box<dyn StoreSession>) -> PipelineResult<()> {
        let mut session = session
            .into_any()
            .downcast::<PgSession>()
            .map_err(|_| SaveError::Store(anyhow::anyhow!("session belongs to another store")))?;
        if let Some(tx) = session.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn assign_key(&self, entity_type: &str) -> PipelineResult<Value> {
        let meta = self.meta(entity_type)?;
        let sequence = format!("{}_{}_seq", meta.table, meta.key_field);
        let key: i64 = sqlx::query_scalar("SELECT nextval($1::regclass)")
            .bind(&sequence)
            .fetch_one(&self.pool)
            .await?;
        Ok(Value::from(key))
    }

    async fn current_concurrency_value(
        &self,
        session: &mut dyn StoreSession,
        entity_type: &str,
        key: &Value,
        field: &str,
    ) -> PipelineResult<Option<Value>> {
        let meta = self.meta(entity_type)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = $1",
            field, meta.table, meta.key_field
        );
        let tx = Self::session_tx(session)?;
        let row = bind_value(sqlx::query(&sql), key)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|r| {
            let mut values = row_to_values(&r);
            values.remove(field).unwrap_or(Value::Null)
        }))
    }

    async fn apply(
        &self,
        session: &mut dyn StoreSession,
        entity_type: &str,
        action: StoreAction,
        key: &Value,
        values: &HashMap<String, Value>,
    ) -> PipelineResult<HashMap<String, Value>> {
        let meta = self.meta(entity_type)?;
        let tx = Self::session_tx(session)?;

        match action {
            StoreAction::Insert => {
                let mut columns: Vec<&String> = values.keys().collect();
                columns.sort();
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("${}", i)).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                    meta.table,
                    columns
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    placeholders.join(", ")
                );
                let mut query = sqlx::query(&sql);
                for column in &columns {
                    query = bind_value(query, &values[*column]);
                }
                let row = query.fetch_one(&mut **tx).await?;
                Ok(row_to_values(&row))
            }
            StoreAction::Update => {
                let mut columns: Vec<&String> =
                    values.keys().filter(|c| **c != meta.key_field).collect();
                columns.sort();
                let assignments: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ${}", c, i + 1))
                    .collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ${} RETURNING *",
                    meta.table,
                    assignments.join(", "),
                    meta.key_field,
                    columns.len() + 1
                );
                let mut query = sqlx::query(&sql);
                for column in &columns {
                    query = bind_value(query, &values[*column]);
                }
                query = bind_value(query, key);
                let row = query.fetch_one(&mut **tx).await?;
                Ok(row_to_values(&row))
            }
            StoreAction::Delete => {
                let sql = format!("DELETE FROM {} WHERE {} = $1", meta.table, meta.key_field);
                bind_value(sqlx::query(&sql), key)
                    .execute(&mut **tx)
                    .await?;
                Ok(HashMap::new())
            }
        }
    }
}
