// Pipeline error taxonomy - fatal errors and per-entity error records
// Fatal variants abort the whole change-set; EntityError records ride inside results.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Fatal pipeline errors. Any of these rolls back the transaction (if one was
/// opened) and yields an error-only outcome to the caller.
#[derive(Debug)]
pub enum SaveError {
    /// Malformed save bundle. No transaction is ever opened.
    Decode(String),
    /// A record named an entity type the metadata registry does not know.
    UnknownEntityType(String),
    /// The metadata registry itself is inconsistent (startup-time failure).
    Metadata(String),
    /// A true foreign-key cycle among the batch's entities, named by entity.
    CyclicDependency(Vec<String>),
    /// One or more rows failed the concurrency-token comparison. Carries every
    /// conflicting entity found, not just the first.
    ConcurrencyConflict(Vec<EntityError>),
    /// A before-save hook aborted the batch.
    Aborted(String),
    /// Any failure surfaced by the store abstraction.
    Store(anyhow::Error),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::Decode(msg) => write!(f, "Decode error: {}", msg),
            SaveError::UnknownEntityType(name) => write!(f, "Unknown entity type: {}", name),
            SaveError::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            SaveError::CyclicDependency(entities) => {
                write!(f, "Cyclic dependency among entities: {}", entities.join(", "))
            }
            SaveError::ConcurrencyConflict(errors) => {
                let names: Vec<String> = errors
                    .iter()
                    .map(|e| format!("{}({})", e.entity_type, e.key))
                    .collect();
                write!(f, "Concurrency conflict on: {}", names.join(", "))
            }
            SaveError::Aborted(msg) => write!(f, "Save aborted: {}", msg),
            SaveError::Store(err) => write!(f, "Store error: {}", err),
        }
    }
}

impl std::error::Error for SaveError {}

impl SaveError {
    /// Per-entity error records carried by this error, if any.
    pub fn entity_errors(&self) -> &[EntityError] {
        match self {
            SaveError::ConcurrencyConflict(errors) => errors,
            _ => &[],
        }
    }

    /// True for failures that occur before scheduling and therefore never
    /// open a transaction.
    pub fn is_pre_transactional(&self) -> bool {
        matches!(
            self,
            SaveError::Decode(_)
                | SaveError::UnknownEntityType(_)
                | SaveError::Metadata(_)
                | SaveError::CyclicDependency(_)
        )
    }
}

impl From<anyhow::Error> for SaveError {
    fn from(err: anyhow::Error) -> Self {
        SaveError::Store(err)
    }
}

impl From<serde_json::Error> for SaveError {
    fn from(err: serde_json::Error) -> Self {
        SaveError::Decode(err.to_string())
    }
}

impl From<sqlx::Error> for SaveError {
    fn from(err: sqlx::Error) -> Self {
        SaveError::Store(anyhow::Error::new(err))
    }
}

pub type PipelineResult<T> = Result<T, SaveError>;

/// Category of a per-entity error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Validation,
    Concurrency,
    Store,
    Decode,
}

/// One entity's error, serializable for the outbound result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityError {
    pub entity_type: String,
    pub key: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    pub message: String,
    pub kind: ErrorKind,
}

impl EntityError {
    pub fn validation(entity_type: &str, key: Value, message: String) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            key,
            property: None,
            message,
            kind: ErrorKind::Validation,
        }
    }

    pub fn concurrency(entity_type: &str, key: Value, property: &str, message: String) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            key,
            property: Some(property.to_string()),
            message,
            kind: ErrorKind::Concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_concurrency_display_names_every_entity() {
        let err = SaveError::ConcurrencyConflict(vec![
            EntityError::concurrency("Order", json!(7), "rowVersion", "stale".to_string()),
            EntityError::concurrency("OrderLine", json!(9), "rowVersion", "stale".to_string()),
        ]);
        let text = err.to_string();
        assert!(text.contains("Order(7)"));
        assert!(text.contains("OrderLine(9)"));
        assert_eq!(err.entity_errors().len(), 2);
    }

    #[test]
    fn test_pre_transactional_classification() {
        assert!(SaveError::Decode("bad".to_string()).is_pre_transactional());
        assert!(SaveError::CyclicDependency(vec![]).is_pre_transactional());
        assert!(!SaveError::Aborted("no".to_string()).is_pre_transactional());
        assert!(!SaveError::ConcurrencyConflict(vec![]).is_pre_transactional());
    }
}
