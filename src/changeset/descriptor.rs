// Entity descriptor - one changed entity for the duration of one request
// Created by the decoder, mutated by the key resolver and hooks, then dropped.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// The client-declared change for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    /// Carried only for graph completeness; produces no store action unless
    /// the record is flagged forceUpdate.
    Unchanged,
}

/// In-memory representation of one entity change record.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub entity_type: String,
    pub change_kind: ChangeKind,
    pub current_values: HashMap<String, Value>,
    pub original_values: HashMap<String, Value>,
    /// Placeholder for store-generated Added keys; the real key otherwise.
    pub client_key: Value,
    /// Permanent key, set by the key resolver.
    pub server_key: Option<Value>,
    /// Client asked for a write even though the record reads as clean.
    pub force_update: bool,
    /// Position in the submitted payload; ties in scheduling break on this.
    pub submission_index: usize,
}

impl EntityDescriptor {
    /// Current value of a field, treating JSON null as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.current_values.get(name).filter(|v| !v.is_null())
    }

    /// The runtime value a foreign-key field points at. Deleted records fall
    /// back to original values - the client may have already cleared the
    /// reference locally.
    pub fn reference_value(&self, field: &str) -> Option<&Value> {
        match self.field(field) {
            Some(v) => Some(v),
            None if self.change_kind == ChangeKind::Deleted => {
                self.original_values.get(field).filter(|v| !v.is_null())
            }
            None => None,
        }
    }

    /// Whether this descriptor produces a store write.
    pub fn is_write(&self) -> bool {
        match self.change_kind {
            ChangeKind::Added | ChangeKind::Modified | ChangeKind::Deleted => true,
            ChangeKind::Unchanged => self.force_update,
        }
    }

    /// Entity label used in error messages, e.g. `Order(-1)`.
    pub fn label(&self) -> String {
        format!("{}({})", self.entity_type, self.client_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(kind: ChangeKind) -> EntityDescriptor {
        EntityDescriptor {
            entity_type: "Order".to_string(),
            change_kind: kind,
            current_values: HashMap::from([("customerId".to_string(), Value::Null)]),
            original_values: HashMap::from([("customerId".to_string(), json!(42))]),
            client_key: json!(-1),
            server_key: None,
            force_update: false,
            submission_index: 0,
        }
    }

    #[test]
    fn test_reference_value_falls_back_to_originals_for_deleted() {
        let d = descriptor(ChangeKind::Deleted);
        assert_eq!(d.reference_value("customerId"), Some(&json!(42)));
    }

    #[test]
    fn test_reference_value_ignores_originals_for_modified() {
        let d = descriptor(ChangeKind::Modified);
        assert_eq!(d.reference_value("customerId"), None);
    }

    #[test]
    fn test_unchanged_writes_only_when_forced() {
        let mut d = descriptor(ChangeKind::Unchanged);
        assert!(!d.is_write());
        d.force_update = true;
        assert!(d.is_write());
    }
}
