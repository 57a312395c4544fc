// Entity-type metadata - the pipeline's description of the domain model
// Built once at startup by the host, validated, then shared read-only.

use crate::error::{PipelineResult, SaveError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How an entity type's primary key gets its permanent value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStrategy {
    /// The store assigns the key; clients submit a placeholder for new rows.
    StoreGenerated,
    /// The client supplies the real (natural) key up front.
    ClientAssigned,
}

/// One persistable field of an entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    pub name: String,
    pub optional: bool,
}

impl FieldMetadata {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
        }
    }

    /// Mark field as optional (nullable in the store).
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A foreign-key field and the entity type it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyMetadata {
    pub field: String,
    pub target_type: String,
    pub required: bool,
}

impl ForeignKeyMetadata {
    pub fn new(field: &str, target_type: &str) -> Self {
        Self {
            field: field.to_string(),
            target_type: target_type.to_string(),
            required: false,
        }
    }

    /// Mark the relationship as required (non-nullable in the store).
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Everything the pipeline knows about one domain type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub entity_type: String,
    pub table: String,
    pub key_field: String,
    pub key_strategy: KeyStrategy,
    pub fields: Vec<FieldMetadata>,
    pub foreign_keys: Vec<ForeignKeyMetadata>,
    pub concurrency_field: Option<String>,
}

impl EntityMetadata {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            table: entity_type.to_lowercase(),
            key_field: "id".to_string(),
            key_strategy: KeyStrategy::StoreGenerated,
            fields: Vec::new(),
            foreign_keys: Vec::new(),
            concurrency_field: None,
        }
    }

    /// Override the backing table name.
    pub fn table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    /// Set the primary-key field and how it is assigned.
    pub fn key(mut self, field: &str, strategy: KeyStrategy) -> Self {
        self.key_field = field.to_string();
        self.key_strategy = strategy;
        self
    }

    /// Add a plain field.
    pub fn field(mut self, field: FieldMetadata) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a foreign-key field. The FK column is also a plain field.
    pub fn foreign_key(mut self, fk: ForeignKeyMetadata) -> Self {
        self.fields.push(FieldMetadata {
            name: fk.field.clone(),
            optional: !fk.required,
        });
        self.foreign_keys.push(fk);
        self
    }

    /// Name the row-version field compared on Modified/Deleted writes.
    pub fn concurrency_field(mut self, field: &str) -> Self {
        self.concurrency_field = Some(field.to_string());
        self.fields.push(FieldMetadata::new(field));
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        name == self.key_field || self.fields.iter().any(|f| f.name == name)
    }

    pub fn foreign_key_for(&self, field: &str) -> Option<&ForeignKeyMetadata> {
        self.foreign_keys.iter().find(|fk| fk.field == field)
    }
}

/// Registry of all entity types known to the host application.
#[derive(Debug, Default, Serialize)]
pub struct MetadataRegistry {
    types: HashMap<String, EntityMetadata>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type's metadata, replacing any previous registration.
    pub fn register(&mut self, metadata: EntityMetadata) {
        self.types.insert(metadata.entity_type.clone(), metadata);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntityMetadata> {
        self.types.get(entity_type)
    }

    /// Lookup that fails the whole request on an unknown type name.
    pub fn expect(&self, entity_type: &str) -> PipelineResult<&EntityMetadata> {
        self.types
            .get(entity_type)
            .ok_or_else(|| SaveError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.types.values()
    }

    /// Serialize the whole registry for clients that build their own model
    /// from server metadata.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.types).unwrap_or(serde_json::Value::Null)
    }

    /// Validate registry consistency. Run once at startup, before the first
    /// save request.
    ///
    /// Checks: every FK target is registered; concurrency fields are declared;
    /// no cross-type cycle exists among required foreign keys. Self-referencing
    /// types are allowed - instance-level edges order those per request.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (entity_type, meta) in &self.types {
            for fk in &meta.foreign_keys {
                if !self.types.contains_key(&fk.target_type) {
                    errors.push(format!(
                        "Entity {} has foreign key '{}' pointing to undefined entity {}",
                        entity_type, fk.field, fk.target_type
                    ));
                }
            }
            if let Some(field) = &meta.concurrency_field {
                if !meta.has_field(field) {
                    errors.push(format!(
                        "Entity {} names concurrency field '{}' which is not declared",
                        entity_type, field
                    ));
                }
            }
        }

        if let Some(cycle) = self.find_required_fk_cycle() {
            errors.push(format!(
                "Required foreign keys form a cycle across types: {}",
                cycle.join(" -> ")
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    // Depth-first walk over the type graph restricted to required FKs,
    // ignoring self-loops.
    fn find_required_fk_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        for start in self.types.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<&str> = Vec::new();
            if let Some(cycle) = self.walk_required(start, &mut stack, &mut visited) {
                return Some(cycle);
            }
        }
        None
    }

    fn walk_required<'a>(
        &'a self,
        entity_type: &'a str,
        stack: &mut Vec<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|t| *t == entity_type) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|t| t.to_string()).collect();
            cycle.push(entity_type.to_string());
            return Some(cycle);
        }
        if visited.contains(entity_type) {
            return None;
        }
        stack.push(entity_type);
        if let Some(meta) = self.types.get(entity_type) {
            for fk in meta.foreign_keys.iter().filter(|fk| fk.required) {
                if fk.target_type == entity_type {
                    continue; // self-reference, handled per instance
                }
                if let Some(cycle) = self.walk_required(&fk.target_type, stack, visited) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        visited.insert(entity_type);
        None
    }
}

static REGISTRY_INSTANCE: OnceCell<Arc<MetadataRegistry>> = OnceCell::new();

/// Validate and install the process-wide registry. Call once at startup.
pub fn initialize_registry(registry: MetadataRegistry) -> PipelineResult<Arc<MetadataRegistry>> {
    registry
        .validate()
        .map_err(|errors| SaveError::Metadata(errors.join("; ")))?;
    let registry = Arc::new(registry);
    REGISTRY_INSTANCE
        .set(registry.clone())
        .map_err(|_| SaveError::Metadata("Metadata registry already initialized".to_string()))?;
    Ok(registry)
}

pub fn global_registry() -> PipelineResult<&'static Arc<MetadataRegistry>> {
    REGISTRY_INSTANCE
        .get()
        .ok_or_else(|| SaveError::Metadata("Metadata registry not initialized".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_types() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry.register(
            EntityMetadata::new("Customer")
                .table("customers")
                .key("id", KeyStrategy::StoreGenerated)
                .field(FieldMetadata::new("name")),
        );
        registry.register(
            EntityMetadata::new("Order")
                .table("orders")
                .key("id", KeyStrategy::StoreGenerated)
                .field(FieldMetadata::new("total"))
                .foreign_key(ForeignKeyMetadata::new("customerId", "Customer").required())
                .concurrency_field("rowVersion"),
        );
        registry
    }

    #[test]
    fn test_validate_accepts_consistent_model() {
        assert!(order_types().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_fk_target() {
        let mut registry = order_types();
        registry.register(
            EntityMetadata::new("Shipment")
                .foreign_key(ForeignKeyMetadata::new("orderId", "Oder")),
        );
        let errors = registry.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Oder")));
    }

    #[test]
    fn test_validate_rejects_required_fk_cycle() {
        let mut registry = MetadataRegistry::new();
        registry.register(
            EntityMetadata::new("A").foreign_key(ForeignKeyMetadata::new("bId", "B").required()),
        );
        registry.register(
            EntityMetadata::new("B").foreign_key(ForeignKeyMetadata::new("aId", "A").required()),
        );
        let errors = registry.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn test_validate_allows_self_reference() {
        let mut registry = MetadataRegistry::new();
        registry.register(
            EntityMetadata::new("Employee")
                .foreign_key(ForeignKeyMetadata::new("managerId", "Employee").required()),
        );
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_optional_fk_cycle_is_legal() {
        let mut registry = MetadataRegistry::new();
        registry.register(EntityMetadata::new("A").foreign_key(ForeignKeyMetadata::new("bId", "B")));
        registry.register(EntityMetadata::new("B").foreign_key(ForeignKeyMetadata::new("aId", "A")));
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_metadata_json_export_round_trips() {
        let json = order_types().to_json();
        assert!(json.get("Order").is_some());
        assert_eq!(json["Order"]["keyField"], "id");
    }

    #[test]
    fn test_global_registry_initializes_exactly_once() {
        initialize_registry(order_types()).unwrap();
        assert!(global_registry().is_ok());
        assert!(matches!(
            initialize_registry(order_types()),
            Err(SaveError::Metadata(_))
        ));
    }
}
