// Dependency graph builder - must-persist-before edges from runtime FK values
// Edges are per-instance, so self-referencing types order correctly within a
// batch instead of collapsing into a type-level cycle.

use crate::changeset::{ChangeKind, EntityDescriptor};
use crate::error::PipelineResult;
use crate::metadata::MetadataRegistry;
use std::collections::HashMap;
use tracing::debug;

/// Why a descriptor must wait for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeReason {
    /// Child row carries a foreign key to a parent row in the same batch.
    ForeignKeyToParent,
    /// Both rows are deleted; the child must go before the parent.
    CascadeDeleteChild,
}

/// One directed edge: `child`'s persistence depends on `parent`.
#[derive(Debug, Clone, Copy)]
pub struct DependencyEdge {
    pub child: usize,
    pub parent: usize,
    pub reason: EdgeReason,
}

/// Immutable per-request dependency graph over descriptor indices.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Derive edges from foreign-key metadata and the batch's runtime values.
    /// A foreign-key value that matches no same-batch descriptor points at a
    /// row already in the store and needs no ordering.
    pub fn build(
        registry: &MetadataRegistry,
        descriptors: &[EntityDescriptor],
    ) -> PipelineResult<Self> {
        let mut by_key: HashMap<(&str, String), usize> = HashMap::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            by_key.insert(
                (descriptor.entity_type.as_str(), descriptor.client_key.to_string()),
                index,
            );
        }

        let mut edges = Vec::new();
        for (child, descriptor) in descriptors.iter().enumerate() {
            let meta = registry.expect(&descriptor.entity_type)?;
            for fk in &meta.foreign_keys {
                let Some(value) = descriptor.reference_value(&fk.field) else {
                    continue;
                };
                let Some(&parent) = by_key.get(&(fk.target_type.as_str(), value.to_string()))
                else {
                    continue;
                };
                if parent == child {
                    // a row referencing itself needs no ordering
                    continue;
                }
                let reason = if descriptor.change_kind == ChangeKind::Deleted
                    && descriptors[parent].change_kind == ChangeKind::Deleted
                {
                    EdgeReason::CascadeDeleteChild
                } else {
                    EdgeReason::ForeignKeyToParent
                };
                edges.push(DependencyEdge {
                    child,
                    parent,
                    reason,
                });
            }
        }

        debug!(edges = edges.len(), "dependency graph built");
        Ok(Self { edges })
    }

    /// Ordering constraints for the insert/update sub-plan as (predecessor,
    /// successor) pairs: a child waits only for parents that are themselves
    /// being inserted - rows that already exist impose no order.
    pub fn insert_constraints(&self, descriptors: &[EntityDescriptor]) -> Vec<(usize, usize)> {
        self.edges
            .iter()
            .filter(|e| {
                descriptors[e.parent].change_kind == ChangeKind::Added
                    && descriptors[e.child].change_kind != ChangeKind::Deleted
                    && descriptors[e.child].is_write()
            })
            .map(|e| (e.parent, e.child))
            .collect()
    }

    /// Ordering constraints for the delete sub-plan: the deleted child must
    /// precede its deleted parent.
    pub fn delete_constraints(&self) -> Vec<(usize, usize)> {
        self.edges
            .iter()
            .filter(|e| e.reason == EdgeReason::CascadeDeleteChild)
            .map(|e| (e.child, e.parent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, ForeignKeyMetadata, KeyStrategy, MetadataRegistry};
    use serde_json::{json, Value};
    use std::collections::HashMap as Map;

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry.register(EntityMetadata::new("Order").key("id", KeyStrategy::StoreGenerated));
        registry.register(
            EntityMetadata::new("OrderLine")
                .key("id", KeyStrategy::StoreGenerated)
                .foreign_key(ForeignKeyMetadata::new("orderId", "Order").required()),
        );
        registry.register(
            EntityMetadata::new("Category")
                .key("id", KeyStrategy::StoreGenerated)
                .foreign_key(ForeignKeyMetadata::new("parentId", "Category")),
        );
        registry
    }

    fn added(entity_type: &str, key: i64, values: Vec<(&str, Value)>, index: usize) -> EntityDescriptor {
        EntityDescriptor {
            entity_type: entity_type.to_string(),
            change_kind: ChangeKind::Added,
            current_values: values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            original_values: Map::new(),
            client_key: json!(key),
            server_key: None,
            force_update: false,
            submission_index: index,
        }
    }

    #[test]
    fn test_edge_per_matching_foreign_key() {
        let descriptors = vec![
            added("Order", -1, vec![], 0),
            added("OrderLine", -2, vec![("orderId", json!(-1))], 1),
        ];
        let graph = DependencyGraph::build(&registry(), &descriptors).unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].child, 1);
        assert_eq!(graph.edges[0].parent, 0);
        assert_eq!(graph.edges[0].reason, EdgeReason::ForeignKeyToParent);
    }

    #[test]
    fn test_fk_to_existing_row_adds_no_edge() {
        let descriptors = vec![added("OrderLine", -2, vec![("orderId", json!(55))], 0)];
        let graph = DependencyGraph::build(&registry(), &descriptors).unwrap();
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_self_referencing_rows_get_instance_edges() {
        let descriptors = vec![
            added("Category", -1, vec![], 0),
            added("Category", -2, vec![("parentId", json!(-1))], 1),
            added("Category", -3, vec![("parentId", json!(-2))], 2),
        ];
        let graph = DependencyGraph::build(&registry(), &descriptors).unwrap();
        assert_eq!(graph.edges.len(), 2);
        let constraints = graph.insert_constraints(&descriptors);
        assert!(constraints.contains(&(0, 1)));
        assert!(constraints.contains(&(1, 2)));
    }

    #[test]
    fn test_deleted_pair_yields_cascade_edge() {
        let mut parent = added("Order", 10, vec![], 0);
        parent.change_kind = ChangeKind::Deleted;
        let mut child = added("OrderLine", 20, vec![("orderId", json!(10))], 1);
        child.change_kind = ChangeKind::Deleted;
        let descriptors = vec![parent, child];
        let graph = DependencyGraph::build(&registry(), &descriptors).unwrap();
        assert_eq!(graph.edges[0].reason, EdgeReason::CascadeDeleteChild);
        assert_eq!(graph.delete_constraints(), vec![(1, 0)]);
    }
}
