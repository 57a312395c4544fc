// Key resolver - swaps client placeholders for permanent, store-assigned keys
// Runs just-in-time as the plan reaches each descriptor so failed requests
// never consume key-space for rows that were not going to be written.

use crate::changeset::{ChangeKind, EntityDescriptor};
use crate::error::PipelineResult;
use crate::metadata::{KeyStrategy, MetadataRegistry};
use crate::store::StoreAdapter;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// One placeholder-to-permanent key translation, returned to the client so it
/// can retarget its own in-memory references.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMapping {
    pub entity_type: String,
    pub client_key: Value,
    pub server_key: Value,
}

/// Request-scoped key assignment state.
#[derive(Debug, Default)]
pub struct KeyResolver {
    mappings: Vec<(usize, KeyMapping)>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the permanent key for one descriptor and rewrite every other
    /// descriptor's foreign keys that pointed at its placeholder.
    pub async fn resolve(
        &mut self,
        store: &dyn StoreAdapter,
        registry: &MetadataRegistry,
        descriptors: &mut [EntityDescriptor],
        index: usize,
    ) -> PipelineResult<()> {
        let meta = registry.expect(&descriptors[index].entity_type)?;
        let key_field = meta.key_field.clone();

        let store_generated = meta.key_strategy == KeyStrategy::StoreGenerated
            && descriptors[index].change_kind == ChangeKind::Added;
        if !store_generated {
            // natural keys and pre-existing rows keep the key the client sent
            let key = descriptors[index].client_key.clone();
            descriptors[index]
                .current_values
                .entry(key_field)
                .or_insert_with(|| key.clone());
            descriptors[index].server_key = Some(key);
            return Ok(());
        }

        let entity_type = descriptors[index].entity_type.clone();
        let placeholder = descriptors[index].client_key.clone();
        let assigned = store.assign_key(&entity_type).await?;
        debug!(entity_type = %entity_type, placeholder = %placeholder, assigned = %assigned, "key assigned");

        descriptors[index]
            .current_values
            .insert(key_field, assigned.clone());
        descriptors[index].server_key = Some(assigned.clone());

        rewrite_references(registry, descriptors, index, &entity_type, &placeholder, &assigned)?;

        self.mappings.push((
            index,
            KeyMapping {
                entity_type,
                client_key: placeholder,
                server_key: assigned,
            },
        ));
        Ok(())
    }

    /// Drop the mapping recorded for a descriptor that was vetoed after its
    /// key had already been assigned.
    pub fn discard(&mut self, index: usize) {
        self.mappings.retain(|(i, _)| *i != index);
    }

    pub fn into_mappings(self) -> Vec<KeyMapping> {
        self.mappings.into_iter().map(|(_, m)| m).collect()
    }
}

fn rewrite_references(
    registry: &MetadataRegistry,
    descriptors: &mut [EntityDescriptor],
    resolved_index: usize,
    target_type: &str,
    placeholder: &Value,
    assigned: &Value,
) -> PipelineResult<()> {
    for (index, descriptor) in descriptors.iter_mut().enumerate() {
        if index == resolved_index {
            continue;
        }
        let meta = registry.expect(&descriptor.entity_type)?;
        for fk in meta.foreign_keys.iter().filter(|fk| fk.target_type == target_type) {
            if descriptor.current_values.get(&fk.field) == Some(placeholder) {
                descriptor
                    .current_values
                    .insert(fk.field.clone(), assigned.clone());
            }
        }
    }
    Ok(())
}
