// Change-set decoder - turns the wire payload into typed entity descriptors
// Shape and type-name validation happens here; nothing touches the store.

use crate::changeset::descriptor::{ChangeKind, EntityDescriptor};
use crate::error::{PipelineResult, SaveError};
use crate::metadata::{KeyStrategy, MetadataRegistry};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Bundle-level options carried alongside the entity records.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveOptions {
    pub allow_concurrent_saves: bool,
    pub tag: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    entities: Vec<RawRecord>,
    #[serde(default)]
    save_options: SaveOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    entity_type: String,
    change_kind: ChangeKind,
    #[serde(default)]
    current_values: HashMap<String, Value>,
    #[serde(default)]
    original_values: HashMap<String, Value>,
    #[serde(default)]
    client_key: Option<Value>,
    #[serde(default)]
    force_update: bool,
}

/// The decoder's output: descriptors in submission order plus bundle options.
#[derive(Debug)]
pub struct DecodedChangeSet {
    pub descriptors: Vec<EntityDescriptor>,
    pub options: SaveOptions,
}

/// Decode a save bundle already parsed into a JSON tree.
///
/// Decoding is pure: equal payloads yield field-wise equal descriptor sets,
/// and no store access happens here.
pub fn decode(registry: &MetadataRegistry, payload: &Value) -> PipelineResult<DecodedChangeSet> {
    let bundle: RawBundle = serde_json::from_value(payload.clone())?;
    build(registry, bundle)
}

/// Decode a save bundle from raw bytes.
pub fn decode_slice(registry: &MetadataRegistry, payload: &[u8]) -> PipelineResult<DecodedChangeSet> {
    let bundle: RawBundle = serde_json::from_slice(payload)?;
    build(registry, bundle)
}

fn build(registry: &MetadataRegistry, bundle: RawBundle) -> PipelineResult<DecodedChangeSet> {
    let mut descriptors = Vec::with_capacity(bundle.entities.len());
    let mut placeholders: HashSet<(String, String)> = HashSet::new();

    for (index, record) in bundle.entities.into_iter().enumerate() {
        let meta = registry.expect(&record.entity_type)?;

        let client_key = match (record.change_kind, meta.key_strategy) {
            (ChangeKind::Added, KeyStrategy::StoreGenerated) => {
                let key = record.client_key.filter(|k| !k.is_null()).ok_or_else(|| {
                    SaveError::Decode(format!(
                        "Added {} record at position {} is missing its placeholder clientKey",
                        record.entity_type, index
                    ))
                })?;
                if !placeholders.insert((record.entity_type.clone(), key.to_string())) {
                    return Err(SaveError::Decode(format!(
                        "Placeholder key {} is used by more than one {} record",
                        key, record.entity_type
                    )));
                }
                key
            }
            _ => real_key(&record, &meta.key_field, index)?,
        };

        descriptors.push(EntityDescriptor {
            entity_type: record.entity_type,
            change_kind: record.change_kind,
            current_values: record.current_values,
            original_values: record.original_values,
            client_key,
            server_key: None,
            force_update: record.force_update,
            submission_index: index,
        });
    }

    debug!(entities = descriptors.len(), "decoded change-set");
    Ok(DecodedChangeSet {
        descriptors,
        options: bundle.save_options,
    })
}

// Non-placeholder records must carry their real key in currentValues, or in
// originalValues for deletes whose current image was already discarded.
fn real_key(record: &RawRecord, key_field: &str, index: usize) -> PipelineResult<Value> {
    let current = record.current_values.get(key_field).filter(|v| !v.is_null());
    let original = record.original_values.get(key_field).filter(|v| !v.is_null());
    let key = match (current, original, record.change_kind) {
        (Some(v), _, _) => v.clone(),
        (None, Some(v), ChangeKind::Deleted) => v.clone(),
        _ => {
            return Err(SaveError::Decode(format!(
                "{:?} {} record at position {} has no value for its key field '{}'",
                record.change_kind, record.entity_type, index, key_field
            )))
        }
    };
    Ok(key)
}
