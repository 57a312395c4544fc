// Interception hooks - host-supplied middleware around entity persistence
// Before-save hooks run just-in-time as the plan advances; after-save hooks
// run once, post-commit, and can no longer affect the transaction.

use crate::changeset::{ChangeKind, EntityDescriptor};
use crate::error::{PipelineResult, SaveError};
use crate::metadata::MetadataRegistry;
use crate::pipeline::committer::SaveResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// What a before-save hook decided for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    /// Persist the entity (possibly with values the hook mutated in place).
    Proceed,
    /// Veto: drop this entity and everything that transitively depends on it,
    /// recording validation errors for each.
    Skip,
    /// Fail the entire batch.
    Abort(String),
}

/// Request-scoped context shared by every hook invocation.
#[derive(Debug)]
pub struct HookContext {
    pub request_id: Uuid,
    pub registry: Arc<MetadataRegistry>,
    pub allow_concurrent_saves: bool,
    /// Opaque client payload from the bundle's saveOptions.
    pub tag: Option<Value>,
    /// Scratch space hooks can use to pass data to later hooks.
    pub metadata: HashMap<String, Value>,
    /// Non-fatal after-save failures, reported alongside the result.
    pub warnings: Vec<String>,
}

impl HookContext {
    pub fn new(registry: Arc<MetadataRegistry>, options: &crate::changeset::SaveOptions) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            registry,
            allow_concurrent_saves: options.allow_concurrent_saves,
            tag: options.tag.clone(),
            metadata: HashMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Trait for host-implemented save interception.
#[async_trait]
pub trait SaveHook: Send + Sync {
    /// Hook name for diagnostics.
    fn name(&self) -> &str;

    /// Called before an entity is written, after its own key is resolved.
    async fn before_save(
        &self,
        _ctx: &mut HookContext,
        _descriptor: &mut EntityDescriptor,
    ) -> PipelineResult<HookDecision> {
        Ok(HookDecision::Proceed)
    }

    /// Called once after the transaction commits. Read-only side effects;
    /// errors become warnings, never rollbacks.
    async fn after_save(&self, _ctx: &mut HookContext, _result: &SaveResult) -> PipelineResult<()> {
        Ok(())
    }
}

/// Registry of hooks, global or scoped to one entity type.
#[derive(Default)]
pub struct HookRegistry {
    global: Vec<Arc<dyn SaveHook>>,
    per_type: HashMap<String, Vec<Arc<dyn SaveHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for every entity type.
    pub fn register(&mut self, hook: Arc<dyn SaveHook>) {
        self.global.push(hook);
    }

    /// Register a hook for one entity type.
    pub fn register_for_type(&mut self, entity_type: &str, hook: Arc<dyn SaveHook>) {
        self.per_type
            .entry(entity_type.to_string())
            .or_default()
            .push(hook);
    }

    fn hooks_for<'a>(&'a self, entity_type: &str) -> impl Iterator<Item = &'a Arc<dyn SaveHook>> {
        self.global
            .iter()
            .chain(self.per_type.get(entity_type).into_iter().flatten())
    }

    /// Run before-save hooks in registration order; the first non-Proceed
    /// decision wins. A hook error aborts the batch.
    pub async fn before_save(
        &self,
        ctx: &mut HookContext,
        descriptor: &mut EntityDescriptor,
    ) -> PipelineResult<HookDecision> {
        let entity_type = descriptor.entity_type.clone();
        for hook in self.hooks_for(&entity_type) {
            let decision = hook.before_save(ctx, descriptor).await.map_err(|e| {
                SaveError::Aborted(format!("before-save hook '{}' failed: {}", hook.name(), e))
            })?;
            if decision != HookDecision::Proceed {
                return Ok(decision);
            }
        }
        Ok(HookDecision::Proceed)
    }

    /// Run every after-save hook; failures are collected as warnings.
    pub async fn after_save(&self, ctx: &mut HookContext, result: &SaveResult) {
        let mut entity_types: Vec<&String> = self.per_type.keys().collect();
        entity_types.sort();
        let per_type = entity_types
            .into_iter()
            .flat_map(|t| self.per_type[t].iter());
        for hook in self.global.iter().chain(per_type) {
            if let Err(e) = hook.after_save(ctx, result).await {
                warn!(hook = hook.name(), error = %e, "after-save hook failed");
                ctx.warnings
                    .push(format!("after-save hook '{}' failed: {}", hook.name(), e));
            }
        }
    }
}

/// Built-in hook that stamps creation/update timestamps on rows whose type
/// declares the fields.
pub struct TimestampHook {
    created_field: String,
    updated_field: String,
}

impl TimestampHook {
    pub fn new(created_field: &str, updated_field: &str) -> Self {
        Self {
            created_field: created_field.to_string(),
            updated_field: updated_field.to_string(),
        }
    }
}

#[async_trait]
impl SaveHook for TimestampHook {
    fn name(&self) -> &str {
        "timestamp_hook"
    }

    async fn before_save(
        &self,
        ctx: &mut HookContext,
        descriptor: &mut EntityDescriptor,
    ) -> PipelineResult<HookDecision> {
        let now = chrono::Utc::now().timestamp();
        let Some(meta) = ctx.registry.get(&descriptor.entity_type) else {
            return Ok(HookDecision::Proceed);
        };
        match descriptor.change_kind {
            ChangeKind::Added => {
                if meta.has_field(&self.created_field) {
                    descriptor
                        .current_values
                        .insert(self.created_field.clone(), Value::from(now));
                }
                if meta.has_field(&self.updated_field) {
                    descriptor
                        .current_values
                        .insert(self.updated_field.clone(), Value::from(now));
                }
            }
            ChangeKind::Modified | ChangeKind::Unchanged => {
                if meta.has_field(&self.updated_field) {
                    descriptor
                        .current_values
                        .insert(self.updated_field.clone(), Value::from(now));
                }
            }
            ChangeKind::Deleted => {}
        }
        Ok(HookDecision::Proceed)
    }
}
