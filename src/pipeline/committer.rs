// Transactional committer - executes the operation plan inside one unit of work
// All-or-nothing: every exit path after begin_transaction either commits or
// rolls back; partial commits are never observable.

use crate::changeset::{ChangeKind, EntityDescriptor};
use crate::error::{EntityError, PipelineResult, SaveError};
use crate::metadata::MetadataRegistry;
use crate::pipeline::hooks::{HookContext, HookDecision, HookRegistry};
use crate::pipeline::keys::{KeyMapping, KeyResolver};
use crate::pipeline::scheduler::OperationPlan;
use crate::store::{StoreAction, StoreAdapter, StoreSession};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Final image of one persisted (or passthrough) entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntity {
    pub entity_type: String,
    pub values: HashMap<String, Value>,
}

/// What the caller gets back: committed entities with server-computed values,
/// the placeholder-key translations, and any per-entity errors.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub entities: Vec<PersistedEntity>,
    pub key_mappings: Vec<KeyMapping>,
    pub errors: Vec<EntityError>,
    /// Non-fatal after-save hook failures.
    pub warnings: Vec<String>,
}

impl SaveResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Executes one request's operation plan against the store.
pub struct Committer<'a> {
    store: &'a dyn StoreAdapter,
    registry: &'a MetadataRegistry,
    hooks: &'a HookRegistry,
}

impl<'a> Committer<'a> {
    pub fn new(
        store: &'a dyn StoreAdapter,
        registry: &'a MetadataRegistry,
        hooks: &'a HookRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            hooks,
        }
    }

    /// Run the plan to completion. Descriptors are mutated in place: keys
    /// resolved, hook edits applied, store-computed values merged back.
    pub async fn commit(
        &self,
        ctx: &mut HookContext,
        descriptors: &mut [EntityDescriptor],
        plan: &OperationPlan,
    ) -> PipelineResult<SaveResult> {
        if plan.steps.is_empty() {
            // nothing to write - no transaction, passthrough-only result
            return Ok(assemble(
                descriptors,
                plan,
                KeyResolver::new(),
                &HashSet::new(),
                Vec::new(),
            ));
        }

        let mut session = self.store.begin_transaction().await?;

        let conflicts = match self.concurrency_sweep(session.as_mut(), descriptors, plan).await {
            Ok(conflicts) => conflicts,
            Err(e) => return self.fail(session, e).await,
        };
        if !conflicts.is_empty() {
            return self
                .fail(session, SaveError::ConcurrencyConflict(conflicts))
                .await;
        }

        let mut resolver = KeyResolver::new();
        let mut vetoed: HashSet<usize> = HashSet::new();
        let mut persisted: HashSet<usize> = HashSet::new();
        let mut errors: Vec<EntityError> = Vec::new();

        for step in &plan.steps {
            if vetoed.contains(&step.index) {
                continue;
            }

            // own-key resolution first: hooks must see the permanent key
            if let Err(e) = resolver
                .resolve(self.store, self.registry, descriptors, step.index)
                .await
            {
                return self.fail(session, e).await;
            }

            let decision = match self
                .hooks
                .before_save(ctx, &mut descriptors[step.index])
                .await
            {
                Ok(decision) => decision,
                Err(e) => return self.fail(session, e).await,
            };

            match decision {
                HookDecision::Proceed => {
                    let descriptor = &descriptors[step.index];
                    let key = descriptor
                        .server_key
                        .clone()
                        .unwrap_or_else(|| descriptor.client_key.clone());
                    let values = match step.action {
                        StoreAction::Delete => HashMap::new(),
                        _ => descriptor.current_values.clone(),
                    };
                    let final_values = match self
                        .store
                        .apply(
                            session.as_mut(),
                            &descriptor.entity_type,
                            step.action,
                            &key,
                            &values,
                        )
                        .await
                    {
                        Ok(final_values) => final_values,
                        Err(e) => return self.fail(session, e).await,
                    };
                    if step.action != StoreAction::Delete && !final_values.is_empty() {
                        descriptors[step.index].current_values = final_values;
                    }
                    persisted.insert(step.index);
                }
                HookDecision::Skip => {
                    veto(
                        step.index,
                        descriptors,
                        plan,
                        &persisted,
                        &mut vetoed,
                        &mut errors,
                        &mut resolver,
                    );
                }
                HookDecision::Abort(message) => {
                    return self.fail(session, SaveError::Aborted(message)).await;
                }
            }
        }

        self.store.commit(session).await?;
        debug!(persisted = persisted.len(), vetoed = vetoed.len(), "transaction committed");
        Ok(assemble(descriptors, plan, resolver, &persisted, errors))
    }

    // Compare every concurrency token before the first write so the error can
    // name all conflicting entities, not just the first.
    async fn concurrency_sweep(
        &self,
        session: &mut dyn StoreSession,
        descriptors: &[EntityDescriptor],
        plan: &OperationPlan,
    ) -> PipelineResult<Vec<EntityError>> {
        let mut conflicts = Vec::new();
        for step in &plan.steps {
            let descriptor = &descriptors[step.index];
            if !matches!(
                descriptor.change_kind,
                ChangeKind::Modified | ChangeKind::Deleted
            ) {
                continue;
            }
            let meta = self.registry.expect(&descriptor.entity_type)?;
            let Some(field) = meta.concurrency_field.as_deref() else {
                continue;
            };
            let current = self
                .store
                .current_concurrency_value(
                    session,
                    &descriptor.entity_type,
                    &descriptor.client_key,
                    field,
                )
                .await?;
            let known = descriptor.original_values.get(field).cloned();
            if current != known {
                conflicts.push(EntityError::concurrency(
                    &descriptor.entity_type,
                    descriptor.client_key.clone(),
                    field,
                    format!(
                        "store-current {} does not match the client's last known value",
                        field
                    ),
                ));
            }
        }
        Ok(conflicts)
    }

    async fn fail<T>(
        &self,
        session: Box<dyn StoreSession>,
        error: SaveError,
    ) -> PipelineResult<T> {
        if let Err(rollback_error) = self.store.rollback(session).await {
            warn!(error = %rollback_error, "rollback failed after save error");
        }
        Err(error)
    }
}

// Prune the vetoed entity plus everything transitively depending on it.
fn veto(
    index: usize,
    descriptors: &[EntityDescriptor],
    plan: &OperationPlan,
    persisted: &HashSet<usize>,
    vetoed: &mut HashSet<usize>,
    errors: &mut Vec<EntityError>,
    resolver: &mut KeyResolver,
) {
    let label = descriptors[index].label();
    debug!(entity = %label, "entity vetoed by before-save hook");
    vetoed.insert(index);
    resolver.discard(index);
    errors.push(EntityError::validation(
        &descriptors[index].entity_type,
        descriptors[index].client_key.clone(),
        "vetoed by before-save hook".to_string(),
    ));

    for dependent in plan.transitive_dependents(index) {
        if persisted.contains(&dependent) || !vetoed.insert(dependent) {
            continue;
        }
        resolver.discard(dependent);
        errors.push(EntityError::validation(
            &descriptors[dependent].entity_type,
            descriptors[dependent].client_key.clone(),
            format!("excluded because it depends on vetoed entity {}", label),
        ));
    }
}

fn assemble(
    descriptors: &[EntityDescriptor],
    plan: &OperationPlan,
    resolver: KeyResolver,
    persisted: &HashSet<usize>,
    errors: Vec<EntityError>,
) -> SaveResult {
    let passthrough: HashSet<usize> = plan.passthrough.iter().copied().collect();
    let entities = descriptors
        .iter()
        .enumerate()
        .filter(|(index, _)| persisted.contains(index) || passthrough.contains(index))
        .map(|(_, d)| PersistedEntity {
            entity_type: d.entity_type.clone(),
            values: d.current_values.clone(),
        })
        .collect();
    SaveResult {
        entities,
        key_mappings: resolver.into_mappings(),
        errors,
        warnings: Vec::new(),
    }
}
