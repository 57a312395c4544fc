// Save pipeline - decode, order, intercept, and commit one change-set
// One pipeline instance handles one request at a time; hosts share it across
// requests because all per-request state lives on the stack.

pub mod committer;
pub mod graph;
pub mod hooks;
pub mod keys;
pub mod scheduler;

pub use committer::{Committer, PersistedEntity, SaveResult};
pub use graph::{DependencyEdge, DependencyGraph, EdgeReason};
pub use hooks::{HookContext, HookDecision, HookRegistry, SaveHook, TimestampHook};
pub use keys::{KeyMapping, KeyResolver};
pub use scheduler::{schedule, OperationPlan, PlanStep};

use crate::changeset::{decode, decode_slice, DecodedChangeSet};
use crate::error::PipelineResult;
use crate::metadata::MetadataRegistry;
use crate::store::StoreAdapter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// Where a request currently is in its lifecycle. Terminal states are
/// `Committed` and `RolledBack`; failures before scheduling never open a
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Decoded,
    GraphBuilt,
    Scheduled,
    Committing,
    Committed,
    RolledBack,
}

/// The change-set persistence pipeline. Construct once with the process-wide
/// metadata registry and a store backend, then feed it save bundles.
pub struct SavePipeline {
    registry: Arc<MetadataRegistry>,
    store: Arc<dyn StoreAdapter>,
    hooks: HookRegistry,
}

impl SavePipeline {
    pub fn new(registry: Arc<MetadataRegistry>, store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            registry,
            store,
            hooks: HookRegistry::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Persist a save bundle already parsed into a JSON tree.
    ///
    /// Cancellation is whole-request: dropping the returned future abandons
    /// the in-flight session, which the store rolls back.
    pub async fn save_changes(&self, payload: &Value) -> PipelineResult<SaveResult> {
        let decoded = decode(&self.registry, payload)?;
        self.save_decoded(decoded).await
    }

    /// Persist a save bundle from raw request bytes.
    pub async fn save_changes_slice(&self, payload: &[u8]) -> PipelineResult<SaveResult> {
        let decoded = decode_slice(&self.registry, payload)?;
        self.save_decoded(decoded).await
    }

    async fn save_decoded(&self, decoded: DecodedChangeSet) -> PipelineResult<SaveResult> {
        let DecodedChangeSet {
            mut descriptors,
            options,
        } = decoded;
        let mut state = PipelineState::Decoded;
        debug!(?state, entities = descriptors.len(), "change-set decoded");

        if descriptors.is_empty() {
            return Ok(SaveResult::default());
        }

        let graph = DependencyGraph::build(&self.registry, &descriptors)?;
        state = PipelineState::GraphBuilt;
        debug!(?state, edges = graph.edges.len(), "dependency graph built");

        let plan = schedule(&descriptors, &graph)?;
        state = PipelineState::Scheduled;
        debug!(?state, steps = plan.steps.len(), "operation plan ready");

        let mut ctx = HookContext::new(self.registry.clone(), &options);
        state = PipelineState::Committing;
        debug!(?state, request_id = %ctx.request_id, "committing");

        let committer = Committer::new(self.store.as_ref(), &self.registry, &self.hooks);
        match committer.commit(&mut ctx, &mut descriptors, &plan).await {
            Ok(mut result) => {
                state = PipelineState::Committed;
                debug!(?state, entities = result.entities.len(), "save complete");
                self.hooks.after_save(&mut ctx, &result).await;
                result.warnings = ctx.warnings;
                Ok(result)
            }
            Err(err) => {
                state = PipelineState::RolledBack;
                error!(?state, error = %err, "save failed");
                Err(err)
            }
        }
    }
}
