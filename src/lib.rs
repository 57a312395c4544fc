// saveflow - atomic change-set persistence for client-submitted entity graphs

// Change-set model - descriptors and the wire decoder
pub mod changeset;

// Entity-type metadata supplied by the host at startup
pub mod metadata;

// The save pipeline - graph, scheduler, keys, hooks, committer
pub mod pipeline;

// Store abstraction and backends
pub mod store;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use changeset::{ChangeKind, EntityDescriptor, SaveOptions};
pub use error::{EntityError, ErrorKind, PipelineResult, SaveError};
pub use metadata::{
    EntityMetadata, FieldMetadata, ForeignKeyMetadata, KeyStrategy, MetadataRegistry,
};
pub use pipeline::{
    HookContext, HookDecision, HookRegistry, SaveHook, SavePipeline, SaveResult,
};
pub use store::{MemoryStore, PostgresStore, StoreAction, StoreAdapter};
