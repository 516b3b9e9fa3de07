pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use config::{AppConfig, EngineSettings};
pub use error::{EngineError, EngineResult};

// Export the engine and its services
pub use logic::{
    BatchOutcome, BlockRef, BlockRegistry, CanvasStateStore, Engine, GraphEdit, GraphValidation,
    InstanceGraph, InstanceLifecycleManager, LifecycleAction, MarketplaceService, NewConnection,
    SchemaValidator, SnapshotManager, TemplateService,
};

// Export all model types
pub use model::*;

pub use seed::seed_builtin_blocks;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store, WriteBatch, WriteOp};
