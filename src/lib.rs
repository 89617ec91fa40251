pub mod config;
pub mod context;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use context::{CancelHandle, OpContext};
pub use error::{Result, VcsError};

// Export logic types
pub use logic::{
    BranchManager, ChangeListener, ChangeTracker, CheckpointRequest, CommitGraph,
    ConflictResolver, FnListener, ObjectStorage, SnapshotManager, SubscriptionId, SyncEngine,
    SyncReport, TreeBuilder, TreeStorage,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{InMemoryEntityStore, InMemoryStore, PostgresStore, Store};
