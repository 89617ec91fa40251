pub mod branch_ops;
pub mod change_tracker;
pub mod commit_graph;
pub mod conflict_resolver;
pub mod listeners;
pub mod merge;
pub mod object_store;
pub mod snapshot_store;
pub mod sync;
pub mod tree_store;

pub use branch_ops::*;
pub use change_tracker::*;
pub use commit_graph::*;
pub use conflict_resolver::*;
pub use listeners::*;
pub use merge::*;
pub use object_store::*;
pub use snapshot_store::*;
pub use sync::*;
pub use tree_store::*;
