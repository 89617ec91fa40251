pub mod branch;
pub mod change;
pub mod commit;
pub mod common;
pub mod conflict;
pub mod object;
pub mod snapshot;
pub mod tree;

pub use branch::*;
pub use change::*;
pub use commit::*;
pub use common::*;
pub use conflict::*;
pub use object::*;
pub use snapshot::*;
pub use tree::*;
