pub mod blob_fs;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use blob_fs::*;
pub use memory::*;
pub use postgres::*;
pub use traits::*;
