mod errors;

pub mod config;
pub mod delegate;
pub mod events;
pub mod fs;
pub mod nodes;
pub mod recordstore;

pub use config::VfsConfig;
pub use errors::Error;
pub use fs::{ContentWriter, PersistentFs};
pub use nodes::{FileId, Flags, RootKind, TreeEntry};

#[cfg(test)]
mod fixtures;

// rstest_reuse templates in submodules resolve via the crate root.
#[cfg(test)]
use rstest_reuse;
