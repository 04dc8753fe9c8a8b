use std::sync::Arc;

use dashmap::DashMap;

use crate::nodes::{FileId, TreeEntry};

/// Concurrent id to directory lookup table.
///
/// Only directories are cached; files are found through their (cached)
/// parent. Insertion keeps the first entry registered for an id, so that
/// racing resolvers agree on a single object.
#[derive(Default)]
pub struct IdCache {
    dirs: DashMap<FileId, Arc<TreeEntry>>,
}

impl IdCache {
    pub fn get(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        self.dirs.get(&id).map(|e| e.value().clone())
    }

    /// Registers `entry` unless another entry is already cached for its id.
    /// Returns whichever entry ends up cached.
    pub fn cache(&self, entry: Arc<TreeEntry>) -> Arc<TreeEntry> {
        debug_assert!(entry.is_directory(), "only directories are cached");
        self.dirs.entry(entry.id()).or_insert(entry).value().clone()
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.dirs.contains_key(&id)
    }

    pub fn remove(&self, id: FileId) {
        self.dirs.remove(&id);
    }

    pub fn clear(&self) {
        self.dirs.clear();
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
