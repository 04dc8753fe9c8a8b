use std::sync::Arc;

use lazy_static::lazy_static;

use crate::{
    config::VfsConfig,
    delegate::{DelegateFs, MemoryFs},
    fs::PersistentFs,
    nodes::TreeEntry,
    recordstore::{MemoryRecordStore, RecordStore},
};

pub const HELLOWORLD_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_CONTENTS: &[u8] = b"";

lazy_static! {
    // 1MB
    pub static ref LARGE_CONTENTS: bytes::Bytes =
        (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();

    pub static ref SMALL_CACHE_CONFIG: VfsConfig = VfsConfig {
        content_cache_threshold: 1024,
        ..Default::default()
    };
}

/// A delegate holding a small project:
///
/// ```text
/// /project
/// ├── README.md
/// ├── docs/guide/intro.md
/// └── src/{lib.rs, main.rs}
/// ```
pub fn sample_tree() -> Arc<MemoryFs> {
    let fs = MemoryFs::default();
    fs.add_file("/project/README.md", HELLOWORLD_CONTENTS);
    fs.add_file("/project/src/main.rs", b"fn main() {}");
    fs.add_file("/project/src/lib.rs", EMPTY_CONTENTS);
    fs.add_file("/project/docs/guide/intro.md", b"# Intro");
    Arc::new(fs)
}

/// An engine over a fresh in-memory record store.
pub fn memory_vfs(config: VfsConfig) -> PersistentFs {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::default());
    PersistentFs::new(store, config).expect("must connect")
}

/// The `/project` root of [sample_tree] in a fresh engine.
pub fn sample_root(config: VfsConfig) -> (PersistentFs, Arc<MemoryFs>, Arc<TreeEntry>) {
    let fs = sample_tree();
    let vfs = memory_vfs(config);
    let delegate: Arc<dyn DelegateFs> = fs.clone();
    let root = vfs.find_root("/project", delegate).expect("must find root");
    (vfs, fs, root)
}

/// Walks `path` (relative to `root`, `/`-separated) with [PersistentFs::find_child].
pub fn lookup(vfs: &PersistentFs, root: &Arc<TreeEntry>, path: &str) -> Arc<TreeEntry> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .fold(root.clone(), |dir, name| {
            vfs.find_child(&dir, name)
                .expect("lookup must succeed")
                .unwrap_or_else(|| panic!("{} must exist", path))
        })
}
