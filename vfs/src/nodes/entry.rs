use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use super::{names_equal, FileId, Flags, RootKind};
use crate::delegate::DelegateFs;

/// An in-memory node of the virtual file system tree.
///
/// Entries are shared as `Arc<TreeEntry>`. Parents are referenced by id and
/// resolved through the engine, so there are no reference cycles between a
/// directory and its children.
pub struct TreeEntry {
    id: FileId,
    fs: Arc<dyn DelegateFs>,
    root: Option<RootKind>,
    state: RwLock<EntryState>,

    // Some for directories.
    children: Option<RwLock<ChildSet>>,

    valid: AtomicBool,
    dirty: AtomicBool,
    modification_stamp: AtomicU64,
}

struct EntryState {
    parent: FileId,
    name: String,
    flags: Flags,
    link_target: Option<String>,
}

#[derive(Default)]
struct ChildSet {
    entries: BTreeMap<FileId, Arc<TreeEntry>>,
    all_loaded: bool,
}

impl TreeEntry {
    pub(crate) fn new_child(
        id: FileId,
        parent: FileId,
        name: String,
        flags: Flags,
        fs: Arc<dyn DelegateFs>,
        modification_stamp: u64,
    ) -> Self {
        Self::new(id, parent, name, flags, fs, None, modification_stamp)
    }

    pub(crate) fn new_root(
        id: FileId,
        kind: RootKind,
        flags: Flags,
        fs: Arc<dyn DelegateFs>,
        modification_stamp: u64,
    ) -> Self {
        let name = kind.name();
        Self::new(
            id,
            FileId::NONE,
            name,
            flags | Flags::IS_DIRECTORY,
            fs,
            Some(kind),
            modification_stamp,
        )
    }

    fn new(
        id: FileId,
        parent: FileId,
        name: String,
        flags: Flags,
        fs: Arc<dyn DelegateFs>,
        root: Option<RootKind>,
        modification_stamp: u64,
    ) -> Self {
        let children = flags
            .contains(Flags::IS_DIRECTORY)
            .then(|| RwLock::new(ChildSet::default()));

        Self {
            id,
            fs,
            root,
            state: RwLock::new(EntryState {
                parent,
                name,
                flags,
                link_target: None,
            }),
            children,
            valid: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            modification_stamp: AtomicU64::new(modification_stamp),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn fs(&self) -> &Arc<dyn DelegateFs> {
        &self.fs
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn parent_id(&self) -> FileId {
        self.state.read().parent
    }

    pub fn flags(&self) -> Flags {
        self.state.read().flags
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn root_kind(&self) -> Option<&RootKind> {
        self.root.as_ref()
    }

    pub fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    pub fn is_writable(&self) -> bool {
        !self.flags().contains(Flags::IS_READ_ONLY)
    }

    pub fn is_hidden(&self) -> bool {
        self.flags().contains(Flags::IS_HIDDEN)
    }

    pub fn is_symlink(&self) -> bool {
        self.flags().contains(Flags::IS_SYMLINK)
    }

    pub fn is_special(&self) -> bool {
        self.flags().contains(Flags::IS_SPECIAL)
    }

    pub fn link_target(&self) -> Option<String> {
        self.state.read().link_target.clone()
    }

    /// An entry stays valid until the file it describes is deleted.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn modification_stamp(&self) -> u64 {
        self.modification_stamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_modification_stamp(&self, stamp: u64) {
        self.modification_stamp.store(stamp, Ordering::Release);
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn set_name(&self, name: String) {
        self.state.write().name = name;
    }

    pub(crate) fn set_parent(&self, parent: FileId) {
        self.state.write().parent = parent;
    }

    pub(crate) fn update_flags(&self, mask: Flags, value: bool) {
        self.state.write().flags.set(mask, value);
    }

    pub(crate) fn set_link_target(&self, target: Option<String>) {
        self.state.write().link_target = target;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Marks this entry and every loaded descendant as dirty.
    pub(crate) fn mark_dirty_recursively(&self) {
        self.mark_dirty();
        for child in self.cached_children() {
            child.mark_dirty_recursively();
        }
    }

    /// Returns the children currently held in memory, ordered by id.
    pub fn cached_children(&self) -> Vec<Arc<TreeEntry>> {
        match &self.children {
            Some(children) => children.read().entries.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn cached_child(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        self.children
            .as_ref()
            .and_then(|children| children.read().entries.get(&id).cloned())
    }

    pub(crate) fn cached_child_by_name(
        &self,
        name: &str,
        case_sensitive: bool,
    ) -> Option<Arc<TreeEntry>> {
        let children = self.children.as_ref()?.read();
        children
            .entries
            .values()
            .find(|child| names_equal(case_sensitive, &child.name(), name))
            .cloned()
    }

    /// Adds `child` unless a child with the same id is already present, in
    /// which case the present one is returned.
    pub(crate) fn add_child(&self, child: Arc<TreeEntry>) -> Arc<TreeEntry> {
        match &self.children {
            Some(children) => children
                .write()
                .entries
                .entry(child.id())
                .or_insert(child)
                .clone(),
            None => child,
        }
    }

    pub(crate) fn remove_child(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        let mut children = self.children.as_ref()?.write();
        children.all_loaded = false;
        children.entries.remove(&id)
    }

    /// True once every persisted child has been materialized in memory.
    pub(crate) fn all_children_loaded(&self) -> bool {
        self.children
            .as_ref()
            .map(|c| c.read().all_loaded)
            .unwrap_or(false)
    }

    pub(crate) fn set_all_children_loaded(&self, loaded: bool) {
        if let Some(children) = &self.children {
            children.write().all_loaded = loaded;
        }
    }
}

impl fmt::Debug for TreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TreeEntry")
            .field("id", &self.id)
            .field("parent", &state.parent)
            .field("name", &state.name)
            .field("flags", &state.flags)
            .field("root", &self.root)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TreeEntry;
    use crate::{
        delegate::{DelegateFs, MemoryFs},
        nodes::{FileId, Flags, RootKind},
    };

    fn fs() -> Arc<dyn DelegateFs> {
        Arc::new(MemoryFs::default())
    }

    #[test]
    fn root_is_directory() {
        let root = TreeEntry::new_root(
            FileId::new(1),
            RootKind::for_path("/project", None),
            Flags::empty(),
            fs(),
            0,
        );
        assert!(root.is_root());
        assert!(root.is_directory());
        assert_eq!("/project", root.name());
        assert_eq!(FileId::NONE, root.parent_id());
    }

    #[test]
    fn add_child_keeps_first() {
        let fs = fs();
        let dir = TreeEntry::new_child(
            FileId::new(2),
            FileId::new(1),
            "dir".into(),
            Flags::IS_DIRECTORY,
            fs.clone(),
            0,
        );
        let first = Arc::new(TreeEntry::new_child(
            FileId::new(3),
            FileId::new(2),
            "a".into(),
            Flags::empty(),
            fs.clone(),
            0,
        ));
        let second = Arc::new(TreeEntry::new_child(
            FileId::new(3),
            FileId::new(2),
            "a".into(),
            Flags::empty(),
            fs,
            0,
        ));

        let added = dir.add_child(first.clone());
        assert!(Arc::ptr_eq(&first, &added));
        let added = dir.add_child(second);
        assert!(Arc::ptr_eq(&first, &added));

        assert!(dir.cached_child_by_name("A", false).is_some());
        assert!(dir.cached_child_by_name("A", true).is_none());

        assert!(dir.remove_child(FileId::new(3)).is_some());
        assert!(dir.cached_child(FileId::new(3)).is_none());
    }

    #[test]
    fn files_have_no_children() {
        let file = TreeEntry::new_child(
            FileId::new(2),
            FileId::new(1),
            "f".into(),
            Flags::IS_READ_ONLY | Flags::IS_HIDDEN,
            fs(),
            7,
        );
        assert!(!file.is_directory());
        assert!(!file.is_writable());
        assert!(file.is_hidden());
        assert_eq!(7, file.modification_stamp());
        assert!(file.cached_children().is_empty());
    }
}
