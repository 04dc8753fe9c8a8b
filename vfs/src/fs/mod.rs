//! The persistent file system engine.
//!
//! [PersistentFs] mirrors one or more delegate file systems into a
//! [RecordStore], materializes [TreeEntry] nodes lazily and applies batches of
//! change events to both the records and the in-memory tree.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::VfsConfig,
    events::{EventBus, ParentLookup},
    nodes::{is_valid_name, join_path, names_equal, FileId, Flags, TreeEntry},
    recordstore::RecordStore,
    Error,
};

mod apply;
mod content;
pub mod id_cache;
mod ops;
mod refresh;
pub mod roots;

#[cfg(test)]
mod tests;

pub use self::content::ContentWriter;
use self::{id_cache::IdCache, roots::RootRegistry};

pub struct PersistentFs {
    store: Arc<dyn RecordStore>,
    config: VfsConfig,
    bus: EventBus,
    roots: RootRegistry,
    id_cache: IdCache,

    // serializes content reads and writes against the record store
    input_lock: Mutex<()>,

    // single structural writer, reentrant so callers can batch operations
    write_lock: ReentrantMutex<()>,

    shut_down: AtomicBool,
    modification_stamp: AtomicU64,
}

impl PersistentFs {
    /// Connects to `store`.
    pub fn new(store: Arc<dyn RecordStore>, config: VfsConfig) -> Result<Self, Error> {
        let created = store.creation_timestamp()?;
        info!(store.created = created, roots = store.list_roots()?.len(), "connected to record store");

        Ok(Self {
            store,
            config,
            bus: EventBus::default(),
            roots: RootRegistry::default(),
            id_cache: IdCache::default(),
            input_lock: Mutex::new(()),
            write_lock: ReentrantMutex::new(()),
            shut_down: AtomicBool::new(false),
            modification_stamp: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// The bus every applied batch of events is published on.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Takes the structural write lock. Structural operations take it
    /// themselves; holding it across several of them makes them atomic with
    /// respect to other writers.
    pub fn write_access(&self) -> ReentrantMutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    pub(crate) fn next_modification_stamp(&self) -> u64 {
        self.modification_stamp.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Flushes the record store. Only the first call has an effect.
    pub fn dispose(&self) -> Result<(), Error> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("vfs dispose started");
        self.store.flush()?;
        self.id_cache.clear();
        info!("vfs dispose completed");
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn creation_timestamp(&self) -> Result<i64, Error> {
        self.store.creation_timestamp()
    }

    /// Drops the id cache. Entries stay reachable through their roots.
    pub fn on_low_memory(&self) {
        self.clear_id_cache();
    }

    pub(crate) fn clear_id_cache(&self) {
        self.id_cache.clear();
    }

    /// Returns the id of a live entry.
    pub fn file_id(&self, file: &TreeEntry) -> Result<FileId, Error> {
        let id = file.id();
        if !id.is_valid() || !file.is_valid() {
            return Err(Error::InvalidAccess(id));
        }
        Ok(id)
    }

    /// Resolves `id` to its entry, materializing the ancestor chain from the
    /// record store as needed.
    ///
    /// Returns None for unknown ids, for ids whose root is not registered and
    /// for corrupted parent chains.
    pub fn find_file_by_id(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        self.resolve(id, false)
    }

    /// Like [PersistentFs::find_file_by_id], but never loads the children of
    /// a directory whose children are not cached yet.
    pub fn find_file_by_id_if_cached(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        self.resolve(id, true)
    }

    #[instrument(skip(self), level = "trace")]
    fn resolve(&self, id: FileId, cached_only: bool) -> Option<Arc<TreeEntry>> {
        if !id.is_valid() {
            return None;
        }
        if let Some(cached) = self.id_cache.get(id) {
            return Some(cached);
        }

        match self.resolve_uncached(id, cached_only) {
            Ok(found) => found,
            Err(e) => {
                warn!(file.id = %id, err = %e, "failed to resolve file");
                None
            }
        }
    }

    fn resolve_uncached(&self, id: FileId, cached_only: bool) -> Result<Option<Arc<TreeEntry>>, Error> {
        // ids from the requested one upwards, up to the first cached ancestor
        let mut chain = vec![id];
        let mut current = id;

        let anchor = loop {
            let parent = self.store.parent(current)?;
            if !parent.is_valid() {
                match self.roots.by_id(current) {
                    Some(root) => {
                        chain.pop();
                        break root;
                    }
                    None => return Ok(None),
                }
            }

            if let Some(cached) = self.id_cache.get(parent) {
                break cached;
            }

            if chain.contains(&parent) || chain.len() >= self.config.depth_limit {
                self.log_dead_loop(&chain, parent);
                return Ok(None);
            }

            chain.push(parent);
            current = parent;
        };

        let mut entry = anchor;
        while let Some(next) = chain.pop() {
            match self.find_child_by_id(&entry, next, cached_only)? {
                Some(child) => entry = child,
                None => return Ok(None),
            }
        }
        Ok(Some(entry))
    }

    fn log_dead_loop(&self, chain: &[FileId], next: FileId) {
        let report = chain
            .iter()
            .chain(std::iter::once(&next))
            .map(|id| {
                format!(
                    "{} '{}' flags: 0x{:x} cached: {}",
                    id,
                    self.store.name(*id).unwrap_or_default(),
                    self.store.flags(*id).map(|f| f.bits()).unwrap_or_default(),
                    self.id_cache.contains(*id),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        error!(
            file.id = %chain[0],
            depth = chain.len(),
            "dead loop detected in persistent file system:\n{}",
            report
        );
    }

    /// Finds the child with the given id, materializing it from the store
    /// if needed.
    pub(crate) fn find_child_by_id(
        &self,
        dir: &Arc<TreeEntry>,
        id: FileId,
        cached_only: bool,
    ) -> Result<Option<Arc<TreeEntry>>, Error> {
        if !dir.is_directory() {
            return Ok(None);
        }
        if let Some(child) = dir.cached_child(id) {
            return Ok(Some(child));
        }

        let dir_id = self.file_id(dir)?;
        if cached_only && !self.store.flags(dir_id)?.contains(Flags::CHILDREN_CACHED) {
            return Ok(None);
        }
        if !self.store.list(dir_id)?.contains(&id) {
            return Ok(None);
        }
        self.materialize_child(dir, id).map(Some)
    }

    fn materialize_child(&self, dir: &Arc<TreeEntry>, id: FileId) -> Result<Arc<TreeEntry>, Error> {
        let child = Arc::new(TreeEntry::new_child(
            id,
            dir.id(),
            self.store.name(id)?,
            self.store.flags(id)?,
            dir.fs().clone(),
            self.next_modification_stamp(),
        ));

        let child = dir.add_child(child);
        if child.is_directory() {
            self.id_cache.cache(child.clone());
        }
        Ok(child)
    }

    /// The parent entry, None for roots.
    pub fn parent(&self, file: &TreeEntry) -> Option<Arc<TreeEntry>> {
        if file.is_root() {
            return None;
        }
        self.find_file_by_id(file.parent_id())
    }

    /// The rendered path of `file` on its delegate.
    pub fn path(&self, file: &Arc<TreeEntry>) -> Result<String, Error> {
        let mut names: Vec<String> = Vec::new();
        let mut current = file.clone();

        loop {
            if let Some(kind) = current.root_kind() {
                if names.is_empty() {
                    return Ok(kind.path());
                }
                let mut path = kind.child_prefix();
                for name in names.iter().rev() {
                    path = join_path(&path, name.as_str());
                }
                return Ok(path);
            }

            if names.len() >= self.config.depth_limit {
                return Err(Error::Corrupted(format!(
                    "path of {} exceeds {} components",
                    file.id(),
                    self.config.depth_limit
                )));
            }
            names.push(current.name());

            current = self.parent(&current).ok_or_else(|| {
                Error::Corrupted(format!(
                    "cannot resolve parent {} of {}",
                    current.parent_id(),
                    current.id()
                ))
            })?;
        }
    }

    /// Names of the children of `dir`, persisting them first if needed.
    pub fn list(&self, dir: &Arc<TreeEntry>) -> Result<Vec<String>, Error> {
        Ok(self.list_all(dir)?.into_iter().map(|(_, name)| name).collect())
    }

    /// Ids and names of the children of `dir`, persisting them first if
    /// needed.
    pub fn list_all(&self, dir: &Arc<TreeEntry>) -> Result<Vec<(FileId, String)>, Error> {
        let id = self.file_id(dir)?;
        if self.store.flags(id)?.contains(Flags::CHILDREN_CACHED) {
            return self.store.list_all(id);
        }
        self.persist_all_children(dir)
    }

    /// Names of the persisted children, without consulting the delegate.
    pub fn list_persisted(&self, dir: &TreeEntry) -> Result<Vec<String>, Error> {
        Ok(self
            .store
            .list_all(self.file_id(dir)?)?
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    #[instrument(skip(self, dir), fields(file.id = %dir.id()), err)]
    fn persist_all_children(&self, dir: &Arc<TreeEntry>) -> Result<Vec<(FileId, String)>, Error> {
        let _guard = self.write_access();
        let id = self.file_id(dir)?;
        if self.store.flags(id)?.contains(Flags::CHILDREN_CACHED) {
            return self.store.list_all(id);
        }

        let fs = dir.fs();
        let path = self.path(dir)?;
        let delegate_names: Vec<String> = fs
            .list(&path)?
            .into_iter()
            .filter(|name| is_valid_name(name))
            .collect();
        let persisted = self.store.list_all(id)?;

        if delegate_names.is_empty() && !persisted.is_empty() {
            return Ok(persisted);
        }

        let case_sensitive = fs.is_case_sensitive();
        let mut children: Vec<(FileId, String)> = Vec::with_capacity(delegate_names.len());
        for name in delegate_names {
            if let Some(existing) = persisted
                .iter()
                .find(|(_, persisted_name)| names_equal(case_sensitive, persisted_name, &name))
            {
                children.push(existing.clone());
                continue;
            }

            if let Some(attributes) = fs.attributes(&join_path(&path, &name))? {
                let child = self.create_and_fill_record(id, &name, &attributes)?;
                children.push((child, name));
            }
        }

        // persisted children the delegate no longer reports
        for (orphan, name) in &persisted {
            if !children.iter().any(|(child, _)| child == orphan) {
                debug!(file.id = %orphan, file.name = %name, "dropping vanished child");
                if let Some(entry) = dir.remove_child(*orphan) {
                    self.invalidate_subtree(&entry);
                }
                self.store.delete_record_recursively(*orphan)?;
            }
        }

        let ids: Vec<FileId> = children.iter().map(|(child, _)| *child).collect();
        self.store.update_list(id, &ids)?;
        self.set_flag(dir, Flags::CHILDREN_CACHED, true)?;

        Ok(children)
    }

    /// Allocates a record for a new child of `parent` and fills it from the
    /// delegate's attributes. The caller links it into the parent's list.
    pub(crate) fn create_and_fill_record(
        &self,
        parent: FileId,
        name: &str,
        attributes: &crate::delegate::FileAttributes,
    ) -> Result<FileId, Error> {
        let id = self.store.create_record()?;
        if let Err(e) = self
            .store
            .write_attributes_to_record(id, parent, name, attributes)
        {
            if let Err(cleanup) = self.store.delete_record_recursively(id) {
                warn!(file.id = %id, err = %cleanup, "failed to drop half-written record");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// All children of `dir`, materialized and ordered by name.
    pub fn children(&self, dir: &Arc<TreeEntry>) -> Result<Vec<Arc<TreeEntry>>, Error> {
        if !dir.is_directory() {
            return Ok(Vec::new());
        }

        if dir.all_children_loaded() {
            self.file_id(dir)?;
            let mut children = dir.cached_children();
            children.sort_by_cached_key(|c| c.name());
            return Ok(children);
        }

        let mut children = Vec::new();
        for (id, _) in self.list_all(dir)? {
            children.push(match dir.cached_child(id) {
                Some(child) => child,
                None => self.materialize_child(dir, id)?,
            });
        }
        dir.set_all_children_loaded(true);

        children.sort_by_cached_key(|c| c.name());
        Ok(children)
    }

    /// Whether the children list of `dir` mirrors the delegate.
    pub fn are_children_loaded(&self, dir: &TreeEntry) -> Result<bool, Error> {
        Ok(self
            .store
            .flags(self.file_id(dir)?)?
            .contains(Flags::CHILDREN_CACHED))
    }

    /// Looks up a child by name, asking the delegate if it is not persisted.
    pub fn find_child(&self, dir: &Arc<TreeEntry>, name: &str) -> Result<Option<Arc<TreeEntry>>, Error> {
        if !dir.is_directory() {
            return Ok(None);
        }
        if let Some(child) = dir.cached_child_by_name(name, dir.fs().is_case_sensitive()) {
            return Ok(Some(child));
        }

        let id = self.child_id(dir, name)?;
        if !id.is_valid() {
            return Ok(None);
        }
        self.find_child_by_id(dir, id, false)
    }

    /// Returns the id of the child named `name`, creating its record if the
    /// delegate has such a file. Returns [FileId::NONE] if there is none.
    pub fn child_id(&self, dir: &Arc<TreeEntry>, name: &str) -> Result<FileId, Error> {
        let parent = self.file_id(dir)?;
        let case_sensitive = dir.fs().is_case_sensitive();
        let persisted_child = |store: &dyn RecordStore| -> Result<Option<FileId>, Error> {
            Ok(store
                .list_all(parent)?
                .into_iter()
                .find(|(_, n)| names_equal(case_sensitive, n, name))
                .map(|(id, _)| id))
        };

        if let Some(id) = persisted_child(self.store.as_ref())? {
            return Ok(id);
        }
        if !is_valid_name(name) {
            return Ok(FileId::NONE);
        }

        let _guard = self.write_access();
        if let Some(id) = persisted_child(self.store.as_ref())? {
            return Ok(id);
        }

        let path = join_path(&self.path(dir)?, name);
        match dir.fs().attributes(&path)? {
            Some(attributes) => {
                let id = self.create_and_fill_record(parent, name, &attributes)?;
                self.append_to_parent_list(parent, id)?;
                Ok(id)
            }
            None => Ok(FileId::NONE),
        }
    }

    pub(crate) fn append_to_parent_list(&self, parent: FileId, child: FileId) -> Result<(), Error> {
        let mut children = self.store.list(parent)?;
        if !children.contains(&child) {
            children.push(child);
            self.store.update_list(parent, &children)?;
        }
        Ok(())
    }

    pub(crate) fn remove_from_parent_list(&self, parent: FileId, child: FileId) -> Result<(), Error> {
        let mut children = self.store.list(parent)?;
        let before = children.len();
        children.retain(|c| *c != child);
        if children.len() == before {
            return Err(Error::Corrupted(format!(
                "cannot find child {} in {}, actual children: {:?}",
                child, parent, children
            )));
        }
        self.store.update_list(parent, &children)
    }

    /// Sets or clears `mask` on both the record and the entry.
    pub(crate) fn set_flag(&self, file: &TreeEntry, mask: Flags, value: bool) -> Result<(), Error> {
        let id = self.file_id(file)?;
        let old = self.store.flags(id)?;
        let mut new = old;
        new.set(mask, value);
        if new != old {
            self.store.set_flags(id, new)?;
        }
        file.update_flags(mask, value);
        Ok(())
    }

    /// Marks `file` and every loaded descendant as invalid.
    pub(crate) fn invalidate_subtree(&self, file: &Arc<TreeEntry>) {
        let mut stack = vec![file.clone()];
        while let Some(entry) = stack.pop() {
            entry.invalidate();
            self.id_cache.remove(entry.id());
            stack.extend(entry.cached_children());
        }
    }

    /// The persisted flags of a record.
    pub fn file_flags(&self, id: FileId) -> Result<Flags, Error> {
        self.store.flags(id)
    }

    /// The persisted name of a record.
    pub fn name(&self, id: FileId) -> Result<String, Error> {
        self.store.name(id)
    }

    pub fn exists(&self, file: &TreeEntry) -> bool {
        file.is_valid()
    }

    pub fn is_directory(&self, file: &TreeEntry) -> bool {
        file.is_directory()
    }

    pub fn is_writable(&self, file: &TreeEntry) -> Result<bool, Error> {
        Ok(!self.file_flags(self.file_id(file)?)?.contains(Flags::IS_READ_ONLY))
    }

    pub fn is_hidden(&self, file: &TreeEntry) -> Result<bool, Error> {
        Ok(self.file_flags(self.file_id(file)?)?.contains(Flags::IS_HIDDEN))
    }

    pub fn is_symlink(&self, file: &TreeEntry) -> Result<bool, Error> {
        Ok(self.file_flags(self.file_id(file)?)?.contains(Flags::IS_SYMLINK))
    }

    pub fn is_special_file(&self, file: &TreeEntry) -> Result<bool, Error> {
        Ok(self.file_flags(self.file_id(file)?)?.contains(Flags::IS_SPECIAL))
    }

    /// The target of a symlink, asked from the delegate on first use.
    pub fn symlink_target(&self, file: &Arc<TreeEntry>) -> Result<Option<String>, Error> {
        if !self.is_symlink(file)? {
            return Ok(None);
        }
        if let Some(target) = file.link_target() {
            return Ok(Some(target));
        }
        let target = file.fs().symlink_target(&self.path(file)?)?;
        file.set_link_target(target.clone());
        Ok(target)
    }

    pub fn timestamp(&self, file: &TreeEntry) -> Result<i64, Error> {
        self.store.timestamp(self.file_id(file)?)
    }

    /// Sets the timestamp on the delegate and the record.
    pub fn set_timestamp(&self, file: &Arc<TreeEntry>, timestamp: i64) -> Result<(), Error> {
        let id = self.file_id(file)?;
        file.fs().set_timestamp(&self.path(file)?, timestamp)?;
        self.store.set_timestamp(id, timestamp)
    }

    /// Modification count of a single record.
    pub fn modification_count(&self, file: &TreeEntry) -> Result<u64, Error> {
        self.store.record_mod_count(self.file_id(file)?)
    }

    pub fn filesystem_modification_count(&self) -> Result<u64, Error> {
        self.store.mod_count()
    }

    pub fn cheap_filesystem_modification_count(&self) -> Result<u64, Error> {
        self.store.local_mod_count()
    }

    pub fn read_attribute(&self, file: &TreeEntry, key: &str) -> Result<Option<bytes::Bytes>, Error> {
        self.store.read_attribute(self.file_id(file)?, key)
    }

    pub fn write_attribute(&self, file: &TreeEntry, key: &str, value: &[u8]) -> Result<(), Error> {
        self.store.write_attribute(self.file_id(file)?, key, value)
    }
}

impl ParentLookup for PersistentFs {
    fn parent_of(&self, entry: &TreeEntry) -> Option<Arc<TreeEntry>> {
        self.parent(entry)
    }
}
