use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, error, instrument};

use super::PersistentFs;
use crate::{
    delegate::DelegateFs,
    nodes::{clean_path, names_equal, FileId, RootKind, TreeEntry},
    Error,
};

#[derive(Default)]
struct Roots {
    by_url: HashMap<String, Arc<TreeEntry>>,
    by_id: HashMap<FileId, Arc<TreeEntry>>,
}

/// The registry of root entries, keyed both by normalized url and by id.
#[derive(Default)]
pub struct RootRegistry {
    roots: RwLock<Roots>,
}

impl RootRegistry {
    pub fn get(&self, url: &str) -> Option<Arc<TreeEntry>> {
        self.roots.read().by_url.get(url).cloned()
    }

    pub fn by_id(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        self.roots.read().by_id.get(&id).cloned()
    }

    /// All registered roots, ordered by id.
    pub fn all(&self) -> Vec<Arc<TreeEntry>> {
        let mut roots: Vec<_> = self.roots.read().by_id.values().cloned().collect();
        roots.sort_by_key(|r| r.id());
        roots
    }

    /// Registers the root produced by `create` under `url`, unless a root is
    /// already registered there. `create` runs with the registry locked.
    fn get_or_insert_with(
        &self,
        url: &str,
        create: impl FnOnce() -> Result<Arc<TreeEntry>, Error>,
    ) -> Result<(Arc<TreeEntry>, bool), Error> {
        let mut roots = self.roots.write();
        if let Some(existing) = roots.by_url.get(url) {
            return Ok((existing.clone(), false));
        }

        let root = create()?;
        roots.by_url.insert(url.to_string(), root.clone());
        roots.by_id.insert(root.id(), root.clone());
        Ok((root, true))
    }

    /// Unregisters the root with the given id from both tables.
    pub fn remove(&self, id: FileId) -> Option<Arc<TreeEntry>> {
        let mut roots = self.roots.write();
        roots.by_url.retain(|_, root| root.id() != id);
        roots.by_id.remove(&id)
    }
}

/// Builds the registry key of a root: `protocol://` followed by the cleaned
/// path without trailing slashes, lowercased on case-insensitive delegates.
pub fn normalize_root_url(base_path: &str, fs: &dyn DelegateFs) -> String {
    let normalized = fs.normalize(&clean_path(base_path));
    let mut url = format!("{}://{}", fs.protocol(), normalized);

    let min_len = fs.protocol().len() + "://".len() + 1;
    while url.len() > min_len && url.ends_with('/') {
        url.pop();
    }

    if fs.is_case_sensitive() {
        url
    } else {
        url.to_lowercase()
    }
}

impl PersistentFs {
    /// Returns the root entry for `base_path` on `fs`, creating and
    /// persisting it on first use.
    ///
    /// Different spellings of the same path resolve to the same entry.
    /// Paths containing the archive separator of `fs` produce archive roots.
    #[instrument(skip(self, fs), fields(root.protocol = fs.protocol()), err)]
    pub fn find_root(
        &self,
        base_path: &str,
        fs: Arc<dyn DelegateFs>,
    ) -> Result<Arc<TreeEntry>, Error> {
        if base_path.is_empty() {
            error!("invalid root: empty path");
            return Err(Error::InvalidRequest("empty root path".to_string()));
        }

        let url = normalize_root_url(base_path, fs.as_ref());
        if let Some(root) = self.roots.get(&url) {
            return Ok(root);
        }

        let root_id = self.store.find_root_record(&url)?;
        let kind = RootKind::for_path(base_path, fs.archive_separator());
        let root_path = kind.path();

        let attributes = match fs.attributes(&root_path)? {
            Some(a) if a.is_directory => a,
            _ => {
                return Err(Error::NotFound(format!(
                    "root {} is not an existing directory",
                    root_path
                )))
            }
        };

        let mut mark_dirty = false;
        let (root, created) = self.roots.get_or_insert_with(&url, || {
            let name = kind.name();
            let persisted_name = self.store.name(root_id)?;
            if names_equal(fs.is_case_sensitive(), &name, &persisted_name) {
                mark_dirty = attributes.last_modified != self.store.timestamp(root_id)?;
            } else {
                self.store
                    .write_attributes_to_record(root_id, FileId::NONE, &name, &attributes)?;
            }

            let flags = self.store.flags(root_id)?;
            Ok(Arc::new(TreeEntry::new_root(
                root_id,
                kind,
                flags,
                fs.clone(),
                self.next_modification_stamp(),
            )))
        })?;

        if created {
            debug!(root.url = %url, root.id = %root.id(), "registered root");
            if mark_dirty {
                root.mark_dirty_recursively();
            }
        }
        Ok(root)
    }

    /// All registered roots.
    pub fn roots(&self) -> Vec<Arc<TreeEntry>> {
        self.roots.all()
    }

    /// The registered roots living on `fs`.
    pub fn roots_for(&self, fs: &Arc<dyn DelegateFs>) -> Vec<Arc<TreeEntry>> {
        self.roots
            .all()
            .into_iter()
            .filter(|root| std::ptr::addr_eq(Arc::as_ptr(root.fs()), Arc::as_ptr(fs)))
            .collect()
    }

    /// Roots on local, non-temporary delegates.
    pub fn local_roots(&self) -> Vec<Arc<TreeEntry>> {
        self.roots
            .all()
            .into_iter()
            .filter(|root| root.fs().is_local() && !root.fs().is_temporary())
            .collect()
    }
}
