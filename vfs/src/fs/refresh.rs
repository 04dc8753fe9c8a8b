use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::PersistentFs;
use crate::{
    events::{ChangeEvent, FileEvent, Property},
    nodes::{is_valid_name, join_path, names_equal, FileId, Flags, TreeEntry},
    Error,
};

impl PersistentFs {
    /// Compares the persisted children of `dir` with what the delegate
    /// reports and applies the differences as one batch of events.
    ///
    /// Only directories whose children are cached are scanned; with
    /// `recursive`, cached subdirectories are scanned as well. Scanned
    /// directories are no longer dirty afterwards.
    #[instrument(skip(self, dir), fields(file.id = %dir.id()), err)]
    pub fn refresh(&self, dir: &Arc<TreeEntry>, recursive: bool) -> Result<(), Error> {
        let _guard = self.write_access();

        let mut events = Vec::new();
        let mut scanned = Vec::new();
        let mut stack = vec![dir.clone()];

        while let Some(current) = stack.pop() {
            if !current.is_directory() || !current.is_valid() {
                continue;
            }
            let id = self.file_id(&current)?;
            if !self.store.flags(id)?.contains(Flags::CHILDREN_CACHED) {
                continue;
            }

            let subdirs = match self.scan_directory(&current, id, &mut events) {
                Ok(subdirs) => subdirs,
                Err(e) if Arc::ptr_eq(&current, dir) => return Err(e),
                Err(e) => {
                    warn!(file.id = %id, err = %e, "failed to scan directory, skipping");
                    continue;
                }
            };
            if recursive {
                stack.extend(subdirs);
            }
            scanned.push(current);
        }

        debug!(events = events.len(), directories = scanned.len(), "refresh scanned");
        if !events.is_empty() {
            self.process_events(events);
        }
        for dir in scanned {
            dir.mark_clean();
        }
        Ok(())
    }

    /// Pushes the events describing how the children of `dir` differ from
    /// the delegate, and returns the child directories that are left alone.
    fn scan_directory(
        &self,
        dir: &Arc<TreeEntry>,
        id: FileId,
        events: &mut Vec<FileEvent>,
    ) -> Result<Vec<Arc<TreeEntry>>, Error> {
        let fs = dir.fs();
        let case_sensitive = fs.is_case_sensitive();
        let path = self.path(dir)?;

        let mut actual: Vec<String> = fs
            .list(&path)?
            .into_iter()
            .filter(|name| is_valid_name(name))
            .collect();
        let mut subdirs = Vec::new();

        for (child_id, name) in self.store.list_all(id)? {
            let position = actual
                .iter()
                .position(|candidate| names_equal(case_sensitive, candidate, &name));
            let Some(child) = self.find_child_by_id(dir, child_id, false)? else {
                warn!(file.id = %child_id, file.name = %name, "cannot materialize persisted child");
                continue;
            };

            let attributes = match position {
                Some(ix) => fs.attributes(&join_path(&path, &actual.swap_remove(ix)))?,
                None => None,
            };
            let Some(attributes) = attributes else {
                events.push(FileEvent::from_refresh(ChangeEvent::Delete { file: child }));
                continue;
            };

            let flags = self.store.flags(child_id)?;
            if attributes.is_directory != flags.contains(Flags::IS_DIRECTORY) {
                events.push(FileEvent::from_refresh(ChangeEvent::Delete { file: child }));
                events.push(FileEvent::from_refresh(ChangeEvent::Create {
                    parent: dir.clone(),
                    name,
                    is_directory: attributes.is_directory,
                }));
                continue;
            }

            if attributes.is_directory {
                subdirs.push(child.clone());
            } else if attributes.last_modified != self.store.timestamp(child_id)?
                || attributes.length as i64 != self.store.length(child_id)?
            {
                events.push(FileEvent::from_refresh(ChangeEvent::ContentChange {
                    file: child.clone(),
                    old_stamp: child.modification_stamp(),
                    new_stamp: self.next_modification_stamp(),
                }));
            }

            let writable = !flags.contains(Flags::IS_READ_ONLY);
            if writable != attributes.is_writable {
                events.push(FileEvent::from_refresh(ChangeEvent::PropertyChange {
                    file: child.clone(),
                    property: Property::Writable {
                        old: writable,
                        new: attributes.is_writable,
                    },
                }));
            }

            let hidden = flags.contains(Flags::IS_HIDDEN);
            if hidden != attributes.is_hidden {
                events.push(FileEvent::from_refresh(ChangeEvent::PropertyChange {
                    file: child,
                    property: Property::Hidden {
                        old: hidden,
                        new: attributes.is_hidden,
                    },
                }));
            }
        }

        // whatever is left was never persisted
        for name in actual {
            if let Some(attributes) = fs.attributes(&join_path(&path, &name))? {
                events.push(FileEvent::from_refresh(ChangeEvent::Create {
                    parent: dir.clone(),
                    name,
                    is_directory: attributes.is_directory,
                }));
            }
        }

        Ok(subdirs)
    }
}
