use std::{collections::HashMap, sync::Arc};

use tracing::{debug, error, instrument};

use super::PersistentFs;
use crate::{
    events::{validate_events, ChangeEvent, FileEvent, Property},
    nodes::{join_path, names_equal, FileId, Flags, TreeEntry, LENGTH_UNKNOWN, TIMESTAMP_UNKNOWN},
    Error,
};

impl PersistentFs {
    /// Applies a single event. See [PersistentFs::process_events].
    pub fn process_event(&self, event: FileEvent) {
        self.process_events(vec![event])
    }

    /// Validates and applies a batch of events.
    ///
    /// Listeners see the validated batch before and after it is applied.
    /// Creations and deletions sharing a parent are applied together with a
    /// single update of the parent's children list. A failing event is logged
    /// and skipped, the rest of the batch is still applied.
    #[instrument(skip_all, fields(events = events.len()))]
    pub fn process_events(&self, events: Vec<FileEvent>) {
        let _guard = self.write_access();

        let events = validate_events(events, self);
        self.bus.publish_before(&events);

        // creations and deletions grouped by parent, in first-seen order
        let mut groups: Vec<(Arc<TreeEntry>, Vec<&FileEvent>)> = Vec::new();
        let mut group_index: HashMap<FileId, usize> = HashMap::new();

        for event in &events {
            let parent = match &event.change {
                ChangeEvent::Create { parent, .. } => Some(parent.clone()),
                ChangeEvent::Delete { file } => self.parent(file),
                _ => None,
            };

            match parent {
                Some(parent) => {
                    let ix = *group_index.entry(parent.id()).or_insert_with(|| {
                        groups.push((parent.clone(), Vec::new()));
                        groups.len() - 1
                    });
                    groups[ix].1.push(event);
                }
                None => self.apply_logged(event, |event| self.apply_event(event)),
            }
        }

        for (parent, group) in &groups {
            if let Err(e) = self.apply_children_change_events(parent, group) {
                error!(file.id = %parent.id(), err = %e, "failed to apply children changes");
            }
        }

        self.bus.publish_after(&events);
    }

    fn apply_logged(&self, event: &FileEvent, f: impl FnOnce(&FileEvent) -> Result<(), Error>) {
        if let Err(e) = f(event) {
            error!(event = %event, err = %e, "failed to apply event");
        }
    }

    fn apply_event(&self, event: &FileEvent) -> Result<(), Error> {
        match &event.change {
            ChangeEvent::Create { parent, name, .. } => {
                self.execute_create_child(parent, name).map(|_| ())
            }
            ChangeEvent::Delete { file } => self.execute_delete(file),
            ChangeEvent::ContentChange {
                file, new_stamp, ..
            } => self.execute_touch(file, event.from_refresh, *new_stamp),
            ChangeEvent::Copy {
                new_parent,
                new_name,
                ..
            } => self.execute_create_child(new_parent, new_name).map(|_| ()),
            ChangeEvent::Move { file, new_parent } => self.execute_move(file, new_parent),
            ChangeEvent::Rename { file, new_name, .. } => self.execute_rename(file, new_name),
            ChangeEvent::PropertyChange { file, property } => match property {
                Property::Writable { new, .. } => self.set_flag(file, Flags::IS_READ_ONLY, !new),
                Property::Hidden { new, .. } => self.set_flag(file, Flags::IS_HIDDEN, *new),
                Property::SymlinkTarget { new, .. } => {
                    file.set_link_target(new.clone());
                    Ok(())
                }
            },
        }
    }

    /// Applies creations and deletions below `parent` with one update of its
    /// children list.
    fn apply_children_change_events(
        &self,
        parent: &Arc<TreeEntry>,
        events: &[&FileEvent],
    ) -> Result<(), Error> {
        let parent_id = self.file_id(parent)?;
        let fs = parent.fs();
        let case_sensitive = fs.is_case_sensitive();
        let parent_path = self.path(parent)?;

        let mut children = self.store.list(parent_id)?;
        let mut created: Vec<Arc<TreeEntry>> = Vec::new();
        let mut deleted: Vec<Arc<TreeEntry>> = Vec::new();

        for event in events {
            match &event.change {
                ChangeEvent::Create { name, .. } => {
                    if self.has_child_named(&children, name, case_sensitive)? {
                        debug!(file.name = %name, "child already exists, skipping creation");
                        continue;
                    }

                    let attributes = match fs.attributes(&join_path(&parent_path, name)) {
                        Ok(Some(attributes)) => attributes,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(event = %event, err = %e, "failed to apply event");
                            continue;
                        }
                    };
                    let id = match self.create_and_fill_record(parent_id, name, &attributes) {
                        Ok(id) => id,
                        Err(e) => {
                            error!(event = %event, err = %e, "failed to apply event");
                            continue;
                        }
                    };
                    children.push(id);
                    created.push(Arc::new(TreeEntry::new_child(
                        id,
                        parent_id,
                        name.clone(),
                        attributes.flags(),
                        fs.clone(),
                        self.next_modification_stamp(),
                    )));
                }
                ChangeEvent::Delete { file } => {
                    let id = file.id();
                    let before = children.len();
                    children.retain(|c| *c != id);
                    if children.len() == before {
                        error!(file.id = %id, "deleting a file which does not exist");
                        continue;
                    }
                    deleted.push(file.clone());
                }
                _ => {}
            }
        }

        self.store.update_list(parent_id, &children)?;

        if !deleted.is_empty() {
            self.clear_id_cache();
        }
        for file in deleted {
            parent.remove_child(file.id());
            self.invalidate_subtree(&file);
            if let Err(e) = self.store.delete_record_recursively(file.id()) {
                error!(file.id = %file.id(), err = %e, "failed to delete record");
            }
        }
        for child in created {
            parent.add_child(child);
        }
        Ok(())
    }

    fn has_child_named(
        &self,
        children: &[FileId],
        name: &str,
        case_sensitive: bool,
    ) -> Result<bool, Error> {
        for id in children {
            if names_equal(case_sensitive, &self.store.name(*id)?, name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Creates the record and entry of a new child, if the delegate reports
    /// it. Returns None when the file vanished in the meantime.
    pub(crate) fn execute_create_child(
        &self,
        parent: &Arc<TreeEntry>,
        name: &str,
    ) -> Result<Option<Arc<TreeEntry>>, Error> {
        let parent_id = self.file_id(parent)?;
        let path = join_path(&self.path(parent)?, name);
        let attributes = match parent.fs().attributes(&path)? {
            Some(attributes) => attributes,
            None => return Ok(None),
        };

        let case_sensitive = parent.fs().is_case_sensitive();
        for (existing, existing_name) in self.store.list_all(parent_id)? {
            if names_equal(case_sensitive, &existing_name, name) {
                debug!(file.name = %name, "child already exists, skipping creation");
                return self.find_child_by_id(parent, existing, false);
            }
        }

        let id = self.create_and_fill_record(parent_id, name, &attributes)?;
        self.append_to_parent_list(parent_id, id)?;

        let child = parent.add_child(Arc::new(TreeEntry::new_child(
            id,
            parent_id,
            name.to_string(),
            attributes.flags(),
            parent.fs().clone(),
            self.next_modification_stamp(),
        )));
        Ok(Some(child))
    }

    #[instrument(skip(self, file), fields(file.id = %file.id()))]
    pub(crate) fn execute_delete(&self, file: &Arc<TreeEntry>) -> Result<(), Error> {
        if !file.is_valid() {
            error!("deleting a file which does not exist");
            return Ok(());
        }
        self.clear_id_cache();

        let id = file.id();
        if file.is_root() {
            self.roots.remove(id);
            self.store.delete_root_record(id)?;
        } else {
            let parent = self.parent(file).ok_or_else(|| {
                Error::Corrupted(format!("cannot resolve parent of {}", id))
            })?;
            self.remove_from_parent_list(parent.id(), id)?;
            parent.remove_child(id);
        }

        self.store.delete_record_recursively(id)?;
        self.invalidate_subtree(file);
        Ok(())
    }

    pub(crate) fn execute_rename(&self, file: &TreeEntry, new_name: &str) -> Result<(), Error> {
        if file.is_root() {
            return Err(Error::InvalidRequest(format!("cannot rename root {}", file.id())));
        }
        self.store.set_name(self.file_id(file)?, new_name)?;
        file.set_name(new_name.to_string());
        Ok(())
    }

    pub(crate) fn execute_move(
        &self,
        file: &Arc<TreeEntry>,
        new_parent: &Arc<TreeEntry>,
    ) -> Result<(), Error> {
        if file.is_root() {
            return Err(Error::InvalidRequest(format!("cannot move root {}", file.id())));
        }
        let id = self.file_id(file)?;
        let new_parent_id = self.file_id(new_parent)?;
        if !new_parent.is_directory() {
            return Err(Error::InvalidRequest(format!("{} is not a directory", new_parent_id)));
        }

        // the new parent must not be the file itself or one of its descendants
        let mut current = Some(new_parent.clone());
        while let Some(entry) = current {
            if entry.id() == id {
                return Err(Error::InvalidRequest(format!(
                    "cannot move {} into its own subtree",
                    id
                )));
            }
            current = self.parent(&entry);
        }

        let old_parent = self
            .parent(file)
            .ok_or_else(|| Error::Corrupted(format!("cannot resolve parent of {}", id)))?;

        self.clear_id_cache();

        self.remove_from_parent_list(old_parent.id(), id)?;
        self.store.set_parent(id, new_parent_id)?;
        self.append_to_parent_list(new_parent_id, id)?;

        old_parent.remove_child(id);
        file.set_parent(new_parent_id);
        new_parent.add_child(file.clone());
        Ok(())
    }

    /// Refreshes length and timestamp of `file` from the delegate and moves
    /// its modification stamp.
    /// With `reload_content`, the cached content is marked stale.
    pub(crate) fn execute_touch(
        &self,
        file: &Arc<TreeEntry>,
        reload_content: bool,
        new_stamp: u64,
    ) -> Result<(), Error> {
        let id = self.file_id(file)?;
        if reload_content {
            self.set_flag(file, Flags::MUST_RELOAD_CONTENT, true)?;
        }

        let attributes = file.fs().attributes(&self.path(file)?)?;
        self.store.set_length(
            id,
            attributes
                .map(|a| a.length as i64)
                .unwrap_or(LENGTH_UNKNOWN),
        )?;
        self.store.set_timestamp(
            id,
            attributes
                .map(|a| a.last_modified)
                .unwrap_or(TIMESTAMP_UNKNOWN),
        )?;

        file.set_modification_stamp(new_stamp);
        Ok(())
    }
}
