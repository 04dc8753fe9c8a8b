use std::sync::Arc;

use tracing::instrument;

use super::PersistentFs;
use crate::{
    events::{ChangeEvent, FileEvent, Property},
    nodes::{is_valid_name, TreeEntry},
    Error,
};

fn check_name(name: &str) -> Result<(), Error> {
    if !is_valid_name(name) {
        return Err(Error::InvalidRequest(format!("invalid file name: {:?}", name)));
    }
    Ok(())
}

impl PersistentFs {
    #[instrument(skip(self, parent), fields(file.id = %parent.id()), err)]
    pub fn create_child_file(&self, parent: &Arc<TreeEntry>, name: &str) -> Result<Arc<TreeEntry>, Error> {
        self.create_child(parent, name, false)
    }

    #[instrument(skip(self, parent), fields(file.id = %parent.id()), err)]
    pub fn create_child_directory(
        &self,
        parent: &Arc<TreeEntry>,
        name: &str,
    ) -> Result<Arc<TreeEntry>, Error> {
        self.create_child(parent, name, true)
    }

    fn create_child(&self, parent: &Arc<TreeEntry>, name: &str, is_directory: bool) -> Result<Arc<TreeEntry>, Error> {
        check_name(name)?;
        let _guard = self.write_access();
        self.file_id(parent)?;
        if !parent.is_directory() {
            return Err(Error::InvalidRequest(format!("{} is not a directory", parent.id())));
        }

        let path = self.path(parent)?;
        if is_directory {
            parent.fs().create_child_directory(&path, name)?;
        } else {
            parent.fs().create_child_file(&path, name)?;
        }

        self.process_event(FileEvent::new(ChangeEvent::Create {
            parent: parent.clone(),
            name: name.to_string(),
            is_directory,
        }));

        self.find_child(parent, name)?
            .ok_or_else(|| Error::NotFound(format!("cannot create child {} in {}", name, path)))
    }

    /// Deletes `file` on the delegate. The deletion is only mirrored if the
    /// delegate no longer reports the file afterwards.
    #[instrument(skip(self, file), fields(file.id = %file.id()), err)]
    pub fn delete_file(&self, file: &Arc<TreeEntry>) -> Result<(), Error> {
        let _guard = self.write_access();
        self.file_id(file)?;
        let path = self.path(file)?;

        file.fs().delete(&path)?;
        if !file.fs().exists(&path)? {
            self.process_event(FileEvent::new(ChangeEvent::Delete { file: file.clone() }));
        }
        Ok(())
    }

    #[instrument(skip(self, file), fields(file.id = %file.id()), err)]
    pub fn rename_file(&self, file: &Arc<TreeEntry>, new_name: &str) -> Result<(), Error> {
        check_name(new_name)?;
        if file.is_root() {
            return Err(Error::InvalidRequest(format!("cannot rename root {}", file.id())));
        }
        let _guard = self.write_access();
        self.file_id(file)?;

        let old_name = file.name();
        file.fs().rename(&self.path(file)?, new_name)?;

        self.process_event(FileEvent::new(ChangeEvent::Rename {
            file: file.clone(),
            old_name,
            new_name: new_name.to_string(),
        }));
        Ok(())
    }

    #[instrument(skip(self, file, new_parent), fields(file.id = %file.id(), new_parent.id = %new_parent.id()), err)]
    pub fn move_file(&self, file: &Arc<TreeEntry>, new_parent: &Arc<TreeEntry>) -> Result<(), Error> {
        if file.is_root() {
            return Err(Error::InvalidRequest(format!("cannot move root {}", file.id())));
        }
        let _guard = self.write_access();
        self.file_id(file)?;
        self.file_id(new_parent)?;

        file.fs()
            .move_to(&self.path(file)?, &self.path(new_parent)?)?;

        self.process_event(FileEvent::new(ChangeEvent::Move {
            file: file.clone(),
            new_parent: new_parent.clone(),
        }));
        Ok(())
    }

    #[instrument(skip(self, file, new_parent), fields(file.id = %file.id(), new_parent.id = %new_parent.id()), err)]
    pub fn copy_file(
        &self,
        file: &Arc<TreeEntry>,
        new_parent: &Arc<TreeEntry>,
        new_name: &str,
    ) -> Result<Arc<TreeEntry>, Error> {
        check_name(new_name)?;
        let _guard = self.write_access();
        self.file_id(file)?;
        self.file_id(new_parent)?;

        let parent_path = self.path(new_parent)?;
        file.fs()
            .copy(&self.path(file)?, &parent_path, new_name)?;

        self.process_event(FileEvent::new(ChangeEvent::Copy {
            file: file.clone(),
            new_parent: new_parent.clone(),
            new_name: new_name.to_string(),
        }));

        self.find_child(new_parent, new_name)?.ok_or_else(|| {
            Error::NotFound(format!("cannot copy {} to {}", new_name, parent_path))
        })
    }

    pub fn set_writable(&self, file: &Arc<TreeEntry>, writable: bool) -> Result<(), Error> {
        let _guard = self.write_access();
        let old = self.is_writable(file)?;
        file.fs().set_writable(&self.path(file)?, writable)?;

        self.process_event(FileEvent::new(ChangeEvent::PropertyChange {
            file: file.clone(),
            property: Property::Writable { old, new: writable },
        }));
        Ok(())
    }

    /// Mirrors a change of the hidden attribute. The delegate is not
    /// touched.
    pub fn set_hidden(&self, file: &Arc<TreeEntry>, hidden: bool) -> Result<(), Error> {
        let _guard = self.write_access();
        let old = self.is_hidden(file)?;

        self.process_event(FileEvent::new(ChangeEvent::PropertyChange {
            file: file.clone(),
            property: Property::Hidden { old, new: hidden },
        }));
        Ok(())
    }
}
