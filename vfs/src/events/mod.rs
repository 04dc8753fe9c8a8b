//! Change events, their validation and the bus publishing them.
use std::{fmt, sync::Arc};

use crate::nodes::TreeEntry;

mod bus;
mod validate;

pub use self::bus::{BulkFileListener, EventBus};
pub use self::validate::{validate_events, ParentLookup};

/// A property change carried by [ChangeEvent::PropertyChange].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Writable { old: bool, new: bool },
    Hidden { old: bool, new: bool },
    SymlinkTarget {
        old: Option<String>,
        new: Option<String>,
    },
}

/// A single change to the mirrored tree.
#[derive(Clone)]
pub enum ChangeEvent {
    Create {
        parent: Arc<TreeEntry>,
        name: String,
        is_directory: bool,
    },
    Delete {
        file: Arc<TreeEntry>,
    },
    Move {
        file: Arc<TreeEntry>,
        new_parent: Arc<TreeEntry>,
    },
    Rename {
        file: Arc<TreeEntry>,
        old_name: String,
        new_name: String,
    },
    ContentChange {
        file: Arc<TreeEntry>,
        old_stamp: u64,
        new_stamp: u64,
    },
    PropertyChange {
        file: Arc<TreeEntry>,
        property: Property,
    },
    Copy {
        file: Arc<TreeEntry>,
        new_parent: Arc<TreeEntry>,
        new_name: String,
    },
}

impl ChangeEvent {
    /// The entry the event is about. For creations, that's the parent.
    pub fn file(&self) -> &Arc<TreeEntry> {
        match self {
            ChangeEvent::Create { parent, .. } => parent,
            ChangeEvent::Delete { file }
            | ChangeEvent::Move { file, .. }
            | ChangeEvent::Rename { file, .. }
            | ChangeEvent::ContentChange { file, .. }
            | ChangeEvent::PropertyChange { file, .. }
            | ChangeEvent::Copy { file, .. } => file,
        }
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::Create {
                parent,
                name,
                is_directory,
            } => write!(
                f,
                "Create({} in {}, directory: {})",
                name,
                parent.id(),
                is_directory
            ),
            ChangeEvent::Delete { file } => write!(f, "Delete({})", file.id()),
            ChangeEvent::Move { file, new_parent } => {
                write!(f, "Move({} to {})", file.id(), new_parent.id())
            }
            ChangeEvent::Rename {
                file,
                old_name,
                new_name,
            } => write!(f, "Rename({}: {} to {})", file.id(), old_name, new_name),
            ChangeEvent::ContentChange {
                file,
                old_stamp,
                new_stamp,
            } => write!(
                f,
                "ContentChange({}: {} to {})",
                file.id(),
                old_stamp,
                new_stamp
            ),
            ChangeEvent::PropertyChange { file, property } => {
                write!(f, "PropertyChange({}: {:?})", file.id(), property)
            }
            ChangeEvent::Copy {
                file,
                new_parent,
                new_name,
            } => write!(
                f,
                "Copy({} to {} as {})",
                file.id(),
                new_parent.id(),
                new_name
            ),
        }
    }
}

/// A [ChangeEvent] together with where it came from.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub change: ChangeEvent,

    /// Set for events produced by comparing against the delegate, as opposed
    /// to changes made through the engine.
    pub from_refresh: bool,
}

impl FileEvent {
    pub fn new(change: ChangeEvent) -> Self {
        Self {
            change,
            from_refresh: false,
        }
    }

    pub fn from_refresh(change: ChangeEvent) -> Self {
        Self {
            change,
            from_refresh: true,
        }
    }

    /// Events about entries that were already invalidated are dropped.
    pub fn is_valid(&self) -> bool {
        match &self.change {
            ChangeEvent::Move {
                file, new_parent, ..
            }
            | ChangeEvent::Copy {
                file, new_parent, ..
            } => file.is_valid() && new_parent.is_valid(),
            change => change.file().is_valid(),
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.change)?;
        if self.from_refresh {
            write!(f, " (refresh)")?;
        }
        Ok(())
    }
}
