//! Types describing the in-memory tree nodes of the virtual file system.
mod entry;
mod root;

use std::fmt;

pub use entry::TreeEntry;
pub(crate) use root::clean_path;
pub use root::RootKind;

/// Length value persisted while the real length is not known yet.
pub const LENGTH_UNKNOWN: i64 = -1;

/// Timestamp value persisted while the real timestamp is not known yet.
pub const TIMESTAMP_UNKNOWN: i64 = -1;

/// Identifier of a persisted record.
///
/// Ids are allocated by the record store and are never reused while the
/// record lives. [FileId::NONE] is used for "no parent" and for entries that
/// were never materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileId(u32);

impl FileId {
    pub const NONE: FileId = FileId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Only strictly positive ids denote persisted records.
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl From<u32> for FileId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Per-record flags, persisted alongside each record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// The children list of this directory mirrors the delegate listing.
        const CHILDREN_CACHED = 0x01;
        const IS_DIRECTORY = 0x02;
        const IS_READ_ONLY = 0x04;
        /// Persisted content is stale and must be fetched from the delegate.
        const MUST_RELOAD_CONTENT = 0x08;
        const IS_SYMLINK = 0x10;
        const IS_SPECIAL = 0x20;
        const IS_HIDDEN = 0x40;
    }
}

/// Checks whether `name` can be used as the name of a child entry.
/// Names must not be empty, `.` or `..`, and may not contain slashes or null
/// bytes.
pub fn is_valid_name(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0'))
}

/// Compares two names, honoring the case sensitivity of the delegate they
/// belong to.
pub fn names_equal(case_sensitive: bool, a: &str, b: &str) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
    }
}

/// Appends `name` to `prefix`, inserting a `/` unless `prefix` already ends
/// with one.
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.ends_with('/') {
        format!("{}{}", prefix, name)
    } else {
        format!("{}/{}", prefix, name)
    }
}
