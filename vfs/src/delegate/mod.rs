//! The delegate file systems the engine mirrors.
//!
//! A delegate answers "what does the disk (or archive) actually look like":
//! attributes, listings and content of a path. Paths are absolute and use
//! `/` as separator on all platforms.
use std::io::{self, Read, Write};

use crate::nodes::Flags;

mod host;
mod memory;

pub use self::host::HostFs;
pub use self::memory::MemoryFs;

/// A snapshot of the attributes of a path, as reported by a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    pub is_directory: bool,
    pub is_symlink: bool,
    pub is_special: bool,
    pub is_hidden: bool,
    pub is_writable: bool,
    pub length: u64,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
}

impl FileAttributes {
    /// The record flags corresponding to these attributes.
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::empty();
        flags.set(Flags::IS_DIRECTORY, self.is_directory);
        flags.set(Flags::IS_READ_ONLY, !self.is_writable);
        flags.set(Flags::IS_SYMLINK, self.is_symlink);
        flags.set(Flags::IS_SPECIAL, self.is_special);
        flags.set(Flags::IS_HIDDEN, self.is_hidden);
        flags
    }
}

/// A file system the engine can mirror.
pub trait DelegateFs: Send + Sync {
    /// The url scheme used for roots of this file system, e.g. `file`.
    fn protocol(&self) -> &str;

    fn is_case_sensitive(&self) -> bool;

    /// Read-only delegates reject every mutation.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Local delegates are backed by the host file system.
    fn is_local(&self) -> bool {
        false
    }

    /// Temporary delegates are excluded from [crate::PersistentFs::local_roots].
    fn is_temporary(&self) -> bool {
        false
    }

    /// For archive file systems, the separator between the archive path and
    /// the path inside of it.
    fn archive_separator(&self) -> Option<&str> {
        None
    }

    /// Canonicalizes a root path. The default returns it unchanged.
    fn normalize(&self, path: &str) -> String {
        path.to_string()
    }

    /// Returns None if nothing exists at `path`.
    fn attributes(&self, path: &str) -> io::Result<Option<FileAttributes>>;

    fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.attributes(path)?.is_some())
    }

    /// Lists the names of the children of the directory at `path`.
    fn list(&self, path: &str) -> io::Result<Vec<String>>;

    fn length(&self, path: &str) -> io::Result<u64> {
        Ok(self.attributes(path)?.map(|a| a.length).unwrap_or(0))
    }

    /// Reads the whole content of `path`.
    fn contents(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_read(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Opens `path` for writing, replacing its content.
    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;

    /// Returns the target of the symlink at `path`, if it is one.
    fn symlink_target(&self, path: &str) -> io::Result<Option<String>> {
        let _ = path;
        Ok(None)
    }

    fn create_child_file(&self, parent: &str, name: &str) -> io::Result<()>;
    fn create_child_directory(&self, parent: &str, name: &str) -> io::Result<()>;

    /// Deletes `path`, recursively for directories.
    fn delete(&self, path: &str) -> io::Result<()>;

    fn rename(&self, path: &str, new_name: &str) -> io::Result<()>;

    /// Moves `path` into the directory `new_parent`, keeping its name.
    fn move_to(&self, path: &str, new_parent: &str) -> io::Result<()>;

    /// Copies `path` into `new_parent` as `new_name`, recursively for
    /// directories.
    fn copy(&self, path: &str, new_parent: &str, new_name: &str) -> io::Result<()>;

    fn set_writable(&self, path: &str, writable: bool) -> io::Result<()>;

    fn set_timestamp(&self, path: &str, timestamp: i64) -> io::Result<()>;
}

/// The error returned by read-only delegates on mutation.
pub(crate) fn read_only_error(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{} is on a read-only file system", path),
    )
}

/// Splits `path` into its parent and its last component.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    let ix = trimmed.rfind('/')?;
    let name = &trimmed[ix + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if ix == 0 { "/" } else { &trimmed[..ix] };
    Some((parent, name))
}
