use bytes::Bytes;

use crate::{
    delegate::FileAttributes,
    nodes::{FileId, Flags},
    Error,
};

mod from_addr;
mod memory;
mod redb;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryRecordStore;
pub use self::redb::RedbRecordStore;

/// The durable, id-keyed table of file records the engine mirrors delegates
/// into.
///
/// Every record carries a parent id, a name, [Flags], a timestamp, a length
/// (-1 if unknown), an ordered list of child ids, a set of named attributes
/// and optionally the cached content of the file.
///
/// Unknown ids produce [Error::InvalidAccess].
pub trait RecordStore: Send + Sync {
    /// Allocates a fresh, empty record.
    fn create_record(&self) -> Result<FileId, Error>;

    /// Removes the record and all records reachable through its children list.
    fn delete_record_recursively(&self, id: FileId) -> Result<(), Error>;

    fn parent(&self, id: FileId) -> Result<FileId, Error>;
    fn set_parent(&self, id: FileId, parent: FileId) -> Result<(), Error>;

    fn name(&self, id: FileId) -> Result<String, Error>;
    fn set_name(&self, id: FileId, name: &str) -> Result<(), Error>;

    fn flags(&self, id: FileId) -> Result<Flags, Error>;
    fn set_flags(&self, id: FileId, flags: Flags) -> Result<(), Error>;

    fn timestamp(&self, id: FileId) -> Result<i64, Error>;
    fn set_timestamp(&self, id: FileId, timestamp: i64) -> Result<(), Error>;

    fn length(&self, id: FileId) -> Result<i64, Error>;
    fn set_length(&self, id: FileId, length: i64) -> Result<(), Error>;

    /// Returns the persisted child ids, in insertion order.
    fn list(&self, id: FileId) -> Result<Vec<FileId>, Error>;

    /// Replaces the persisted child ids.
    fn update_list(&self, id: FileId, children: &[FileId]) -> Result<(), Error>;

    fn read_attribute(&self, id: FileId, key: &str) -> Result<Option<Bytes>, Error>;
    fn write_attribute(&self, id: FileId, key: &str, value: &[u8]) -> Result<(), Error>;

    fn read_content(&self, id: FileId) -> Result<Option<Bytes>, Error>;
    fn write_content(&self, id: FileId, content: &[u8]) -> Result<(), Error>;

    /// Returns the record id for the root with the given normalized url,
    /// allocating one if there is none yet.
    /// Concurrent calls for the same url return the same id.
    fn find_root_record(&self, url: &str) -> Result<FileId, Error>;

    /// Forgets the root registration of `id`. The record itself is left in
    /// place.
    fn delete_root_record(&self, id: FileId) -> Result<(), Error>;

    fn list_roots(&self) -> Result<Vec<FileId>, Error>;

    /// Bumped on every metadata or structural change.
    fn mod_count(&self) -> Result<u64, Error>;

    /// Bumped on every write, including content and attributes.
    fn local_mod_count(&self) -> Result<u64, Error>;

    /// Bumped on every write touching the given record.
    fn record_mod_count(&self, id: FileId) -> Result<u64, Error>;

    /// Milliseconds since the epoch at which the store was first created.
    fn creation_timestamp(&self) -> Result<i64, Error>;

    /// Makes pending writes durable.
    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Returns the persisted children together with their names.
    fn list_all(&self, id: FileId) -> Result<Vec<(FileId, String)>, Error> {
        self.list(id)?
            .into_iter()
            .map(|child| Ok((child, self.name(child)?)))
            .collect()
    }

    /// Overwrites parent, name, flags, timestamp and length of a record from
    /// freshly probed delegate attributes.
    fn write_attributes_to_record(
        &self,
        id: FileId,
        parent: FileId,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<(), Error> {
        self.set_parent(id, parent)?;
        self.set_name(id, name)?;
        self.set_flags(id, attributes.flags())?;
        self.set_timestamp(id, attributes.last_modified)?;
        self.set_length(
            id,
            if attributes.is_directory {
                crate::nodes::LENGTH_UNKNOWN
            } else {
                attributes.length as i64
            },
        )
    }
}

/// Current wall clock time, in milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
