use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use super::{now_millis, RecordStore};
use crate::{
    nodes::{FileId, Flags, LENGTH_UNKNOWN, TIMESTAMP_UNKNOWN},
    Error,
};

#[derive(Default)]
struct Record {
    parent: FileId,
    name: String,
    flags: Flags,
    timestamp: i64,
    length: i64,
    children: Vec<FileId>,
    attributes: HashMap<String, Bytes>,
    content: Option<Bytes>,
    mod_count: u64,
}

struct Records {
    next_id: u32,
    records: HashMap<FileId, Record>,
    roots: HashMap<String, FileId>,
    mod_count: u64,
    local_mod_count: u64,
}

impl Records {
    fn get(&self, id: FileId) -> Result<&Record, Error> {
        self.records.get(&id).ok_or(Error::InvalidAccess(id))
    }

    /// Runs `f` against the record, bumping the counters.
    /// `structural` selects whether the global mod count moves as well.
    fn update<T>(
        &mut self,
        id: FileId,
        structural: bool,
        f: impl FnOnce(&mut Record) -> T,
    ) -> Result<T, Error> {
        let record = self.records.get_mut(&id).ok_or(Error::InvalidAccess(id))?;
        record.mod_count += 1;
        let out = f(record);

        self.local_mod_count += 1;
        if structural {
            self.mod_count += 1;
        }
        Ok(out)
    }
}

/// A [RecordStore] keeping everything in process memory.
pub struct MemoryRecordStore {
    db: RwLock<Records>,
    created: i64,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self {
            db: RwLock::new(Records {
                next_id: 1,
                records: HashMap::new(),
                roots: HashMap::new(),
                mod_count: 0,
                local_mod_count: 0,
            }),
            created: now_millis(),
        }
    }
}

impl RecordStore for MemoryRecordStore {
    #[instrument(skip(self))]
    fn create_record(&self) -> Result<FileId, Error> {
        let mut db = self.db.write();
        let id = FileId::new(db.next_id);
        db.next_id += 1;
        db.records.insert(
            id,
            Record {
                timestamp: TIMESTAMP_UNKNOWN,
                length: LENGTH_UNKNOWN,
                ..Default::default()
            },
        );
        db.mod_count += 1;
        db.local_mod_count += 1;
        Ok(id)
    }

    #[instrument(skip(self), fields(record.id = %id))]
    fn delete_record_recursively(&self, id: FileId) -> Result<(), Error> {
        let mut db = self.db.write();
        db.get(id)?;

        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                warn!(record.id = %current, "record reachable twice, children lists are corrupted");
                continue;
            }
            if let Some(record) = db.records.remove(&current) {
                stack.extend(record.children);
            }
        }
        db.mod_count += 1;
        db.local_mod_count += 1;
        Ok(())
    }

    fn parent(&self, id: FileId) -> Result<FileId, Error> {
        Ok(self.db.read().get(id)?.parent)
    }

    fn set_parent(&self, id: FileId, parent: FileId) -> Result<(), Error> {
        self.db.write().update(id, true, |r| r.parent = parent)
    }

    fn name(&self, id: FileId) -> Result<String, Error> {
        Ok(self.db.read().get(id)?.name.clone())
    }

    fn set_name(&self, id: FileId, name: &str) -> Result<(), Error> {
        self.db.write().update(id, true, |r| r.name = name.to_string())
    }

    fn flags(&self, id: FileId) -> Result<Flags, Error> {
        Ok(self.db.read().get(id)?.flags)
    }

    fn set_flags(&self, id: FileId, flags: Flags) -> Result<(), Error> {
        self.db.write().update(id, true, |r| r.flags = flags)
    }

    fn timestamp(&self, id: FileId) -> Result<i64, Error> {
        Ok(self.db.read().get(id)?.timestamp)
    }

    fn set_timestamp(&self, id: FileId, timestamp: i64) -> Result<(), Error> {
        self.db.write().update(id, true, |r| r.timestamp = timestamp)
    }

    fn length(&self, id: FileId) -> Result<i64, Error> {
        Ok(self.db.read().get(id)?.length)
    }

    fn set_length(&self, id: FileId, length: i64) -> Result<(), Error> {
        self.db.write().update(id, true, |r| r.length = length)
    }

    fn list(&self, id: FileId) -> Result<Vec<FileId>, Error> {
        Ok(self.db.read().get(id)?.children.clone())
    }

    fn update_list(&self, id: FileId, children: &[FileId]) -> Result<(), Error> {
        self.db
            .write()
            .update(id, true, |r| r.children = children.to_vec())
    }

    fn read_attribute(&self, id: FileId, key: &str) -> Result<Option<Bytes>, Error> {
        Ok(self.db.read().get(id)?.attributes.get(key).cloned())
    }

    fn write_attribute(&self, id: FileId, key: &str, value: &[u8]) -> Result<(), Error> {
        self.db.write().update(id, false, |r| {
            r.attributes
                .insert(key.to_string(), Bytes::copy_from_slice(value));
        })
    }

    fn read_content(&self, id: FileId) -> Result<Option<Bytes>, Error> {
        Ok(self.db.read().get(id)?.content.clone())
    }

    fn write_content(&self, id: FileId, content: &[u8]) -> Result<(), Error> {
        self.db.write().update(id, false, |r| {
            r.content = Some(Bytes::copy_from_slice(content))
        })
    }

    #[instrument(skip(self))]
    fn find_root_record(&self, url: &str) -> Result<FileId, Error> {
        let mut db = self.db.write();
        if let Some(id) = db.roots.get(url) {
            return Ok(*id);
        }

        let id = FileId::new(db.next_id);
        db.next_id += 1;
        db.records.insert(
            id,
            Record {
                timestamp: TIMESTAMP_UNKNOWN,
                length: LENGTH_UNKNOWN,
                ..Default::default()
            },
        );
        db.roots.insert(url.to_string(), id);
        db.mod_count += 1;
        db.local_mod_count += 1;
        Ok(id)
    }

    fn delete_root_record(&self, id: FileId) -> Result<(), Error> {
        let mut db = self.db.write();
        db.roots.retain(|_, root| *root != id);
        db.mod_count += 1;
        db.local_mod_count += 1;
        Ok(())
    }

    fn list_roots(&self) -> Result<Vec<FileId>, Error> {
        let mut roots: Vec<FileId> = self.db.read().roots.values().copied().collect();
        roots.sort();
        Ok(roots)
    }

    fn mod_count(&self) -> Result<u64, Error> {
        Ok(self.db.read().mod_count)
    }

    fn local_mod_count(&self) -> Result<u64, Error> {
        Ok(self.db.read().local_mod_count)
    }

    fn record_mod_count(&self, id: FileId) -> Result<u64, Error> {
        Ok(self.db.read().get(id)?.mod_count)
    }

    fn creation_timestamp(&self) -> Result<i64, Error> {
        Ok(self.created)
    }
}
