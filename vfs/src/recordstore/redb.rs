use std::{collections::HashSet, path::PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{instrument, warn};

use super::{now_millis, RecordStore};
use crate::{
    nodes::{FileId, Flags, LENGTH_UNKNOWN, TIMESTAMP_UNKNOWN},
    Error,
};

/// (parent, flags, timestamp, length, mod_count)
type RecordRow = (u32, u32, i64, i64, u64);

const RECORDS_TABLE: TableDefinition<u32, RecordRow> = TableDefinition::new("records");
const NAMES_TABLE: TableDefinition<u32, &str> = TableDefinition::new("names");
/// Little-endian encoded child ids.
const CHILDREN_TABLE: TableDefinition<u32, &[u8]> = TableDefinition::new("children");
/// Keyed by `{id}:{attribute}`.
const ATTRIBUTES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("attributes");
const CONTENTS_TABLE: TableDefinition<u32, &[u8]> = TableDefinition::new("contents");
const ROOTS_TABLE: TableDefinition<&str, u32> = TableDefinition::new("roots");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_NEXT_ID: &str = "next_id";
const META_MOD_COUNT: &str = "mod_count";
const META_LOCAL_MOD_COUNT: &str = "local_mod_count";
const META_CREATED: &str = "created";

/// A [RecordStore] backed by a [redb] database.
pub struct RedbRecordStore {
    db: Database,

    // serializes read-modify-write cycles spanning several transactions
    write_lock: Mutex<()>,
}

impl RedbRecordStore {
    /// Constructs a new instance using the specified filesystem path for
    /// storage.
    pub fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = redb::Database::create(path)?;
        create_schema(&db)?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn row(&self, id: FileId) -> Result<RecordRow, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS_TABLE)?;
        let row = table.get(id.get())?.ok_or(Error::InvalidAccess(id))?;
        Ok(row.value())
    }

    /// Runs `f` in a write transaction and commits it.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T, Error>) -> Result<T, Error> {
        let _guard = self.write_lock.lock();
        let txn = self.db.begin_write()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Applies `f` to the record row, bumping the per-record and global
    /// counters.
    fn update_row(
        &self,
        id: FileId,
        structural: bool,
        f: impl FnOnce(&mut RecordRow),
    ) -> Result<(), Error> {
        self.write(|txn| {
            touch_record(txn, id, structural, f)?;
            Ok(())
        })
    }
}

/// Ensures all tables are present, and stamps the creation time on first use.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(RECORDS_TABLE)?;
    txn.open_table(NAMES_TABLE)?;
    txn.open_table(CHILDREN_TABLE)?;
    txn.open_table(ATTRIBUTES_TABLE)?;
    txn.open_table(CONTENTS_TABLE)?;
    txn.open_table(ROOTS_TABLE)?;
    {
        let mut meta = txn.open_table(META_TABLE)?;
        if meta.get(META_CREATED)?.is_none() {
            meta.insert(META_CREATED, now_millis() as u64)?;
            meta.insert(META_NEXT_ID, 1u64)?;
        }
    }
    txn.commit()?;

    Ok(())
}

fn bump_counters(txn: &WriteTransaction, structural: bool) -> Result<(), Error> {
    let mut meta = txn.open_table(META_TABLE)?;
    let local = meta.get(META_LOCAL_MOD_COUNT)?.map(|v| v.value()).unwrap_or(0);
    meta.insert(META_LOCAL_MOD_COUNT, local + 1u64)?;
    if structural {
        let global = meta.get(META_MOD_COUNT)?.map(|v| v.value()).unwrap_or(0);
        meta.insert(META_MOD_COUNT, global + 1)?;
    }
    Ok(())
}

fn touch_record(
    txn: &WriteTransaction,
    id: FileId,
    structural: bool,
    f: impl FnOnce(&mut RecordRow),
) -> Result<(), Error> {
    {
        let mut records = txn.open_table(RECORDS_TABLE)?;
        let mut row = records
            .get(id.get())?
            .map(|v| v.value())
            .ok_or(Error::InvalidAccess(id))?;
        row.4 += 1;
        f(&mut row);
        records.insert(id.get(), row)?;
    }
    bump_counters(txn, structural)
}

fn allocate_record(txn: &WriteTransaction) -> Result<FileId, Error> {
    let id = {
        let mut meta = txn.open_table(META_TABLE)?;
        let next = meta.get(META_NEXT_ID)?.map(|v| v.value()).unwrap_or(1);
        meta.insert(META_NEXT_ID, next + 1)?;
        u32::try_from(next)
            .map_err(|_| Error::StorageError("record ids exhausted".to_string()))?
    };

    let mut records = txn.open_table(RECORDS_TABLE)?;
    records.insert(
        id,
        (0u32, Flags::empty().bits(), TIMESTAMP_UNKNOWN, LENGTH_UNKNOWN, 0u64),
    )?;
    drop(records);
    bump_counters(txn, true)?;

    Ok(FileId::new(id))
}

fn attribute_key(id: FileId, key: &str) -> String {
    format!("{}:{}", id, key)
}

fn decode_children(data: &[u8]) -> Vec<FileId> {
    data.chunks_exact(4)
        .map(|c| FileId::new(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect()
}

fn encode_children(children: &[FileId]) -> Vec<u8> {
    children
        .iter()
        .flat_map(|c| c.get().to_le_bytes())
        .collect()
}

impl RecordStore for RedbRecordStore {
    #[instrument(skip(self))]
    fn create_record(&self) -> Result<FileId, Error> {
        self.write(allocate_record)
    }

    #[instrument(skip(self), fields(record.id = %id))]
    fn delete_record_recursively(&self, id: FileId) -> Result<(), Error> {
        self.row(id)?;
        self.write(|txn| {
            let mut records = txn.open_table(RECORDS_TABLE)?;
            let mut names = txn.open_table(NAMES_TABLE)?;
            let mut children = txn.open_table(CHILDREN_TABLE)?;
            let mut attributes = txn.open_table(ATTRIBUTES_TABLE)?;
            let mut contents = txn.open_table(CONTENTS_TABLE)?;

            let mut seen = HashSet::new();
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                if !seen.insert(current) {
                    warn!(record.id = %current, "record reachable twice, children lists are corrupted");
                    continue;
                }

                let raw = current.get();
                records.remove(raw)?;
                names.remove(raw)?;
                contents.remove(raw)?;
                if let Some(list) = children.remove(raw)? {
                    stack.extend(decode_children(list.value()));
                }

                // attribute keys of this record sort between "{id}:" and "{id};"
                let lower = format!("{}:", current);
                let upper = format!("{};", current);
                let keys = attributes
                    .range(lower.as_str()..upper.as_str())?
                    .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                for key in keys {
                    attributes.remove(key.as_str())?;
                }
            }

            drop((records, names, children, attributes, contents));
            bump_counters(txn, true)
        })
    }

    fn parent(&self, id: FileId) -> Result<FileId, Error> {
        Ok(FileId::new(self.row(id)?.0))
    }

    fn set_parent(&self, id: FileId, parent: FileId) -> Result<(), Error> {
        self.update_row(id, true, |row| row.0 = parent.get())
    }

    fn name(&self, id: FileId) -> Result<String, Error> {
        self.row(id)?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(NAMES_TABLE)?;
        let name = table.get(id.get())?;
        Ok(name.map(|n| n.value().to_string()).unwrap_or_default())
    }

    fn set_name(&self, id: FileId, name: &str) -> Result<(), Error> {
        self.write(|txn| {
            touch_record(txn, id, true, |_| {})?;
            txn.open_table(NAMES_TABLE)?.insert(id.get(), name)?;
            Ok(())
        })
    }

    fn flags(&self, id: FileId) -> Result<Flags, Error> {
        Ok(Flags::from_bits_truncate(self.row(id)?.1))
    }

    fn set_flags(&self, id: FileId, flags: Flags) -> Result<(), Error> {
        self.update_row(id, true, |row| row.1 = flags.bits())
    }

    fn timestamp(&self, id: FileId) -> Result<i64, Error> {
        Ok(self.row(id)?.2)
    }

    fn set_timestamp(&self, id: FileId, timestamp: i64) -> Result<(), Error> {
        self.update_row(id, true, |row| row.2 = timestamp)
    }

    fn length(&self, id: FileId) -> Result<i64, Error> {
        Ok(self.row(id)?.3)
    }

    fn set_length(&self, id: FileId, length: i64) -> Result<(), Error> {
        self.update_row(id, true, |row| row.3 = length)
    }

    fn list(&self, id: FileId) -> Result<Vec<FileId>, Error> {
        self.row(id)?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHILDREN_TABLE)?;
        let list = table.get(id.get())?;
        Ok(list.map(|l| decode_children(l.value())).unwrap_or_default())
    }

    fn update_list(&self, id: FileId, children: &[FileId]) -> Result<(), Error> {
        let encoded = encode_children(children);
        self.write(|txn| {
            touch_record(txn, id, true, |_| {})?;
            txn.open_table(CHILDREN_TABLE)?
                .insert(id.get(), encoded.as_slice())?;
            Ok(())
        })
    }

    fn read_attribute(&self, id: FileId, key: &str) -> Result<Option<Bytes>, Error> {
        self.row(id)?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ATTRIBUTES_TABLE)?;
        let value = table.get(attribute_key(id, key).as_str())?;
        Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn write_attribute(&self, id: FileId, key: &str, value: &[u8]) -> Result<(), Error> {
        let key = attribute_key(id, key);
        self.write(|txn| {
            touch_record(txn, id, false, |_| {})?;
            txn.open_table(ATTRIBUTES_TABLE)?
                .insert(key.as_str(), value)?;
            Ok(())
        })
    }

    fn read_content(&self, id: FileId) -> Result<Option<Bytes>, Error> {
        self.row(id)?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CONTENTS_TABLE)?;
        let value = table.get(id.get())?;
        Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn write_content(&self, id: FileId, content: &[u8]) -> Result<(), Error> {
        self.write(|txn| {
            touch_record(txn, id, false, |_| {})?;
            txn.open_table(CONTENTS_TABLE)?.insert(id.get(), content)?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn find_root_record(&self, url: &str) -> Result<FileId, Error> {
        self.write(|txn| {
            if let Some(id) = txn.open_table(ROOTS_TABLE)?.get(url)? {
                return Ok(FileId::new(id.value()));
            }

            let id = allocate_record(txn)?;
            txn.open_table(ROOTS_TABLE)?.insert(url, id.get())?;
            Ok(id)
        })
    }

    fn delete_root_record(&self, id: FileId) -> Result<(), Error> {
        self.write(|txn| {
            {
                let mut roots = txn.open_table(ROOTS_TABLE)?;
                let urls = roots
                    .iter()?
                    .filter_map(|entry| match entry {
                        Ok((k, v)) if v.value() == id.get() => Some(Ok(k.value().to_string())),
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                for url in urls {
                    roots.remove(url.as_str())?;
                }
            }
            bump_counters(txn, true)
        })
    }

    fn list_roots(&self) -> Result<Vec<FileId>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ROOTS_TABLE)?;
        let mut roots = table
            .iter()?
            .map(|entry| entry.map(|(_, v)| FileId::new(v.value())))
            .collect::<Result<Vec<_>, _>>()?;
        roots.sort();
        Ok(roots)
    }

    fn mod_count(&self) -> Result<u64, Error> {
        self.meta(META_MOD_COUNT)
    }

    fn local_mod_count(&self) -> Result<u64, Error> {
        self.meta(META_LOCAL_MOD_COUNT)
    }

    fn record_mod_count(&self, id: FileId) -> Result<u64, Error> {
        Ok(self.row(id)?.4)
    }

    fn creation_timestamp(&self) -> Result<i64, Error> {
        Ok(self.meta(META_CREATED)? as i64)
    }
}

impl RedbRecordStore {
    fn meta(&self, key: &str) -> Result<u64, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        let value = table.get(key)?;
        Ok(value.map(|v| v.value()).unwrap_or(0))
    }
}
