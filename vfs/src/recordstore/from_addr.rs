use std::{path::PathBuf, sync::Arc};

use url::Url;

use super::{MemoryRecordStore, RecordStore, RedbRecordStore};
use crate::Error;

/// Constructs a new instance of a [RecordStore] from an URI.
///
/// The following URIs are supported:
/// - `memory://`
///   Uses a in-memory implementation.
/// - `redb://`
///   Uses redb with its in-memory backend.
/// - `redb:///absolute/path/to/somewhere`
///   Uses redb, using a path on the disk for persistency. Can be only opened
///   from one process at the same time.
pub fn from_addr(uri: &str) -> Result<Arc<dyn RecordStore>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    let record_store: Arc<dyn RecordStore> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Arc::<MemoryRecordStore>::default()
        }
        "redb" => {
            // redb doesn't support host, and a path can be provided (otherwise
            // it'll live in memory only).
            if url.has_host() {
                return Err(Error::StorageError("no host allowed".to_string()));
            }

            if url.path() == "/" {
                return Err(Error::StorageError(
                    "cowardly refusing to open / with redb".to_string(),
                ));
            }

            Arc::new(if url.path().is_empty() {
                RedbRecordStore::new_temporary()?
            } else {
                RedbRecordStore::new(PathBuf::from(url.path()))?
            })
        }
        _ => return Err(Error::StorageError(format!("unknown scheme: {}", url.scheme()))),
    };

    Ok(record_store)
}
