use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use tracing::{debug, instrument, warn};

use super::PersistentFs;
use crate::{
    events::{validate_events, ChangeEvent, FileEvent},
    nodes::{FileId, Flags, TreeEntry},
    Error,
};

impl PersistentFs {
    /// The length of `file`, reloaded from the delegate if the persisted one
    /// is stale or unknown.
    pub fn length(&self, file: &Arc<TreeEntry>) -> Result<u64, Error> {
        let id = self.file_id(file)?;
        let persisted = self.store.length(id)?;
        if persisted >= 0 && !self.must_reload(id)? {
            return Ok(persisted as u64);
        }
        self.reload_length(file, id)
    }

    fn must_reload(&self, id: FileId) -> Result<bool, Error> {
        Ok(self.store.flags(id)?.contains(Flags::MUST_RELOAD_CONTENT))
    }

    fn reload_length(&self, file: &Arc<TreeEntry>, id: FileId) -> Result<u64, Error> {
        let length = file.fs().length(&self.path(file)?)?;
        self.store.set_length(id, length as i64)?;
        Ok(length)
    }

    /// Whether content of the given length may be kept in the record store.
    /// Content of read-only delegates is only cached when the caller asks for
    /// it and the engine is not in internal mode.
    fn should_cache(&self, file: &TreeEntry, length: u64, cache_requested: bool) -> bool {
        let writable_source = !file.fs().is_read_only();
        let read_only_allowed =
            cache_requested && self.config.cache_read_only_content && !self.config.internal_mode;

        (writable_source || read_only_allowed) && length <= self.config.content_cache_threshold
    }

    /// Returns the content of `file`.
    ///
    /// Cached content is served from the record store unless it is stale.
    /// Otherwise the delegate is read and, for small enough files, the bytes
    /// are written back to the store and the stale marker cleared. If the
    /// bytes read do not match the length the delegate reported, the stale
    /// marker stays set.
    #[instrument(skip(self, file), fields(file.id = %file.id()), err)]
    pub fn contents_to_byte_array(
        &self,
        file: &Arc<TreeEntry>,
        cache_content: bool,
    ) -> Result<Vec<u8>, Error> {
        let id = self.file_id(file)?;
        if file.is_directory() {
            return Err(Error::InvalidRequest(format!("{} is a directory", id)));
        }

        let _guard = self.input_lock.lock();

        let outdated = self.must_reload(id)? || self.store.length(id)? < 0;
        if !outdated {
            if let Some(content) = self.store.read_content(id)? {
                return Ok(content.to_vec());
            }
        }

        let length = self.reload_length(file, id)?;
        let content = file.fs().contents(&self.path(file)?)?;

        if self.should_cache(file, length, cache_content) {
            if content.len() as u64 == length {
                self.store.write_content(id, &content)?;
                self.set_flag(file, Flags::MUST_RELOAD_CONTENT, false)?;
            } else {
                warn!(
                    expected = length,
                    actual = content.len(),
                    "content length changed while reading, not caching"
                );
                self.set_flag(file, Flags::MUST_RELOAD_CONTENT, true)?;
            }
        }

        Ok(content)
    }

    /// Returns a reader over the content of `file`.
    ///
    /// Cached content is served from the record store. Otherwise the delegate
    /// stream is returned; for small enough files it is wrapped so that the
    /// bytes are stored once the reader is dropped, if their count matches
    /// the length reported by the delegate.
    pub fn input_stream(&self, file: &Arc<TreeEntry>) -> Result<Box<dyn Read + Send + '_>, Error> {
        let id = self.file_id(file)?;
        if file.is_directory() {
            return Err(Error::InvalidRequest(format!("{} is a directory", id)));
        }

        let length = {
            let _guard = self.input_lock.lock();
            let outdated = self.must_reload(id)? || self.store.length(id)? < 0;
            if !outdated {
                if let Some(content) = self.store.read_content(id)? {
                    return Ok(Box::new(io::Cursor::new(content)));
                }
            }
            self.reload_length(file, id)?
        };

        let inner = file.fs().open_read(&self.path(file)?)?;
        if !self.should_cache(file, length, false) {
            return Ok(inner);
        }

        Ok(Box::new(ReplicatingReader {
            fs: self,
            file: file.clone(),
            inner,
            buf: Vec::new(),
            expected: length,
            stored: false,
        }))
    }

    /// Stores replicated bytes if their count matches `expected`, marks the
    /// content stale otherwise.
    fn store_replicated(&self, file: &Arc<TreeEntry>, content: &[u8], expected: u64) -> Result<(), Error> {
        let _guard = self.input_lock.lock();
        let id = self.file_id(file)?;
        if content.len() as u64 == expected {
            self.store.write_content(id, content)?;
            self.set_flag(file, Flags::MUST_RELOAD_CONTENT, false)
        } else {
            debug!(file.id = %id, expected, actual = content.len(), "partial read, not caching");
            self.set_flag(file, Flags::MUST_RELOAD_CONTENT, true)
        }
    }

    /// Returns a writer replacing the content of `file`.
    ///
    /// Bytes are buffered until [ContentWriter::close] (or drop), which
    /// writes them to the delegate and then to the record store, and publishes
    /// a content change. `modification_stamp` defaults to a fresh stamp.
    pub fn output_stream(
        &self,
        file: &Arc<TreeEntry>,
        modification_stamp: Option<u64>,
    ) -> Result<ContentWriter<'_>, Error> {
        let id = self.file_id(file)?;
        if file.is_directory() {
            return Err(Error::InvalidRequest(format!("{} is a directory", id)));
        }

        Ok(ContentWriter {
            fs: self,
            file: file.clone(),
            buf: Vec::new(),
            modification_stamp: modification_stamp
                .unwrap_or_else(|| self.next_modification_stamp()),
            closed: false,
        })
    }

    /// Marks every file below the persisted roots stale, forcing the next
    /// read to go to the delegate.
    pub fn clean_persisted_contents(&self) -> Result<(), Error> {
        let _guard = self.input_lock.lock();

        let mut stack = self.store.list_roots()?;
        while let Some(id) = stack.pop() {
            let flags = self.store.flags(id)?;
            if flags.contains(Flags::IS_DIRECTORY) {
                stack.extend(self.store.list(id)?);
            } else if !flags.contains(Flags::MUST_RELOAD_CONTENT) {
                self.store.set_flags(id, flags | Flags::MUST_RELOAD_CONTENT)?;
            }
        }
        Ok(())
    }
}

/// Copies everything read from the delegate, and hands the copy to the
/// record store when dropped.
struct ReplicatingReader<'a> {
    fs: &'a PersistentFs,
    file: Arc<TreeEntry>,
    inner: Box<dyn Read + Send + 'a>,
    buf: Vec<u8>,
    expected: u64,
    stored: bool,
}

impl ReplicatingReader<'_> {
    fn store(&mut self) {
        if self.stored {
            return;
        }
        self.stored = true;
        if let Err(e) = self.fs.store_replicated(&self.file, &self.buf, self.expected) {
            warn!(file.id = %self.file.id(), err = %e, "failed to store read content");
        }
    }
}

impl Read for ReplicatingReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        if !self.stored {
            self.buf.extend_from_slice(&out[..n]);
            // EOF, or more bytes than announced
            if n == 0 || self.buf.len() as u64 > self.expected {
                self.store();
            }
        }
        Ok(n)
    }
}

impl Drop for ReplicatingReader<'_> {
    fn drop(&mut self) {
        self.store();
    }
}

/// Buffers new content of a file until it is closed.
///
/// Closing writes the bytes to the delegate, and only once it accepted them
/// to the record store. Length and timestamp are updated afterwards and a
/// content change is published around it, unless the file is gone by then.
/// If any step fails the stored content is marked for reload. Closing
/// happens at most once; dropping an unclosed writer closes it and logs
/// failures.
pub struct ContentWriter<'a> {
    fs: &'a PersistentFs,
    file: Arc<TreeEntry>,
    buf: Vec<u8>,
    modification_stamp: u64,
    closed: bool,
}

impl ContentWriter<'_> {
    pub fn close(mut self) -> Result<(), Error> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let fs = self.fs;
        let file = &self.file;
        let _write = fs.write_access();

        let events = validate_events(
            vec![FileEvent::new(ChangeEvent::ContentChange {
                file: file.clone(),
                old_stamp: file.modification_stamp(),
                new_stamp: self.modification_stamp,
            })],
            fs,
        );
        if events.is_empty() {
            return Err(Error::InvalidAccess(file.id()));
        }

        fs.bus.publish_before(&events);
        let result = {
            let _input = fs.input_lock.lock();
            self.write_through()
        };
        fs.bus.publish_after(&events);

        result
    }

    fn write_through(&self) -> Result<(), Error> {
        let fs = self.fs;
        let file = &self.file;
        let id = fs.file_id(file)?;
        let path = fs.path(file)?;

        let delegated = file
            .fs()
            .open_write(&path)
            .and_then(|mut w| {
                w.write_all(&self.buf)?;
                w.flush()
            })
            .map_err(Error::from);
        if let Err(e) = delegated.and_then(|_| fs.store.write_content(id, &self.buf)) {
            self.mark_stale(id);
            return Err(e);
        }
        if let Err(e) = fs.execute_touch(file, false, self.modification_stamp) {
            self.mark_stale(id);
            return Err(e);
        }

        // the delegate may report a different length than what was written
        let consistent = fs.store.length(id)? == self.buf.len() as i64;
        fs.set_flag(file, Flags::MUST_RELOAD_CONTENT, !consistent)
    }

    /// Makes the next read go to the delegate after a failed write.
    fn mark_stale(&self, id: FileId) {
        let marked = self
            .fs
            .store
            .flags(id)
            .and_then(|flags| self.fs.store.set_flags(id, flags | Flags::MUST_RELOAD_CONTENT));
        if let Err(e) = marked {
            warn!(file.id = %id, err = %e, "failed to mark content for reload");
        }
    }
}

impl Write for ContentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "writer already closed"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ContentWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(file.id = %self.file.id(), err = %e, "failed to close content writer");
        }
    }
}
