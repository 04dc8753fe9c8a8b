use std::{
    collections::BTreeMap,
    io::{self, Cursor, Read, Write},
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{read_only_error, split_path, DelegateFs, FileAttributes};
use crate::nodes::join_path;

#[derive(Debug, Clone)]
enum NodeKind {
    Directory,
    File(Bytes),
}

#[derive(Debug, Clone)]
struct MemoryNode {
    path: String,
    kind: NodeKind,
    writable: bool,
    hidden: bool,
    last_modified: i64,
    // overrides the length reported by attributes, to mimic files changing
    // between probing and reading
    reported_length: Option<u64>,
    symlink_target: Option<String>,
    broken: bool,
    // writers accept bytes but fail when flushing them
    full: bool,
}

/// A [DelegateFs] keeping a tree of files in memory.
///
/// Besides serving as a delegate for archives that were unpacked into memory,
/// it is scriptable from the outside: files can be changed or removed behind
/// the engine's back, and reads are counted.
pub struct MemoryFs {
    protocol: String,
    case_sensitive: bool,
    read_only: bool,
    archive_separator: Option<String>,
    nodes: Arc<RwLock<BTreeMap<String, MemoryNode>>>,
    clock: Arc<AtomicI64>,
    reads: AtomicUsize,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new("mem", true)
    }
}

impl MemoryFs {
    pub fn new(protocol: &str, case_sensitive: bool) -> Self {
        Self {
            protocol: protocol.to_string(),
            case_sensitive,
            read_only: false,
            archive_separator: None,
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
            clock: Arc::new(AtomicI64::new(1_000)),
            reads: AtomicUsize::new(0),
        }
    }

    /// A read-only file system whose roots live inside archives.
    pub fn archive(protocol: &str, separator: &str) -> Self {
        Self {
            read_only: true,
            archive_separator: Some(separator.to_string()),
            ..Self::new(protocol, true)
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn key(&self, path: &str) -> String {
        let trimmed = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        if self.case_sensitive {
            trimmed.to_string()
        } else {
            trimmed.to_lowercase()
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn new_node(&self, path: &str, kind: NodeKind) -> MemoryNode {
        MemoryNode {
            path: path.to_string(),
            kind,
            writable: true,
            hidden: false,
            last_modified: self.tick(),
            reported_length: None,
            symlink_target: None,
            broken: false,
            full: false,
        }
    }

    /// Adds a directory at `path`, including all missing ancestors.
    pub fn add_directory(&self, path: &str) {
        let mut nodes = self.nodes.write();
        let mut current = path.trim_end_matches('/').to_string();
        if current.is_empty() {
            current = "/".to_string();
        }
        loop {
            let key = self.key(&current);
            if nodes.contains_key(&key) {
                break;
            }
            nodes.insert(key, self.new_node(&current, NodeKind::Directory));
            match split_path(&current) {
                Some((parent, _)) => current = parent.to_string(),
                None => break,
            }
        }
    }

    /// Adds or replaces a file at `path`, creating missing ancestors.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        if let Some((parent, _)) = split_path(path) {
            self.add_directory(parent);
        }
        let node = self.new_node(path, NodeKind::File(Bytes::copy_from_slice(content)));
        self.nodes.write().insert(self.key(path), node);
    }

    /// Changes the content of an existing file, bumping its timestamp.
    pub fn set_content(&self, path: &str, content: &[u8]) {
        let stamp = self.tick();
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.kind = NodeKind::File(Bytes::copy_from_slice(content));
            node.last_modified = stamp;
        }
    }

    /// Makes attributes report `length` for `path`, whatever the content is.
    pub fn set_reported_length(&self, path: &str, length: Option<u64>) {
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.reported_length = length;
        }
    }

    pub fn set_hidden(&self, path: &str, hidden: bool) {
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.hidden = hidden;
        }
    }

    pub fn set_symlink_target(&self, path: &str, target: Option<&str>) {
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.symlink_target = target.map(str::to_string);
        }
    }

    /// Makes every access to `path` fail with an I/O error.
    pub fn set_broken(&self, path: &str, broken: bool) {
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.broken = broken;
        }
    }

    /// Makes writes to `path` fail as if the device was full. Reads keep
    /// working.
    pub fn set_full(&self, path: &str, full: bool) {
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.full = full;
        }
    }

    /// Removes `path` and everything below it.
    pub fn remove(&self, path: &str) {
        let key = self.key(path);
        let prefix = format!("{}/", key);
        self.nodes
            .write()
            .retain(|k, _| k != &key && !k.starts_with(&prefix));
    }

    /// Number of times content was read.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn node(&self, path: &str) -> io::Result<Option<MemoryNode>> {
        match self.nodes.read().get(&self.key(path)) {
            Some(node) if node.broken => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is broken", path),
            )),
            node => Ok(node.cloned()),
        }
    }

    fn existing(&self, path: &str) -> io::Result<MemoryNode> {
        self.node(path)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} does not exist", path))
        })
    }

    fn check_writable(&self, path: &str) -> io::Result<()> {
        if self.read_only {
            return Err(read_only_error(path));
        }
        Ok(())
    }

    /// Re-homes `from` and everything below it to `to`.
    fn relocate(&self, from: &str, to: &str, keep_source: bool) -> io::Result<()> {
        let from_key = self.key(from);
        let to_key = self.key(to);
        let prefix = format!("{}/", from_key);
        if to_key == from_key || to_key.starts_with(&prefix) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot move {} into itself", from),
            ));
        }

        let mut nodes = self.nodes.write();
        if nodes.contains_key(&to_key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", to),
            ));
        }

        let affected: Vec<(String, MemoryNode)> = nodes
            .iter()
            .filter(|(k, _)| *k == &from_key || k.starts_with(&prefix))
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();
        if affected.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", from),
            ));
        }

        let source = from.trim_end_matches('/');
        for (key, mut node) in affected {
            if !keep_source {
                nodes.remove(&key);
            }
            let rest = node.path.get(source.len()..).unwrap_or_default().to_string();
            node.path = format!("{}{}", to.trim_end_matches('/'), rest);
            nodes.insert(self.key(&node.path), node);
        }
        Ok(())
    }
}

impl DelegateFs for MemoryFs {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn archive_separator(&self) -> Option<&str> {
        self.archive_separator.as_deref()
    }

    fn attributes(&self, path: &str) -> io::Result<Option<FileAttributes>> {
        Ok(self.node(path)?.map(|node| {
            let (is_directory, length) = match &node.kind {
                NodeKind::Directory => (true, 0),
                NodeKind::File(content) => (false, content.len() as u64),
            };
            FileAttributes {
                is_directory,
                is_symlink: node.symlink_target.is_some(),
                is_special: false,
                is_hidden: node.hidden,
                is_writable: node.writable && !self.read_only,
                length: node.reported_length.unwrap_or(length),
                last_modified: node.last_modified,
            }
        }))
    }

    fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let dir = self.existing(path)?;
        if !matches!(dir.kind, NodeKind::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", path),
            ));
        }

        let key = self.key(path);
        Ok(self
            .nodes
            .read()
            .values()
            .filter_map(|node| {
                let (parent, name) = split_path(&node.path)?;
                (self.key(parent) == key).then(|| name.to_string())
            })
            .collect())
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        match self.existing(path)?.kind {
            NodeKind::File(content) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Cursor::new(content)))
            }
            NodeKind::Directory => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", path),
            )),
        }
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        self.check_writable(path)?;
        let (parent, _) = split_path(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot write a root"))?;
        self.existing(parent)?;

        Ok(Box::new(MemoryWriter {
            nodes: self.nodes.clone(),
            clock: self.clock.clone(),
            key: self.key(path),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    fn symlink_target(&self, path: &str) -> io::Result<Option<String>> {
        Ok(self.node(path)?.and_then(|n| n.symlink_target))
    }

    fn create_child_file(&self, parent: &str, name: &str) -> io::Result<()> {
        self.check_writable(parent)?;
        self.existing(parent)?;
        let path = join_path(parent, name);
        if self.node(&path)?.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path),
            ));
        }
        self.add_file(&path, b"");
        Ok(())
    }

    fn create_child_directory(&self, parent: &str, name: &str) -> io::Result<()> {
        self.check_writable(parent)?;
        self.existing(parent)?;
        let path = join_path(parent, name);
        if self.node(&path)?.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path),
            ));
        }
        self.add_directory(&path);
        Ok(())
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        self.check_writable(path)?;
        self.existing(path)?;
        self.remove(path);
        Ok(())
    }

    fn rename(&self, path: &str, new_name: &str) -> io::Result<()> {
        self.check_writable(path)?;
        let (parent, _) = split_path(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "cannot rename a root")
        })?;
        self.relocate(path, &join_path(parent, new_name), false)
    }

    fn move_to(&self, path: &str, new_parent: &str) -> io::Result<()> {
        self.check_writable(path)?;
        self.existing(new_parent)?;
        let (_, name) = split_path(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot move a root"))?;
        self.relocate(path, &join_path(new_parent, name), false)
    }

    fn copy(&self, path: &str, new_parent: &str, new_name: &str) -> io::Result<()> {
        self.check_writable(new_parent)?;
        self.existing(new_parent)?;
        self.relocate(path, &join_path(new_parent, new_name), true)
    }

    fn set_writable(&self, path: &str, writable: bool) -> io::Result<()> {
        self.check_writable(path)?;
        self.existing(path)?;
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.writable = writable;
        }
        Ok(())
    }

    fn set_timestamp(&self, path: &str, timestamp: i64) -> io::Result<()> {
        self.check_writable(path)?;
        self.existing(path)?;
        if let Some(node) = self.nodes.write().get_mut(&self.key(path)) {
            node.last_modified = timestamp;
        }
        Ok(())
    }
}

/// Collects written bytes and swaps them in on flush and drop.
struct MemoryWriter {
    nodes: Arc<RwLock<BTreeMap<String, MemoryNode>>>,
    clock: Arc<AtomicI64>,
    key: String,
    path: String,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let stamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let content = NodeKind::File(Bytes::copy_from_slice(&self.buf));

        let mut nodes = self.nodes.write();
        match nodes.get_mut(&self.key) {
            Some(node) if node.full => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("no space left for {}", self.path),
                ));
            }
            Some(node) => {
                node.kind = content;
                node.last_modified = stamp;
            }
            None => {
                nodes.insert(
                    self.key.clone(),
                    MemoryNode {
                        path: self.path.clone(),
                        kind: content,
                        writable: true,
                        hidden: false,
                        last_modified: stamp,
                        reported_length: None,
                        symlink_target: None,
                        broken: false,
                        full: false,
                    },
                );
            }
        }
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
