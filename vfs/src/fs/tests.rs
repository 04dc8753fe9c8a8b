use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
};

use bytes::Bytes;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::PersistentFs;
use crate::{
    config::VfsConfig,
    delegate::{DelegateFs, MemoryFs},
    events::{BulkFileListener, ChangeEvent, FileEvent},
    fixtures::{
        lookup, memory_vfs, sample_root, sample_tree, HELLOWORLD_CONTENTS, LARGE_CONTENTS,
        SMALL_CACHE_CONFIG,
    },
    nodes::{FileId, Flags},
    recordstore::{MemoryRecordStore, RecordStore},
    Error,
};

#[derive(Default)]
struct Recorder {
    before: Mutex<Vec<Vec<String>>>,
    after: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    fn subscribe(vfs: &PersistentFs) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        vfs.events().subscribe(recorder.clone());
        recorder
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.after.lock().clone()
    }
}

impl BulkFileListener for Recorder {
    fn before(&self, events: &[FileEvent]) {
        self.before
            .lock()
            .push(events.iter().map(ToString::to_string).collect());
    }

    fn after(&self, events: &[FileEvent]) {
        self.after
            .lock()
            .push(events.iter().map(ToString::to_string).collect());
    }
}

/// A [MemoryRecordStore] whose `set_name` can be made to fail, which breaks
/// filling freshly created records.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryRecordStore,
    fail_names: AtomicBool,
    last_created: Mutex<Option<FileId>>,
}

impl RecordStore for FlakyStore {
    fn create_record(&self) -> Result<FileId, Error> {
        let id = self.inner.create_record()?;
        *self.last_created.lock() = Some(id);
        Ok(id)
    }
    fn delete_record_recursively(&self, id: FileId) -> Result<(), Error> {
        self.inner.delete_record_recursively(id)
    }
    fn parent(&self, id: FileId) -> Result<FileId, Error> {
        self.inner.parent(id)
    }
    fn set_parent(&self, id: FileId, parent: FileId) -> Result<(), Error> {
        self.inner.set_parent(id, parent)
    }
    fn name(&self, id: FileId) -> Result<String, Error> {
        self.inner.name(id)
    }
    fn set_name(&self, id: FileId, name: &str) -> Result<(), Error> {
        if self.fail_names.load(Ordering::SeqCst) {
            return Err(Error::StorageError("names are read-only".into()));
        }
        self.inner.set_name(id, name)
    }
    fn flags(&self, id: FileId) -> Result<Flags, Error> {
        self.inner.flags(id)
    }
    fn set_flags(&self, id: FileId, flags: Flags) -> Result<(), Error> {
        self.inner.set_flags(id, flags)
    }
    fn timestamp(&self, id: FileId) -> Result<i64, Error> {
        self.inner.timestamp(id)
    }
    fn set_timestamp(&self, id: FileId, timestamp: i64) -> Result<(), Error> {
        self.inner.set_timestamp(id, timestamp)
    }
    fn length(&self, id: FileId) -> Result<i64, Error> {
        self.inner.length(id)
    }
    fn set_length(&self, id: FileId, length: i64) -> Result<(), Error> {
        self.inner.set_length(id, length)
    }
    fn list(&self, id: FileId) -> Result<Vec<FileId>, Error> {
        self.inner.list(id)
    }
    fn update_list(&self, id: FileId, children: &[FileId]) -> Result<(), Error> {
        self.inner.update_list(id, children)
    }
    fn read_attribute(&self, id: FileId, key: &str) -> Result<Option<Bytes>, Error> {
        self.inner.read_attribute(id, key)
    }
    fn write_attribute(&self, id: FileId, key: &str, value: &[u8]) -> Result<(), Error> {
        self.inner.write_attribute(id, key, value)
    }
    fn read_content(&self, id: FileId) -> Result<Option<Bytes>, Error> {
        self.inner.read_content(id)
    }
    fn write_content(&self, id: FileId, content: &[u8]) -> Result<(), Error> {
        self.inner.write_content(id, content)
    }
    fn find_root_record(&self, url: &str) -> Result<FileId, Error> {
        self.inner.find_root_record(url)
    }
    fn delete_root_record(&self, id: FileId) -> Result<(), Error> {
        self.inner.delete_root_record(id)
    }
    fn list_roots(&self) -> Result<Vec<FileId>, Error> {
        self.inner.list_roots()
    }
    fn mod_count(&self) -> Result<u64, Error> {
        self.inner.mod_count()
    }
    fn local_mod_count(&self) -> Result<u64, Error> {
        self.inner.local_mod_count()
    }
    fn record_mod_count(&self, id: FileId) -> Result<u64, Error> {
        self.inner.record_mod_count(id)
    }
    fn creation_timestamp(&self) -> Result<i64, Error> {
        self.inner.creation_timestamp()
    }
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

#[test]
fn resolve_returns_same_entry() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let main = lookup(&vfs, &root, "src/main.rs");

    vfs.clear_id_cache();
    let first = vfs.find_file_by_id(main.id()).expect("must resolve");
    let second = vfs.find_file_by_id(main.id()).expect("must resolve");

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &main));
    assert_eq!("/project/src/main.rs", vfs.path(&first).unwrap());
}

#[test]
fn resolve_unknown_ids() {
    let vfs = memory_vfs(VfsConfig::default());
    assert!(vfs.find_file_by_id(FileId::NONE).is_none());
    assert!(vfs.find_file_by_id(FileId::new(4711)).is_none());

    // a parentless record that is not a registered root
    let orphan = vfs.store().create_record().unwrap();
    assert!(vfs.find_file_by_id(orphan).is_none());
}

#[test]
fn cyclic_parents_resolve_to_none() {
    let vfs = memory_vfs(VfsConfig::default());
    let store = vfs.store();
    let a = store.create_record().unwrap();
    let b = store.create_record().unwrap();
    store.set_parent(a, b).unwrap();
    store.set_parent(b, a).unwrap();

    assert!(vfs.find_file_by_id(a).is_none());
    assert!(vfs.find_file_by_id_if_cached(b).is_none());
}

#[test]
fn depth_limit_stops_resolution() {
    let fs = MemoryFs::default();
    fs.add_file("/project/a/b/c/d/e.txt", HELLOWORLD_CONTENTS);
    let fs: Arc<dyn DelegateFs> = Arc::new(fs);

    let vfs = memory_vfs(VfsConfig::default());
    let root = vfs.find_root("/project", fs.clone()).unwrap();
    let deep = lookup(&vfs, &root, "a/b/c/d/e.txt");

    let shallow = PersistentFs::new(
        vfs.store().clone(),
        VfsConfig {
            depth_limit: 3,
            ..Default::default()
        },
    )
    .unwrap();
    shallow.find_root("/project", fs.clone()).unwrap();
    assert!(shallow.find_file_by_id(deep.id()).is_none());

    let fresh = PersistentFs::new(vfs.store().clone(), VfsConfig::default()).unwrap();
    fresh.find_root("/project", fs).unwrap();
    let resolved = fresh.find_file_by_id(deep.id()).expect("must resolve");
    assert_eq!("e.txt", resolved.name());
}

#[test]
fn resolve_if_cached_does_not_load_children() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let main = lookup(&vfs, &root, "src/main.rs");

    let other = PersistentFs::new(vfs.store().clone(), VfsConfig::default()).unwrap();
    other.find_root("/project", root.fs().clone()).unwrap();

    // neither the root nor src had their children listed
    assert!(other.find_file_by_id_if_cached(main.id()).is_none());
    assert!(other.find_file_by_id(main.id()).is_some());
}

#[test]
fn equivalent_paths_share_root() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let delegate: Arc<dyn DelegateFs> = fs;

    for path in ["/project/", "/project/./src/..", "/project//"] {
        let other = vfs.find_root(path, delegate.clone()).unwrap();
        assert!(Arc::ptr_eq(&root, &other), "{} must resolve to the same root", path);
    }
    assert_eq!(1, vfs.store().list_roots().unwrap().len());
    assert_eq!(1, vfs.roots_for(&delegate).len());
    assert!(vfs.local_roots().is_empty());
}

#[rstest]
#[case::missing("/nope")]
#[case::file("/project/README.md")]
fn find_root_requires_directory(#[case] path: &str) {
    let (vfs, fs, _) = sample_root(VfsConfig::default());
    assert!(matches!(vfs.find_root(path, fs), Err(Error::NotFound(_))));
}

#[test]
fn find_root_rejects_empty_path() {
    let vfs = memory_vfs(VfsConfig::default());
    assert!(matches!(
        vfs.find_root("", sample_tree()),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn concurrent_find_root_creates_one_record() {
    let fs: Arc<dyn DelegateFs> = sample_tree();
    let vfs = memory_vfs(VfsConfig::default());
    let barrier = Barrier::new(8);

    let roots: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fs = fs.clone();
                let vfs = &vfs;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    vfs.find_root("/project", fs).expect("must find root")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(roots.iter().all(|r| Arc::ptr_eq(r, &roots[0])));
    assert_eq!(vec![roots[0].id()], vfs.store().list_roots().unwrap());
}

#[test]
fn changed_root_is_dirty_until_refreshed() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    assert!(!root.is_dirty());

    fs.set_timestamp("/project", 99).unwrap();

    let other = PersistentFs::new(vfs.store().clone(), VfsConfig::default()).unwrap();
    let reopened = other.find_root("/project", fs).unwrap();
    assert_eq!(root.id(), reopened.id());
    assert!(reopened.is_dirty());

    other.list(&reopened).unwrap();
    other.refresh(&reopened, false).unwrap();
    assert!(!reopened.is_dirty());
}

#[test]
fn delete_invalidates_loaded_subtree() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");
    let main = lookup(&vfs, &root, "src/main.rs");

    vfs.delete_file(&src).unwrap();

    assert!(!src.is_valid());
    assert!(!main.is_valid());
    assert!(matches!(vfs.file_id(&main), Err(Error::InvalidAccess(_))));
    assert!(vfs.store().name(main.id()).is_err());
    assert!(!fs.exists("/project/src").unwrap());
    assert!(vfs.find_child(&root, "src").unwrap().is_none());
    assert!(vfs.find_file_by_id(src.id()).is_none());
}

#[test]
fn nested_deletes_are_collapsed() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");
    let main = lookup(&vfs, &root, "src/main.rs");
    let recorder = Recorder::subscribe(&vfs);

    vfs.process_events(vec![
        FileEvent::new(ChangeEvent::Delete { file: main.clone() }),
        FileEvent::new(ChangeEvent::Delete { file: src.clone() }),
    ]);

    let expected = vec![vec![format!("Delete({})", src.id())]];
    assert_eq!(expected, recorder.batches());
    assert_eq!(expected, *recorder.before.lock());
    assert!(!main.is_valid());
    assert!(vfs.store().name(main.id()).is_err());
}

#[test]
fn create_of_vanished_file_is_ignored() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let before = vfs.list_persisted(&root).unwrap();

    vfs.process_event(FileEvent::new(ChangeEvent::Create {
        parent: root.clone(),
        name: "ghost".to_string(),
        is_directory: false,
    }));

    assert_eq!(before, vfs.list_persisted(&root).unwrap());
}

#[test]
fn failing_event_does_not_abort_batch() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let main = lookup(&vfs, &root, "src/main.rs");
    fs.set_broken("/project/src/main.rs", true);
    fs.add_file("/project/NEW.md", b"new");

    vfs.process_events(vec![
        FileEvent::new(ChangeEvent::ContentChange {
            file: main.clone(),
            old_stamp: main.modification_stamp(),
            new_stamp: 4711,
        }),
        FileEvent::new(ChangeEvent::Rename {
            file: root.clone(),
            old_name: root.name(),
            new_name: "elsewhere".to_string(),
        }),
        FileEvent::new(ChangeEvent::Create {
            parent: root.clone(),
            name: "NEW.md".to_string(),
            is_directory: false,
        }),
    ]);

    assert!(vfs
        .list_persisted(&root)
        .unwrap()
        .contains(&"NEW.md".to_string()));
    assert_eq!("/project", root.name());
}

#[test]
fn failed_creation_keeps_sibling_deletion() {
    let store = Arc::new(FlakyStore::default());
    let vfs = PersistentFs::new(store.clone(), VfsConfig::default()).unwrap();
    let fs = sample_tree();
    let root = vfs.find_root("/project", fs.clone()).unwrap();
    let readme = lookup(&vfs, &root, "README.md");

    fs.remove("/project/README.md");
    fs.add_file("/project/NEW.md", b"new");
    store.fail_names.store(true, Ordering::SeqCst);

    vfs.process_events(vec![
        FileEvent::new(ChangeEvent::Delete {
            file: readme.clone(),
        }),
        FileEvent::new(ChangeEvent::Create {
            parent: root.clone(),
            name: "NEW.md".to_string(),
            is_directory: false,
        }),
    ]);

    assert_eq!(
        vec!["docs", "src"],
        sorted(vfs.list_persisted(&root).unwrap())
    );
    assert!(!readme.is_valid());

    // the half-filled record of NEW.md is gone as well
    let abandoned = store.last_created.lock().expect("a record was allocated");
    assert!(matches!(
        store.name(abandoned),
        Err(Error::InvalidAccess(_))
    ));
}

#[test]
fn duplicate_creation_is_skipped() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");

    vfs.process_event(FileEvent::new(ChangeEvent::Create {
        parent: root.clone(),
        name: "README.md".to_string(),
        is_directory: false,
    }));

    let persisted = vfs.store().list_all(root.id()).unwrap();
    assert_eq!(
        vec![readme.id()],
        persisted
            .iter()
            .filter(|(_, name)| name == "README.md")
            .map(|(id, _)| *id)
            .collect::<Vec<_>>()
    );
}

#[test]
fn list_persists_children() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    assert!(!vfs.are_children_loaded(&root).unwrap());

    assert_eq!(
        vec!["README.md", "docs", "src"],
        sorted(vfs.list(&root).unwrap())
    );
    assert!(vfs.are_children_loaded(&root).unwrap());
    assert_eq!(
        sorted(vfs.list(&root).unwrap()),
        sorted(vfs.list_persisted(&root).unwrap())
    );

    let children = vfs.children(&root).unwrap();
    assert_eq!(
        vec!["README.md", "docs", "src"],
        children.iter().map(|c| c.name()).collect::<Vec<_>>()
    );
    assert!(root.all_children_loaded());
    assert!(children[1].is_directory());
    assert!(!children[0].is_directory());
}

#[test]
fn loaded_children_are_reused() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let first = vfs.children(&root).unwrap();
    assert!(root.all_children_loaded());

    vfs.create_child_file(&root, "NEW.md").unwrap();
    let second = vfs.children(&root).unwrap();
    assert_eq!(
        vec!["NEW.md", "README.md", "docs", "src"],
        second.iter().map(|c| c.name()).collect::<Vec<_>>()
    );
    assert!(Arc::ptr_eq(&first[2], &second[3]));

    // a removal makes the next call go back to the store
    vfs.delete_file(&second[1]).unwrap();
    assert!(!root.all_children_loaded());
    assert_eq!(
        vec!["NEW.md", "docs", "src"],
        vfs.children(&root)
            .unwrap()
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
    );
    assert!(root.all_children_loaded());
}

#[test]
fn persist_all_children_drops_vanished() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");
    let main = lookup(&vfs, &root, "src/main.rs");
    assert_eq!(vec!["lib.rs", "main.rs"], sorted(vfs.list(&src).unwrap()));

    fs.remove("/project/src/main.rs");
    // listings are served from the store until the children are reloaded
    assert_eq!(vec!["lib.rs", "main.rs"], sorted(vfs.list(&src).unwrap()));

    vfs.set_flag(&src, Flags::CHILDREN_CACHED, false).unwrap();
    assert_eq!(vec!["lib.rs"], vfs.list(&src).unwrap());
    assert!(!main.is_valid());
    assert!(vfs.store().name(main.id()).is_err());
}

#[test]
fn case_insensitive_lookup() {
    let fs = MemoryFs::new("mem", false);
    fs.add_file("/Project/ReadMe.md", HELLOWORLD_CONTENTS);
    let fs: Arc<dyn DelegateFs> = Arc::new(fs);

    let vfs = memory_vfs(VfsConfig::default());
    let root = vfs.find_root("/project", fs.clone()).unwrap();
    assert!(Arc::ptr_eq(&root, &vfs.find_root("/PROJECT", fs).unwrap()));

    let upper = vfs.find_child(&root, "README.MD").unwrap().expect("must exist");
    let lower = vfs.find_child(&root, "readme.md").unwrap().expect("must exist");
    assert_eq!(upper.id(), lower.id());
    assert_eq!(1, vfs.list_persisted(&root).unwrap().len());
}

#[test]
fn find_child_of_missing_name() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    assert!(vfs.find_child(&root, "missing").unwrap().is_none());
    assert!(vfs.find_child(&root, "..").unwrap().is_none());
    assert_eq!(FileId::NONE, vfs.child_id(&root, "missing").unwrap());

    let readme = lookup(&vfs, &root, "README.md");
    assert!(vfs.find_child(&readme, "anything").unwrap().is_none());
}

#[rstest]
#[case::internal_mode(true, true, false)]
#[case::requested(false, true, true)]
#[case::not_requested(false, false, false)]
fn read_only_content_caching(
    #[case] internal_mode: bool,
    #[case] cache_requested: bool,
    #[case] cached: bool,
) {
    let fs = MemoryFs::default();
    fs.add_file("/project/README.md", HELLOWORLD_CONTENTS);
    let fs: Arc<dyn DelegateFs> = Arc::new(fs.with_read_only(true));

    let vfs = memory_vfs(VfsConfig {
        internal_mode,
        ..Default::default()
    });
    let root = vfs.find_root("/project", fs).unwrap();
    let readme = lookup(&vfs, &root, "README.md");

    assert_eq!(
        HELLOWORLD_CONTENTS,
        vfs.contents_to_byte_array(&readme, cache_requested).unwrap()
    );
    assert_eq!(cached, vfs.store().read_content(readme.id()).unwrap().is_some());
    assert!(!vfs.is_writable(&readme).unwrap());
}

#[test]
fn matching_length_is_cached() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");

    assert_eq!(HELLOWORLD_CONTENTS, vfs.contents_to_byte_array(&readme, false).unwrap());
    assert_eq!(HELLOWORLD_CONTENTS, vfs.contents_to_byte_array(&readme, false).unwrap());
    assert_eq!(1, fs.reads());
    assert!(!vfs.file_flags(readme.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));
    assert_eq!(HELLOWORLD_CONTENTS.len() as u64, vfs.length(&readme).unwrap());
}

#[test]
fn length_mismatch_is_not_cached() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    fs.set_reported_length("/project/README.md", Some(5));

    assert_eq!(HELLOWORLD_CONTENTS, vfs.contents_to_byte_array(&readme, false).unwrap());
    assert!(vfs.file_flags(readme.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));
    assert!(vfs.store().read_content(readme.id()).unwrap().is_none());

    vfs.contents_to_byte_array(&readme, false).unwrap();
    assert_eq!(2, fs.reads());
}

#[test]
fn large_content_is_not_cached() {
    let (vfs, fs, root) = sample_root(SMALL_CACHE_CONFIG.clone());
    fs.add_file("/project/big.bin", &LARGE_CONTENTS);
    let big = lookup(&vfs, &root, "big.bin");

    assert_eq!(LARGE_CONTENTS.to_vec(), vfs.contents_to_byte_array(&big, false).unwrap());
    assert!(vfs.store().read_content(big.id()).unwrap().is_none());
}

#[test]
fn directories_have_no_content() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");
    assert!(matches!(
        vfs.contents_to_byte_array(&src, false),
        Err(Error::InvalidRequest(_))
    ));
    assert!(vfs.input_stream(&src).is_err());
    assert!(vfs.output_stream(&src, None).is_err());
}

#[test]
fn input_stream_replicates_content() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");

    let mut out = Vec::new();
    vfs.input_stream(&readme)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(HELLOWORLD_CONTENTS, out);
    assert_eq!(
        Some(HELLOWORLD_CONTENTS),
        vfs.store()
            .read_content(readme.id())
            .unwrap()
            .as_deref()
    );

    out.clear();
    vfs.input_stream(&readme)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(HELLOWORLD_CONTENTS, out);
    assert_eq!(1, fs.reads());
}

#[test]
fn input_stream_with_wrong_length() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let main = lookup(&vfs, &root, "src/main.rs");
    fs.set_reported_length("/project/src/main.rs", Some(5));

    let mut out = Vec::new();
    vfs.input_stream(&main)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(b"fn main() {}".to_vec(), out);
    assert!(vfs.file_flags(main.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));
    assert!(vfs.store().read_content(main.id()).unwrap().is_none());
}

#[test]
fn content_writer_publishes_once() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    let recorder = Recorder::subscribe(&vfs);

    let mut writer = vfs.output_stream(&readme, Some(4711)).unwrap();
    writer.write_all(b"new").unwrap();
    writer.close().unwrap();

    assert_eq!(1, recorder.before.lock().len());
    assert_eq!(1, recorder.batches().len());
    assert_eq!(4711, readme.modification_stamp());

    // served from the store
    assert_eq!(b"new".to_vec(), vfs.contents_to_byte_array(&readme, false).unwrap());
    assert_eq!(0, fs.reads());
    assert_eq!(3, vfs.length(&readme).unwrap());
    assert_eq!(b"new".to_vec(), fs.contents("/project/README.md").unwrap());
}

#[test]
fn dropped_content_writer_closes() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let main = lookup(&vfs, &root, "src/main.rs");
    let recorder = Recorder::subscribe(&vfs);
    let stamp = main.modification_stamp();

    {
        let mut writer = vfs.output_stream(&main, None).unwrap();
        writer.write_all(b"fn main() { loop {} }").unwrap();
    }

    assert_eq!(1, recorder.batches().len());
    assert!(main.modification_stamp() > stamp);
    assert_eq!(
        b"fn main() { loop {} }".to_vec(),
        fs.contents("/project/src/main.rs").unwrap()
    );
}

#[test]
fn content_writer_keeps_stale_marker_on_mismatch() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    fs.set_reported_length("/project/README.md", Some(1));

    let mut writer = vfs.output_stream(&readme, None).unwrap();
    writer.write_all(b"twelve bytes").unwrap();
    writer.close().unwrap();

    assert!(vfs.file_flags(readme.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));
}

#[test]
fn failed_delegate_write_is_not_served() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    assert_eq!(
        HELLOWORLD_CONTENTS.to_vec(),
        vfs.contents_to_byte_array(&readme, true).unwrap()
    );
    fs.set_full("/project/README.md", true);

    let mut writer = vfs.output_stream(&readme, None).unwrap();
    writer.write_all(b"Goodbye!!!!!").unwrap();
    assert!(matches!(writer.close(), Err(Error::Io(_))));

    assert_eq!(
        HELLOWORLD_CONTENTS.to_vec(),
        fs.contents("/project/README.md").unwrap()
    );
    assert!(vfs.file_flags(readme.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));
    assert_eq!(
        HELLOWORLD_CONTENTS.to_vec(),
        vfs.contents_to_byte_array(&readme, false).unwrap()
    );
}

#[test]
fn content_writer_of_deleted_file() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    let mut writer = vfs.output_stream(&readme, None).unwrap();
    writer.write_all(b"too late").unwrap();

    let recorder = Recorder::subscribe(&vfs);
    vfs.delete_file(&readme).unwrap();
    assert!(matches!(writer.close(), Err(Error::InvalidAccess(_))));

    // only the deletion was published
    assert_eq!(1, recorder.before.lock().len());
    assert_eq!(1, recorder.batches().len());
    assert!(recorder.batches()[0][0].starts_with("Delete"));
    assert!(!fs.exists("/project/README.md").unwrap());
}

#[test]
fn clean_persisted_contents_forces_reload() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    vfs.list(&root).unwrap();
    vfs.contents_to_byte_array(&readme, false).unwrap();

    vfs.clean_persisted_contents().unwrap();
    assert!(vfs.file_flags(readme.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));

    vfs.contents_to_byte_array(&readme, false).unwrap();
    assert_eq!(2, fs.reads());
}

#[test]
fn create_children() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let before = vfs.filesystem_modification_count().unwrap();

    let target = vfs.create_child_directory(&root, "target").unwrap();
    assert!(target.is_directory());
    let out = vfs.create_child_file(&target, "out.txt").unwrap();
    assert!(!out.is_directory());

    assert_eq!("/project/target/out.txt", vfs.path(&out).unwrap());
    assert!(fs.exists("/project/target/out.txt").unwrap());
    assert!(vfs.filesystem_modification_count().unwrap() > before);

    assert!(matches!(
        vfs.create_child_file(&root, "a/b"),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        vfs.create_child_file(&root, "target"),
        Err(Error::Io(_))
    ));
    assert!(matches!(
        vfs.create_child_file(&out, "nested"),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn write_access_is_reentrant() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let _guard = vfs.write_access();
    let created = vfs.create_child_file(&root, "locked.txt").unwrap();
    vfs.rename_file(&created, "renamed.txt").unwrap();
    assert_eq!("renamed.txt", created.name());
}

#[test]
fn rename_file() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");

    vfs.rename_file(&readme, "README.txt").unwrap();

    assert_eq!("README.txt", readme.name());
    assert_eq!("README.txt", vfs.name(readme.id()).unwrap());
    assert!(fs.exists("/project/README.txt").unwrap());
    assert!(Arc::ptr_eq(&readme, &lookup(&vfs, &root, "README.txt")));
}

#[test]
fn roots_cannot_be_renamed_or_moved() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");

    assert!(matches!(
        vfs.rename_file(&root, "elsewhere"),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        vfs.move_file(&root, &src),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn move_file() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");
    let docs = lookup(&vfs, &root, "docs");
    let main = lookup(&vfs, &root, "src/main.rs");

    vfs.move_file(&main, &docs).unwrap();

    assert_eq!("/project/docs/main.rs", vfs.path(&main).unwrap());
    assert_eq!(docs.id(), vfs.store().parent(main.id()).unwrap());
    assert_eq!(docs.id(), main.parent_id());
    assert!(fs.exists("/project/docs/main.rs").unwrap());
    assert!(!vfs.list_persisted(&src).unwrap().contains(&"main.rs".to_string()));
    assert!(vfs.list(&docs).unwrap().contains(&"main.rs".to_string()));

    vfs.clear_id_cache();
    let resolved = vfs.find_file_by_id(main.id()).expect("must resolve");
    assert!(Arc::ptr_eq(&main, &resolved));
}

#[test]
fn move_loaded_directory() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let src = lookup(&vfs, &root, "src");
    let docs = lookup(&vfs, &root, "docs");
    let intro = lookup(&vfs, &root, "docs/guide/intro.md");

    vfs.move_file(&docs, &src).unwrap();

    assert!(fs.exists("/project/src/docs/guide/intro.md").unwrap());
    assert!(src.cached_child(docs.id()).is_some());
    assert!(root.cached_child(docs.id()).is_none());
    assert_eq!("/project/src/docs/guide/intro.md", vfs.path(&intro).unwrap());

    vfs.clear_id_cache();
    let resolved = vfs.find_file_by_id(intro.id()).expect("must resolve");
    assert!(Arc::ptr_eq(&intro, &resolved));
    assert_eq!(
        "/project/src/docs/guide/intro.md",
        vfs.path(&resolved).unwrap()
    );
}

#[test]
fn move_into_own_subtree_is_rejected() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let docs = lookup(&vfs, &root, "docs");
    let guide = lookup(&vfs, &root, "docs/guide");

    vfs.process_event(FileEvent::new(ChangeEvent::Move {
        file: docs.clone(),
        new_parent: guide.clone(),
    }));

    assert_eq!(root.id(), vfs.store().parent(docs.id()).unwrap());
    assert_eq!("/project/docs/guide", vfs.path(&guide).unwrap());
}

#[test]
fn copy_file() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    let docs = lookup(&vfs, &root, "docs");

    let copy = vfs.copy_file(&readme, &docs, "COPY.md").unwrap();

    assert_eq!("COPY.md", copy.name());
    assert_eq!(docs.id(), copy.parent_id());
    assert_ne!(readme.id(), copy.id());
    assert_eq!(HELLOWORLD_CONTENTS.to_vec(), fs.contents("/project/docs/COPY.md").unwrap());
    assert_eq!(HELLOWORLD_CONTENTS, vfs.contents_to_byte_array(&copy, false).unwrap());
}

#[test]
fn delete_root() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");

    vfs.delete_file(&root).unwrap();

    assert!(vfs.roots().is_empty());
    assert!(vfs.store().list_roots().unwrap().is_empty());
    assert!(!root.is_valid());
    assert!(!readme.is_valid());
}

#[test]
fn properties() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    assert!(vfs.is_writable(&readme).unwrap());
    assert!(!vfs.is_hidden(&readme).unwrap());

    vfs.set_writable(&readme, false).unwrap();
    assert!(!vfs.is_writable(&readme).unwrap());
    assert!(!readme.is_writable());
    assert!(!fs.attributes("/project/README.md").unwrap().unwrap().is_writable);

    vfs.set_hidden(&readme, true).unwrap();
    assert!(vfs.is_hidden(&readme).unwrap());
    assert!(readme.is_hidden());
    // only mirrored
    assert!(!fs.attributes("/project/README.md").unwrap().unwrap().is_hidden);
}

#[test]
fn symlink_target_is_loaded_lazily() {
    let fs = sample_tree();
    fs.set_symlink_target("/project/README.md", Some("/elsewhere/README.md"));
    let vfs = memory_vfs(VfsConfig::default());
    let root = vfs.find_root("/project", fs).unwrap();
    let readme = lookup(&vfs, &root, "README.md");
    let main = lookup(&vfs, &root, "src/main.rs");

    assert!(vfs.is_symlink(&readme).unwrap());
    assert_eq!(
        Some("/elsewhere/README.md".to_string()),
        vfs.symlink_target(&readme).unwrap()
    );
    assert_eq!(None, vfs.symlink_target(&main).unwrap());
    assert!(!vfs.is_special_file(&main).unwrap());
}

#[test]
fn timestamps_and_counters() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");

    vfs.set_timestamp(&readme, 1_234).unwrap();
    assert_eq!(1_234, vfs.timestamp(&readme).unwrap());
    assert_eq!(1_234, fs.attributes("/project/README.md").unwrap().unwrap().last_modified);

    let record = vfs.modification_count(&readme).unwrap();
    let cheap = vfs.cheap_filesystem_modification_count().unwrap();
    vfs.write_attribute(&readme, "encoding", b"utf-8").unwrap();
    assert!(vfs.modification_count(&readme).unwrap() > record);
    assert!(vfs.cheap_filesystem_modification_count().unwrap() > cheap);
    assert_eq!(
        Some(&b"utf-8"[..]),
        vfs.read_attribute(&readme, "encoding").unwrap().as_deref()
    );
}

#[test]
fn refresh_detects_changes() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let readme = lookup(&vfs, &root, "README.md");
    let src = lookup(&vfs, &root, "src");
    vfs.list(&root).unwrap();
    vfs.list(&src).unwrap();
    let main = lookup(&vfs, &root, "src/main.rs");
    let lib = lookup(&vfs, &root, "src/lib.rs");
    let recorder = Recorder::subscribe(&vfs);

    fs.remove("/project/README.md");
    fs.add_file("/project/NEW.md", b"new");
    fs.set_content("/project/src/main.rs", b"fn main() { loop {} }");
    fs.set_hidden("/project/src/lib.rs", true);

    vfs.refresh(&root, true).unwrap();

    assert_eq!(
        vec!["NEW.md", "docs", "src"],
        sorted(vfs.list_persisted(&root).unwrap())
    );
    assert!(!readme.is_valid());
    assert!(vfs.file_flags(main.id()).unwrap().contains(Flags::MUST_RELOAD_CONTENT));
    assert_eq!(21, vfs.store().length(main.id()).unwrap());
    assert!(vfs.is_hidden(&lib).unwrap());

    let batches = recorder.batches();
    assert_eq!(1, batches.len());
    assert_eq!(4, batches[0].len());
    assert!(batches[0].iter().all(|e| e.ends_with("(refresh)")));

    // nothing left to do
    vfs.refresh(&root, true).unwrap();
    assert_eq!(1, recorder.batches().len());
}

#[test]
fn refresh_replaces_changed_types() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    vfs.list(&root).unwrap();
    let readme = lookup(&vfs, &root, "README.md");

    fs.remove("/project/README.md");
    fs.add_directory("/project/README.md");
    vfs.refresh(&root, false).unwrap();

    assert!(!readme.is_valid());
    let replaced = lookup(&vfs, &root, "README.md");
    assert!(replaced.is_directory());
    assert_ne!(readme.id(), replaced.id());
}

#[test]
fn refresh_skips_unlisted_directories() {
    let (vfs, fs, root) = sample_root(VfsConfig::default());
    let recorder = Recorder::subscribe(&vfs);
    fs.add_file("/project/NEW.md", b"new");

    vfs.refresh(&root, true).unwrap();

    assert!(recorder.batches().is_empty());
    assert!(!vfs
        .list_persisted(&root)
        .unwrap()
        .contains(&"NEW.md".to_string()));
}

#[test]
fn archive_roots() {
    let fs = MemoryFs::archive("jar", "!/");
    fs.add_file("/libs/a.jar!/META-INF/MANIFEST.MF", b"Manifest-Version: 1.0");
    let fs: Arc<dyn DelegateFs> = Arc::new(fs);

    let vfs = memory_vfs(VfsConfig::default());
    let root = vfs.find_root("/libs/a.jar!/", fs).unwrap();
    assert_eq!("a.jar", root.name());
    assert_eq!("/libs/a.jar!/", vfs.path(&root).unwrap());

    let manifest = lookup(&vfs, &root, "META-INF/MANIFEST.MF");
    assert_eq!("/libs/a.jar!/META-INF/MANIFEST.MF", vfs.path(&manifest).unwrap());
    assert_eq!(
        b"Manifest-Version: 1.0".to_vec(),
        vfs.contents_to_byte_array(&manifest, true).unwrap()
    );
    assert!(vfs.delete_file(&manifest).is_err());
    assert!(manifest.is_valid());
}

#[test]
fn dispose_once() {
    let (vfs, _, _) = sample_root(VfsConfig::default());
    assert!(!vfs.is_disposed());
    vfs.dispose().unwrap();
    vfs.dispose().unwrap();
    assert!(vfs.is_disposed());
    assert!(vfs.creation_timestamp().unwrap() > 0);
}

#[test]
fn low_memory_keeps_entries_reachable() {
    let (vfs, _, root) = sample_root(VfsConfig::default());
    let guide = lookup(&vfs, &root, "docs/guide");

    vfs.on_low_memory();

    let resolved = vfs.find_file_by_id(guide.id()).expect("must resolve");
    assert!(Arc::ptr_eq(&guide, &resolved));
}
