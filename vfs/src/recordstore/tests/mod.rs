//! This contains test scenarios that a given [RecordStore] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all stores we want to test
//! against, and then apply this template to all test functions.

use std::sync::Arc;

use rstest::*;
use rstest_reuse::{self, *};

use super::RecordStore;
use crate::{
    delegate::FileAttributes,
    nodes::{FileId, Flags, LENGTH_UNKNOWN},
    recordstore, Error,
};

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(recordstore::from_addr("memory://").unwrap())]
#[case::redb(recordstore::from_addr("redb://").unwrap())]
pub fn record_stores(#[case] record_store: Arc<dyn RecordStore>) {}

/// Fresh records have no parent, no name and unknown length.
#[apply(record_stores)]
fn create_record_defaults(record_store: Arc<dyn RecordStore>) {
    let id = record_store.create_record().expect("must succeed");
    assert!(id.is_valid());
    assert_eq!(FileId::NONE, record_store.parent(id).unwrap());
    assert_eq!("", record_store.name(id).unwrap());
    assert_eq!(Flags::empty(), record_store.flags(id).unwrap());
    assert_eq!(LENGTH_UNKNOWN, record_store.length(id).unwrap());
    assert!(record_store.list(id).unwrap().is_empty());
    assert!(record_store.read_content(id).unwrap().is_none());

    let other = record_store.create_record().unwrap();
    assert_ne!(id, other);
}

/// Accessing an unknown record is an error, not a default.
#[apply(record_stores)]
fn unknown_record(record_store: Arc<dyn RecordStore>) {
    assert!(matches!(
        record_store.name(FileId::new(4711)),
        Err(Error::InvalidAccess(id)) if id == FileId::new(4711)
    ));
    assert!(record_store
        .set_flags(FileId::new(4711), Flags::IS_DIRECTORY)
        .is_err());
}

#[apply(record_stores)]
fn set_and_get_fields(record_store: Arc<dyn RecordStore>) {
    let parent = record_store.create_record().unwrap();
    let id = record_store.create_record().unwrap();

    record_store.set_parent(id, parent).unwrap();
    record_store.set_name(id, "Cargo.toml").unwrap();
    record_store
        .set_flags(id, Flags::IS_READ_ONLY | Flags::IS_HIDDEN)
        .unwrap();
    record_store.set_timestamp(id, 1_700_000_000_000).unwrap();
    record_store.set_length(id, 42).unwrap();

    assert_eq!(parent, record_store.parent(id).unwrap());
    assert_eq!("Cargo.toml", record_store.name(id).unwrap());
    assert_eq!(
        Flags::IS_READ_ONLY | Flags::IS_HIDDEN,
        record_store.flags(id).unwrap()
    );
    assert_eq!(1_700_000_000_000, record_store.timestamp(id).unwrap());
    assert_eq!(42, record_store.length(id).unwrap());
}

/// Children lists keep their order, and list_all pairs them with names.
#[apply(record_stores)]
fn children_lists(record_store: Arc<dyn RecordStore>) {
    let dir = record_store.create_record().unwrap();
    let b = record_store.create_record().unwrap();
    let a = record_store.create_record().unwrap();
    record_store.set_name(a, "a").unwrap();
    record_store.set_name(b, "b").unwrap();

    record_store.update_list(dir, &[b, a]).unwrap();
    assert_eq!(vec![b, a], record_store.list(dir).unwrap());
    assert_eq!(
        vec![(b, "b".to_string()), (a, "a".to_string())],
        record_store.list_all(dir).unwrap()
    );

    record_store.update_list(dir, &[a]).unwrap();
    assert_eq!(vec![a], record_store.list(dir).unwrap());
}

/// Deleting a record removes everything reachable through its children.
#[apply(record_stores)]
fn delete_recursively(record_store: Arc<dyn RecordStore>) {
    let dir = record_store.create_record().unwrap();
    let sub = record_store.create_record().unwrap();
    let file = record_store.create_record().unwrap();
    let sibling = record_store.create_record().unwrap();

    record_store.update_list(dir, &[sub]).unwrap();
    record_store.update_list(sub, &[file]).unwrap();
    record_store.write_attribute(file, "encoding", b"utf-8").unwrap();
    record_store.write_content(file, b"hello").unwrap();

    record_store.delete_record_recursively(dir).unwrap();

    for id in [dir, sub, file] {
        assert!(record_store.name(id).is_err(), "{} must be gone", id);
    }
    assert!(record_store.name(sibling).is_ok());
}

/// A corrupted children list pointing back up must not hang deletion.
#[apply(record_stores)]
fn delete_with_cycle(record_store: Arc<dyn RecordStore>) {
    let a = record_store.create_record().unwrap();
    let b = record_store.create_record().unwrap();
    record_store.update_list(a, &[b]).unwrap();
    record_store.update_list(b, &[a]).unwrap();

    record_store.delete_record_recursively(a).unwrap();
    assert!(record_store.name(b).is_err());
}

#[apply(record_stores)]
fn attributes(record_store: Arc<dyn RecordStore>) {
    let id = record_store.create_record().unwrap();
    let other = record_store.create_record().unwrap();

    assert!(record_store.read_attribute(id, "encoding").unwrap().is_none());
    record_store.write_attribute(id, "encoding", b"utf-8").unwrap();
    record_store.write_attribute(other, "encoding", b"latin1").unwrap();

    assert_eq!(
        &b"utf-8"[..],
        &record_store.read_attribute(id, "encoding").unwrap().unwrap()[..]
    );
    assert_eq!(
        &b"latin1"[..],
        &record_store.read_attribute(other, "encoding").unwrap().unwrap()[..]
    );
}

#[apply(record_stores)]
fn content(record_store: Arc<dyn RecordStore>) {
    let id = record_store.create_record().unwrap();
    record_store.write_content(id, b"fn main() {}").unwrap();
    assert_eq!(
        &b"fn main() {}"[..],
        &record_store.read_content(id).unwrap().unwrap()[..]
    );

    record_store.write_content(id, b"").unwrap();
    assert!(record_store.read_content(id).unwrap().unwrap().is_empty());
}

/// Looking up the same root url twice yields the same record.
#[apply(record_stores)]
fn root_records(record_store: Arc<dyn RecordStore>) {
    let a = record_store.find_root_record("file:///a").unwrap();
    let b = record_store.find_root_record("file:///b").unwrap();
    assert_ne!(a, b);
    assert_eq!(a, record_store.find_root_record("file:///a").unwrap());

    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(expected, record_store.list_roots().unwrap());

    record_store.delete_root_record(a).unwrap();
    assert_eq!(vec![b], record_store.list_roots().unwrap());
}

/// Content and attribute writes only move the local counter.
#[apply(record_stores)]
fn mod_counts(record_store: Arc<dyn RecordStore>) {
    let id = record_store.create_record().unwrap();

    let global = record_store.mod_count().unwrap();
    let local = record_store.local_mod_count().unwrap();
    let record = record_store.record_mod_count(id).unwrap();

    record_store.write_content(id, b"x").unwrap();
    assert_eq!(global, record_store.mod_count().unwrap());
    assert!(record_store.local_mod_count().unwrap() > local);
    assert!(record_store.record_mod_count(id).unwrap() > record);

    record_store.set_name(id, "x").unwrap();
    assert!(record_store.mod_count().unwrap() > global);
}

#[apply(record_stores)]
fn write_attributes_to_record(record_store: Arc<dyn RecordStore>) {
    let parent = record_store.create_record().unwrap();
    let id = record_store.create_record().unwrap();

    let attributes = FileAttributes {
        is_writable: false,
        length: 12,
        last_modified: 1000,
        ..Default::default()
    };
    record_store
        .write_attributes_to_record(id, parent, "main.rs", &attributes)
        .unwrap();

    assert_eq!(parent, record_store.parent(id).unwrap());
    assert_eq!("main.rs", record_store.name(id).unwrap());
    assert_eq!(Flags::IS_READ_ONLY, record_store.flags(id).unwrap());
    assert_eq!(12, record_store.length(id).unwrap());
    assert_eq!(1000, record_store.timestamp(id).unwrap());
}

#[apply(record_stores)]
fn creation_timestamp(record_store: Arc<dyn RecordStore>) {
    assert!(record_store.creation_timestamp().unwrap() > 0);
}
