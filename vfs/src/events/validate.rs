use std::{collections::HashSet, sync::Arc};

use tracing::debug;

use super::{ChangeEvent, FileEvent};
use crate::nodes::{FileId, TreeEntry};

/// Resolves the parent of an entry. Roots have none.
pub trait ParentLookup {
    fn parent_of(&self, entry: &TreeEntry) -> Option<Arc<TreeEntry>>;
}

/// Walks up from `entry` and calls `f` on it and each ancestor, stopping
/// early when `f` returns true. Returns whether it stopped early.
fn any_ancestor(
    lookup: &impl ParentLookup,
    entry: &Arc<TreeEntry>,
    mut f: impl FnMut(&TreeEntry) -> bool,
) -> bool {
    let mut seen: HashSet<FileId> = HashSet::new();
    let mut current = Some(entry.clone());
    while let Some(e) = current {
        if f(&e) {
            return true;
        }
        if !seen.insert(e.id()) {
            return false;
        }
        current = lookup.parent_of(&e);
    }
    false
}

fn depth(lookup: &impl ParentLookup, entry: &Arc<TreeEntry>) -> usize {
    let mut depth = 0;
    any_ancestor(lookup, entry, |_| {
        depth += 1;
        false
    });
    depth
}

/// Filters a batch of events before it is applied.
///
/// Events about already invalidated entries are dropped. Deletions are
/// considered shallowest first, and a deletion is dropped if the file or one
/// of its ancestors is already being deleted by another event in the batch.
/// The relative order of the remaining events is kept.
pub fn validate_events(events: Vec<FileEvent>, lookup: &impl ParentLookup) -> Vec<FileEvent> {
    let mut deletions: Vec<(usize, usize, Arc<TreeEntry>)> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_valid())
        .filter_map(|(ix, e)| match &e.change {
            ChangeEvent::Delete { file } => Some((depth(lookup, file), ix, file.clone())),
            _ => None,
        })
        .collect();
    deletions.sort_by_key(|(depth, ix, _)| (*depth, *ix));

    let mut deleted: HashSet<FileId> = HashSet::new();
    let mut redundant: HashSet<usize> = HashSet::new();
    for (_, ix, file) in deletions {
        if any_ancestor(lookup, &file, |e| deleted.contains(&e.id())) {
            debug!(file.id = %file.id(), "dropping nested deletion");
            redundant.insert(ix);
        } else {
            deleted.insert(file.id());
        }
    }

    events
        .into_iter()
        .enumerate()
        .filter(|(ix, e)| e.is_valid() && !redundant.contains(ix))
        .map(|(_, e)| e)
        .collect()
}
