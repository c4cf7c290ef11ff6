//! Watch root bookkeeping
//!
//! Keeps the set of directories registered with the OS watch facility free
//! of nesting: a root that is an ancestor of another subsumes it. Each root
//! remembers which loaders asked for it so it can be released when the last
//! of them is closed.

use crate::loader::LoaderId;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// A directory tree registered with the OS watch facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedPath {
    pub path: PathBuf,
    /// Loaders that requested this tree; `None` is the system-wide owner and
    /// is never released by a loader teardown
    pub owners: HashSet<Option<LoaderId>>,
}

/// Outcome of requesting a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootChange {
    /// Exactly this path is already a root
    AlreadyWatched,
    /// An ancestor root covers the path; nothing to register
    Covered { by: PathBuf },
    /// The path is a new root; `subsumed` roots below it are now redundant
    Added { subsumed: Vec<PathBuf> },
}

/// Non-overlapping set of watch roots
#[derive(Debug, Default)]
pub struct WatchRoots {
    roots: BTreeMap<PathBuf, WatchedPath>,
}

impl WatchRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner`'s interest in the tree at `path`.
    ///
    /// Owners of subsumed roots move to the new root so that releasing a
    /// loader later still accounts for every tree it asked for.
    pub fn insert(&mut self, path: &Path, owner: Option<LoaderId>) -> RootChange {
        if let Some(existing) = self.roots.get_mut(path) {
            existing.owners.insert(owner);
            return RootChange::AlreadyWatched;
        }

        if let Some(cover) = self.covering_mut(path) {
            cover.owners.insert(owner);
            return RootChange::Covered { by: cover.path.clone() };
        }

        let subsumed: Vec<PathBuf> =
            self.roots.keys().filter(|root| root.starts_with(path)).cloned().collect();

        let mut owners = HashSet::from([owner]);
        for root in &subsumed {
            if let Some(old) = self.roots.remove(root) {
                owners.extend(old.owners);
            }
        }

        self.roots.insert(path.to_path_buf(), WatchedPath { path: path.to_path_buf(), owners });
        RootChange::Added { subsumed }
    }

    /// The root whose tree contains `path`, if any
    pub fn covering(&self, path: &Path) -> Option<&WatchedPath> {
        self.roots.values().find(|root| path.starts_with(&root.path))
    }

    fn covering_mut(&mut self, path: &Path) -> Option<&mut WatchedPath> {
        self.roots.values_mut().find(|root| path.starts_with(&root.path))
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.roots.contains_key(path)
    }

    /// Drop `loader` from every root and return the roots no one owns anymore
    pub fn release(&mut self, loader: LoaderId) -> Vec<PathBuf> {
        let mut released = Vec::new();
        self.roots.retain(|path, root| {
            root.owners.remove(&Some(loader));
            if root.owners.is_empty() {
                released.push(path.clone());
                false
            } else {
                true
            }
        });
        released
    }

    /// Forget a root whose directory disappeared
    pub fn remove(&mut self, path: &Path) -> Option<WatchedPath> {
        self.roots.remove(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.roots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
