//! Filesystem monitoring and change detection system
//!
//! This module provides the watching half of the pipeline:
//! - Recursive directory watches with root subsumption
//! - Normalization of backend events into create/modify/delete
//! - Prefix-routed listener tables keyed by loader
//! - Bulk listener removal when a loader is closed

pub mod registry;
pub mod roots;
pub mod watcher;

pub use registry::{ListenerId, ListenerRegistry, WatchEventListener};
pub use roots::{RootChange, WatchRoots, WatchedPath};
pub use watcher::FileSystemWatcher;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Kinds of filesystem changes delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileEvent {
    Create,
    Modify,
    Delete,
}

impl FileEvent {
    pub const ALL: [FileEvent; 3] = [FileEvent::Create, FileEvent::Modify, FileEvent::Delete];
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileEvent::Create => "CREATE",
            FileEvent::Modify => "MODIFY",
            FileEvent::Delete => "DELETE",
        };
        f.pad(name)
    }
}

/// A normalized change of a single filesystem entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchFileEvent {
    pub path: PathBuf,
    pub uri: Url,
    pub kind: FileEvent,
    /// Best effort: a deleted entry can no longer be inspected
    pub is_file: bool,
    pub is_directory: bool,
}

impl WatchFileEvent {
    /// Build an event, inspecting the entry on disk for its type
    pub fn new(path: impl Into<PathBuf>, kind: FileEvent) -> Option<Self> {
        let path = path.into();
        let metadata = std::fs::symlink_metadata(&path).ok();
        let is_directory = metadata.as_ref().is_some_and(|m| m.is_dir());
        let is_file = match &metadata {
            Some(m) => m.is_file(),
            // Gone already: assume a file unless told otherwise
            None => kind == FileEvent::Delete,
        };
        Self::with_type(path, kind, is_file, is_directory)
    }

    /// Build an event with an explicit entry type
    pub fn with_type(
        path: impl Into<PathBuf>,
        kind: FileEvent,
        is_file: bool,
        is_directory: bool,
    ) -> Option<Self> {
        let path = path.into();
        let uri = Url::from_file_path(&path).ok()?;
        Some(Self { path, uri, kind, is_file, is_directory })
    }
}

impl fmt::Display for WatchFileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}

/// Configuration for the file watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// How long the polling thread waits for backend events before checking
    /// the stop flag again
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(50) }
    }
}

/// Entry type reported by the backend, when it knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    File,
    Directory,
    Unknown,
}

/// Convert a backend event into zero or more normalized events.
///
/// Renames become a delete of the old name and a create of the new one;
/// access notifications are dropped.
pub(crate) fn normalize_event(event: &Event) -> Vec<WatchFileEvent> {
    let (kind, entry) = match event.kind {
        EventKind::Create(kind) => (FileEvent::Create, create_entry(kind)),
        EventKind::Remove(kind) => (FileEvent::Delete, remove_entry(kind)),
        EventKind::Modify(ModifyKind::Name(mode)) => return normalize_rename(mode, &event.paths),
        EventKind::Modify(_) => (FileEvent::Modify, EntryType::Unknown),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event.paths.iter().filter_map(|path| build_event(path, kind, entry)).collect()
}

fn normalize_rename(mode: RenameMode, paths: &[PathBuf]) -> Vec<WatchFileEvent> {
    let unknown = EntryType::Unknown;
    match mode {
        RenameMode::From => {
            paths.iter().filter_map(|p| build_event(p, FileEvent::Delete, unknown)).collect()
        }
        RenameMode::To => {
            paths.iter().filter_map(|p| build_event(p, FileEvent::Create, unknown)).collect()
        }
        RenameMode::Both if paths.len() == 2 => [
            build_event(&paths[0], FileEvent::Delete, unknown),
            build_event(&paths[1], FileEvent::Create, unknown),
        ]
        .into_iter()
        .flatten()
        .collect(),
        // The backend could not pair the names; look at what is on disk now
        _ => paths
            .iter()
            .filter_map(|p| {
                let kind = if p.exists() { FileEvent::Create } else { FileEvent::Delete };
                build_event(p, kind, unknown)
            })
            .collect(),
    }
}

fn build_event(path: &Path, kind: FileEvent, entry: EntryType) -> Option<WatchFileEvent> {
    match entry {
        EntryType::File => WatchFileEvent::with_type(path, kind, true, false),
        EntryType::Directory => WatchFileEvent::with_type(path, kind, false, true),
        EntryType::Unknown => WatchFileEvent::new(path, kind),
    }
}

fn create_entry(kind: CreateKind) -> EntryType {
    match kind {
        CreateKind::File => EntryType::File,
        CreateKind::Folder => EntryType::Directory,
        _ => EntryType::Unknown,
    }
}

fn remove_entry(kind: RemoveKind) -> EntryType {
    match kind {
        RemoveKind::File => EntryType::File,
        RemoveKind::Folder => EntryType::Directory,
        _ => EntryType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_create_and_remove_use_backend_entry_type() {
        let created = normalize_event(&event(
            EventKind::Create(CreateKind::Folder),
            &["/nonexistent/hotswap/dir"],
        ));
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, FileEvent::Create);
        assert!(created[0].is_directory);
        assert!(!created[0].is_file);

        let removed = normalize_event(&event(
            EventKind::Remove(RemoveKind::File),
            &["/nonexistent/hotswap/Foo.class"],
        ));
        assert_eq!(removed[0].kind, FileEvent::Delete);
        assert!(removed[0].is_file);
    }

    #[test]
    fn test_deleted_entry_of_unknown_type_is_assumed_file() {
        let removed = normalize_event(&event(
            EventKind::Remove(RemoveKind::Any),
            &["/nonexistent/hotswap/Foo.class"],
        ));
        assert!(removed[0].is_file);
        assert!(!removed[0].is_directory);
    }

    #[test]
    fn test_rename_becomes_delete_and_create() {
        let renamed = normalize_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/nonexistent/a/Foo.class~", "/nonexistent/a/Foo.class"],
        ));
        assert_eq!(renamed.len(), 2);
        assert_eq!(renamed[0].kind, FileEvent::Delete);
        assert_eq!(renamed[1].kind, FileEvent::Create);
        assert_eq!(renamed[1].path, PathBuf::from("/nonexistent/a/Foo.class"));
    }

    #[test]
    fn test_access_and_data_events() {
        let access = normalize_event(&event(
            EventKind::Access(AccessKind::Any),
            &["/nonexistent/a/Foo.class"],
        ));
        assert!(access.is_empty());

        let modified = normalize_event(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/nonexistent/a/Foo.class"],
        ));
        assert_eq!(modified[0].kind, FileEvent::Modify);
        assert_eq!(modified[0].uri.scheme(), "file");
    }
}
