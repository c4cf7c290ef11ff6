//! Class redefinition
//!
//! Changed classes are collected by a [`ClassReloader`] and pushed to the
//! running VM in one batch by a [`ReloadCommand`]. The transport itself is
//! behind [`RedefinitionBackend`].

use crate::command::{Command, CommandKey, MergeableCommand, MergedCommands};
use crate::lock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// Errors reported by a redefinition backend
#[derive(Debug, Error)]
pub enum RedefinitionError {
    #[error("Class {class} is not loaded")]
    NotLoaded { class: String },

    #[error("Redefinition of {class} rejected: {reason}")]
    Rejected { class: String, reason: String },

    #[error("Redefinition transport unavailable: {0}")]
    Unavailable(String),
}

/// Transport that replaces loaded class bytecode in the target VM
pub trait RedefinitionBackend: Send + Sync {
    fn reload(&self, class_name: &str, bytes: &[u8]) -> Result<(), RedefinitionError>;

    /// Redefine a batch of classes. The default reloads them one by one and
    /// stops at the first failure.
    fn reload_all(&self, classes: &BTreeMap<String, Vec<u8>>) -> Result<(), RedefinitionError> {
        for (class_name, bytes) in classes {
            self.reload(class_name, bytes)?;
        }
        Ok(())
    }
}

struct ReloaderInner {
    id: u64,
    backend: Arc<dyn RedefinitionBackend>,
    pending: Mutex<BTreeMap<String, Vec<u8>>>,
}

/// Collects changed classes until the next reload
#[derive(Clone)]
pub struct ClassReloader {
    inner: Arc<ReloaderInner>,
}

impl ClassReloader {
    pub fn new(backend: Arc<dyn RedefinitionBackend>) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(ReloaderInner {
                id: NEXT.fetch_add(1, Ordering::Relaxed),
                backend,
                pending: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Queue a class; newer bytes for the same class replace older ones
    pub fn enqueue(&self, class_name: impl Into<String>, bytes: Vec<u8>) {
        let class_name = class_name.into();
        debug!("Queued {} for redefinition", class_name);
        lock(&self.inner.pending).insert(class_name, bytes);
    }

    /// Names of the queued classes
    pub fn pending(&self) -> Vec<String> {
        lock(&self.inner.pending).keys().cloned().collect()
    }

    /// Command that reloads whatever is queued when it runs
    pub fn command(&self) -> ReloadCommand {
        ReloadCommand { reloader: self.clone(), merged: MergedCommands::new() }
    }

    /// Drain the queue and redefine its classes. A failed batch is not
    /// requeued.
    pub fn reload_pending(&self) -> Result<usize, RedefinitionError> {
        let batch = std::mem::take(&mut *lock(&self.inner.pending));
        if batch.is_empty() {
            return Ok(0);
        }

        info!("Reloading classes {:?}", batch.keys().collect::<Vec<_>>());
        self.inner.backend.reload_all(&batch)?;
        debug!("Reload of {} classes complete", batch.len());
        Ok(batch.len())
    }
}

impl fmt::Debug for ClassReloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassReloader")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReloadKey(u64);

/// Reloads the queued classes of one [`ClassReloader`]; equal while pending,
/// so a burst of class changes ends in a single batch
#[derive(Debug)]
pub struct ReloadCommand {
    reloader: ClassReloader,
    merged: MergedCommands,
}

impl Command for ReloadCommand {
    fn key(&self) -> CommandKey {
        CommandKey::new(ReloadKey(self.reloader.inner.id))
    }

    fn execute(&self) -> anyhow::Result<()> {
        self.reloader.reload_pending()?;
        Ok(())
    }

    fn merge(self: Box<Self>, newer: Box<dyn Command>) -> Box<dyn Command> {
        self.absorb(newer)
    }

    fn merged(&self) -> &[Box<dyn Command>] {
        self.merged.as_slice()
    }
}

impl MergeableCommand for ReloadCommand {
    fn merged_commands(&self) -> &MergedCommands {
        &self.merged
    }

    fn merged_commands_mut(&mut self) -> &mut MergedCommands {
        &mut self.merged
    }
}
