//! Deferred commands and their scheduler
//!
//! A command is a unit of work whose identity is a [`CommandKey`]. Equal
//! commands scheduled close together are merged into one pending entry and
//! never run concurrently unless their duplicate policy allows it.

pub mod scheduler;


pub use scheduler::{CommandScheduler, SchedulerConfig, SchedulerStats};

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Upcast to `Any` for downcasting trait objects
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type-erased key component that can be compared and hashed
trait KeyPart: AsAny + Send + Sync + Debug {
    fn eq_dyn(&self, other: &dyn KeyPart) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
}

impl<T> KeyPart for T
where
    T: Eq + Hash + Send + Sync + Debug + 'static,
{
    fn eq_dyn(&self, other: &dyn KeyPart) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|other| other == self)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Identity of a command.
///
/// Wraps any `Eq + Hash` value; keys built from different value types never
/// compare equal.
#[derive(Clone)]
pub struct CommandKey(Arc<dyn KeyPart>);

impl CommandKey {
    pub fn new<K>(key: K) -> Self
    where
        K: Eq + Hash + Send + Sync + Debug + 'static,
    {
        Self(Arc::new(key))
    }

    /// The wrapped value, if it has type `K`
    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        (*self.0).as_any().downcast_ref::<K>()
    }
}

impl PartialEq for CommandKey {
    fn eq(&self, other: &Self) -> bool {
        (*self.0).eq_dyn(&*other.0)
    }
}

impl Eq for CommandKey {}

impl Hash for CommandKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self.0).hash_dyn(state);
    }
}

impl Debug for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

/// Deferred unit of work
pub trait Command: AsAny + Send + Debug + 'static {
    /// Identity used for merging and duplicate detection. Must not include
    /// incidental data such as timestamps.
    fn key(&self) -> CommandKey;

    fn execute(&self) -> anyhow::Result<()>;

    /// Combine this pending command with an equal `newer` one. By default the
    /// newer command replaces this one.
    fn merge(self: Box<Self>, newer: Box<dyn Command>) -> Box<dyn Command> {
        newer
    }

    /// Commands absorbed by earlier merges
    fn merged(&self) -> &[Box<dyn Command>] {
        &[]
    }
}

impl dyn Command {
    pub fn downcast_ref<T: Command>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A command that keeps equal commands merged into it instead of being
/// replaced by them.
///
/// Implementors forward [`Command::merge`] to [`MergeableCommand::absorb`]
/// and [`Command::merged`] to their [`MergedCommands`].
pub trait MergeableCommand: Command + Sized {
    fn merged_commands(&self) -> &MergedCommands;

    fn merged_commands_mut(&mut self) -> &mut MergedCommands;

    fn absorb(mut self: Box<Self>, newer: Box<dyn Command>) -> Box<dyn Command> {
        self.merged_commands_mut().push(newer);
        self
    }
}

/// Commands absorbed into a [`MergeableCommand`], oldest first
#[derive(Debug, Default)]
pub struct MergedCommands(Vec<Box<dyn Command>>);

impl MergedCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        self.0.push(command);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Box<dyn Command>] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Command> {
        self.0.iter().map(|command| command.as_ref())
    }

    /// Absorbed commands of concrete type `T`
    pub fn of_type<T: Command>(&self) -> impl Iterator<Item = &T> {
        self.iter().filter_map(|command| command.downcast_ref::<T>())
    }
}

/// What to do with a due command while an equal one is still running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Keep it pending and launch it once the running one finishes
    #[default]
    WaitAndRunAfter,
    /// Drop it
    Skip,
    /// Launch it anyway
    RunDuplicate,
}
