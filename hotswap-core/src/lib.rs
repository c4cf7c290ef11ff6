//! Core functionality for hotswap
//!
//! This crate contains the file-watch → debounce → scheduling → execution
//! pipeline that turns class and resource changes on disk into in-place class
//! redefinition, together with the registries that tie it to loaders and
//! plugin handlers.

pub mod agent;
pub mod classfile;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod loader;
pub mod monitor;
pub mod redefine;

pub use agent::HotswapAgent;
pub use classfile::{ClassFile, ClassFormatError};
pub use command::{
    Command, CommandKey, CommandScheduler, DuplicatePolicy, MergeableCommand, MergedCommands,
    SchedulerConfig,
};
pub use config::{AgentConfig, ConfigRegistry, RetryPolicy};
pub use error::{HotswapError, HotswapResult};
pub use handler::{ClassName, FromInvocation, HandlerId, Invocation, WatchFilter, WatchKind};
pub use loader::{Loader, LoaderId};
pub use monitor::{FileEvent, FileSystemWatcher, ListenerId, WatchFileEvent, WatcherConfig};
pub use redefine::{ClassReloader, RedefinitionBackend, RedefinitionError};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking listener or command must not wedge the pipeline, so poisoned
// locks are recovered rather than propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
