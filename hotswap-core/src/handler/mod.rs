//! Watch handlers
//!
//! Plugins declare what they want to be told about with a [`WatchFilter`]
//! and supply a closure to call. Each change that passes the filter becomes
//! a [`WatchEventCommand`] on the scheduler.

pub mod command;
pub mod extract;

pub use command::WatchEventCommand;
pub use extract::{
    ClassName, FromInvocation, IntoHandlerResult, IntoWatchHandler, Invocation, InvokeError,
    WatchHandler,
};

use crate::error::{HotswapError, HotswapResult};
use crate::loader::LoaderId;
use crate::monitor::{FileEvent, WatchFileEvent};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

/// What a handler watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchKind {
    /// Any file under a resource path
    Resource,
    /// Compiled classes; the handler may receive the parsed class
    ClassFile,
}

/// Declarative filter of a handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchFilter {
    pub kind: WatchKind,
    /// Resource path relative to the classpath roots; empty is the root
    pub path: String,
    /// Pattern the whole event URI must match
    pub filter: Option<String>,
    /// Pattern the whole binary class name must match (class files only)
    pub class_name: Option<String>,
    pub events: Vec<FileEvent>,
    pub only_regular_files: bool,
    /// Debounce window of the scheduled command
    pub timeout_ms: u64,
}

impl WatchFilter {
    /// Watch resources under `path`: every event kind, regular files only,
    /// 50 ms debounce
    pub fn resource(path: impl Into<String>) -> Self {
        Self {
            kind: WatchKind::Resource,
            path: path.into(),
            filter: None,
            class_name: None,
            events: FileEvent::ALL.to_vec(),
            only_regular_files: true,
            timeout_ms: 50,
        }
    }

    /// Watch every class file on the classpath with a 100 ms debounce
    pub fn class_files() -> Self {
        Self {
            kind: WatchKind::ClassFile,
            path: String::new(),
            filter: None,
            class_name: Some(".*".to_string()),
            events: FileEvent::ALL.to_vec(),
            only_regular_files: true,
            timeout_ms: 100,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    pub fn class_name(mut self, pattern: impl Into<String>) -> Self {
        self.class_name = Some(pattern.into());
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = FileEvent>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn include_directories(mut self) -> Self {
        self.only_regular_files = false;
        self
    }

    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// `""`, `"."` and `"/"` all denote the root; leading and trailing
    /// slashes are dropped
    pub fn normalized_path(&self) -> String {
        let trimmed = self.path.trim().trim_matches('/');
        if trimmed == "." { String::new() } else { trimmed.to_string() }
    }

    /// Compile the patterns
    pub fn compile(&self) -> HotswapResult<CompiledFilter> {
        let compile = |pattern: &Option<String>| -> HotswapResult<Option<Regex>> {
            match pattern.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => regex_utils::full_match(p).map(Some).map_err(|source| {
                    HotswapError::InvalidPattern { pattern: p.to_string(), source }
                }),
                None => Ok(None),
            }
        };

        let class_name = match self.kind {
            WatchKind::ClassFile => compile(&self.class_name)?,
            WatchKind::Resource => None,
        };

        Ok(CompiledFilter {
            kind: self.kind,
            path: self.normalized_path(),
            uri: compile(&self.filter)?,
            class_name,
            events: self.events.clone(),
            only_regular_files: self.only_regular_files,
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

/// A [`WatchFilter`] with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub kind: WatchKind,
    pub path: String,
    uri: Option<Regex>,
    class_name: Option<Regex>,
    pub events: Vec<FileEvent>,
    pub only_regular_files: bool,
    pub timeout: Duration,
}

impl CompiledFilter {
    /// Quick check done on the watcher thread before scheduling
    pub fn accepts_path(&self, event: &WatchFileEvent) -> bool {
        if self.only_regular_files && !event.is_file {
            return false;
        }
        match self.kind {
            WatchKind::ClassFile => {
                event.path.to_str().is_some_and(regex_utils::class_file::is_class_file)
            }
            WatchKind::Resource => true,
        }
    }

    /// Full event check: file type, event kind and URI pattern
    pub fn accepts_event(&self, event: &WatchFileEvent) -> bool {
        if self.only_regular_files && !event.is_file {
            return false;
        }
        if !self.events.contains(&event.kind) {
            return false;
        }
        self.accepts_uri(&event.uri)
    }

    pub fn accepts_uri(&self, uri: &Url) -> bool {
        self.uri.as_ref().is_none_or(|re| re.is_match(uri.as_str()))
    }

    pub fn accepts_class_name(&self, name: &str) -> bool {
        self.class_name.as_ref().is_none_or(|re| re.is_match(name))
    }
}

/// Identity of a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// A handler bound to a loader
pub struct HandlerRegistration {
    pub id: HandlerId,
    pub loader: LoaderId,
    pub plugin: String,
    pub name: String,
    pub filter: CompiledFilter,
    handler: Box<dyn WatchHandler>,
    active: AtomicBool,
}

impl HandlerRegistration {
    pub fn new(
        loader: LoaderId,
        plugin: impl Into<String>,
        name: impl Into<String>,
        filter: CompiledFilter,
        handler: Box<dyn WatchHandler>,
    ) -> Self {
        Self {
            id: HandlerId::next(),
            loader,
            plugin: plugin.into(),
            name: name.into(),
            filter,
            handler,
            active: AtomicBool::new(true),
        }
    }

    pub fn handler(&self) -> &dyn WatchHandler {
        self.handler.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Commands already scheduled for this handler become no-ops
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .field("loader", &self.loader)
            .field("plugin", &self.plugin)
            .field("name", &self.name)
            .field("kind", &self.filter.kind)
            .field("active", &self.is_active())
            .finish()
    }
}
