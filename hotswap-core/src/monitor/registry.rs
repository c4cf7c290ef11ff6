//! Listener table keyed by path prefix

use crate::loader::LoaderId;
use crate::monitor::WatchFileEvent;
use crate::{panic_message, read, write};
use dashmap::DashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, trace};

/// Receives normalized events for paths under the prefix it was registered at
pub trait WatchEventListener: Send + Sync {
    fn on_event(&self, event: &WatchFileEvent) -> anyhow::Result<()>;
}

impl<F> WatchEventListener for F
where
    F: Fn(&WatchFileEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &WatchFileEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle of a single listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

struct Registration {
    id: ListenerId,
    loader: Option<LoaderId>,
    prefix: PathBuf,
    listener: Box<dyn WatchEventListener>,
    // Held for reading while the listener runs; cleared under the write lock
    // on removal, which waits out in-flight callbacks.
    active: RwLock<bool>,
}

/// Listeners grouped by the path prefix they observe
#[derive(Default)]
pub struct ListenerRegistry {
    by_prefix: DashMap<PathBuf, Vec<Arc<Registration>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        loader: Option<LoaderId>,
        prefix: PathBuf,
        listener: Box<dyn WatchEventListener>,
    ) -> ListenerId {
        let id = ListenerId::next();
        debug!("Registering {} for {:?} on {:?}", id, loader, prefix);

        let registration = Arc::new(Registration {
            id,
            loader,
            prefix: prefix.clone(),
            listener,
            active: RwLock::new(true),
        });
        self.by_prefix.entry(prefix).or_default().push(registration);
        id
    }

    /// Remove every listener registered for `loader`.
    ///
    /// Returns once no removed listener is still running, so none of them is
    /// invoked after this call.
    pub fn remove_loader(&self, loader: LoaderId) -> usize {
        let mut removed = Vec::new();
        for mut entry in self.by_prefix.iter_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) =
                entry.value_mut().drain(..).partition(|r| r.loader == Some(loader));
            *entry.value_mut() = kept;
            removed.extend(gone);
        }
        self.by_prefix.retain(|_, registrations| !registrations.is_empty());

        for registration in &removed {
            *write(&registration.active) = false;
            trace!("Removed {} on {:?}", registration.id, registration.prefix);
        }

        debug!("Removed {} listeners of {}", removed.len(), loader);
        removed.len()
    }

    /// Deliver `event` to every listener whose prefix is an ancestor of (or
    /// equal to) the event path. Returns the number of listeners invoked.
    pub fn dispatch(&self, event: &WatchFileEvent) -> usize {
        let targets = self.matching(&event.path);
        let mut delivered = 0;

        for registration in targets {
            let active = read(&registration.active);
            if !*active {
                continue;
            }

            delivered += 1;
            let outcome =
                catch_unwind(AssertUnwindSafe(|| registration.listener.on_event(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener {} failed on {}: {:#}", registration.id, event, e),
                Err(panic) => error!(
                    "Listener {} panicked on {}: {}",
                    registration.id,
                    event,
                    panic_message(panic.as_ref())
                ),
            }
        }

        delivered
    }

    fn matching(&self, path: &Path) -> Vec<Arc<Registration>> {
        self.by_prefix
            .iter()
            .filter(|entry| path.starts_with(entry.key()))
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_prefix.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry").field("listeners", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::FileEvent;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> Box<dyn WatchEventListener> {
        let counter = counter.clone();
        Box::new(move |_: &WatchFileEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn event(path: &str) -> WatchFileEvent {
        WatchFileEvent::with_type(path, FileEvent::Modify, true, false).unwrap()
    }

    #[test]
    fn test_dispatch_routes_by_prefix() {
        let registry = ListenerRegistry::new();
        let classes = Arc::new(AtomicUsize::new(0));
        let resources = Arc::new(AtomicUsize::new(0));

        registry.register(None, PathBuf::from("/app/classes"), counting(&classes));
        registry.register(None, PathBuf::from("/app/resources"), counting(&resources));

        assert_eq!(registry.dispatch(&event("/app/classes/com/Foo.class")), 1);
        assert_eq!(registry.dispatch(&event("/app/classes2/Foo.class")), 0);

        assert_eq!(classes.load(Ordering::SeqCst), 1);
        assert_eq!(resources.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.register(
            None,
            PathBuf::from("/app"),
            Box::new(|_: &WatchFileEvent| -> anyhow::Result<()> { anyhow::bail!("boom") }),
        );
        registry.register(
            None,
            PathBuf::from("/app"),
            Box::new(|_: &WatchFileEvent| -> anyhow::Result<()> { panic!("listener panic") }),
        );
        registry.register(None, PathBuf::from("/app"), counting(&counter));

        assert_eq!(registry.dispatch(&event("/app/a.txt")), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_loader_only_touches_its_listeners() {
        let registry = ListenerRegistry::new();
        let first = LoaderId::next();
        let second = LoaderId::next();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.register(Some(first), PathBuf::from("/app"), counting(&counter));
        registry.register(Some(first), PathBuf::from("/lib"), counting(&counter));
        registry.register(Some(second), PathBuf::from("/app"), counting(&counter));

        assert_eq!(registry.remove_loader(first), 2);
        assert_eq!(registry.len(), 1);

        registry.dispatch(&event("/app/a.txt"));
        registry.dispatch(&event("/lib/b.txt"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert_eq!(registry.remove_loader(second), 1);
        assert!(registry.is_empty());
    }
}
