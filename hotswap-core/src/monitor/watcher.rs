//! Core file system watcher implementation using notify crate

use crate::error::{HotswapError, HotswapResult};
use crate::loader::LoaderId;
use crate::monitor::{
    FileEvent, ListenerId, ListenerRegistry, RootChange, WatchEventListener, WatchFileEvent,
    WatchRoots, WatcherConfig, normalize_event,
};
use crate::lock;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;

type BackendEvent = notify::Result<Event>;

/// Recursive directory watcher shared by every loader.
///
/// Events from the OS are normalized on a dedicated polling thread and routed
/// to listeners by path prefix.
pub struct FileSystemWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: WatcherConfig,
    // Lock order: roots before backend
    roots: Mutex<WatchRoots>,
    backend: Mutex<RecommendedWatcher>,
    tx: Sender<BackendEvent>,
    rx: Mutex<Receiver<BackendEvent>>,
    listeners: ListenerRegistry,
    started: AtomicBool,
    polling: AtomicBool,
    paused: AtomicBool,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileSystemWatcher {
    /// Create a watcher; nothing is observed until roots are added
    pub fn new(config: WatcherConfig) -> HotswapResult<Self> {
        let (tx, rx) = mpsc::channel();
        let backend = create_backend(&tx)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                roots: Mutex::new(WatchRoots::new()),
                backend: Mutex::new(backend),
                tx,
                rx: Mutex::new(rx),
                listeners: ListenerRegistry::new(),
                started: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        })
    }

    /// Register the directory tree at `uri` on behalf of `loader`.
    ///
    /// Returns the canonical directory, or `None` (with a warning) when the
    /// URI is not a local directory or the OS refuses the watch.
    pub fn add_root(&self, loader: Option<LoaderId>, uri: &Url) -> Option<PathBuf> {
        let path = match local_path(uri) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        watch_dir(&self.inner, loader, &path)
    }

    /// Register `listener` for events at or below `uri`.
    ///
    /// A file URI watches the file's directory and routes only that file.
    pub fn add_listener(
        &self,
        loader: Option<LoaderId>,
        uri: &Url,
        listener: impl WatchEventListener + 'static,
    ) -> Option<ListenerId> {
        let path = match local_path(uri) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        let prefix = if path.is_file() {
            let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
                warn!("Unable to watch {:?}: no parent directory", path);
                return None;
            };
            watch_dir(&self.inner, loader, dir)?.join(name)
        } else {
            watch_dir(&self.inner, loader, &path)?
        };

        Some(self.inner.listeners.register(loader, prefix, Box::new(listener)))
    }

    /// Drop every listener of `loader` and release the roots only it owned.
    ///
    /// When no listener remains at all, the OS watch service is recreated and
    /// the remaining roots are registered again.
    pub fn remove_all_for_loader(&self, loader: LoaderId) -> usize {
        let removed = self.inner.listeners.remove_loader(loader);

        let mut roots = lock(&self.inner.roots);
        let mut backend = lock(&self.inner.backend);
        for path in roots.release(loader) {
            debug!("Unwatching {:?}, released by {}", path, loader);
            if let Err(e) = backend.unwatch(&path) {
                debug!("Unwatch of {:?} failed: {}", path, e);
            }
        }

        if self.inner.listeners.is_empty() {
            match create_backend(&self.inner.tx) {
                Ok(fresh) => {
                    *backend = fresh;
                    for path in roots.paths() {
                        if let Err(e) = backend.watch(&path, RecursiveMode::Recursive) {
                            warn!("Unable to watch {:?} again: {}", path, e);
                            roots.remove(&path);
                        }
                    }
                    info!("No listeners left, recreated watch service ({} roots)", roots.len());
                }
                Err(e) => error!("Unable to recreate watch service: {}", e),
            }
        }

        removed
    }

    /// Start the polling thread
    pub fn start(&self) -> HotswapResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop.store(false, Ordering::SeqCst);

        if let Err(e) = ensure_polling(&self.inner) {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("File watcher started");
        Ok(())
    }

    /// Ask the polling thread to finish and wait for it
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = lock(&self.inner.thread).take() {
            // A listener stopping the watcher runs on the polling thread itself
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("File watcher thread panicked");
            }
        }
        info!("File watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// While paused, observed events are drained and dropped
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::SeqCst);
        debug!("File watcher paused: {}", paused);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Deliver `event` to listeners as if it had been observed
    pub fn dispatch(&self, event: &WatchFileEvent) -> usize {
        self.inner.listeners.dispatch(event)
    }

    /// Current watch roots
    pub fn roots(&self) -> Vec<PathBuf> {
        lock(&self.inner.roots).paths()
    }
}

impl Drop for FileSystemWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for FileSystemWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemWatcher")
            .field("roots", &self.roots())
            .field("listeners", &self.inner.listeners)
            .field("running", &self.is_running())
            .finish()
    }
}

fn watch_dir(inner: &Arc<Inner>, loader: Option<LoaderId>, dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        warn!("{}", HotswapError::NotADirectory { path: dir.to_path_buf() });
        return None;
    }
    let path = match dir.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            warn!("{}", HotswapError::io(dir, e));
            return None;
        }
    };

    let mut roots = lock(&inner.roots);
    if roots.contains(&path) || roots.covering(&path).is_some() {
        let change = roots.insert(&path, loader);
        trace!("Root {:?} for {:?}: {:?}", path, loader, change);
        return Some(path);
    }

    // Nested roots share OS watches with a recursive parent; release them first
    let nested: Vec<PathBuf> = roots.paths().into_iter().filter(|root| root.starts_with(&path)).collect();
    let mut backend = lock(&inner.backend);
    for narrower in &nested {
        if let Err(e) = backend.unwatch(narrower) {
            debug!("Unwatch of {:?} failed: {}", narrower, e);
        }
    }

    if let Err(e) = backend.watch(&path, RecursiveMode::Recursive) {
        warn!("{}", HotswapError::Watch(e));
        for narrower in &nested {
            if let Err(e) = backend.watch(narrower, RecursiveMode::Recursive) {
                warn!("Unable to watch {:?} again: {}", narrower, e);
                roots.remove(narrower);
            }
        }
        return None;
    }
    info!("Watching path: {:?}", path);

    if let RootChange::Added { subsumed } = roots.insert(&path, loader) {
        for narrower in subsumed {
            debug!("Root {:?} subsumed by {:?}", narrower, path);
        }
    }
    drop(backend);

    if inner.started.load(Ordering::SeqCst) && !inner.polling.load(Ordering::SeqCst) {
        debug!("Respawning file watcher thread for {:?}", path);
        if let Err(e) = spawn_polling(inner) {
            error!("{}", e);
        }
    }

    Some(path)
}

/// Spawn the polling thread unless one is running. A concurrent add_root may
/// already have spawned it after `started` was set.
fn ensure_polling(inner: &Arc<Inner>) -> HotswapResult<()> {
    let _roots = lock(&inner.roots);
    if inner.polling.load(Ordering::SeqCst) {
        return Ok(());
    }
    spawn_polling(inner)
}

/// Spawn the polling thread. Callers hold the roots lock so a concurrent
/// exit decision cannot interleave with the respawn.
fn spawn_polling(inner: &Arc<Inner>) -> HotswapResult<()> {
    inner.polling.store(true, Ordering::SeqCst);
    let worker = inner.clone();
    let spawned = std::thread::Builder::new()
        .name("hotswap-watcher".into())
        .spawn(move || poll_events(worker));

    match spawned {
        Ok(handle) => {
            *lock(&inner.thread) = Some(handle);
            Ok(())
        }
        Err(source) => {
            inner.polling.store(false, Ordering::SeqCst);
            Err(HotswapError::Spawn { name: "watcher", source })
        }
    }
}

fn poll_events(inner: Arc<Inner>) {
    debug!("File watcher thread running");
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            inner.polling.store(false, Ordering::SeqCst);
            break;
        }

        let received = lock(&inner.rx).recv_timeout(inner.config.poll_interval);
        match received {
            Ok(Ok(event)) => {
                // On false the flag was already cleared under the roots lock
                if !handle_event(&inner, &event) {
                    break;
                }
            }
            Ok(Err(e)) => warn!("Watch error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                inner.polling.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
    debug!("File watcher thread exiting");
}

/// Process one backend event; returns false when nothing is left to watch
fn handle_event(inner: &Inner, event: &Event) -> bool {
    if inner.paused.load(Ordering::SeqCst) {
        debug!("File watcher paused, dropping {:?} on {:?}", event.kind, event.paths);
        return true;
    }

    for change in normalize_event(event) {
        trace!("File event: {}", change);

        if change.kind == FileEvent::Create && change.is_directory {
            if let Some(root) = lock(&inner.roots).covering(&change.path) {
                trace!("New directory {:?} covered by {:?}", change.path, root.path);
            }
        }

        if change.kind == FileEvent::Delete {
            let mut roots = lock(&inner.roots);
            if roots.remove(&change.path).is_some() {
                warn!("Watch root {:?} was deleted, no longer watching it", change.path);
                if let Err(e) = lock(&inner.backend).unwatch(&change.path) {
                    trace!("Unwatch of deleted root failed: {}", e);
                }
                if roots.is_empty() {
                    // Decided under the roots lock; add_root respawns
                    inner.polling.store(false, Ordering::SeqCst);
                    drop(roots);
                    inner.listeners.dispatch(&change);
                    return false;
                }
            }
        }

        inner.listeners.dispatch(&change);
    }
    true
}

fn create_backend(tx: &Sender<BackendEvent>) -> HotswapResult<RecommendedWatcher> {
    let tx = tx.clone();
    let watcher = notify::recommended_watcher(move |res: BackendEvent| {
        if tx.send(res).is_err() {
            trace!("File watcher channel closed");
        }
    })?;
    Ok(watcher)
}

fn local_path(uri: &Url) -> HotswapResult<PathBuf> {
    if uri.scheme() != "file" {
        return Err(HotswapError::NonLocalUri { uri: uri.to_string() });
    }
    uri.to_file_path().map_err(|_| HotswapError::NonLocalUri { uri: uri.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use notify::event::RemoveKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn dir_url(path: &Path) -> Url {
        Url::from_directory_path(path).unwrap()
    }

    fn forwarding(tx: mpsc::Sender<WatchFileEvent>) -> impl WatchEventListener + 'static {
        let tx = Mutex::new(tx);
        move |event: &WatchFileEvent| -> anyhow::Result<()> {
            lock(&tx).send(event.clone())?;
            Ok(())
        }
    }

    /// Wait up to five seconds for an event on `expected`
    fn wait_for(rx: &Receiver<WatchFileEvent>, expected: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                if event.path == expected {
                    return true;
                }
            }
        }
        false
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl WatchEventListener + 'static {
        let counter = counter.clone();
        move |_: &WatchFileEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_non_local_and_missing_roots_are_rejected() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();

        let jar = Url::parse("jar:file:/opt/app/lib.jar!/META-INF").unwrap();
        assert!(watcher.add_root(None, &jar).is_none());

        let missing = dir_url(&temp_dir.path().join("missing"));
        assert!(watcher.add_root(None, &missing).is_none());

        assert!(watcher.roots().is_empty());
    }

    #[test]
    fn test_broader_root_replaces_narrower() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("com").join("example");
        std::fs::create_dir_all(&nested).unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        let (tx, rx) = mpsc::channel();

        let first = watcher.add_listener(Some(LoaderId::next()), &dir_url(&nested), forwarding(tx));
        assert!(first.is_some());
        assert_eq!(watcher.roots(), vec![nested.canonicalize().unwrap()]);

        watcher.add_root(None, &dir_url(temp_dir.path())).unwrap();
        assert_eq!(watcher.roots(), vec![root.clone()]);

        // Already covered: no new root
        watcher.add_root(None, &dir_url(&nested)).unwrap();
        assert_eq!(watcher.roots(), vec![root.clone()]);

        // Files below the subsumed root are still observed
        watcher.start().unwrap();
        std::fs::write(nested.join("Foo.class"), b"\xCA\xFE\xBA\xBE").unwrap();
        let expected = root.join("com").join("example").join("Foo.class");
        let seen = wait_for(&rx, &expected);

        watcher.stop();
        assert!(seen, "no event observed for {:?}", expected);
    }

    #[test]
    fn test_loader_teardown_removes_listeners_and_roots() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let loader = LoaderId::next();
        let counter = Arc::new(AtomicUsize::new(0));

        watcher.add_listener(Some(loader), &dir_url(temp_dir.path()), counting(&counter)).unwrap();
        let file = temp_dir.path().canonicalize().unwrap().join("app.properties");
        let event = WatchFileEvent::with_type(&file, FileEvent::Modify, true, false).unwrap();

        assert_eq!(watcher.dispatch(&event), 1);
        assert_eq!(watcher.remove_all_for_loader(loader), 1);
        assert_eq!(watcher.dispatch(&event), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(watcher.roots().is_empty());
    }

    #[test]
    fn test_file_listener_only_sees_that_file() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("app.properties");
        std::fs::write(&file, "a=1").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let url = Url::from_file_path(&file).unwrap();
        watcher.add_listener(None, &url, counting(&counter)).unwrap();

        let dir = temp_dir.path().canonicalize().unwrap();
        assert_eq!(watcher.roots(), vec![dir.clone()]);

        let other = WatchFileEvent::with_type(dir.join("other.txt"), FileEvent::Modify, true, false);
        let own = WatchFileEvent::with_type(dir.join("app.properties"), FileEvent::Modify, true, false);
        assert_eq!(watcher.dispatch(&other.unwrap()), 0);
        assert_eq!(watcher.dispatch(&own.unwrap()), 1);
    }

    #[test]
    fn test_deleted_root_is_dropped_and_paused_events_ignored() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let root = watcher.add_listener(None, &dir_url(temp_dir.path()), counting(&counter));
        assert!(root.is_some());
        let root = temp_dir.path().canonicalize().unwrap();

        let removal = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root.clone());

        watcher.set_paused(true);
        assert!(handle_event(&watcher.inner, &removal));
        assert_eq!(watcher.roots(), vec![root.clone()]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        watcher.set_paused(false);
        assert!(!handle_event(&watcher.inner, &removal));
        assert!(watcher.roots().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observes_real_file_changes() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();

        watcher.add_listener(None, &dir_url(temp_dir.path()), forwarding(tx)).unwrap();
        watcher.start().unwrap();
        assert!(watcher.is_running());

        let file = temp_dir.path().join("Hello.class");
        std::fs::write(&file, b"\xCA\xFE\xBA\xBE").unwrap();

        let expected = temp_dir.path().canonicalize().unwrap().join("Hello.class");
        let seen = wait_for(&rx, &expected);

        watcher.stop();
        assert!(seen, "no event observed for {:?}", expected);
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_start_after_concurrent_spawn_keeps_one_thread() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let thread_id = |watcher: &FileSystemWatcher| {
            lock(&watcher.inner.thread).as_ref().map(|handle| handle.thread().id())
        };

        // start() has set the flag; a root added now spawns the thread
        watcher.inner.started.store(true, Ordering::SeqCst);
        watcher.add_root(None, &dir_url(temp_dir.path())).unwrap();
        let spawned = thread_id(&watcher);
        assert!(spawned.is_some());

        // The rest of start() must not spawn a second one
        ensure_polling(&watcher.inner).unwrap();
        assert_eq!(thread_id(&watcher), spawned);

        watcher.stop();
        assert!(!watcher.inner.polling.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_respawns_after_last_root_deleted() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let gone = TempDir::new().unwrap();
        let next = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        watcher.add_listener(None, &dir_url(gone.path()), counting(&counter)).unwrap();
        watcher.start().unwrap();

        let root = gone.path().canonicalize().unwrap();
        let removal = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root);
        watcher.inner.tx.send(Ok(removal)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.inner.polling.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!watcher.inner.polling.load(Ordering::SeqCst), "thread kept polling");
        assert!(watcher.roots().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(watcher.is_running());

        // The next root brings the thread back
        let (tx, rx) = mpsc::channel();
        watcher.add_listener(None, &dir_url(next.path()), forwarding(tx)).unwrap();
        assert!(watcher.inner.polling.load(Ordering::SeqCst));

        std::fs::write(next.path().join("Next.class"), b"\xCA\xFE\xBA\xBE").unwrap();
        let expected = next.path().canonicalize().unwrap().join("Next.class");
        let seen = wait_for(&rx, &expected);

        watcher.stop();
        assert!(seen, "no event observed for {:?}", expected);
    }

    #[test]
    fn test_recreated_watch_service_keeps_remaining_roots() {
        let watcher = FileSystemWatcher::new(WatcherConfig::default()).unwrap();
        let closed = TempDir::new().unwrap();
        let shared = TempDir::new().unwrap();
        let loader = LoaderId::next();
        let counter = Arc::new(AtomicUsize::new(0));

        watcher.add_root(None, &dir_url(shared.path())).unwrap();
        watcher.add_listener(Some(loader), &dir_url(closed.path()), counting(&counter)).unwrap();
        assert_eq!(watcher.roots().len(), 2);

        // Last listener gone: the service is rebuilt with the system-owned root
        assert_eq!(watcher.remove_all_for_loader(loader), 1);
        let shared_root = shared.path().canonicalize().unwrap();
        assert_eq!(watcher.roots(), vec![shared_root.clone()]);

        let (tx, rx) = mpsc::channel();
        watcher.add_listener(Some(LoaderId::next()), &dir_url(shared.path()), forwarding(tx)).unwrap();
        watcher.start().unwrap();

        std::fs::write(shared.path().join("app.properties"), "a=1").unwrap();
        let expected = shared_root.join("app.properties");
        let seen = wait_for(&rx, &expected);

        watcher.stop();
        assert!(seen, "no event observed for {:?}", expected);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
