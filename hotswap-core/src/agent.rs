//! Agent wiring
//!
//! [`HotswapAgent`] owns the shared watcher and scheduler and keeps the
//! per-loader tables: configuration, handler registrations and, with a
//! redefinition backend installed, the class reloader.

use crate::classfile::ClassFile;
use crate::command::{CommandScheduler, DuplicatePolicy};
use crate::config::{AgentConfig, ConfigRegistry};
use crate::error::{HotswapError, HotswapResult};
use crate::handler::{
    HandlerId, HandlerRegistration, IntoWatchHandler, WatchEventCommand, WatchFilter, WatchKind,
};
use crate::loader::{Loader, LoaderId, directory_url};
use crate::lock;
use crate::monitor::{FileEvent, FileSystemWatcher, WatchFileEvent};
use crate::redefine::{ClassReloader, RedefinitionBackend};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Plugin name used for the built-in class reload handler
pub const HOTSWAPPER_PLUGIN: &str = "Hotswapper";

/// Delay between a class change and the batch reload
const RELOAD_DELAY: Duration = Duration::from_millis(100);

pub struct HotswapAgent {
    configs: ConfigRegistry,
    watcher: FileSystemWatcher,
    scheduler: CommandScheduler,
    loaders: DashMap<LoaderId, Loader>,
    handlers: DashMap<LoaderId, Vec<Arc<HandlerRegistration>>>,
    backend: Option<Arc<dyn RedefinitionBackend>>,
    reloaders: DashMap<LoaderId, ClassReloader>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl HotswapAgent {
    pub fn new(config: AgentConfig) -> HotswapResult<Self> {
        let watcher = FileSystemWatcher::new(config.watcher_config())?;
        let scheduler = CommandScheduler::new(config.scheduler_config());

        Ok(Self {
            configs: ConfigRegistry::new(config),
            watcher,
            scheduler,
            loaders: DashMap::new(),
            handlers: DashMap::new(),
            backend: None,
            reloaders: DashMap::new(),
            scheduler_task: Mutex::new(None),
        })
    }

    /// Install the transport used to redefine changed classes
    pub fn with_backend(mut self, backend: Arc<dyn RedefinitionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Start the watcher thread and the scheduler tick.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> HotswapResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(HotswapError::NoRuntime);
        }

        self.watcher.start()?;

        let mut task = lock(&self.scheduler_task);
        if task.is_none() {
            *task = self.scheduler.start();
        }
        info!("Hotswap agent started");
        Ok(())
    }

    /// Stop the scheduler (discarding pending commands) and the watcher
    pub fn stop(&self) {
        self.scheduler.stop();
        self.watcher.stop();
        if let Some(task) = lock(&self.scheduler_task).take() {
            task.abort();
        }
    }

    /// Register a loader: resolve its configuration, extend its classpath and
    /// enable automatic class reload when configured
    pub fn register_loader(&self, mut loader: Loader) -> LoaderId {
        let id = loader.id();
        let config = self.configs.register(&loader);
        loader.extend_classpath(config.extra_classpath_urls());

        info!("Registered {} '{}' with {} classpath entries", id, loader.name(), loader.classpath().len());
        self.loaders.insert(id, loader);

        if config.auto_hotswap {
            match &self.backend {
                Some(backend) => self.enable_auto_hotswap(id, backend.clone()),
                None => warn!("auto_hotswap is set for {} but no redefinition backend is installed", id),
            }
        }

        id
    }

    /// Register `handler` of `plugin` for changes matching `filter` on
    /// `loader`'s classpath.
    ///
    /// Returns `Ok(None)` when the plugin is disabled for this loader.
    pub fn register_handler<Args>(
        &self,
        loader: LoaderId,
        plugin: &str,
        name: &str,
        filter: WatchFilter,
        handler: impl IntoWatchHandler<Args>,
    ) -> HotswapResult<Option<HandlerId>> {
        let Some(entry) = self.loaders.get(&loader) else {
            return Err(HotswapError::UnknownLoader(loader));
        };
        let classpath_dirs = entry.classpath_dirs();
        let archived: Vec<_> = entry
            .resources(&filter.normalized_path())
            .into_iter()
            .filter(|resource| regex_utils::uri::is_archive(resource.as_str()))
            .collect();
        drop(entry);

        let config = self.configs.get(Some(loader));
        if config.is_plugin_disabled(plugin) {
            debug!("Plugin {} is disabled for {}, skipping handler {}", plugin, loader, name);
            return Ok(None);
        }

        let compiled = filter.compile().inspect_err(|e| {
            error!("Unable to register handler {} of {}: {}", name, plugin, e);
        })?;
        let path = compiled.path.clone();
        let kind = compiled.kind;
        let registration = Arc::new(HandlerRegistration::new(
            loader,
            plugin,
            name,
            compiled,
            handler.into_handler(),
        ));

        // (classpath root, watched target)
        let mut targets: Vec<(PathBuf, PathBuf)> = Vec::new();
        for dir in classpath_dirs {
            let target = join(&dir, &path);
            targets.push((dir, target));
        }
        if kind == WatchKind::Resource {
            for dir in &config.watch_resources {
                targets.push((dir.clone(), join(dir, &path)));
            }
        }

        for resource in &archived {
            warn!(
                "{} (handler {} of {})",
                HotswapError::NonLocalUri { uri: resource.to_string() },
                name,
                plugin
            );
        }

        let retry = config.retry_policy();
        let mut watched = 0;
        for (base, target) in targets {
            if !target.exists() {
                trace!("Nothing at {:?} for handler {}", target, name);
                continue;
            }
            let Some(uri) = directory_url(&target) else { continue };
            let base = base.canonicalize().unwrap_or(base);

            let registration = registration.clone();
            let scheduler = self.scheduler.clone();
            let listener = move |event: &WatchFileEvent| -> anyhow::Result<()> {
                if registration.filter.accepts_path(event) {
                    let command = WatchEventCommand::new(
                        registration.clone(),
                        event.clone(),
                        Some(base.clone()),
                        retry,
                    );
                    scheduler.schedule_with(
                        command,
                        registration.filter.timeout,
                        DuplicatePolicy::WaitAndRunAfter,
                    );
                }
                Ok(())
            };

            if self.watcher.add_listener(Some(loader), &uri, listener).is_some() {
                watched += 1;
            }
        }

        if watched == 0 {
            debug!("No local resource at '{}' for handler {} of {}", path, name, plugin);
        }

        let id = registration.id;
        info!("Registered {} ({}::{}) on {} locations of {}", id, plugin, name, watched, loader);
        self.handlers.entry(loader).or_default().push(registration);
        Ok(Some(id))
    }

    /// Tear down everything registered for `loader`. Commands already
    /// scheduled for its handlers become no-ops.
    pub fn close_loader(&self, loader: LoaderId) -> HotswapResult<()> {
        if self.loaders.remove(&loader).is_none() {
            return Err(HotswapError::UnknownLoader(loader));
        }

        let handlers = self.handlers.remove(&loader).map(|(_, list)| list).unwrap_or_default();
        for registration in &handlers {
            registration.deactivate();
        }

        let listeners = self.watcher.remove_all_for_loader(loader);
        self.reloaders.remove(&loader);
        self.configs.remove(loader);

        info!("Closed {}: {} handlers, {} listeners", loader, handlers.len(), listeners);
        Ok(())
    }

    pub fn watcher(&self) -> &FileSystemWatcher {
        &self.watcher
    }

    pub fn scheduler(&self) -> &CommandScheduler {
        &self.scheduler
    }

    pub fn loader(&self, id: LoaderId) -> Option<Loader> {
        self.loaders.get(&id).map(|entry| entry.clone())
    }

    /// Effective configuration of `loader`, or the global one
    pub fn config(&self, loader: Option<LoaderId>) -> Arc<AgentConfig> {
        self.configs.get(loader)
    }

    pub fn handlers(&self, loader: LoaderId) -> Vec<HandlerId> {
        self.handlers
            .get(&loader)
            .map(|list| list.iter().map(|registration| registration.id).collect())
            .unwrap_or_default()
    }

    pub fn reloader(&self, loader: LoaderId) -> Option<ClassReloader> {
        self.reloaders.get(&loader).map(|entry| entry.clone())
    }

    fn enable_auto_hotswap(&self, loader: LoaderId, backend: Arc<dyn RedefinitionBackend>) {
        let reloader = ClassReloader::new(backend);
        self.reloaders.insert(loader, reloader.clone());

        let scheduler = self.scheduler.clone();
        let handler = move |class: ClassFile| {
            reloader.enqueue(class.name.clone(), class.bytes().to_vec());
            scheduler.schedule_in(reloader.command(), RELOAD_DELAY);
        };

        let filter = WatchFilter::class_files().events([FileEvent::Modify]);
        match self.register_handler(loader, HOTSWAPPER_PLUGIN, "reload_class", filter, handler) {
            Ok(Some(_)) => debug!("Automatic class reload enabled for {}", loader),
            Ok(None) => {}
            Err(e) => error!("Unable to enable automatic class reload for {}: {}", loader, e),
        }
    }
}

impl Drop for HotswapAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join(dir: &std::path::Path, relative: &str) -> PathBuf {
    if relative.is_empty() { dir.to_path_buf() } else { dir.join(relative) }
}
