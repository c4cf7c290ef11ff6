//! Agent configuration
//!
//! Settings are read from `hotswap-agent.toml`. Each loader may carry its own
//! file on its classpath; loaders without one inherit their parent's, and
//! the agent-wide configuration is the last fallback.

use crate::command::SchedulerConfig;
use crate::error::{HotswapError, HotswapResult};
use crate::loader::{Loader, LoaderId, directory_url};
use crate::monitor::WatcherConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// File name looked up in classpath directories
pub const CONFIG_FILE_NAME: &str = "hotswap-agent.toml";

/// Main configuration for the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Reload changed classes through the redefinition backend
    pub auto_hotswap: bool,

    /// Directories searched for resources before the classpath; resource
    /// handlers are registered on them too
    pub watch_resources: Vec<PathBuf>,

    /// Directories appended to the loader's classpath
    pub extra_classpath: Vec<PathBuf>,

    /// Plugins whose handlers are not registered (case-insensitive)
    pub disabled_plugins: Vec<String>,

    pub scheduler: SchedulerSection,

    pub watcher: WatcherSection,

    pub class_read: ClassReadSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_ms: u64,
    pub default_timeout_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { tick_interval_ms: 100, default_timeout_ms: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub poll_interval_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self { poll_interval_ms: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassReadSection {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for ClassReadSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self { attempts: retry.attempts, delay_ms: retry.delay.as_millis() as u64 }
    }
}

/// Bounded retry for reads that race with a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, delay: Duration::from_millis(20) }
    }
}

impl AgentConfig {
    /// Load configuration from file. Relative paths in the file are resolved
    /// against the file's directory.
    pub fn from_file(path: &Path) -> HotswapResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HotswapError::io(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse_from(&content, base, path)
    }

    /// Parse TOML content, resolving relative paths against `base`
    pub fn parse(content: &str, base: &Path) -> HotswapResult<Self> {
        Self::parse_from(content, base, base)
    }

    fn parse_from(content: &str, base: &Path, origin: &Path) -> HotswapResult<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|source| HotswapError::Config { path: origin.to_path_buf(), source })?;
        for path in config.watch_resources.iter_mut().chain(config.extra_classpath.iter_mut()) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        Ok(config)
    }

    pub fn is_plugin_disabled(&self, plugin: &str) -> bool {
        self.disabled_plugins.iter().any(|p| p.eq_ignore_ascii_case(plugin))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.scheduler.tick_interval_ms.max(1)),
            default_timeout: Duration::from_millis(self.scheduler.default_timeout_ms),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig { poll_interval: Duration::from_millis(self.watcher.poll_interval_ms.max(1)) }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.class_read.attempts.max(1),
            delay: Duration::from_millis(self.class_read.delay_ms),
        }
    }

    pub fn extra_classpath_urls(&self) -> Vec<Url> {
        self.extra_classpath.iter().filter_map(|dir| directory_url(dir)).collect()
    }
}

#[derive(Debug)]
struct LoaderConfig {
    own: Option<Arc<AgentConfig>>,
    parent: Option<LoaderId>,
}

/// Per-loader configuration lookup
#[derive(Debug)]
pub struct ConfigRegistry {
    global: Arc<AgentConfig>,
    loaders: DashMap<LoaderId, LoaderConfig>,
}

impl ConfigRegistry {
    pub fn new(global: AgentConfig) -> Self {
        Self { global: Arc::new(global), loaders: DashMap::new() }
    }

    /// Discover `loader`'s own configuration file and return the effective
    /// configuration for it
    pub fn register(&self, loader: &Loader) -> Arc<AgentConfig> {
        let own = discover(loader).map(Arc::new);
        self.loaders.insert(loader.id(), LoaderConfig { own, parent: loader.parent() });
        self.get(Some(loader.id()))
    }

    /// Effective configuration: the loader's own, else the nearest
    /// ancestor's, else the global one
    pub fn get(&self, loader: Option<LoaderId>) -> Arc<AgentConfig> {
        let mut current = loader;
        // Bounded walk; parents are registered before children
        for _ in 0..=self.loaders.len() {
            let Some(id) = current else { break };
            let Some(entry) = self.loaders.get(&id) else { break };
            if let Some(own) = &entry.own {
                return own.clone();
            }
            current = entry.parent;
        }
        self.global.clone()
    }

    pub fn has_own_config(&self, loader: LoaderId) -> bool {
        self.loaders.get(&loader).is_some_and(|entry| entry.own.is_some())
    }

    pub fn remove(&self, loader: LoaderId) {
        self.loaders.remove(&loader);
    }
}

fn discover(loader: &Loader) -> Option<AgentConfig> {
    for dir in loader.classpath_dirs() {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if !candidate.is_file() {
            continue;
        }
        match AgentConfig::from_file(&candidate) {
            Ok(config) => {
                debug!("Loader {} uses configuration {:?}", loader.id(), candidate);
                return Some(config);
            }
            Err(e) => error!("Ignoring configuration for {}: {}", loader.id(), e),
        }
    }
    debug!("Loader {} has no {} of its own", loader.id(), CONFIG_FILE_NAME);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_with_sections_and_defaults() {
        let content = r#"
            auto_hotswap = true
            watch_resources = ["resources", "/abs/static"]
            disabled_plugins = ["Hibernate"]

            [scheduler]
            default_timeout_ms = 250

            [class_read]
            attempts = 3
        "#;
        let config = AgentConfig::parse(content, Path::new("/app")).unwrap();

        assert!(config.auto_hotswap);
        assert_eq!(
            config.watch_resources,
            vec![PathBuf::from("/app/resources"), PathBuf::from("/abs/static")]
        );
        assert!(config.is_plugin_disabled("hibernate"));
        assert!(!config.is_plugin_disabled("spring"));
        assert_eq!(config.scheduler_config().default_timeout, Duration::from_millis(250));
        assert_eq!(config.scheduler_config().tick_interval, Duration::from_millis(100));
        assert_eq!(config.watcher_config().poll_interval, Duration::from_millis(50));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy { attempts: 3, delay: Duration::from_millis(20) }
        );
    }

    #[test]
    fn test_invalid_file_is_a_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "auto_hotswap = \"maybe\"").unwrap();

        match AgentConfig::from_file(&path) {
            Err(HotswapError::Config { path: origin, source }) => {
                assert_eq!(origin, path);
                assert!(source.to_string().contains("boolean"), "{}", source);
            }
            other => panic!("expected a configuration error, got {:?}", other),
        }
        assert!(matches!(
            AgentConfig::parse("[[[", Path::new("/app")),
            Err(HotswapError::Config { .. })
        ));
    }

    #[test]
    fn test_loader_config_falls_back_to_parent_then_global() {
        let parent_dir = TempDir::new().unwrap();
        let child_dir = TempDir::new().unwrap();
        let broken_dir = TempDir::new().unwrap();
        std::fs::write(parent_dir.path().join(CONFIG_FILE_NAME), "auto_hotswap = true").unwrap();
        std::fs::write(broken_dir.path().join(CONFIG_FILE_NAME), "[[[").unwrap();

        let registry = ConfigRegistry::new(AgentConfig::default());
        let parent = Loader::from_dirs("parent", &[parent_dir.path()]);
        let child = Loader::from_dirs("child", &[child_dir.path()]).with_parent(parent.id());
        let orphan = Loader::from_dirs("orphan", &[broken_dir.path()]);

        assert!(registry.register(&parent).auto_hotswap);
        assert!(registry.register(&child).auto_hotswap);
        assert!(!registry.has_own_config(child.id()));

        // Unparseable file is ignored
        assert!(!registry.register(&orphan).auto_hotswap);

        registry.remove(parent.id());
        assert!(!registry.get(Some(child.id())).auto_hotswap);
        assert!(!registry.get(None).auto_hotswap);
    }
}
