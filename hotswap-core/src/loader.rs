//! Loader handles
//!
//! A loader stands in for a JVM classloader: an opaque identity used to key
//! listener, configuration and handler tables, plus the classpath it serves
//! resources from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use url::Url;

/// Opaque loader identity. Two handles are equal only if they were produced
/// by the same call to [`LoaderId::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u64);

impl LoaderId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

const ARCHIVE_EXTENSIONS: [&str; 4] = ["jar", "zip", "war", "ear"];

/// A classloader as seen by the watch pipeline
#[derive(Debug, Clone)]
pub struct Loader {
    id: LoaderId,
    name: String,
    parent: Option<LoaderId>,
    classpath: Vec<Url>,
}

impl Loader {
    /// Create a loader with a fresh identity
    pub fn new(name: impl Into<String>, classpath: impl IntoIterator<Item = Url>) -> Self {
        Self {
            id: LoaderId::next(),
            name: name.into(),
            parent: None,
            classpath: classpath.into_iter().collect(),
        }
    }

    /// Create a loader whose classpath is a list of local directories.
    /// Relative paths are made absolute against the working directory.
    pub fn from_dirs<P: AsRef<Path>>(name: impl Into<String>, dirs: &[P]) -> Self {
        let classpath = dirs.iter().filter_map(|dir| directory_url(dir.as_ref()));
        Self::new(name, classpath)
    }

    pub fn with_parent(mut self, parent: LoaderId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<LoaderId> {
        self.parent
    }

    pub fn classpath(&self) -> &[Url] {
        &self.classpath
    }

    /// Append classpath entries, skipping ones already present
    pub fn extend_classpath(&mut self, entries: impl IntoIterator<Item = Url>) {
        for entry in entries {
            if !self.classpath.contains(&entry) {
                self.classpath.push(entry);
            }
        }
    }

    /// Local directories on the classpath
    pub fn classpath_dirs(&self) -> Vec<PathBuf> {
        self.classpath
            .iter()
            .filter_map(|url| url.to_file_path().ok())
            .filter(|path| path.is_dir())
            .collect()
    }

    /// Candidate URLs of `path` under every classpath entry.
    ///
    /// Directory entries resolve to `file:` URLs (which may not exist yet);
    /// archive entries resolve to `jar:` URLs that the watcher will reject
    /// as non-local.
    pub fn resources(&self, path: &str) -> Vec<Url> {
        let relative = path.trim_start_matches('/');
        let mut found = Vec::new();

        for entry in &self.classpath {
            let Ok(base) = entry.to_file_path() else {
                trace!("Skipping non-file classpath entry {}", entry);
                continue;
            };

            if is_archive(&base) {
                let uri = format!("jar:{}!/{}", entry, relative);
                match Url::parse(&uri) {
                    Ok(url) => found.push(url),
                    Err(e) => trace!("Skipping archive resource {}: {}", uri, e),
                }
                continue;
            }

            let target = if relative.is_empty() { base } else { base.join(relative) };
            if let Some(url) = directory_url(&target) {
                found.push(url);
            }
        }

        found
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ARCHIVE_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

/// `file:` URL for a local path; directories get a trailing slash
pub(crate) fn directory_url(path: &Path) -> Option<Url> {
    let absolute = std::path::absolute(path).ok()?;
    if absolute.is_dir() {
        Url::from_directory_path(&absolute).ok()
    } else {
        Url::from_file_path(&absolute).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_loader_ids_are_unique() {
        let a = LoaderId::next();
        let b = LoaderId::next();
        assert_ne!(a, b);
        assert_eq!(a, a);
        assert!(a.to_string().starts_with("loader#"));
    }

    #[test]
    fn test_resources_resolve_under_directories_and_archives() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("META-INF")).unwrap();
        let jar = temp_dir.path().join("lib.jar");
        std::fs::write(&jar, b"PK").unwrap();

        let loader = Loader::new(
            "app",
            vec![
                Url::from_directory_path(temp_dir.path()).unwrap(),
                Url::from_file_path(&jar).unwrap(),
            ],
        );

        let resources = loader.resources("META-INF");
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].scheme(), "file");
        assert_eq!(
            resources[0].to_file_path().unwrap(),
            temp_dir.path().join("META-INF")
        );
        assert_eq!(resources[1].scheme(), "jar");
        assert!(resources[1].as_str().ends_with("lib.jar!/META-INF"));
    }

    #[test]
    fn test_extend_classpath_skips_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let mut loader = Loader::from_dirs("app", &[temp_dir.path()]);
        let entry = loader.classpath()[0].clone();

        loader.extend_classpath(vec![entry]);
        assert_eq!(loader.classpath().len(), 1);
        assert_eq!(loader.classpath_dirs(), vec![temp_dir.path().to_path_buf()]);
    }
}
