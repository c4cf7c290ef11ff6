//! Regex utilities for hotswap
//! Extracted to a separate crate for compilation optimization

use once_cell::sync::Lazy;
use regex::Regex;

/// Compile `pattern` so that it must match the whole input.
///
/// Handler filters are written as "the URI matches this expression", so a
/// plain `find` would accept `Foo.classpath` for `.*\.class`.
pub fn full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Patterns for compiled class files on disk
pub mod class_file {
    use super::*;

    pub static CLASS_FILE_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\.class$").expect("Invalid regex pattern"));

    /// A single segment of a binary class name (`Outer$Inner` included)
    pub static NAME_SEGMENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[\p{L}_$][\p{L}\p{N}_$]*$").expect("Invalid regex pattern")
    });

    /// Whether the path names a compiled class file
    pub fn is_class_file(path: &str) -> bool {
        CLASS_FILE_PATTERN.is_match(path)
    }

    /// Derive a binary class name from a path relative to a classpath root.
    ///
    /// `com/example/Foo$Bar.class` becomes `com.example.Foo$Bar`. Returns
    /// `None` when the path is not a class file or a segment is not a valid
    /// identifier.
    pub fn binary_name(relative: &str) -> Option<String> {
        let normalized = relative.replace('\\', "/");
        let stem = normalized.trim_start_matches('/').strip_suffix(".class")?;
        if stem.is_empty() {
            return None;
        }

        let segments: Vec<&str> = stem.split('/').collect();
        if segments.iter().all(|s| NAME_SEGMENT_PATTERN.is_match(s)) {
            Some(segments.join("."))
        } else {
            None
        }
    }
}

/// URI scheme detection
pub mod uri {
    use super::*;

    /// Schemes that address entries inside an archive rather than a file
    pub static ARCHIVE_SCHEME_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?i)(jar|zip|war|ear|vfs|vfszip|wsjar):").expect("Invalid regex pattern")
    });

    pub fn is_archive(uri: &str) -> bool {
        ARCHIVE_SCHEME_PATTERN.is_match(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_is_anchored() {
        let re = full_match(r".*\.class").unwrap();
        assert!(re.is_match("file:/app/classes/Foo.class"));
        assert!(!re.is_match("file:/app/classes/Foo.classpath"));

        let alternation = full_match("a|b").unwrap();
        assert!(alternation.is_match("a"));
        assert!(!alternation.is_match("ab"));
    }

    #[test]
    fn test_binary_name() {
        assert_eq!(
            class_file::binary_name("com/example/Foo$Bar.class"),
            Some("com.example.Foo$Bar".to_string())
        );
        assert_eq!(class_file::binary_name("/Foo.class"), Some("Foo".to_string()));
        assert_eq!(class_file::binary_name("com/example/Foo.java"), None);
        assert_eq!(class_file::binary_name("com/1bad/Foo.class"), None);
        assert_eq!(class_file::binary_name(".class"), None);
    }

    #[test]
    fn test_archive_detection() {
        assert!(uri::is_archive("jar:file:/app/lib/a.jar!/com/Foo.class"));
        assert!(uri::is_archive("VFS:/content/app.war/WEB-INF"));
        assert!(!uri::is_archive("file:/app/classes/"));
    }
}
