//! Filesystem back-ends. The engine core only depends on the
//! stream-opening contract; the in-memory and real-FS implementations
//! here cover the common hosting setups.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};
use tracing::trace;

/// The loading contract: resolve a template name to its source text, or
/// `None` if this handler has no such template. Sources are UTF-8; the
/// host is responsible for transcoding anything else before registration.
pub trait FilesystemHandler: Send + Sync {
    fn open_stream(&self, name: &str) -> Option<String>;
}

/// Templates registered directly in memory, useful for tests and embedded
/// template sets
#[derive(Default)]
pub struct MemoryFileSystem {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(
        &self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.files
            .lock()
            .expect("file map lock poisoned")
            .insert(name.into(), content.into());
    }
}

impl FilesystemHandler for MemoryFileSystem {
    fn open_stream(&self, name: &str) -> Option<String> {
        self.files
            .lock()
            .expect("file map lock poisoned")
            .get(name)
            .cloned()
    }
}

/// Templates loaded from disk, rooted at a directory
pub struct RealFileSystem {
    root: PathBuf,
}

impl RealFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new(".")
    }
}

impl FilesystemHandler for RealFileSystem {
    fn open_stream(&self, name: &str) -> Option<String> {
        let path = self.root.join(name);
        trace!(path = %path.display(), "opening template file");
        fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fs() {
        let fs = MemoryFileSystem::new();
        fs.add_file("a.j2", "content");
        assert_eq!(fs.open_stream("a.j2"), Some("content".to_owned()));
        assert_eq!(fs.open_stream("b.j2"), None);
    }
}
