use std::path::Path;

use async_trait::async_trait;

use crate::globs::GlobFilter;

/// A file found under a scope root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Path relative to the root, `/`-separated.
    pub path: String,
    pub size: u64,
}

/// Abstraction over the content the engine reads: enumerate files under a
/// root and read their text.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Read the file at root-relative `path` as text.
    async fn read_file(&self, root: &Path, path: &str) -> waypoint_types::Result<String>;

    /// Every file under `root` accepted by `filter`, sorted by path.
    async fn list_files(
        &self,
        root: &Path,
        filter: &GlobFilter,
    ) -> waypoint_types::Result<Vec<FileMeta>>;
}
