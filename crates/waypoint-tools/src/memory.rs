use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;

use waypoint_types::WaypointError;

use crate::globs::GlobFilter;
use crate::store::{ContentStore, FileMeta};

/// A content store that keeps files in memory, keyed by root-relative path.
/// The root argument is ignored.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    files: RwLock<BTreeMap<String, String>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&self, path: &str, content: &str) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), content.to_string());
    }

    pub fn remove(&self, path: &str) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn read_file(&self, _root: &Path, path: &str) -> waypoint_types::Result<String> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| {
                WaypointError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {path}"),
                ))
            })
    }

    async fn list_files(
        &self,
        _root: &Path,
        filter: &GlobFilter,
    ) -> waypoint_types::Result<Vec<FileMeta>> {
        Ok(self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(path, _)| filter.is_match(path))
            .map(|(path, content)| FileMeta {
                path: path.clone(),
                size: content.len() as u64,
            })
            .collect())
    }
}
