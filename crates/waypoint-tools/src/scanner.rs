//! Inventory scan: turn a scope root and glob lists into the file entries a
//! session tracks.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use waypoint_types::FileEntry;

use crate::globs::GlobFilter;
use crate::store::ContentStore;

/// Counts describing an inventory, returned to the caller at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub files_total: usize,
    pub total_bytes: u64,
    pub by_class: BTreeMap<String, usize>,
    pub by_extension: BTreeMap<String, usize>,
}

impl InventorySummary {
    pub fn from_entries(entries: &[FileEntry]) -> Self {
        let mut summary = Self {
            files_total: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            summary.total_bytes += entry.size;
            *summary
                .by_class
                .entry(entry.class.as_str().to_string())
                .or_default() += 1;
            let file_name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            let ext = file_name
                .rsplit_once('.')
                .map(|(_, e)| e.to_ascii_lowercase())
                .unwrap_or_default();
            *summary.by_extension.entry(ext).or_default() += 1;
        }
        summary
    }
}

/// Stateless scanner over a [`ContentStore`].
pub struct FileScanner<'a> {
    store: &'a dyn ContentStore,
}

impl<'a> FileScanner<'a> {
    pub fn new(store: &'a dyn ContentStore) -> Self {
        Self { store }
    }

    /// Build the initial inventory: one pending, checklist-less entry per file.
    pub async fn scan(
        &self,
        root: &Path,
        include: &[String],
        exclude: &[String],
    ) -> waypoint_types::Result<Vec<FileEntry>> {
        let filter = GlobFilter::new(include, exclude)?;
        let files = self.store.list_files(root, &filter).await?;
        tracing::info!(root = %root.display(), files = files.len(), "Inventory scanned");
        Ok(files
            .into_iter()
            .map(|meta| FileEntry::new(meta.path, meta.size))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContentStore;
    use waypoint_types::{FileClass, FileStatus};

    #[tokio::test]
    async fn scan_builds_pending_entries() {
        let store = MemoryContentStore::new()
            .with_file("src/Sales.Codeunit.al", "codeunit")
            .with_file("test/Sales.Test.al", "test")
            .with_file("app.json", "{}");
        let scanner = FileScanner::new(&store);

        let entries = scanner
            .scan(Path::new("/repo"), &["**/*.al".to_string()], &[])
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == FileStatus::Pending));
        assert!(entries.iter().all(|e| e.checklist.is_empty()));
        assert_eq!(entries[0].class, FileClass::Source);
        assert_eq!(entries[1].class, FileClass::Test);
    }

    #[tokio::test]
    async fn scan_with_bad_glob_fails() {
        let store = MemoryContentStore::new();
        let scanner = FileScanner::new(&store);
        let result = scanner
            .scan(Path::new("/repo"), &["[".to_string()], &[])
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn summary_counts_classes_and_extensions() {
        let entries = vec![
            FileEntry::new("src/a.al", 10),
            FileEntry::new("src/b.AL", 5),
            FileEntry::new("app.json", 2),
        ];
        let summary = InventorySummary::from_entries(&entries);
        assert_eq!(summary.files_total, 3);
        assert_eq!(summary.total_bytes, 17);
        assert_eq!(summary.by_extension["al"], 2);
        assert_eq!(summary.by_class["source"], 2);
        assert_eq!(summary.by_class["config"], 1);
    }
}
