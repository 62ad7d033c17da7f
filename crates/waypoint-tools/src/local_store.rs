use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::globs::GlobFilter;
use crate::store::{ContentStore, FileMeta};

/// Concrete content store backed by the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalContentStore;

impl LocalContentStore {
    pub fn new() -> Self {
        Self
    }
}

/// Join root-relative path components with `/` regardless of platform.
fn to_relative_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn read_file(&self, root: &Path, path: &str) -> waypoint_types::Result<String> {
        let bytes = tokio::fs::read(root.join(path)).await?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text.strip_prefix('\u{feff}').unwrap_or(&text).to_string())
    }

    async fn list_files(
        &self,
        root: &Path,
        filter: &GlobFilter,
    ) -> waypoint_types::Result<Vec<FileMeta>> {
        let mut matches = Vec::new();
        collect_matches(root, root.to_path_buf(), filter, &mut matches).await?;
        matches.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!(root = %root.display(), count = matches.len(), "Listed files");
        Ok(matches)
    }
}

/// Recursively collect files accepted by the filter. Symlinks are not followed.
/// Only a failure on `current` itself is returned; unreadable entries below it
/// are logged and skipped.
async fn collect_matches(
    base: &Path,
    current: PathBuf,
    filter: &GlobFilter,
    matches: &mut Vec<FileMeta>,
) -> waypoint_types::Result<()> {
    let meta = tokio::fs::symlink_metadata(&current).await?;
    if meta.is_file() {
        if let Ok(rel) = current.strip_prefix(base) {
            let rel = to_relative_string(rel);
            if filter.is_match(&rel) {
                matches.push(FileMeta {
                    path: rel,
                    size: meta.len(),
                });
            }
        }
    } else if meta.is_dir() {
        let mut read_dir = tokio::fs::read_dir(&current).await?;
        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %current.display(), error = %e, "Stopped listing directory");
                    break;
                }
            };
            let path = entry.path();
            if let Err(e) = Box::pin(collect_matches(base, path.clone(), filter, matches)).await {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn filter(include: &[&str], exclude: &[&str]) -> GlobFilter {
        let inc: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exc: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        GlobFilter::new(&inc, &exc).unwrap()
    }

    #[tokio::test]
    async fn list_files_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "src/b.al", "b");
        write(&dir, "src/a.al", "aaaa");
        write(&dir, "notes.txt", "x");
        write(&dir, ".alpackages/dep.al", "dep");

        let store = LocalContentStore::new();
        let files = store
            .list_files(dir.path(), &filter(&["**/*.al"], &["**/.alpackages/**"]))
            .await
            .unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.al", "src/b.al"]);
        assert_eq!(files[0].size, 4);
    }

    #[tokio::test]
    async fn read_file_strips_bom() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.al", "\u{feff}codeunit 50100 Foo");

        let store = LocalContentStore::new();
        let text = store.read_file(dir.path(), "a.al").await.unwrap();
        assert_eq!(text, "codeunit 50100 Foo");
    }

    #[tokio::test]
    async fn read_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalContentStore::new();
        let err = store.read_file(dir.path(), "missing.al").await.unwrap_err();
        assert!(matches!(err, waypoint_types::WaypointError::Io(_)));
    }

    #[tokio::test]
    async fn missing_root_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalContentStore::new();
        let result = store
            .list_files(&dir.path().join("nope"), &filter(&["**/*"], &[]))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_subdirectory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        write(&dir, "src/a.al", "a");
        write(&dir, "locked/b.al", "b");
        let locked = dir.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // privileged users read through permission bits
        let denied = std::fs::read_dir(&locked).is_err();

        let store = LocalContentStore::new();
        let files = store
            .list_files(dir.path(), &filter(&["**/*.al"], &[]))
            .await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let paths: Vec<_> = files.unwrap().into_iter().map(|f| f.path).collect();
        if denied {
            assert_eq!(paths, vec!["src/a.al".to_string()]);
        } else {
            assert_eq!(paths, vec!["locked/b.al".to_string(), "src/a.al".to_string()]);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_does_not_abort_listing() {
        let dir = TempDir::new().unwrap();
        write(&dir, "src/a.al", "a");
        std::os::unix::fs::symlink(dir.path().join("gone.al"), dir.path().join("src/link.al")).unwrap();

        let store = LocalContentStore::new();
        let files = store
            .list_files(dir.path(), &filter(&["**/*.al"], &[]))
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/a.al");
    }
}
