//! Confirmation tokens shared between processes that use one state directory.
//!
//! A dry run and its execution may happen in different processes, so the
//! outstanding tokens are kept in `<state_dir>/tokens.json`. [`StateLock`]
//! serialises processes on the directory; [`TokenFile`] writes back only the
//! tokens this process issued or consumed, so a stale snapshot never revives
//! a token another process already used.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use waypoint_types::Result;

use crate::tokens::{ConfirmationToken, TokenStore};

const LOCK_FILE: &str = "state.lock";
const TOKENS_FILE: &str = "tokens.json";

// ---------------------------------------------------------------------------
// StateLock
// ---------------------------------------------------------------------------

/// Exclusive, process-level lock on a state directory. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    fn open(state_dir: &Path) -> Result<(File, PathBuf)> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }

    /// Block until the directory is free.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let (file, path) = Self::open(state_dir)?;
        file.lock_exclusive()?;
        tracing::debug!(path = %path.display(), "State lock acquired");
        Ok(Self { file, path })
    }

    /// Take the lock only if no other holder has it.
    pub fn try_acquire(state_dir: &Path) -> Result<Option<Self>> {
        let (file, path) = Self::open(state_dir)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to release state lock");
        }
    }
}

// ---------------------------------------------------------------------------
// TokenFile
// ---------------------------------------------------------------------------

/// The persisted token list, remembering which tokens this process loaded.
#[derive(Debug)]
pub struct TokenFile {
    path: PathBuf,
    loaded: HashSet<String>,
}

impl TokenFile {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(TOKENS_FILE),
            loaded: HashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<ConfirmationToken>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let json = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Restore the persisted tokens into `tokens`.
    pub async fn load(&mut self, tokens: &TokenStore) -> Result<usize> {
        let saved = self.read().await?;
        self.loaded = saved.iter().map(|t| t.token.clone()).collect();
        let count = saved.len();
        tokens.restore(saved);
        tracing::debug!(count, path = %self.path.display(), "Loaded confirmation tokens");
        Ok(count)
    }

    /// Merge this process's changes into the file: tokens it loaded and no
    /// longer holds are removed, tokens it issued are added, and everything
    /// else on disk is left alone.
    pub async fn save(&mut self, tokens: &TokenStore) -> Result<()> {
        let outstanding = tokens.snapshot();
        let held: HashSet<&str> = outstanding.iter().map(|t| t.token.as_str()).collect();

        let mut merged: Vec<ConfirmationToken> = self
            .read()
            .await?
            .into_iter()
            .filter(|t| !self.loaded.contains(&t.token) || held.contains(t.token.as_str()))
            .collect();
        for token in outstanding {
            let issued_here = !self.loaded.contains(&token.token);
            if issued_here && !merged.iter().any(|t| t.token == token.token) {
                merged.push(token);
            }
        }
        merged.sort_by_key(|t| t.issued_at);
        let excess = merged.len().saturating_sub(tokens.capacity());
        let merged = merged.split_off(excess);

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&merged)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        self.loaded = merged.iter().map(|t| t.token.clone()).collect();
        tracing::debug!(count = merged.len(), path = %self.path.display(), "Saved confirmation tokens");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchFilter, BatchOperation};
    use tempfile::TempDir;

    #[test]
    fn lock_excludes_a_second_holder() {
        let dir = TempDir::new().unwrap();
        let first = StateLock::acquire(dir.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE));
        assert!(StateLock::try_acquire(dir.path()).unwrap().is_none());

        drop(first);
        assert!(StateLock::try_acquire(dir.path()).unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_file_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(10);
        assert_eq!(TokenFile::new(dir.path()).load(&store).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_revive_a_used_token() {
        let dir = TempDir::new().unwrap();
        let origin = TokenStore::new(10);
        let token = origin.issue("s1", BatchOperation::SkipInstances, &BatchFilter::default(), 2);
        TokenFile::new(dir.path()).save(&origin).await.unwrap();

        let (a, b) = (TokenStore::new(10), TokenStore::new(10));
        let mut a_file = TokenFile::new(dir.path());
        let mut b_file = TokenFile::new(dir.path());
        a_file.load(&a).await.unwrap();
        b_file.load(&b).await.unwrap();

        assert!(b.take(&token.token, "s1").is_some());
        b_file.save(&b).await.unwrap();
        let issued_by_a = a.issue("s2", BatchOperation::FlagForReview, &BatchFilter::default(), 1);
        a_file.save(&a).await.unwrap();

        let fresh = TokenStore::new(10);
        TokenFile::new(dir.path()).load(&fresh).await.unwrap();
        assert!(fresh.take(&token.token, "s1").is_none());
        assert!(fresh.take(&issued_by_a.token, "s2").is_some());
    }

    #[tokio::test]
    async fn merged_file_keeps_the_retention_cap() {
        let dir = TempDir::new().unwrap();
        let first = TokenStore::new(2);
        first.issue("s", BatchOperation::ApplyFixes, &BatchFilter::default(), 0);
        first.issue("s", BatchOperation::ApplyFixes, &BatchFilter::default(), 0);
        TokenFile::new(dir.path()).save(&first).await.unwrap();

        let second = TokenStore::new(2);
        let mut file = TokenFile::new(dir.path());
        let newest = second.issue("s", BatchOperation::ApplyFixes, &BatchFilter::default(), 0);
        file.save(&second).await.unwrap();

        let fresh = TokenStore::new(10);
        assert_eq!(TokenFile::new(dir.path()).load(&fresh).await.unwrap(), 2);
        assert!(fresh.take(&newest.token, "s").is_some());
    }
}
