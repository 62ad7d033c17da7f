//! Single-use confirmation tokens for batch mutations.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchFilter, BatchOperation};

/// Authorises one execution of `operation` with `filter` on `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationToken {
    pub token: String,
    pub session_id: String,
    pub operation: BatchOperation,
    /// Normalised snapshot of the dry-run filter.
    pub filter: BatchFilter,
    pub instance_count: usize,
    pub issued_at: DateTime<Utc>,
}

impl ConfirmationToken {
    /// Whether this token was issued for exactly this operation and filter.
    pub fn authorises(&self, operation: BatchOperation, filter: &BatchFilter) -> bool {
        self.operation == operation && self.filter == filter.clone().normalized()
    }
}

/// Bounded store of outstanding tokens. The oldest token is evicted once
/// `capacity` is exceeded.
pub struct TokenStore {
    capacity: usize,
    tokens: Mutex<VecDeque<ConfirmationToken>>,
}

impl TokenStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tokens: Mutex::new(VecDeque::new()),
        }
    }

    pub fn issue(
        &self,
        session_id: &str,
        operation: BatchOperation,
        filter: &BatchFilter,
        instance_count: usize,
    ) -> ConfirmationToken {
        let token = ConfirmationToken {
            token: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            operation,
            filter: filter.clone().normalized(),
            instance_count,
            issued_at: Utc::now(),
        };
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.push_back(token.clone());
        while tokens.len() > self.capacity {
            if let Some(evicted) = tokens.pop_front() {
                tracing::debug!(session_id = %evicted.session_id, "Confirmation token evicted");
            }
        }
        token
    }

    /// Remove and return `token` if it was issued for `session_id`. Tokens of
    /// other sessions are left in place.
    pub fn take(&self, token: &str, session_id: &str) -> Option<ConfirmationToken> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let pos = tokens
            .iter()
            .position(|t| t.token == token && t.session_id == session_id)?;
        tokens.remove(pos)
    }

    /// Outstanding tokens, oldest first.
    pub fn snapshot(&self) -> Vec<ConfirmationToken> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Re-load tokens saved by [`snapshot`](Self::snapshot), keeping the
    /// retention cap.
    pub fn restore(&self, saved: Vec<ConfirmationToken>) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.extend(saved);
        while tokens.len() > self.capacity {
            tokens.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(types: &[&str]) -> BatchFilter {
        BatchFilter {
            instance_types: types.iter().map(|s| s.to_string()).collect(),
            ..BatchFilter::default()
        }
    }

    #[test]
    fn token_is_single_use() {
        let store = TokenStore::new(10);
        let t = store.issue("s1", BatchOperation::ApplyFixes, &filter(&["literal"]), 3);
        assert_eq!(t.instance_count, 3);

        assert!(store.take(&t.token, "s1").is_some());
        assert!(store.take(&t.token, "s1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn token_is_bound_to_session() {
        let store = TokenStore::new(10);
        let t = store.issue("s1", BatchOperation::SkipInstances, &filter(&[]), 1);
        assert!(store.take(&t.token, "s2").is_none());
        // still usable by its own session
        assert!(store.take(&t.token, "s1").is_some());
    }

    #[test]
    fn authorises_exact_operation_and_filter() {
        let store = TokenStore::default();
        let t = store.issue("s1", BatchOperation::ApplyFixes, &filter(&["b", "a"]), 2);
        assert!(t.authorises(BatchOperation::ApplyFixes, &filter(&["a", "b"])));
        assert!(!t.authorises(BatchOperation::SkipInstances, &filter(&["a", "b"])));
        assert!(!t.authorises(BatchOperation::ApplyFixes, &filter(&["a"])));
    }

    #[test]
    fn snapshot_restores_into_a_fresh_store() {
        let store = TokenStore::new(10);
        let t = store.issue("s1", BatchOperation::ApplyFixes, &filter(&["literal"]), 3);

        let restored = TokenStore::new(10);
        restored.restore(store.snapshot());
        let taken = restored.take(&t.token, "s1").unwrap();
        assert_eq!(taken, t);
    }

    #[test]
    fn oldest_tokens_are_evicted() {
        let store = TokenStore::new(2);
        let first = store.issue("s", BatchOperation::ApplyFixes, &filter(&[]), 0);
        let second = store.issue("s", BatchOperation::ApplyFixes, &filter(&[]), 0);
        let third = store.issue("s", BatchOperation::ApplyFixes, &filter(&[]), 0);

        assert_eq!(store.len(), 2);
        assert!(store.take(&first.token, "s").is_none());
        assert!(store.take(&second.token, "s").is_some());
        assert!(store.take(&third.token, "s").is_some());
    }
}
