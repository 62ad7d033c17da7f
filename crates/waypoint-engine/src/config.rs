use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of persisted state; sessions live under `<state_dir>/sessions/`.
    pub state_dir: PathBuf,
    /// How many unconsumed confirmation tokens are retained before the oldest
    /// is evicted.
    pub token_retention: usize,
    /// Default bound on autonomous work during `start` and `resume` when the
    /// caller does not pass its own.
    pub autonomous_timeout: Duration,
}

impl EngineConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".waypoint"),
            token_retention: 100,
            autonomous_timeout: Duration::from_secs(30),
        }
    }
}
