//! Engine configuration.

use std::time::Duration;

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a lock request may wait before failing with a timeout.
    pub lock_wait_timeout: Duration,

    /// Whether to flush the WAL after every append (safer but slower).
    ///
    /// Commits always flush before versions become visible; this knob
    /// additionally flushes each individual record.
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(5),
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock-wait timeout.
    #[must_use]
    pub const fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Sets whether to flush the WAL on every append.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}
