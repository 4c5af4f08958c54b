//! Wall-clock abstraction.
//!
//! Audit timestamps, SPK expiry checks and request deadlines all read the
//! clock through [`Environment`], so tests can pin time with [`ManualEnv`]
//! while production uses [`SystemEnv`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Source of wall-clock time.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;
}

/// Production environment reading the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        // A clock set before 1970 reads as the epoch
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

/// Environment whose clock only moves when told to.
///
/// Clones share the same clock.
#[derive(Debug, Clone, Default)]
pub struct ManualEnv {
    now_secs: Arc<AtomicU64>,
}

impl ManualEnv {
    /// Clock starting at `now_secs`.
    pub fn new(now_secs: u64) -> Self {
        Self { now_secs: Arc::new(AtomicU64::new(now_secs)) }
    }

    /// Move the clock to `now_secs`.
    pub fn set(&self, now_secs: u64) {
        self.now_secs.store(now_secs, Ordering::SeqCst);
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.now_secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Environment for ManualEnv {
    fn wall_clock_secs(&self) -> u64 {
        self.now_secs.load(Ordering::SeqCst)
    }
}
