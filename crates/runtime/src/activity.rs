//! Shared cells used by the stream readers and the idle watchdog

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Last-activity clock shared between output readers and the watchdog.
///
/// Stores milliseconds since the attempt started. Updates go through
/// `fetch_max`, so the observed value never moves backwards even when the
/// two readers race.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Offset of the last recorded activity from the attempt start.
    pub fn last_activity(&self) -> Duration {
        Duration::from_millis(self.last_ms.load(Ordering::Acquire))
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.origin.elapsed().saturating_sub(self.last_activity())
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded output buffer. Keeps the most recent `limit` bytes.
#[derive(Debug)]
pub struct CapturedOutput {
    inner: Mutex<Captured>,
    limit: usize,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

impl CapturedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Captured::default()),
            limit: limit.max(1),
        }
    }

    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.bytes.extend_from_slice(data);
        if inner.bytes.len() > self.limit {
            let excess = inner.bytes.len() - self.limit;
            inner.bytes.drain(..excess);
            inner.dropped += excess;
        }
    }

    /// Total bytes currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes discarded from the front to respect the limit.
    pub fn dropped(&self) -> usize {
        self.inner.lock().dropped
    }

    /// Lossy text view, prefixed with a marker when truncated.
    pub fn text(&self) -> String {
        let inner = self.inner.lock();
        let body = String::from_utf8_lossy(&inner.bytes);
        if inner.dropped > 0 {
            format!("[{} bytes truncated] {}", inner.dropped, body)
        } else {
            body.into_owned()
        }
    }
}
