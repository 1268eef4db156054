//! Throttled transfer progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot handed to progress observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub bytes: u64,
    pub total: u64,
    pub percent: f64,
    pub bytes_per_sec: f64,
}

/// Progress observer. Called from transfer tasks, so it must be cheap and non-blocking.
pub type ProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// A callback that ignores every update.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Rate-limits progress callbacks and guarantees a final 100% report.
pub struct ProgressThrottle {
    callback: ProgressFn,
    total: u64,
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(callback: ProgressFn, total: u64, interval: Duration) -> Self {
        Self {
            callback,
            total,
            interval,
            started: Instant::now(),
            last_emit: None,
        }
    }

    fn snapshot(&self, bytes: u64) -> TransferProgress {
        let percent = if self.total == 0 {
            0.0
        } else {
            (bytes as f64 / self.total as f64 * 100.0).min(100.0)
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };
        TransferProgress {
            bytes,
            total: self.total,
            percent,
            bytes_per_sec,
        }
    }

    /// Report `bytes` moved so far; dropped if the previous report was too recent.
    pub fn update(&mut self, bytes: u64) {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.interval {
                return;
            }
        }
        self.last_emit = Some(now);
        (self.callback)(self.snapshot(bytes));
    }

    /// Final report at 100%.
    pub fn finish(&mut self) {
        let mut snap = self.snapshot(self.total);
        snap.percent = 100.0;
        self.last_emit = Some(Instant::now());
        (self.callback)(snap);
    }
}
