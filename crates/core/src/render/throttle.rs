use std::time::{Duration, Instant};

/// Rate limiter firing on both edges of its window.
///
/// The first value offered after a quiet period passes straight through.
/// Values offered inside the window are held back; only the newest one is
/// kept and released by [`Throttle::poll`] once the window has elapsed.
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            pending: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns `value` if it may be applied now, otherwise keeps it pending.
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        if self.window_elapsed(now) {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Releases the pending value once the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_some() && self.window_elapsed(now) {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// Releases the pending value regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        self.last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window)
    }
}
