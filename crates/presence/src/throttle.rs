/// Leading-edge throttle with a trailing value
use chrono::{DateTime, Duration, Utc};

/// Lets one value through per window. Values offered while the window is
/// open are held back; the latest of them is released once the window
/// closes.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    window: Duration,
    last_fired: Option<DateTime<Utc>>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: None,
            pending: None,
        }
    }

    /// Offer a value. Returns it back if it may be acted on right now.
    pub fn offer(&mut self, value: T, now: DateTime<Utc>) -> Option<T> {
        if self.is_open(now) {
            self.pending = Some(value);
            return None;
        }
        self.pending = None;
        self.last_fired = Some(now);
        Some(value)
    }

    /// Release the held-back value once its window has closed
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Option<T> {
        if self.pending.is_none() || self.is_open(now) {
            return None;
        }
        self.last_fired = Some(now);
        self.pending.take()
    }

    /// When the held-back value becomes due, if there is one
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match (&self.pending, self.last_fired) {
            (Some(_), Some(at)) => Some(at + self.window),
            _ => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    fn is_open(&self, now: DateTime<Utc>) -> bool {
        matches!(self.last_fired, Some(at) if now - at < self.window)
    }
}
