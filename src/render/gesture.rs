// =============================================================================
// Gesture settling — debounced history re-fetch after pan / zoom
// =============================================================================
//
// Gestures never request data mid-flight. Each pan/zoom step pushes the
// deadline out; once the gesture has been quiet for `delay`, one refetch is
// planned for the window the user settled on. If that window is pressed
// against the oldest cached candle, the span before it is requested instead
// (load older history).
// =============================================================================

use std::time::{Duration, Instant};

use super::viewport::TimeRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchRequest {
    pub start: i64,
    pub end: i64,
    /// Extends the cache backwards rather than filling the visible window.
    pub older: bool,
}

/// Decide what to fetch for a settled `visible` window given the `cached`
/// range. `bar_ms` is the series interval.
pub fn plan_refetch(visible: TimeRange, cached: Option<TimeRange>, bar_ms: i64) -> Option<RefetchRequest> {
    let Some(cached) = cached else {
        return Some(RefetchRequest {
            start: visible.start,
            end: visible.end,
            older: false,
        });
    };

    if visible.start <= cached.start + bar_ms {
        let span = visible.span().max(bar_ms);
        return Some(RefetchRequest {
            start: cached.start - span,
            end: cached.start,
            older: true,
        });
    }

    if visible.start < cached.start || visible.end > cached.end {
        return Some(RefetchRequest {
            start: visible.start,
            end: visible.end,
            older: false,
        });
    }
    None
}

#[derive(Debug, Clone)]
pub struct RefetchDebouncer {
    delay: Duration,
    deadline: Option<Instant>,
    window: Option<TimeRange>,
}

impl RefetchDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            window: None,
        }
    }

    /// Record a gesture step ending on `visible`.
    pub fn on_gesture(&mut self, now: Instant, visible: TimeRange) {
        self.deadline = Some(now + self.delay);
        self.window = Some(visible);
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// The settled window, once the quiet period has elapsed. Fires once per
    /// gesture.
    pub fn poll(&mut self, now: Instant) -> Option<TimeRange> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.window.take()
            }
            _ => None,
        }
    }
}
