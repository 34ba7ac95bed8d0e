//! Flow schedule: when the write path may send.

use std::time::{Duration, Instant};

/// Start, flow-start and optional flow-stop instants of one test.
#[derive(Debug, Clone, Copy)]
pub struct FlowSchedule {
    start: Instant,
    flow_start: Instant,
    flow_stop: Option<Instant>,
}

impl FlowSchedule {
    /// `duration` of `None` leaves the flow unbounded.
    pub fn new(start: Instant, delay: Duration, duration: Option<Duration>) -> Self {
        let flow_start = start.checked_add(delay).unwrap_or_else(far_future);
        let flow_stop = duration.map(|d| flow_start.checked_add(d).unwrap_or_else(far_future));
        Self {
            start,
            flow_start,
            flow_stop,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// `flow_start <= now < flow_stop`.
    pub fn may_write(&self, now: Instant) -> bool {
        now >= self.flow_start && self.flow_stop.map_or(true, |stop| now < stop)
    }

    /// The bounded flow has ended.
    pub fn has_stopped(&self, now: Instant) -> bool {
        self.flow_stop.is_some_and(|stop| now >= stop)
    }

    /// Time until the next start/stop transition, if one is still ahead.
    pub fn next_transition(&self, now: Instant) -> Option<Duration> {
        if now < self.flow_start {
            return Some(self.flow_start - now);
        }
        match self.flow_stop {
            Some(stop) if now < stop => Some(stop - now),
            _ => None,
        }
    }
}

// Roughly thirty years out; `Instant` has no MAX.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
