//! Keep-alive scheduler.
//!
//! One deadline per connection. Every send pushes the deadline a full
//! interval out; when it fires with less than an interval elapsed since the
//! last send, it re-arms for the remainder instead of pinging.

use std::time::Duration;

use tokio::time::Instant;

/// Idle-probe timer state for one connection.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    last_send: Instant,
    deadline: Instant,
}

impl KeepAlive {
    /// Creates a scheduler treating `now` as the last send.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_send: now,
            deadline: now + interval,
        }
    }

    /// Current ping interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the timer next fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time of the last recorded send.
    pub fn last_send(&self) -> Instant {
        self.last_send
    }

    /// Records a send and re-arms for a full interval.
    pub fn record_send(&mut self, now: Instant) {
        self.last_send = now;
        self.deadline = now + self.interval;
    }

    /// Changes the interval and re-arms immediately against the last send.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        self.deadline = (self.last_send + interval).max(now);
    }

    /// Handles the timer firing at `now`.
    ///
    /// Returns `true` if a ping is due; the timer is then re-armed for a full
    /// interval. Otherwise it is re-armed for the remaining idle budget.
    pub fn on_timer(&mut self, now: Instant) -> bool {
        let idle = now.saturating_duration_since(self.last_send);
        if idle >= self.interval {
            self.deadline = now + self.interval;
            true
        } else {
            self.deadline = self.last_send + self.interval;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_new_arms_full_interval() {
        let now = Instant::now();
        let ka = KeepAlive::new(30 * SECOND, now);
        assert_eq!(ka.deadline(), now + 30 * SECOND);
        assert_eq!(ka.interval(), 30 * SECOND);
    }

    #[test]
    fn test_fires_when_idle() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(30 * SECOND, start);

        let fire = start + 30 * SECOND;
        assert!(ka.on_timer(fire));
        assert_eq!(ka.deadline(), fire + 30 * SECOND);
    }

    #[test]
    fn test_rearms_for_remaining_budget() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(30 * SECOND, start);

        ka.record_send(start + 10 * SECOND);
        // Stale wake-up at the old deadline
        assert!(!ka.on_timer(start + 30 * SECOND));
        assert_eq!(ka.deadline(), start + 40 * SECOND);
    }

    #[test]
    fn test_record_send_resets_deadline() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(30 * SECOND, start);
        ka.record_send(start + 5 * SECOND);
        assert_eq!(ka.deadline(), start + 35 * SECOND);
        assert_eq!(ka.last_send(), start + 5 * SECOND);
    }

    #[test]
    fn test_shorter_interval_applies_immediately() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(30 * SECOND, start);

        ka.set_interval(5 * SECOND, start + SECOND);
        assert_eq!(ka.deadline(), start + 5 * SECOND);
        assert!(ka.on_timer(start + 5 * SECOND));
    }

    #[test]
    fn test_shorter_interval_already_overdue_fires_now() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(30 * SECOND, start);

        let now = start + 20 * SECOND;
        ka.set_interval(5 * SECOND, now);
        assert_eq!(ka.deadline(), now);
        assert!(ka.on_timer(now));
    }

    #[test]
    fn test_longer_interval_extends_deadline() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(5 * SECOND, start);
        ka.set_interval(60 * SECOND, start + SECOND);
        assert_eq!(ka.deadline(), start + 60 * SECOND);
    }
}
