//! Send pacing.
//!
//! The governor keeps a schedule anchored at the start of a connection:
//! event `k` is due at `k / rate` seconds. Each tick sleeps only until the
//! next due time, so oversleeping on one tick shortens the next one and the
//! long-run rate converges on the target instead of drifting.

use std::time::Duration;
use tracing::debug;

/// Length of a reporting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// How far the loop may fall behind its schedule before the schedule is
/// re-anchored at the present (no catch-up burst beyond this).
pub const MAX_LAG: Duration = WINDOW;

/// Target emission rate in events per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateTarget {
    pub events_per_second: f64,
}

impl RateTarget {
    pub fn new(events_per_second: f64) -> Self {
        Self { events_per_second }
    }

    pub fn is_valid(&self) -> bool {
        self.events_per_second.is_finite() && self.events_per_second > 0.0
    }

}

/// How long to wait before the next emission, given how many events have
/// been emitted and how much time has passed since the schedule origin.
///
/// Never negative: when the loop is late this is zero and the event goes out
/// immediately.
pub fn next_delay(target_rate: f64, events_sent: u64, elapsed: Duration) -> Duration {
    due_at(target_rate, events_sent).saturating_sub(elapsed)
}

/// Offset from the schedule origin at which event number `events_sent` is due.
fn due_at(target_rate: f64, events_sent: u64) -> Duration {
    if !(target_rate.is_finite() && target_rate > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(events_sent as f64 / target_rate).unwrap_or(Duration::MAX)
}

/// Realized throughput of one completed window, plus the whole windows that
/// passed after it without a single emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReport {
    /// Offset of the window start from the governor's clock origin.
    pub started_at: Duration,
    pub events: u64,
    pub realized_rate: f64,
    pub idle_windows: u64,
}

impl WindowReport {
    /// Windows this report closes, idle ones included.
    pub fn windows(&self) -> u64 {
        1 + self.idle_windows
    }

    /// Rate of the most recent window it covers.
    pub fn latest_rate(&self) -> f64 {
        if self.idle_windows > 0 {
            0.0
        } else {
            self.realized_rate
        }
    }
}

/// Stateful pacer. Time is passed in as an offset from an arbitrary origin
/// so callers can drive it from `tokio::time::Instant` or a simulated clock.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    target: RateTarget,
    anchor: Duration,
    scheduled: u64,
    window_start: Duration,
    window_events: u64,
    reanchors: u64,
}

impl RateGovernor {
    pub fn new(target: RateTarget, now: Duration) -> Self {
        Self {
            target,
            anchor: now,
            scheduled: 0,
            window_start: now,
            window_events: 0,
            reanchors: 0,
        }
    }

    /// Number of times the schedule was abandoned because the loop fell
    /// more than [`MAX_LAG`] behind.
    pub fn reanchors(&self) -> u64 {
        self.reanchors
    }

    /// Delay until the next event is due.
    pub fn pace(&mut self, now: Duration) -> Duration {
        let elapsed = now.saturating_sub(self.anchor);
        let due = due_at(self.target.events_per_second, self.scheduled);
        if elapsed > due.saturating_add(MAX_LAG) {
            debug!(
                behind_ms = (elapsed - due).as_millis() as u64,
                "send loop fell behind schedule, re-anchoring"
            );
            self.anchor = now;
            self.scheduled = 0;
            self.reanchors += 1;
            return Duration::ZERO;
        }
        next_delay(self.target.events_per_second, self.scheduled, elapsed)
    }

    /// Count one emission at `now`. Returns the report of the window that
    /// just closed, if `now` crossed a window boundary.
    pub fn record_emission(&mut self, now: Duration) -> Option<WindowReport> {
        self.scheduled += 1;
        let report = self.roll_window(now);
        self.window_events += 1;
        report
    }

    fn roll_window(&mut self, now: Duration) -> Option<WindowReport> {
        let since = now.checked_sub(self.window_start)?;
        if since < WINDOW {
            return None;
        }
        let skipped = since.as_secs();
        let report = WindowReport {
            started_at: self.window_start,
            events: self.window_events,
            realized_rate: self.window_events as f64 / WINDOW.as_secs_f64(),
            idle_windows: skipped - 1,
        };
        self.window_start += Duration::from_secs(skipped);
        self.window_events = 0;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulate(rate: f64, seconds: u64, mut cost: impl FnMut(u64) -> Duration) -> (u64, Vec<WindowReport>) {
        let mut governor = RateGovernor::new(RateTarget::new(rate), Duration::ZERO);
        let end = Duration::from_secs(seconds);
        let mut now = Duration::ZERO;
        let mut sent = 0;
        let mut reports = Vec::new();
        loop {
            now += governor.pace(now) + cost(sent);
            if now >= end {
                break;
            }
            reports.extend(governor.record_emission(now));
            sent += 1;
        }
        (sent, reports)
    }

    #[test]
    fn delay_is_never_negative() {
        assert_eq!(next_delay(100.0, 5, Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(next_delay(100.0, 0, Duration::ZERO), Duration::ZERO);
        assert_eq!(
            next_delay(100.0, 10, Duration::from_millis(40)),
            Duration::from_millis(60)
        );
    }

    #[test]
    fn invalid_rate_does_not_panic() {
        assert_eq!(next_delay(0.0, 10, Duration::ZERO), Duration::ZERO);
        assert_eq!(next_delay(f64::NAN, 10, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn exact_clock_hits_target() {
        let (sent, reports) = simulate(1000.0, 10, |_| Duration::ZERO);
        assert_eq!(sent, 10_000);
        assert_eq!(reports.len(), 9);
        assert!(reports.iter().all(|r| r.events == 1000 && r.idle_windows == 0));
    }

    #[test]
    fn oversleep_is_corrected() {
        // every tick oversleeps by 300us against a 1ms budget
        let (sent, _) = simulate(1000.0, 10, |_| Duration::from_micros(300));
        assert!((9_900..=10_100).contains(&sent), "sent {sent}");
    }

    #[test]
    fn slow_sink_falls_behind_without_panicking() {
        // 2ms per send against a 1ms budget
        let mut governor = RateGovernor::new(RateTarget::new(1000.0), Duration::ZERO);
        let mut now = Duration::ZERO;
        let mut sent = 0u64;
        while now < Duration::from_secs(5) {
            let delay = governor.pace(now);
            assert_eq!(delay, Duration::ZERO);
            governor.record_emission(now);
            now += Duration::from_millis(2);
            sent += 1;
        }
        assert_eq!(sent, 2_500);
        assert!(governor.reanchors() > 0);
    }

    #[test]
    fn stall_keeps_last_busy_window_and_counts_idle_ones() {
        let mut governor = RateGovernor::new(RateTarget::new(10.0), Duration::ZERO);
        governor.record_emission(Duration::ZERO);
        governor.record_emission(Duration::from_millis(500));
        let report = governor
            .record_emission(Duration::from_millis(3_200))
            .expect("window closed");
        assert_eq!(report.started_at, Duration::ZERO);
        assert_eq!(report.events, 2);
        assert_eq!(report.realized_rate, 2.0);
        assert_eq!(report.idle_windows, 2);
        assert_eq!(report.windows(), 3);
        assert_eq!(report.latest_rate(), 0.0);

        let next = governor.record_emission(Duration::from_millis(4_000)).unwrap();
        assert_eq!(next.started_at, Duration::from_secs(3));
        assert_eq!(next.events, 1);
        assert_eq!(next.idle_windows, 0);
        assert_eq!(next.latest_rate(), 1.0);
    }

    #[test]
    fn stall_is_not_followed_by_burst() {
        let mut governor = RateGovernor::new(RateTarget::new(100.0), Duration::ZERO);
        governor.record_emission(Duration::ZERO);
        // nothing sent for 5 seconds
        let now = Duration::from_secs(5);
        assert_eq!(governor.pace(now), Duration::ZERO);
        governor.record_emission(now);
        assert_eq!(governor.pace(now), Duration::from_millis(10));
    }

    #[test]
    fn rate_target_validity() {
        assert!(RateTarget::new(250.0).is_valid());
        assert!(!RateTarget::new(0.0).is_valid());
        assert!(!RateTarget::new(f64::INFINITY).is_valid());
    }
}
