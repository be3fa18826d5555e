//! Poll timing and the background retry budget.
//!
//! [`SchedulePolicy`] captures everything that differs between the two poll
//! loops; [`PollTimer`] is the replaceable interval the scheduler task waits
//! on; [`RetryBudget`] counts consecutive failures.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::protocol::{HIDDEN_POLL_PERIOD, MAX_CONSECUTIVE_FAILURES, VISIBLE_POLL_PERIOD};
use crate::types::{TransportMode, Variant, Visibility};

// ── SchedulePolicy ────────────────────────────────────────────────────────────

/// Per-variant poll behavior.
///
/// | | Foreground | Background |
/// |---|---|---|
/// | Visible period | 3 s | 3 s |
/// | Hidden period | 3 s | 10 s |
/// | Failure cutoff | none | 3 consecutive |
/// | Gated on auto-connect flag | no | yes, every tick |
/// | Transport | direct, falls back | always proxied |
/// | Error line | yes | no |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub visible_period: Duration,
    /// `None` keeps `visible_period` regardless of visibility.
    pub hidden_period: Option<Duration>,
    /// Consecutive failures after which the loop stops for good.
    pub max_consecutive_failures: Option<u32>,
    /// Re-check the auto-connect flag before every tick.
    pub requires_auto_connect: bool,
    /// Route fixed for the whole session.
    pub pinned_mode: Option<TransportMode>,
    /// Publish failure reasons to the status line.
    pub reports_errors: bool,
}

impl SchedulePolicy {
    pub fn foreground() -> Self {
        Self {
            visible_period: VISIBLE_POLL_PERIOD,
            hidden_period: None,
            max_consecutive_failures: None,
            requires_auto_connect: false,
            pinned_mode: None,
            reports_errors: true,
        }
    }

    pub fn background() -> Self {
        Self {
            visible_period: VISIBLE_POLL_PERIOD,
            hidden_period: Some(HIDDEN_POLL_PERIOD),
            max_consecutive_failures: Some(MAX_CONSECUTIVE_FAILURES),
            requires_auto_connect: true,
            pinned_mode: Some(TransportMode::Proxied),
            reports_errors: false,
        }
    }

    pub fn for_variant(variant: Variant) -> Self {
        match variant {
            Variant::Foreground => Self::foreground(),
            Variant::Background => Self::background(),
        }
    }

    /// Poll period for the given page visibility.
    pub fn period(&self, visibility: Visibility) -> Duration {
        match (visibility, self.hidden_period) {
            (Visibility::Hidden, Some(hidden)) => hidden,
            _ => self.visible_period,
        }
    }
}

// ── RetryBudget ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    failures: u32,
    limit: Option<u32>,
}

impl RetryBudget {
    pub fn new(limit: Option<u32>) -> Self {
        Self { failures: 0, limit }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Count one failure; `true` once the limit is reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        matches!(self.limit, Some(limit) if self.failures >= limit)
    }
}

// ── PollTimer ─────────────────────────────────────────────────────────────────

/// An interval that can be replaced or removed.
///
/// Re-arming always drops the old interval and starts the new period from
/// now, so a switch from 3 s to 10 s never fires at the remainder of the
/// old period.
#[derive(Debug, Default)]
pub struct PollTimer {
    interval: Option<Interval>,
    period: Option<Duration>,
}

impl PollTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm with `period` (or disarm with `None`). A no-op when the period is
    /// unchanged, so the phase of a running interval is kept.
    pub fn set(&mut self, period: Option<Duration>) {
        if period == self.period {
            return;
        }
        self.period = period;
        self.interval = period.map(|p| {
            let mut interval = interval_at(Instant::now() + p, p);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
    }

    /// Wait for the next firing. Pending forever while disarmed.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
