// Named fixed-period timers driving the coordinator loop

use pebl_common::TimingConfig;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Transfer and sync status projection
    Status,
    /// Physical device removal detection
    DeviceRemoval,
    /// Remote quota refresh
    QuotaRefresh,
    /// Display idle check
    IdleCheck,
}

pub struct TickSchedule {
    status: Interval,
    removal: Interval,
    quota: Interval,
    idle: Interval,
}

impl TickSchedule {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            status: interval(timing.status_poll()),
            removal: interval(timing.removal_poll()),
            quota: interval(timing.quota_refresh()),
            idle: interval(timing.idle_check()),
        }
    }

    /// Wait for the next timer; status ticks win when several are due
    pub async fn next(&mut self) -> Tick {
        tokio::select! {
            biased;
            _ = self.status.tick() => Tick::Status,
            _ = self.removal.tick() => Tick::DeviceRemoval,
            _ = self.idle.tick() => Tick::IdleCheck,
            _ = self.quota.tick() => Tick::QuotaRefresh,
        }
    }
}

/// Late ticks are skipped rather than replayed in a burst
fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
