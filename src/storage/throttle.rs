use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleConfig {
    pub interval: Duration,
    pub percent_step: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            percent_step: 1,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ThrottleState {
    last_update: Option<Instant>,
    last_percent_floor: u32,
}

/// Rate limiter for `(received, total)` byte callbacks.
///
/// The first update after construction or [`reset`](Self::reset) and every
/// update with `received >= total` always pass. Anything in between passes
/// once the interval elapsed or the whole-percent value moved by at least
/// `percent_step`.
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    config: ThrottleConfig,
    state: ThrottleState,
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

impl ProgressThrottler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: ThrottleState::default(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn admit(&mut self, received: u64, total: u64) -> bool {
        self.admit_at(received, total, Instant::now())
    }

    pub fn admit_at(&mut self, received: u64, total: u64, now: Instant) -> bool {
        if total == 0 {
            return false;
        }

        let floor = percent_floor(received, total);
        let forward = match self.state.last_update {
            None => true,
            Some(_) if received >= total => true,
            Some(last) => {
                now.saturating_duration_since(last) > self.config.interval
                    || floor.abs_diff(self.state.last_percent_floor) >= self.config.percent_step
            }
        };

        if forward {
            self.state.last_update = Some(now);
            self.state.last_percent_floor = floor;
        }
        forward
    }

    /// Invokes `callback` when the update passes the throttle.
    pub fn forward<F>(&mut self, received: u64, total: u64, callback: F) -> bool
    where
        F: FnOnce(u64, u64),
    {
        let admitted = self.admit(received, total);
        if admitted {
            callback(received, total);
        }
        admitted
    }

    pub fn reset(&mut self) {
        self.state = ThrottleState::default();
    }
}

fn percent_floor(received: u64, total: u64) -> u32 {
    if received >= total {
        return 100;
    }
    ((received as u128 * 100) / total as u128) as u32
}
