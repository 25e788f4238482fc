use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest delay exponential backoff will ever produce
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Delay between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(rename = "delay")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(rename = "delay")]
        delay_ms: u64,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self::Exponential {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay before the next attempt once `attempts_made` attempts failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                let delay = delay_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(delay).min(MAX_BACKOFF)
            }
        }
    }
}

/// What to do with a finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    Remove,
    Keep,
    KeepLast(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    /// Initial delay before the first attempt
    #[serde(default)]
    pub delay_ms: u64,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
}

impl JobOptions {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts,
            backoff,
            delay_ms: 0,
            priority: 0,
            remove_on_complete: Retention::Keep,
            remove_on_fail: Retention::Keep,
        }
    }

    pub fn keep(mut self, completed: usize, failed: usize) -> Self {
        self.remove_on_complete = Retention::KeepLast(completed);
        self.remove_on_fail = Retention::KeepLast(failed);
        self
    }

    /// Per-job overrides win over queue defaults.
    pub fn merged(&self, overrides: &JobOverrides) -> Self {
        Self {
            attempts: overrides.attempts.unwrap_or(self.attempts).max(1),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            delay_ms: overrides
                .delay
                .map(|d| d.as_millis() as u64)
                .unwrap_or(self.delay_ms),
            priority: overrides.priority.unwrap_or(self.priority),
            remove_on_complete: overrides
                .remove_on_complete
                .unwrap_or(self.remove_on_complete),
            remove_on_fail: overrides.remove_on_fail.unwrap_or(self.remove_on_fail),
        }
    }
}

/// Per-job options supplied at enqueue time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOverrides {
    /// Caller-chosen id; enqueueing an id that already exists is a no-op
    pub job_id: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub delay: Option<Duration>,
    pub priority: Option<i32>,
    pub remove_on_complete: Option<Retention>,
    pub remove_on_fail: Option<Retention>,
}

impl JobOverrides {
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::exponential(Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(20));
        assert_eq!(backoff.delay_for(40), MAX_BACKOFF);
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(Duration::from_secs(30));
        assert_eq!(backoff.delay_for(1), backoff.delay_for(5));
    }

    #[test]
    fn test_overrides_merge() {
        let defaults = JobOptions::new(3, Backoff::fixed(Duration::from_secs(1))).keep(10, 5);
        let merged = defaults.merged(&JobOverrides::default().attempts(7).priority(2));
        assert_eq!(merged.attempts, 7);
        assert_eq!(merged.priority, 2);
        assert_eq!(merged.remove_on_complete, Retention::KeepLast(10));
        assert_eq!(merged.backoff, defaults.backoff);
    }

    #[test]
    fn test_options_wire_shape() {
        let options = JobOptions::new(5, Backoff::exponential(Duration::from_secs(3))).keep(1000, 100);
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["backoff"]["type"], "exponential");
        assert_eq!(json["backoff"]["delay"], 3000);
        assert_eq!(json["removeOnComplete"]["keep_last"], 1000);
    }
}
