//! Bounded exponential backoff for subscription attempts
//!
//! [`SubscriptionAttempt`] is the per-interface state machine
//! `Unsubscribed -> Subscribing -> Subscribed`, with `Failed` once the
//! attempt budget of its [`BackoffPolicy`] is spent. It holds no I/O, so the
//! give-up rules are testable without a controller.

use crate::error::SubscriptionError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for `init` calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomize the upper half of each delay
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Policy without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = Duration::from_millis(base_ms as u64).min(self.max_delay);

        if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }
}

/// Equal jitter: half the delay plus a random share of the other half
fn apply_jitter(delay: Duration) -> Duration {
    let half_ms = delay.as_millis() as f64 / 2.0;
    if half_ms <= 0.0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis((half_ms + rng.gen_range(0.0..=half_ms)) as u64)
}

/// Subscription state of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing { attempt: u32 },
    Subscribed,
    Failed { last_error: SubscriptionError },
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    RetryAfter(Duration),
    GiveUp(SubscriptionError),
}

/// State machine driving one interface's subscription
#[derive(Debug, Clone)]
pub struct SubscriptionAttempt {
    policy: BackoffPolicy,
    attempts: u32,
    state: SubscriptionState,
}

impl SubscriptionAttempt {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            state: SubscriptionState::Unsubscribed,
        }
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Enter `Subscribing` for the next attempt and return its number
    pub fn begin(&mut self) -> u32 {
        self.attempts += 1;
        self.state = SubscriptionState::Subscribing {
            attempt: self.attempts,
        };
        self.attempts
    }

    pub fn succeeded(&mut self) {
        self.state = SubscriptionState::Subscribed;
    }

    /// Record a failed attempt and decide whether to try again
    pub fn failed(&mut self, error: SubscriptionError) -> NextStep {
        if self.attempts >= self.policy.max_attempts {
            self.state = SubscriptionState::Failed {
                last_error: error.clone(),
            };
            return NextStep::GiveUp(error);
        }
        NextStep::RetryAfter(self.policy.calculate_delay(self.attempts))
    }

    /// A subscribed interface stopped answering; start over
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.state = SubscriptionState::Unsubscribed;
    }
}
