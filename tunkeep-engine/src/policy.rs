//! Reconnect policy
//!
//! A pure decision over the controller's reconnect bookkeeping. The checks
//! run in a fixed order: user stop, retry already pending, cooldown after the
//! last successful connect, attempt limit, and finally an exponential delay.

use std::time::Duration;

/// Tunables for automatic reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            cooldown: Duration::from_millis(10_000),
        }
    }
}

/// Inputs to a single decision
#[derive(Debug, Clone, Copy)]
pub struct ReconnectContext {
    /// Attempts already made since the last successful connect
    pub attempt: u32,
    /// Time since the last successful connect, if there was one
    pub since_last_connect: Option<Duration>,
    pub user_stopped: bool,
    pub already_reconnecting: bool,
}

/// Why a loss signal was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UserStopped,
    AlreadyReconnecting,
    Cooldown,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UserStopped => write!(f, "stopped by user"),
            SkipReason::AlreadyReconnecting => write!(f, "reconnect already in progress"),
            SkipReason::Cooldown => write!(f, "within cooldown after last connect"),
        }
    }
}

/// Outcome of [`ReconnectPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Do nothing, the tunnel stays as it is
    Skip(SkipReason),
    /// Attempts are exhausted
    GiveUp,
    /// Retry as attempt number `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
}

impl ReconnectPolicy {
    pub fn decide(&self, ctx: &ReconnectContext) -> ReconnectDecision {
        if ctx.user_stopped {
            return ReconnectDecision::Skip(SkipReason::UserStopped);
        }
        if ctx.already_reconnecting {
            return ReconnectDecision::Skip(SkipReason::AlreadyReconnecting);
        }
        if let Some(elapsed) = ctx.since_last_connect {
            if elapsed < self.cooldown {
                return ReconnectDecision::Skip(SkipReason::Cooldown);
            }
        }
        if ctx.attempt >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }

        let attempt = ctx.attempt + 1;
        ReconnectDecision::Retry {
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    /// Backoff for the 1-based `attempt`: `base * 2^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
