//! The single poll-until-condition primitive used by every wait site.

use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Hands out attempt slots until the deadline passes or the run is cancelled.
///
/// ```ignore
/// let mut poller = Poller::new(policy, &cancel);
/// while poller.tick().await.is_ok() {
///     if condition() { break; }
/// }
/// ```
///
/// The first `tick` returns immediately; later ticks sleep for the interval,
/// clamped to the deadline, so one final attempt always happens at the
/// deadline itself.
pub struct Poller<'a> {
    policy: PollPolicy,
    deadline: Instant,
    cancel: &'a CancellationToken,
    attempts: u32,
}

impl<'a> Poller<'a> {
    pub fn new(policy: PollPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            deadline: Instant::now() + policy.timeout,
            cancel,
            attempts: 0,
        }
    }

    pub async fn tick(&mut self) -> Result<u32, WaitError> {
        if self.cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        if self.attempts > 0 {
            let now = Instant::now();
            if now >= self.deadline {
                return Err(WaitError::Timeout(self.policy.timeout));
            }
            let pause = self.policy.interval.min(self.deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = sleep(pause) => {}
            }
        }

        self.attempts += 1;
        Ok(self.attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Sleep that wakes early, with an error, when the run is cancelled.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), WaitError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        _ = sleep(duration) => Ok(()),
    }
}
