use std::time::Duration;

use tokio::{net::TcpStream, time::Instant};
use tokio_util::sync::CancellationToken;

/// How long to wait after a failed attempt, as a pure function of the
/// number of failures so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// As many attempts as fit into `timeout` at one per `interval`.
    pub fn within(timeout: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1.0
        } else {
            timeout.as_secs_f64() / interval.as_secs_f64()
        };
        Self::bounded(interval, attempts.ceil().clamp(1.0, u32::MAX as f64) as u32)
    }

    /// Delay before the next attempt after `failures` failed ones, or `None`
    /// once the attempts are exhausted.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures >= max => None,
            _ => Some(self.interval),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Exhausted { attempts: u32 },
    Cancelled,
}

/// Sleeps for `delay` unless cancelled first. Returns false on cancellation.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// One TCP connect bounded by `timeout`.
pub async fn probe_tcp(addr: &str, timeout: Duration) -> anyhow::Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(anyhow::anyhow!("connect {}: {}", addr, e)),
        Err(_) => Err(anyhow::anyhow!("connect {}: timed out", addr)),
    }
}

const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Repeats the TCP probe against `addr` following `policy`. With a `budget`
/// the whole probe, connects and pauses included, ends once it is spent.
pub async fn wait_ready(
    addr: &str,
    policy: BackoffPolicy,
    budget: Option<Duration>,
    cancel: &CancellationToken,
) -> Readiness {
    let deadline = budget.map(|budget| Instant::now() + budget);
    let connect_timeout = policy.interval.max(MIN_CONNECT_TIMEOUT);
    let mut failures = 0;
    loop {
        if cancel.is_cancelled() {
            return Readiness::Cancelled;
        }
        let timeout = match deadline {
            Some(deadline) => connect_timeout.min(remaining(deadline).max(MIN_CONNECT_TIMEOUT)),
            None => connect_timeout,
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return Readiness::Cancelled,
            result = probe_tcp(addr, timeout) => result,
        };
        match result {
            Ok(()) => return Readiness::Ready,
            Err(e) => {
                failures += 1;
                log::debug!("probe: attempt {} failed: {:#}", failures, e);
                let Some(mut delay) = policy.delay_for(failures) else {
                    return Readiness::Exhausted { attempts: failures };
                };
                if let Some(deadline) = deadline {
                    let left = remaining(deadline);
                    if left.is_zero() {
                        return Readiness::Exhausted { attempts: failures };
                    }
                    delay = delay.min(left);
                }
                if !pause(delay, cancel).await {
                    return Readiness::Cancelled;
                }
            }
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
