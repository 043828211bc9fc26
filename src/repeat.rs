// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Result, ensure};
use log::debug;
use tokio::time::{Duration, Instant, sleep};

/// Outcome of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Not there yet, keep polling.
    Continue,
    /// Converged, stop the loop.
    Succeed,
    /// A state was observed from which convergence is impossible. Stops the
    /// loop immediately instead of burning the rest of the deadline.
    FailFast(String),
}

/// Final outcome of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    FailedFast(String),
    TimedOut,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        *self == RunOutcome::Succeeded
    }
}

/// How `run` treats an `Err` from the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Treat the error like `Continue` until the deadline expires.
    RetryUntilDeadline,
    /// Abort the loop and propagate the first error.
    Rethrow,
}

/// Cadence and deadline for one retry loop.
///
/// `deadline: None` means no deadline at all: the loop runs until the probe
/// settles. A zero deadline is an ordinary deadline that expires after the
/// first probe. Zero is never used to mean "forever".
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    pub deadline: Option<Duration>,
    pub on_error: ErrorMode,
}

impl RetryPolicy {
    /// A policy polling at the given interval, with no deadline, swallowing
    /// probe errors.
    pub fn every(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            deadline: None,
            on_error: ErrorMode::RetryUntilDeadline,
        }
    }

    pub fn deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    pub fn rethrow_errors(mut self) -> Self {
        self.on_error = ErrorMode::Rethrow;
        self
    }
}

/// Invoke `probe` immediately and then on every tick of
/// `policy.poll_interval` until it succeeds, fails fast, or the deadline
/// elapses.
///
/// Holds no shared state; concurrent loops never interfere. The only
/// suspension point is the sleep between attempts, so dropping the returned
/// future cancels the loop cleanly.
pub async fn run(
    policy: &RetryPolicy,
    mut probe: impl AsyncFnMut() -> Result<ProbeResult>,
) -> Result<RunOutcome> {
    ensure!(
        policy.poll_interval > Duration::ZERO,
        "retry poll interval must be positive"
    );
    let started = Instant::now();
    loop {
        match probe().await {
            Ok(ProbeResult::Succeed) => return Ok(RunOutcome::Succeeded),
            Ok(ProbeResult::FailFast(reason)) => return Ok(RunOutcome::FailedFast(reason)),
            Ok(ProbeResult::Continue) => {}
            Err(e) => match policy.on_error {
                ErrorMode::Rethrow => return Err(e),
                ErrorMode::RetryUntilDeadline => debug!("probe not ready: {e:#}"),
            },
        }
        if let Some(limit) = policy.deadline
            && started.elapsed() >= limit
        {
            return Ok(RunOutcome::TimedOut);
        }
        sleep(policy.poll_interval).await;
    }
}
