// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::repeat::{self, ProbeResult, RetryPolicy};
use anyhow::{Result, bail};
use log::{debug, info, warn};
use std::fmt::Display;

/// Poll `fetch` until the observed status equals `desired`, a terminal
/// failure is observed, or the policy's deadline elapses.
///
/// Returns the last observed status in every case; "did not converge" is for
/// the caller to judge, not an error. Fetch errors follow the policy's error
/// mode, so a waiter against an unreachable server can still surface that
/// instead of masking it as "not converged".
pub async fn wait_for_status<S>(
    resource: &str,
    desired: S,
    is_terminal_failure: impl Fn(S) -> bool,
    mut fetch: impl AsyncFnMut() -> Result<S>,
    policy: &RetryPolicy,
) -> Result<S>
where
    S: PartialEq + Copy + Display,
{
    info!(
        "Waiting {} for {resource} to be {desired}",
        describe_deadline(policy)
    );
    let mut last: Option<S> = None;
    repeat::run(policy, async || {
        let status = fetch().await?;
        debug!("{resource} status is {status}");
        last = Some(status);
        Ok(if status == desired {
            ProbeResult::Succeed
        } else if is_terminal_failure(status) {
            ProbeResult::FailFast(format!("{resource} reached terminal status {status}"))
        } else {
            ProbeResult::Continue
        })
    })
    .await?;
    match last {
        Some(status) if status == desired => {
            info!("{resource} is {desired}");
            Ok(status)
        }
        Some(status) => {
            warn!(
                "{resource} is not {desired} within {}. Status is: {status}",
                describe_deadline(policy)
            );
            Ok(status)
        }
        None => bail!("no status observed for {resource} within {}", describe_deadline(policy)),
    }
}

/// Strict variant of [`wait_for_status`]: errors unless the final status
/// equals `desired`, naming the resource, both statuses, and the deadline.
pub async fn wait_for_status_or_fail<S>(
    resource: &str,
    desired: S,
    is_terminal_failure: impl Fn(S) -> bool,
    fetch: impl AsyncFnMut() -> Result<S>,
    policy: &RetryPolicy,
) -> Result<S>
where
    S: PartialEq + Copy + Display,
{
    let status = wait_for_status(resource, desired, is_terminal_failure, fetch, policy).await?;
    if status != desired {
        bail!(
            "{resource} is not {desired} within {}. Is: {status}",
            describe_deadline(policy)
        );
    }
    Ok(status)
}

fn describe_deadline(policy: &RetryPolicy) -> String {
    match policy.deadline {
        Some(limit) => format!("{limit:?}"),
        None => "unbounded".to_string(),
    }
}
