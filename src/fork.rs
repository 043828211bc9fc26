// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

/// Returned by [`ForkHandle::exit_code`] when the process has not exited
/// within the given wait.
pub const EXIT_CODE_UNRESOLVED: i32 = -1;

/// Everything needed to launch one external server process.
#[derive(Debug, Clone)]
pub struct ForkSpec {
    /// Logical endpoint of the server the process will run, e.g.
    /// `http://127.0.0.1:8081`. Used as the registry key and in logs.
    pub address: String,
    /// Working directory for the child; created if absent.
    pub work_dir: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    /// Overlay on the inherited environment.
    pub env: Vec<(String, String)>,
}

/// A live forked server process.
///
/// The exit code is published through a watch channel by a background wait
/// task, so any number of readers can poll or await it without owning the
/// child. Clones observe the same process; the registry holds the clone
/// that drives teardown.
#[derive(Clone)]
pub struct ForkHandle {
    address: String,
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
}

/// Spawn the process described by `spec` and return a handle to it.
///
/// Returns as soon as the process is running; whether the service inside it
/// is answering requests is a separate concern layered on top. Must be called
/// from within a tokio runtime (the exit-wait task is spawned onto it).
pub fn fork(spec: &ForkSpec) -> Result<ForkHandle> {
    std::fs::create_dir_all(&spec.work_dir)
        .with_context(|| format!("creating work directory {}", spec.work_dir.display()))?;

    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args).current_dir(&spec.work_dir);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("[{}] failed to spawn: {}", spec.address, spec.executable))?;
    let pid = child.id().unwrap_or(0);
    info!("[{}] spawned (pid={pid}, cmd={})", spec.address, spec.executable);

    let (tx, rx) = watch::channel(None);
    let address = spec.address.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => {
                info!("[{address}] exited with {status}");
                status
                    .code()
                    .or_else(|| status.signal().map(|sig| 128 + sig))
                    .unwrap_or(EXIT_CODE_UNRESOLVED)
            }
            Err(e) => {
                warn!("[{address}] failed to wait for child: {e}");
                EXIT_CODE_UNRESOLVED
            }
        };
        let _ = tx.send(Some(code));
    });

    Ok(ForkHandle {
        address: spec.address.clone(),
        pid,
        exit: rx,
    })
}

impl ForkHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking: has the process exited.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait up to `limit` for the exit code (`None` = wait forever).
    /// Returns [`EXIT_CODE_UNRESOLVED`] if the process is still running when
    /// the limit expires, so teardown paths never hang on a misbehaving
    /// child.
    pub async fn exit_code(&self, limit: Option<Duration>) -> i32 {
        let mut rx = self.exit.clone();
        let wait = async move {
            loop {
                if let Some(code) = *rx.borrow_and_update() {
                    return code;
                }
                if rx.changed().await.is_err() {
                    return EXIT_CODE_UNRESOLVED;
                }
            }
        };
        match limit {
            Some(limit) => timeout(limit, wait).await.unwrap_or(EXIT_CODE_UNRESOLVED),
            None => wait.await,
        }
    }

    /// Best-effort signal delivery; failures are logged, not returned.
    pub fn send_signal(&self, sig: Signal) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), sig) {
            warn!("[{}] failed to send {sig}: {e}", self.address);
        }
    }
}
