// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::client::Orchestrator;
use crate::fork::{EXIT_CODE_UNRESOLVED, ForkHandle};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Duration;

/// Local wait for a forked process to exit when the shutdown options carry
/// no deadline of their own.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(90);

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);

/// How to ask one server to shut down. Paired with its fork handle in the
/// registry at registration time; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub server: String,
    /// Stop child applications before the server itself.
    pub stop_all_applications: bool,
    /// Proceed with the shutdown even if stopping applications errored.
    pub force_shutdown_on_error: bool,
    /// Server-side shutdown deadline. `None` lets the server take as long as
    /// it needs; the local wait for process exit stays bounded either way
    /// (see [`DEFAULT_STOP_TIMEOUT`]).
    pub timeout: Option<Duration>,
}

impl ShutdownOptions {
    pub fn for_server(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            stop_all_applications: true,
            force_shutdown_on_error: true,
            timeout: None,
        }
    }
}

struct ForkEntry {
    handle: ForkHandle,
    options: ShutdownOptions,
}

/// Tracks every live forked server for later teardown.
///
/// One registry per invocation, passed by reference to whoever needs the
/// failure cascade. The lock guards only the map; shutdown requests and exit
/// waits happen outside it, so tearing one server down never blocks
/// registering or tearing down another.
pub struct ForkRegistry {
    forks: Mutex<HashMap<String, ForkEntry>>,
}

impl ForkRegistry {
    pub fn new() -> Self {
        Self {
            forks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ForkEntry>> {
        // A poisoned lock only means some teardown panicked mid-map-update;
        // the map itself is still usable for cleanup.
        self.forks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a fork under its address. The newest fork wins on a duplicate
    /// address; the previous entry is dropped with a warning since it likely
    /// means a leaked earlier fork.
    pub fn register(&self, handle: ForkHandle, options: ShutdownOptions) {
        let address = handle.address().to_string();
        let previous = self.lock().insert(address.clone(), ForkEntry { handle, options });
        if let Some(prev) = previous {
            warn!(
                "[{address}] replacing tracked fork (pid={}); the previous process may still be running",
                prev.handle.pid()
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tear down the server addressed by `options`: request a remote
    /// shutdown and, if the server was forked by us, wait (bounded) for the
    /// process to exit, escalating to SIGKILL if it does not.
    ///
    /// A shutdown request is issued even for addresses we never forked,
    /// matching the stop-server operation against externally started
    /// servers. All errors are logged, never returned: teardown is
    /// best-effort cleanup.
    pub async fn teardown(&self, options: &ShutdownOptions, api: &dyn Orchestrator) {
        let entry = self.lock().remove(&options.server);
        match entry {
            Some(entry) => do_teardown(options, Some(entry.handle), api).await,
            None => do_teardown(options, None, api).await,
        }
    }

    /// Tear down one *tracked* fork. The entry is removed atomically up
    /// front, so of two concurrent calls for one address exactly one
    /// performs the shutdown and the exit wait; the other returns `false`
    /// without side effects.
    pub async fn teardown_one(&self, address: &str, api: &dyn Orchestrator) -> bool {
        let entry = self.lock().remove(address);
        match entry {
            Some(entry) => {
                do_teardown(&entry.options, Some(entry.handle), api).await;
                true
            }
            None => {
                debug!("[{address}] not tracked, nothing to tear down");
                false
            }
        }
    }

    /// Tear down every tracked fork. Entries are popped one at a time under
    /// the lock, so a concurrent [`teardown`](Self::teardown) of the same
    /// address cannot double-free it. Order across entries is unspecified.
    pub async fn teardown_all(&self, api: &dyn Orchestrator) {
        loop {
            let entry = {
                let mut forks = self.lock();
                let key = forks.keys().next().cloned();
                key.and_then(|k| forks.remove(&k))
            };
            let Some(entry) = entry else { break };
            do_teardown(&entry.options, Some(entry.handle), api).await;
        }
    }
}

impl Default for ForkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote shutdown first, local exit wait second: a server cannot be
/// observed to exit before being told to stop.
async fn do_teardown(options: &ShutdownOptions, handle: Option<ForkHandle>, api: &dyn Orchestrator) {
    info!(
        "Stopping server at {} (stop_apps={}, force={}, timeout={:?})",
        options.server, options.stop_all_applications, options.force_shutdown_on_error, options.timeout
    );
    if let Err(e) = api.shutdown(options).await {
        warn!("Failed to request shutdown of {}: {e:#}", options.server);
    }

    let Some(handle) = handle else {
        debug!("No forked process tracked for {}; not waiting for exit", options.server);
        return;
    };
    let wait = options.timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
    debug!("[{}] waiting up to {wait:?} for forked process to exit", options.server);
    let code = handle.exit_code(Some(wait)).await;
    if code == EXIT_CODE_UNRESOLVED {
        warn!(
            "[{}] still running after {wait:?}, sending SIGKILL",
            options.server
        );
        handle.send_signal(Signal::SIGKILL);
        if handle.exit_code(Some(SIGKILL_TIMEOUT)).await == EXIT_CODE_UNRESOLVED {
            warn!("[{}] still running after SIGKILL, giving up", options.server);
        }
    } else {
        debug!("[{}] forked process exited with code {code}", options.server);
    }
}
