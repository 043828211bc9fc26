// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Goal-level operations: start a server, deploy a blueprint, query
//! sensors, stop applications and servers. Each one is thin glue over the
//! polling engine, the forker and the registry, with the
//! teardown-on-failure cascade applied at this level.

use crate::blueprint;
use crate::client::{AppStatus, Orchestrator};
use crate::fork::{self, ForkSpec};
use crate::registry::{ForkRegistry, ShutdownOptions};
use crate::repeat::{self, ProbeResult, RetryPolicy, RunOutcome};
use crate::status;
use anyhow::{Result, bail};
use log::{debug, info, warn};
use std::fmt::Write as _;
use tokio::time::Duration;

/// Poll cadence for the server readiness probe; status waits use the
/// caller-configured cadence instead.
const SERVER_UP_POLL: Duration = Duration::from_secs(1);

/// Caller-configured polling cadence and overall deadline for waits against
/// the orchestration server.
#[derive(Debug, Clone, Copy)]
pub struct Waits {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Waits {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::every(self.poll_interval).deadline(self.timeout)
    }
}

pub struct StartOptions {
    pub spec: ForkSpec,
    pub shutdown: ShutdownOptions,
    /// Wait for the server to answer its readiness probe before returning.
    pub wait_for_up: bool,
}

/// Fork a server, register it for teardown, and (by default) wait until it
/// answers requests or its process exits, whichever happens first.
///
/// The process-exit check runs before the HTTP probe on every attempt: once
/// the process is gone the probe can only error, and "exited with code N"
/// is the diagnosis worth reporting. Connectivity errors while the server
/// is still coming up are swallowed until the deadline.
pub async fn start_server(
    api: &dyn Orchestrator,
    registry: &ForkRegistry,
    options: StartOptions,
    waits: Waits,
) -> Result<String> {
    let address = options.spec.address.clone();
    let handle = fork::fork(&options.spec)?;
    registry.register(handle.clone(), options.shutdown);

    if !options.wait_for_up {
        info!("Server starting at {address}");
        return Ok(address);
    }

    info!("Waiting for server at {address} to be ready within {:?}", waits.timeout);
    let policy = RetryPolicy::every(SERVER_UP_POLL).deadline(waits.timeout);
    let outcome = repeat::run(&policy, async || {
        if handle.has_exited() {
            return Ok(ProbeResult::FailFast(format!(
                "forked server exited unexpectedly (exit code {})",
                handle.exit_code(None).await
            )));
        }
        Ok(if api.is_up(&address).await? {
            ProbeResult::Succeed
        } else {
            ProbeResult::Continue
        })
    })
    .await?;

    match outcome {
        RunOutcome::Succeeded => {
            // Version is a nice-to-have in the build log, never a failure.
            match api.server_version(&address).await {
                Ok(version) => info!("Server at {address} is running (version {version})"),
                Err(e) => {
                    info!("Server running at {address}");
                    debug!("Failed to query server version: {e:#}");
                }
            }
            Ok(address)
        }
        RunOutcome::FailedFast(reason) => bail!(reason),
        RunOutcome::TimedOut => bail!(
            "server at {address} does not appear to be running after {:?}",
            waits.timeout
        ),
    }
}

pub struct DeployOptions {
    /// File path or URL of the blueprint.
    pub blueprint: String,
    /// Wait for the application to be RUNNING, failing the run otherwise.
    pub wait_for_running: bool,
    /// On a failed deployment, ask the server to stop the application
    /// before reporting the failure.
    pub stop_app_on_error: bool,
    /// Tear down every tracked fork if this operation fails.
    pub tear_down_on_failure: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            blueprint: String::new(),
            wait_for_running: true,
            stop_app_on_error: true,
            tear_down_on_failure: true,
        }
    }
}

/// Deploy a blueprint and return the new application's id.
pub async fn deploy(
    api: &dyn Orchestrator,
    registry: &ForkRegistry,
    server: &str,
    options: &DeployOptions,
    waits: Waits,
) -> Result<String> {
    let result = try_deploy(api, server, options, waits).await;
    with_teardown_on_failure(result, registry, api, options.tear_down_on_failure).await
}

async fn try_deploy(
    api: &dyn Orchestrator,
    server: &str,
    options: &DeployOptions,
    waits: Waits,
) -> Result<String> {
    let text = blueprint::load(&options.blueprint).await?;
    let task = api.create_from_blueprint(server, &text).await?;
    let app = task.entity_id.clone();
    info!("Deployed blueprint as application {app} (task {})", task.id);

    if options.wait_for_running {
        // Status fetch errors abort the wait here: the server answered the
        // deployment request, so an unreachable server is a real failure,
        // not "still converging".
        let final_status = status::wait_for_status(
            &format!("application {app}"),
            AppStatus::Running,
            AppStatus::shortcut_on_error(AppStatus::Running),
            async || api.application_status(server, &app).await,
            &waits.policy().rethrow_errors(),
        )
        .await?;
        if final_status != AppStatus::Running {
            let mut message =
                format!("application {app} should be RUNNING but is {final_status}. ");
            // The provisioning task's result is often the only clue to what
            // went wrong; fetch it best-effort for the failure message.
            match api.task_result(server, &task.id).await {
                Ok(Some(result)) => {
                    let _ = write!(message, "Task result: {}. ", render_json(&result));
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to fetch the result of task {}: {e:#}", task.id),
            }
            if options.stop_app_on_error {
                match api.invoke_stop(server, &app, waits.timeout.as_millis() as u64).await {
                    Ok(()) => message.push_str("The application was requested to stop."),
                    Err(e) => {
                        let _ = write!(
                            message,
                            "It was not possible to stop the application; its resources may still be running: {e:#}"
                        );
                    }
                }
            } else {
                message.push_str("It was not requested to stop; its resources may still be running.");
            }
            bail!(message);
        }
    }
    Ok(app)
}

pub struct SensorOptions {
    pub application: String,
    pub sensor: String,
    /// Only entities whose type matches this regex are queried.
    pub type_regex: String,
    /// Fail the run when no entity carries the sensor.
    pub fail_if_no_matches: bool,
    /// Wait for the application to be RUNNING before querying.
    pub wait_for_running: bool,
    pub tear_down_on_failure: bool,
}

/// Fetch a sensor's value from the application's entities and render it for
/// the property sink: a single match yields the bare value, several yield a
/// bracketed list.
pub async fn query_sensor(
    api: &dyn Orchestrator,
    registry: &ForkRegistry,
    server: &str,
    options: &SensorOptions,
    waits: Waits,
) -> Result<String> {
    let result = try_query_sensor(api, server, options, waits).await;
    with_teardown_on_failure(result, registry, api, options.tear_down_on_failure).await
}

async fn try_query_sensor(
    api: &dyn Orchestrator,
    server: &str,
    options: &SensorOptions,
    waits: Waits,
) -> Result<String> {
    let app = &options.application;
    if options.wait_for_running {
        status::wait_for_status_or_fail(
            &format!("application {app}"),
            AppStatus::Running,
            AppStatus::shortcut_on_error(AppStatus::Running),
            async || api.application_status(server, app).await,
            &waits.policy().rethrow_errors(),
        )
        .await?;
    }
    let matches = api
        .descendant_sensor(server, app, &options.sensor, &options.type_regex)
        .await?;
    if matches.is_empty() && options.fail_if_no_matches {
        bail!(
            "no entities in {app} matching {} have a value for {}",
            options.type_regex,
            options.sensor
        );
    }
    info!(
        "Matches for {} on {app}: {}",
        options.sensor,
        matches
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(render_sensor_values(&matches))
}

/// Strings render bare (no JSON quoting), everything else as JSON text.
fn render_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_sensor_values(
    matches: &std::collections::BTreeMap<String, serde_json::Value>,
) -> String {
    match matches.len() {
        1 => matches.values().map(render_json).collect(),
        _ => format!(
            "[{}]",
            matches.values().map(render_json).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Ask the server to stop an application. Failures are logged, not
/// propagated: this runs in cleanup positions where the build must go on.
pub async fn stop_application(api: &dyn Orchestrator, server: &str, app: &str, timeout: Duration) {
    info!("Stopping application {app}");
    if let Err(e) = api.invoke_stop(server, app, timeout.as_millis() as u64).await {
        warn!("Failed to stop application {app}: {e:#}");
    }
}

/// Ask a server to shut down; waits for the forked process when the server
/// is one of ours.
pub async fn stop_server(api: &dyn Orchestrator, registry: &ForkRegistry, options: &ShutdownOptions) {
    registry.teardown(options, api).await;
}

/// The failure cascade: a failed operation tears down every tracked fork
/// before the original error propagates. Teardown problems are logged by
/// the registry and never replace the triggering failure.
async fn with_teardown_on_failure<T>(
    result: Result<T>,
    registry: &ForkRegistry,
    api: &dyn Orchestrator,
    enabled: bool,
) -> Result<T> {
    if let Err(e) = &result
        && enabled
        && !registry.is_empty()
    {
        info!("Cleaning up forked servers after failure: {e:#}");
        registry.teardown_all(api).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TaskSummary;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedApi {
        up_script: Mutex<Vec<bool>>,
        status_script: Mutex<Vec<AppStatus>>,
        sensors: Mutex<BTreeMap<String, serde_json::Value>>,
        task_result: Mutex<Option<serde_json::Value>>,
        stops: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl ScriptedApi {
        fn with_statuses(statuses: &[AppStatus]) -> Self {
            let api = Self::default();
            *api.status_script.lock().unwrap() = statuses.to_vec();
            api
        }

        fn pop<T: Copy>(script: &Mutex<Vec<T>>) -> Option<T> {
            let mut script = script.lock().unwrap();
            if script.is_empty() { None } else { Some(script.remove(0)) }
        }
    }

    #[async_trait]
    impl Orchestrator for ScriptedApi {
        async fn is_up(&self, _server: &str) -> Result<bool> {
            Self::pop(&self.up_script).ok_or_else(|| anyhow!("connection refused"))
        }

        async fn server_version(&self, _server: &str) -> Result<String> {
            Ok("1.1.0".to_string())
        }

        async fn application_status(&self, _server: &str, _app: &str) -> Result<AppStatus> {
            Self::pop(&self.status_script).ok_or_else(|| anyhow!("status script exhausted"))
        }

        async fn task_result(
            &self,
            _server: &str,
            _task: &str,
        ) -> Result<Option<serde_json::Value>> {
            Ok(self.task_result.lock().unwrap().clone())
        }

        async fn create_from_blueprint(&self, _server: &str, blueprint: &str) -> Result<TaskSummary> {
            assert!(!blueprint.is_empty());
            Ok(TaskSummary {
                id: "task-1".to_string(),
                entity_id: "app-1".to_string(),
            })
        }

        async fn invoke_stop(&self, _server: &str, _app: &str, _timeout_ms: u64) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self, _options: &ShutdownOptions) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn descendant_sensor(
            &self,
            _server: &str,
            _app: &str,
            _sensor: &str,
            _type_regex: &str,
        ) -> Result<BTreeMap<String, serde_json::Value>> {
            Ok(self.sensors.lock().unwrap().clone())
        }
    }

    fn fast_waits() -> Waits {
        Waits {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    fn blueprint_file(dir: &std::path::Path) -> String {
        let path = dir.join("app.yaml");
        std::fs::write(&path, "name: app\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_deploy_returns_app_id_once_running() {
        let dir = tempfile::tempdir().unwrap();
        let api = ScriptedApi::with_statuses(&[AppStatus::Starting, AppStatus::Running]);
        let registry = ForkRegistry::new();
        let options = DeployOptions {
            blueprint: blueprint_file(dir.path()),
            ..DeployOptions::default()
        };
        let app = deploy(&api, &registry, "http://srv", &options, fast_waits())
            .await
            .unwrap();
        assert_eq!(app, "app-1");
        assert_eq!(api.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deploy_failure_stops_app_and_tears_down_forks() {
        let dir = tempfile::tempdir().unwrap();
        let api = ScriptedApi::with_statuses(&[AppStatus::Starting, AppStatus::Error]);
        let registry = ForkRegistry::new();
        let handle = fork::fork(&crate::fork::tests::sh("http://srv", dir.path(), "exit 0")).unwrap();
        registry.register(handle, ShutdownOptions::for_server("http://srv"));

        let options = DeployOptions {
            blueprint: blueprint_file(dir.path()),
            ..DeployOptions::default()
        };
        let err = deploy(&api, &registry, "http://srv", &options, fast_waits())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("app-1"), "unexpected message: {message}");
        assert!(message.contains("ERROR"), "unexpected message: {message}");
        assert_eq!(api.stops.load(Ordering::SeqCst), 1, "app should be asked to stop");
        assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1, "fork should be torn down");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_failure_reports_task_result() {
        let dir = tempfile::tempdir().unwrap();
        let api = ScriptedApi::with_statuses(&[AppStatus::Error]);
        *api.task_result.lock().unwrap() =
            Some(serde_json::json!("Failure running task provisioning: out of quota"));
        let registry = ForkRegistry::new();
        let options = DeployOptions {
            blueprint: blueprint_file(dir.path()),
            ..DeployOptions::default()
        };
        let err = deploy(&api, &registry, "http://srv", &options, fast_waits())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("Task result: Failure running task provisioning: out of quota"),
            "unexpected message: {message}"
        );
    }

    #[tokio::test]
    async fn test_deploy_failure_without_cascade_leaves_forks_alone() {
        let dir = tempfile::tempdir().unwrap();
        let api = ScriptedApi::with_statuses(&[AppStatus::Error]);
        let registry = ForkRegistry::new();
        let handle = fork::fork(&crate::fork::tests::sh("http://srv", dir.path(), "exit 0")).unwrap();
        registry.register(handle, ShutdownOptions::for_server("http://srv"));

        let options = DeployOptions {
            blueprint: blueprint_file(dir.path()),
            stop_app_on_error: false,
            tear_down_on_failure: false,
            ..DeployOptions::default()
        };
        let err = deploy(&api, &registry, "http://srv", &options, fast_waits())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not requested to stop"));
        assert_eq!(api.stops.load(Ordering::SeqCst), 0);
        assert_eq!(api.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_start_server_waits_for_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let api = ScriptedApi::default();
        *api.up_script.lock().unwrap() = vec![false, true];
        let registry = ForkRegistry::new();
        let options = StartOptions {
            spec: crate::fork::tests::sh("http://srv", dir.path(), "sleep 60"),
            shutdown: ShutdownOptions::for_server("http://srv"),
            wait_for_up: true,
        };
        let waits = Waits {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(10),
        };
        let address = start_server(&api, &registry, options, waits).await.unwrap();
        assert_eq!(address, "http://srv");
        assert_eq!(registry.len(), 1);

        registry.teardown_all(&api).await;
    }

    #[tokio::test]
    async fn test_start_server_reports_early_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let api = ScriptedApi::default();
        // Enough "not up yet" answers to outlast the child.
        *api.up_script.lock().unwrap() = vec![false; 30];
        let registry = ForkRegistry::new();
        let options = StartOptions {
            spec: crate::fork::tests::sh("http://srv", dir.path(), "exit 3"),
            shutdown: ShutdownOptions::for_server("http://srv"),
            wait_for_up: true,
        };
        let waits = Waits {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(30),
        };
        let err = start_server(&api, &registry, options, waits).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"), "unexpected message: {message}");
    }

    #[tokio::test]
    async fn test_query_sensor_single_match_is_bare_value() {
        let api = ScriptedApi::default();
        api.sensors
            .lock()
            .unwrap()
            .insert("e1".to_string(), serde_json::json!("http://10.0.0.1:8080"));
        let registry = ForkRegistry::new();
        let options = SensorOptions {
            application: "app-1".to_string(),
            sensor: "main.uri".to_string(),
            type_regex: ".*".to_string(),
            fail_if_no_matches: false,
            wait_for_running: false,
            tear_down_on_failure: true,
        };
        let value = query_sensor(&api, &registry, "http://srv", &options, fast_waits())
            .await
            .unwrap();
        assert_eq!(value, "http://10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_query_sensor_no_matches_can_fail_the_run() {
        let api = ScriptedApi::default();
        let registry = ForkRegistry::new();
        let options = SensorOptions {
            application: "app-1".to_string(),
            sensor: "main.uri".to_string(),
            type_regex: "com[.]example[.].*".to_string(),
            fail_if_no_matches: true,
            wait_for_running: false,
            tear_down_on_failure: true,
        };
        let err = query_sensor(&api, &registry, "http://srv", &options, fast_waits())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("main.uri"));
    }

    #[test]
    fn test_render_sensor_values_multiple_matches() {
        let mut matches = BTreeMap::new();
        matches.insert("e1".to_string(), serde_json::json!(8080));
        matches.insert("e2".to_string(), serde_json::json!("b"));
        assert_eq!(render_sensor_values(&matches), "[8080, b]");
    }

    #[tokio::test]
    async fn test_stop_application_swallows_errors() {
        struct DownApi;
        #[async_trait]
        impl Orchestrator for DownApi {
            async fn is_up(&self, _: &str) -> Result<bool> {
                Err(anyhow!("down"))
            }
            async fn server_version(&self, _: &str) -> Result<String> {
                Err(anyhow!("down"))
            }
            async fn application_status(&self, _: &str, _: &str) -> Result<AppStatus> {
                Err(anyhow!("down"))
            }
            async fn task_result(&self, _: &str, _: &str) -> Result<Option<serde_json::Value>> {
                Err(anyhow!("down"))
            }
            async fn create_from_blueprint(&self, _: &str, _: &str) -> Result<TaskSummary> {
                Err(anyhow!("down"))
            }
            async fn invoke_stop(&self, _: &str, _: &str, _: u64) -> Result<()> {
                Err(anyhow!("down"))
            }
            async fn shutdown(&self, _: &ShutdownOptions) -> Result<()> {
                Err(anyhow!("down"))
            }
            async fn descendant_sensor(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<BTreeMap<String, serde_json::Value>> {
                Err(anyhow!("down"))
            }
        }
        stop_application(&DownApi, "http://srv", "app-1", Duration::from_secs(1)).await;
    }
}
