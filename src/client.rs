// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::registry::ShutdownOptions;
use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application status as reported by the orchestration server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Accepted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Error,
    #[serde(other)]
    Unknown,
}

impl AppStatus {
    /// Predicate for the waiter's early exit: ERROR and UNKNOWN are terminal
    /// unless they are themselves the desired status.
    pub fn shortcut_on_error(desired: AppStatus) -> impl Fn(AppStatus) -> bool {
        let shortcut = !matches!(desired, AppStatus::Error | AppStatus::Unknown);
        move |status| shortcut && matches!(status, AppStatus::Error | AppStatus::Unknown)
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppStatus::Accepted => "ACCEPTED",
            AppStatus::Starting => "STARTING",
            AppStatus::Running => "RUNNING",
            AppStatus::Stopping => "STOPPING",
            AppStatus::Stopped => "STOPPED",
            AppStatus::Destroyed => "DESTROYED",
            AppStatus::Error => "ERROR",
            AppStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Server's answer to a blueprint deployment: the provisioning task and the
/// entity id of the new application.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
}

#[derive(Debug, Deserialize)]
struct ApplicationSummary {
    status: AppStatus,
}

#[derive(Debug, Deserialize)]
struct ActivitySummary {
    result: Option<serde_json::Value>,
}

/// The orchestration server's REST surface, as far as this tool needs it.
/// Kept behind a trait so the polling and teardown machinery can be tested
/// against a scripted implementation.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Readiness probe: is the server answering requests.
    async fn is_up(&self, server: &str) -> Result<bool>;

    /// Version string reported by a running server.
    async fn server_version(&self, server: &str) -> Result<String>;

    async fn application_status(&self, server: &str, app: &str) -> Result<AppStatus>;

    /// Result of a task, if the server reports one. Useful as a failure
    /// diagnostic once a provisioning task has gone bad.
    async fn task_result(&self, server: &str, task: &str) -> Result<Option<serde_json::Value>>;

    /// Submit a blueprint for deployment. Errors on a non-2xx response.
    async fn create_from_blueprint(&self, server: &str, blueprint: &str) -> Result<TaskSummary>;

    /// Invoke the application's `stop` effector.
    async fn invoke_stop(&self, server: &str, app: &str, timeout_ms: u64) -> Result<()>;

    /// Ask the server to shut itself down.
    async fn shutdown(&self, options: &ShutdownOptions) -> Result<()>;

    /// Values of `sensor` on all descendants of `app` whose type matches
    /// `type_regex`, keyed by entity id.
    async fn descendant_sensor(
        &self,
        server: &str,
        app: &str,
        sensor: &str,
        type_regex: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>>;
}

/// reqwest-backed [`Orchestrator`] with optional basic-auth credentials.
pub struct RestClient {
    http: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl RestClient {
    pub fn new(credentials: Option<(String, String)>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self { http, credentials })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some((user, password)) = &self.credentials {
            builder = builder.basic_auth(user, Some(password));
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder.send().await.with_context(|| format!("request failed: {what}"))?;
        ensure!(
            response.status().is_success(),
            "unexpected response to {what}: {}",
            response.status()
        );
        Ok(response)
    }
}

fn endpoint(server: &str, path: &str) -> String {
    format!("{}{path}", server.trim_end_matches('/'))
}

// Older servers answer the version query with a bare string, newer ones
// with a summary object.
fn render_version(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("version")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

#[async_trait]
impl Orchestrator for RestClient {
    async fn is_up(&self, server: &str) -> Result<bool> {
        let url = endpoint(server, "/v1/server/up");
        let response = self
            .send(self.request(reqwest::Method::GET, url), "server readiness probe")
            .await?;
        response.json().await.context("parsing server readiness response")
    }

    async fn server_version(&self, server: &str) -> Result<String> {
        let url = endpoint(server, "/v1/server/version");
        let response = self
            .send(self.request(reqwest::Method::GET, url), "server version query")
            .await?;
        let value: serde_json::Value =
            response.json().await.context("parsing server version response")?;
        Ok(render_version(&value))
    }

    async fn application_status(&self, server: &str, app: &str) -> Result<AppStatus> {
        let url = endpoint(server, &format!("/v1/applications/{app}"));
        let response = self
            .send(self.request(reqwest::Method::GET, url), "application status query")
            .await?;
        let summary: ApplicationSummary =
            response.json().await.context("parsing application summary")?;
        Ok(summary.status)
    }

    async fn task_result(&self, server: &str, task: &str) -> Result<Option<serde_json::Value>> {
        let url = endpoint(server, &format!("/v1/activities/{task}"));
        let response = self
            .send(self.request(reqwest::Method::GET, url), "task result query")
            .await?;
        let summary: ActivitySummary =
            response.json().await.context("parsing activity summary")?;
        Ok(summary.result)
    }

    async fn create_from_blueprint(&self, server: &str, blueprint: &str) -> Result<TaskSummary> {
        let url = endpoint(server, "/v1/applications");
        let builder = self
            .request(reqwest::Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, "application/yaml")
            .body(blueprint.to_string());
        let response = self.send(builder, "blueprint deployment").await?;
        response.json().await.context("parsing deployment task summary")
    }

    async fn invoke_stop(&self, server: &str, app: &str, timeout_ms: u64) -> Result<()> {
        let url = endpoint(
            server,
            &format!("/v1/applications/{app}/entities/{app}/effectors/stop"),
        );
        let builder = self
            .request(reqwest::Method::POST, url)
            .query(&[("timeout", timeout_ms.to_string())])
            .json(&serde_json::json!({}));
        self.send(builder, "stop effector invocation").await?;
        Ok(())
    }

    async fn shutdown(&self, options: &ShutdownOptions) -> Result<()> {
        let url = endpoint(&options.server, "/v1/server/shutdown");
        // A missing timeout goes out as "0", which the server reads as
        // "no deadline". The local exit wait stays bounded regardless.
        let timeout_ms = options
            .timeout
            .map(|t| t.as_millis().to_string())
            .unwrap_or_else(|| "0".to_string());
        let builder = self.request(reqwest::Method::POST, url).form(&[
            ("stopAppsFirst", options.stop_all_applications.to_string()),
            ("forceShutdownOnError", options.force_shutdown_on_error.to_string()),
            ("shutdownTimeout", timeout_ms.clone()),
            ("requestTimeout", timeout_ms.clone()),
            ("delayForHttpReturn", timeout_ms),
        ]);
        self.send(builder, "server shutdown request").await?;
        Ok(())
    }

    async fn descendant_sensor(
        &self,
        server: &str,
        app: &str,
        sensor: &str,
        type_regex: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let url = endpoint(
            server,
            &format!("/v1/applications/{app}/entities/{app}/descendants/sensor/{sensor}"),
        );
        let builder = self
            .request(reqwest::Method::GET, url)
            .query(&[("typeRegex", type_regex)]);
        let response = self.send(builder, "descendant sensor query").await?;
        response.json().await.context("parsing sensor query response")
    }
}
