// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::fork::ForkSpec;
use crate::registry::ShutdownOptions;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("blueprintctl-work")
}

fn default_server_url_property() -> String {
    "server.url".to_string()
}

fn default_app_id_property() -> String {
    "app.id".to_string()
}

fn default_type_regex() -> String {
    ".*".to_string()
}

/// One full run: optionally fork a server, optionally deploy, query
/// sensors, stop the server at the end.
#[derive(Debug, Deserialize)]
pub struct Plan {
    /// Log and do nothing. Lets a pipeline disable the run without
    /// deleting its configuration.
    #[serde(default)]
    pub skip: bool,
    pub server: Option<ServerPlan>,
    /// Address of an already-running server; used when `server` is absent.
    pub server_url: Option<String>,
    pub deploy: Option<DeployPlan>,
    #[serde(default)]
    pub sensors: Vec<SensorPlan>,
    /// Shut the forked server down once the steps are done.
    #[serde(default = "default_true")]
    pub stop_server: bool,
    /// Tear down every tracked fork when a step fails.
    #[serde(default = "default_true")]
    pub tear_down_on_failure: bool,
    pub properties_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ServerPlan {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_true")]
    pub wait_for_up: bool,
    #[serde(default = "default_server_url_property")]
    pub server_url_property: String,
    #[serde(default = "default_true")]
    pub stop_applications: bool,
    #[serde(default = "default_true")]
    pub force_shutdown_on_error: bool,
    /// Server-side shutdown deadline; absent means "let it take as long as
    /// it needs".
    pub shutdown_timeout_secs: Option<u64>,
}

impl ServerPlan {
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.bind_address, self.port)
    }

    pub fn fork_spec(&self) -> ForkSpec {
        ForkSpec {
            address: self.address(),
            work_dir: self.work_dir.clone(),
            executable: self.executable.clone(),
            args: self.args.clone(),
            env: self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn shutdown_options(&self) -> ShutdownOptions {
        ShutdownOptions {
            server: self.address(),
            stop_all_applications: self.stop_applications,
            force_shutdown_on_error: self.force_shutdown_on_error,
            timeout: self.shutdown_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeployPlan {
    /// File path or URL of the blueprint.
    pub blueprint: String,
    #[serde(default = "default_app_id_property")]
    pub application_id_property: String,
    #[serde(default = "default_true")]
    pub wait_for_running: bool,
    #[serde(default = "default_true")]
    pub stop_app_on_error: bool,
}

#[derive(Debug, Deserialize)]
pub struct SensorPlan {
    pub sensor: String,
    /// Defaults to the application deployed earlier in the plan.
    pub application: Option<String>,
    #[serde(default = "default_type_regex")]
    pub type_regex: String,
    /// Property name for the value; defaults to `sensor.<name>`.
    pub property: Option<String>,
    #[serde(default)]
    pub fail_if_no_matches: bool,
    #[serde(default)]
    pub wait_for_running: bool,
}

impl SensorPlan {
    pub fn property_name(&self) -> String {
        self.property
            .clone()
            .unwrap_or_else(|| format!("sensor.{}", self.sensor))
    }
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let plan: Plan =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(plan)
}
