// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use blueprintctl::client::RestClient;
use blueprintctl::config::{self, Plan};
use blueprintctl::ops::{self, DeployOptions, SensorOptions, StartOptions, Waits};
use blueprintctl::props::PropertySink;
use blueprintctl::registry::{ForkRegistry, ShutdownOptions};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Duration;

#[derive(Parser)]
#[command(
    name = "blueprintctl",
    version,
    about = "Drive an application-orchestration server from a build pipeline"
)]
struct Cli {
    /// Poll cadence for status waits, in seconds.
    #[arg(long, global = true, default_value_t = 5)]
    poll_secs: u64,
    /// Overall deadline for each wait, in seconds.
    #[arg(long, global = true, default_value_t = 300)]
    timeout_secs: u64,
    /// Basic-auth user for the server.
    #[arg(long, global = true)]
    user: Option<String>,
    #[arg(long, global = true, requires = "user")]
    password: Option<String>,
    /// Write results (server URL, application id, sensor values) here as
    /// sorted key=value lines.
    #[arg(long, global = true)]
    properties_file: Option<PathBuf>,
    /// Log and exit without doing anything.
    #[arg(long, global = true)]
    skip: bool,
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a plan file: fork a server, deploy, query sensors, tear down.
    Run { plan: PathBuf },
    /// Deploy a blueprint (file or URL) to a running server.
    Deploy {
        #[arg(long)]
        server: String,
        blueprint: String,
        /// Property name for the new application's id.
        #[arg(long, default_value = "app.id")]
        application_id_property: String,
        /// Return as soon as the server accepts the blueprint.
        #[arg(long)]
        no_wait: bool,
        /// Leave the application as-is if it fails to reach RUNNING.
        #[arg(long)]
        keep_app_on_error: bool,
    },
    /// Fetch a sensor value from an application's entities.
    Sensor {
        #[arg(long)]
        server: String,
        #[arg(long)]
        app: String,
        sensor: String,
        /// Only query entities whose type matches this regex.
        #[arg(long, default_value = ".*")]
        type_regex: String,
        /// Property name for the value; defaults to sensor.<name>.
        #[arg(long)]
        property: Option<String>,
        #[arg(long)]
        fail_if_no_matches: bool,
        /// Wait for the application to be RUNNING first.
        #[arg(long)]
        wait_for_running: bool,
    },
    /// Ask the server to stop a deployed application.
    StopApp {
        #[arg(long)]
        server: String,
        app: String,
    },
    /// Ask a server to shut down.
    StopServer {
        server: String,
        /// Leave deployed applications running.
        #[arg(long)]
        keep_applications: bool,
        /// Abort the shutdown if stopping an application fails.
        #[arg(long)]
        no_force: bool,
        /// Server-side shutdown deadline, in seconds.
        #[arg(long)]
        shutdown_timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level)?;
    info!("blueprintctl {}", env!("CARGO_PKG_VERSION"));

    if cli.skip {
        info!("Skipping execution");
        return Ok(());
    }

    let credentials = cli
        .user
        .clone()
        .map(|user| (user, cli.password.clone().unwrap_or_default()));
    let api = RestClient::new(credentials)?;
    let registry = ForkRegistry::new();
    let waits = Waits {
        poll_interval: Duration::from_secs(cli.poll_secs),
        timeout: Duration::from_secs(cli.timeout_secs),
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = dispatch(&cli, &api, &registry, waits) => result,
        _ = sigterm.recv() => interrupted("SIGTERM", &registry, &api).await,
        _ = sigint.recv() => interrupted("SIGINT", &registry, &api).await,
    }
}

async fn interrupted(sig: &str, registry: &ForkRegistry, api: &RestClient) -> Result<()> {
    info!("Received {sig}, cleaning up forked servers");
    registry.teardown_all(api).await;
    bail!("interrupted by {sig}")
}

async fn dispatch(cli: &Cli, api: &RestClient, registry: &ForkRegistry, waits: Waits) -> Result<()> {
    match &cli.command {
        Command::Run { plan } => {
            let plan = config::load_plan(plan)?;
            run_plan(api, registry, &plan, waits, cli.properties_file.clone()).await
        }
        Command::Deploy {
            server,
            blueprint,
            application_id_property,
            no_wait,
            keep_app_on_error,
        } => {
            let options = DeployOptions {
                blueprint: blueprint.clone(),
                wait_for_running: !no_wait,
                stop_app_on_error: !keep_app_on_error,
                // Nothing was forked by this invocation.
                tear_down_on_failure: false,
            };
            let app = ops::deploy(api, registry, server, &options, waits).await?;
            let mut sink = PropertySink::new(cli.properties_file.clone());
            sink.set(application_id_property, app);
            sink.flush()
        }
        Command::Sensor {
            server,
            app,
            sensor,
            type_regex,
            property,
            fail_if_no_matches,
            wait_for_running,
        } => {
            let options = SensorOptions {
                application: app.clone(),
                sensor: sensor.clone(),
                type_regex: type_regex.clone(),
                fail_if_no_matches: *fail_if_no_matches,
                wait_for_running: *wait_for_running,
                tear_down_on_failure: false,
            };
            let value = ops::query_sensor(api, registry, server, &options, waits).await?;
            let mut sink = PropertySink::new(cli.properties_file.clone());
            let key = property
                .clone()
                .unwrap_or_else(|| format!("sensor.{sensor}"));
            sink.set(&key, value);
            sink.flush()
        }
        Command::StopApp { server, app } => {
            ops::stop_application(api, server, app, waits.timeout).await;
            Ok(())
        }
        Command::StopServer {
            server,
            keep_applications,
            no_force,
            shutdown_timeout_secs,
        } => {
            let options = ShutdownOptions {
                server: server.clone(),
                stop_all_applications: !keep_applications,
                force_shutdown_on_error: !no_force,
                timeout: shutdown_timeout_secs.map(Duration::from_secs),
            };
            ops::stop_server(api, registry, &options).await;
            Ok(())
        }
    }
}

async fn run_plan(
    api: &RestClient,
    registry: &ForkRegistry,
    plan: &Plan,
    waits: Waits,
    cli_properties: Option<PathBuf>,
) -> Result<()> {
    if plan.skip {
        info!("Plan is marked skip, doing nothing");
        return Ok(());
    }
    let mut sink = PropertySink::new(cli_properties.or_else(|| plan.properties_file.clone()));

    let result = execute_plan(api, registry, plan, waits, &mut sink).await;
    // Step-level operations already cascade; this catches failures around
    // them, like a server that never became ready.
    if let Err(e) = &result
        && plan.tear_down_on_failure
        && !registry.is_empty()
    {
        info!("Cleaning up forked servers after failure: {e:#}");
        registry.teardown_all(api).await;
    }
    sink.flush()?;
    result
}

async fn execute_plan(
    api: &RestClient,
    registry: &ForkRegistry,
    plan: &Plan,
    waits: Waits,
    sink: &mut PropertySink,
) -> Result<()> {
    let server_url = match &plan.server {
        Some(server) => {
            let url = ops::start_server(
                api,
                registry,
                StartOptions {
                    spec: server.fork_spec(),
                    shutdown: server.shutdown_options(),
                    wait_for_up: server.wait_for_up,
                },
                waits,
            )
            .await?;
            sink.set(&server.server_url_property, url.clone());
            url
        }
        None => plan
            .server_url
            .clone()
            .context("plan needs a server section or a server_url")?,
    };

    let mut deployed = None;
    if let Some(deploy) = &plan.deploy {
        let options = DeployOptions {
            blueprint: deploy.blueprint.clone(),
            wait_for_running: deploy.wait_for_running,
            stop_app_on_error: deploy.stop_app_on_error,
            tear_down_on_failure: plan.tear_down_on_failure,
        };
        let app = ops::deploy(api, registry, &server_url, &options, waits).await?;
        sink.set(&deploy.application_id_property, app.clone());
        deployed = Some(app);
    }

    for sensor in &plan.sensors {
        let application = match sensor.application.clone().or_else(|| deployed.clone()) {
            Some(app) => app,
            None => bail!(
                "sensor {} names no application and the plan has no deploy step",
                sensor.sensor
            ),
        };
        let options = SensorOptions {
            application,
            sensor: sensor.sensor.clone(),
            type_regex: sensor.type_regex.clone(),
            fail_if_no_matches: sensor.fail_if_no_matches,
            wait_for_running: sensor.wait_for_running,
            tear_down_on_failure: plan.tear_down_on_failure,
        };
        let value = ops::query_sensor(api, registry, &server_url, &options, waits).await?;
        sink.set(&sensor.property_name(), value);
    }

    if plan.stop_server && let Some(server) = &plan.server {
        ops::stop_server(api, registry, &server.shutdown_options()).await;
    }
    Ok(())
}
