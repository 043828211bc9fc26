// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! blueprintctl drives an application-orchestration server from a build
//! pipeline: fork a server process, wait for it to come up, deploy a
//! blueprint, read sensor values off the deployed entities, and tear
//! everything down again. Every forked process is tracked in a registry so
//! that a failure anywhere cleans up all of them.

pub mod blueprint;
pub mod client;
pub mod config;
pub mod fork;
pub mod ops;
pub mod props;
pub mod registry;
pub mod repeat;
pub mod status;
