// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use log::info;
use std::path::Path;

/// Load blueprint text from a file on disk or a remote URL.
///
/// A source that is neither a readable UTF-8 file nor an `http(s)` URL is a
/// configuration error; nothing here is retried.
pub async fn load(source: &str) -> Result<String> {
    let path = Path::new(source);
    if path.is_file() {
        info!("Loading blueprint from {}", path.display());
        return std::fs::read_to_string(path)
            .with_context(|| format!("reading blueprint {}", path.display()));
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        info!("Loading blueprint from {source}");
        let response = reqwest::get(source)
            .await
            .with_context(|| format!("fetching blueprint {source}"))?;
        if !response.status().is_success() {
            bail!("fetching blueprint {source}: {}", response.status());
        }
        return response
            .text()
            .await
            .with_context(|| format!("reading blueprint body from {source}"));
    }
    bail!("blueprint {source} is neither an existing file nor an http(s) URL")
}
