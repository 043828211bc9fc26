// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Write-only sink for results later steps (or the surrounding build) pick
/// up: the forked server's URL, the deployed application's id, sensor
/// values. Flushed as sorted `key=value` lines; with no file configured the
/// values are only logged.
pub struct PropertySink {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl PropertySink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            values: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        debug!("Setting property {key}={value}");
        self.values.insert(key.to_string(), value);
    }

    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            for (key, value) in &self.values {
                info!("Result: {key}={value}");
            }
            return Ok(());
        };
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
        info!("Wrote {} propert(ies) to {}", self.values.len(), path.display());
        Ok(())
    }
}
