//! Dispatch engine configuration parsing.
//!
//! ```kdl
//! dispatch {
//!     mode "both"
//!     stale-worker-threshold "1h"
//!     untagged-workers-accept-untagged-only #true
//! }
//! sweep {
//!     interval "30s"
//!     batch-size 1000
//!     concurrency 4
//!     max-batches 50
//!     lease-timeout "10m"
//! }
//! ```

use crate::duration::{parse_duration, serde_str};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted duration setting (100 years).
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// How queued jobs get ticked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Tick right after each enqueue, on the caller's task.
    Event,
    /// Only the periodic sweep ticks entries.
    Sweep,
    /// Both of the above.
    Both,
}

impl DispatchMode {
    pub fn ticks_on_enqueue(&self) -> bool {
        matches!(self, DispatchMode::Event | DispatchMode::Both)
    }

    pub fn runs_sweep(&self) -> bool {
        matches!(self, DispatchMode::Sweep | DispatchMode::Both)
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "event" => Ok(DispatchMode::Event),
            "sweep" => Ok(DispatchMode::Sweep),
            "both" => Ok(DispatchMode::Both),
            other => Err(ConfigError::InvalidValue {
                field: "dispatch.mode".to_string(),
                message: format!("unknown mode: {} (expected event, sweep or both)", other),
            }),
        }
    }
}

/// Configuration of the queue and dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub dispatch_mode: DispatchMode,
    /// Workers silent for longer than this are skipped.
    #[serde(with = "serde_str")]
    pub stale_worker_threshold: Duration,
    /// When false, workers without tags accept any job.
    pub untagged_workers_accept_untagged_only: bool,
    #[serde(with = "serde_str")]
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    /// Ticks in flight at once during a sweep.
    pub sweep_concurrency: usize,
    /// Stop a sweep pass after this many batches; the next pass resumes.
    pub sweep_max_batches: Option<usize>,
    #[serde(with = "serde_str")]
    pub lease_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Both,
            stale_worker_threshold: Duration::from_secs(60 * 60),
            untagged_workers_accept_untagged_only: true,
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 1000,
            sweep_concurrency: 4,
            sweep_max_batches: None,
            lease_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sweep_batch_size == 0 {
            return Err(invalid("sweep.batch-size", "must be greater than zero"));
        }
        if self.sweep_concurrency == 0 {
            return Err(invalid("sweep.concurrency", "must be greater than zero"));
        }
        if self.sweep_max_batches == Some(0) {
            return Err(invalid("sweep.max-batches", "must be greater than zero"));
        }
        for (field, value) in [
            ("dispatch.stale-worker-threshold", self.stale_worker_threshold),
            ("sweep.interval", self.sweep_interval),
            ("sweep.lease-timeout", self.lease_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
            if value > MAX_DURATION {
                return Err(invalid(field, "must not exceed 876000h"));
            }
        }
        if self.lease_timeout < self.sweep_interval {
            return Err(invalid(
                "sweep.lease-timeout",
                "must be at least the sweep interval",
            ));
        }
        Ok(())
    }
}

/// Parse a dispatch configuration from KDL text.
pub fn parse_dispatch_config(kdl: &str) -> ConfigResult<DispatchConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = DispatchConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "dispatch" => parse_dispatch_section(node, &mut config)?,
            "sweep" => parse_sweep_section(node, &mut config)?,
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_dispatch_config(path: impl AsRef<Path>) -> ConfigResult<DispatchConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_dispatch_config(&content)
}

fn parse_dispatch_section(node: &KdlNode, config: &mut DispatchConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "mode" => {
                config.dispatch_mode = require_string(child, "dispatch.mode")?.parse()?;
            }
            "stale-worker-threshold" => {
                config.stale_worker_threshold =
                    require_duration(child, "dispatch.stale-worker-threshold")?;
            }
            "untagged-workers-accept-untagged-only" => {
                config.untagged_workers_accept_untagged_only =
                    get_first_bool_arg(child).ok_or_else(|| {
                        invalid(
                            "dispatch.untagged-workers-accept-untagged-only",
                            "expected a boolean",
                        )
                    })?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_sweep_section(node: &KdlNode, config: &mut DispatchConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "interval" => {
                config.sweep_interval = require_duration(child, "sweep.interval")?;
            }
            "batch-size" | "batch_size" => {
                config.sweep_batch_size = require_count(child, "sweep.batch-size")?;
            }
            "concurrency" => {
                config.sweep_concurrency = require_count(child, "sweep.concurrency")?;
            }
            "max-batches" | "max_batches" => {
                config.sweep_max_batches = Some(require_count(child, "sweep.max-batches")?);
            }
            "lease-timeout" | "lease_timeout" => {
                config.lease_timeout = require_duration(child, "sweep.lease-timeout")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    first_arg(node).and_then(|v| v.as_bool())
}

fn require_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn require_duration(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let raw = require_string(node, field)?;
    parse_duration(&raw)
}

fn require_count(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    usize::try_from(value).map_err(|_| invalid(field, "must be a non-negative integer"))
}
