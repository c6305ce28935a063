//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Dispatch engine configuration (conveyor.kdl)
//! - Human-readable durations ("30s", "10m", ...)

pub mod dispatch;
pub mod duration;
pub mod error;

pub use dispatch::{
    DispatchConfig, DispatchMode, MAX_DURATION, load_dispatch_config, parse_dispatch_config,
};
pub use error::{ConfigError, ConfigResult};
