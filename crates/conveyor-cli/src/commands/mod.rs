//! CLI command implementations.

pub mod simulate;

use anyhow::{Context, Result};
use conveyor_config::load_dispatch_config;

pub fn validate(path: &str) -> Result<()> {
    match load_dispatch_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  mode: {:?}", config.dispatch_mode);
            println!("  sweep batch size: {}", config.sweep_batch_size);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn show_config(path: &str) -> Result<()> {
    let config = load_dispatch_config(path)
        .with_context(|| format!("Failed to load config file: {}", path))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
