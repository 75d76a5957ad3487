//! Config command implementations

use anyhow::{Context, Result};

use vg_core::config::{self, ClientConfig};

use crate::context::AppContext;
use crate::output::{print_error, print_info, print_success};

/// Show the effective configuration
pub fn config_show(ctx: &AppContext) -> Result<()> {
    if ctx.config_path.exists() {
        print_info(&format!("Configuration file: {:?}", ctx.config_path));
    } else {
        print_info(&format!(
            "No configuration file at {:?}; showing defaults",
            ctx.config_path
        ));
    }
    println!();
    println!("{}", toml::to_string_pretty(&ctx.config)?);
    Ok(())
}

/// Show where configuration and the server list live
pub fn config_path(ctx: &AppContext) -> Result<()> {
    println!("config:  {}", ctx.config_path.display());
    println!("servers: {}", ctx.store.path().display());
    Ok(())
}

/// Write a configuration file with the default settings
pub fn config_init(ctx: &AppContext, force: bool) -> Result<()> {
    if ctx.config_path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", ctx.config_path));
        print_info("Use --force to overwrite");
        return Ok(());
    }
    config::save_config(&ctx.config_path, &ClientConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", ctx.config_path))?;
    print_success(&format!("Created configuration file: {:?}", ctx.config_path));
    Ok(())
}
