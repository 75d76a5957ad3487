//! List command implementation

use anyhow::{Context, Result};

use crate::context::AppContext;
use crate::output::format_servers;

/// Print the configured servers
pub fn list_command(ctx: &AppContext, long: bool, json: bool) -> Result<()> {
    let mut servers = ctx
        .store
        .load()
        .with_context(|| format!("Failed to read {:?}", ctx.store.path()))?;
    servers.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
    } else {
        println!("{}", format_servers(&servers, long));
    }
    Ok(())
}
