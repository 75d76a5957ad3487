//! Remove command implementation

use anyhow::Result;

use super::user_error;
use crate::context::AppContext;
use crate::output::print_success;

/// Forget a server together with its stored password and key
pub async fn remove_command(ctx: &AppContext, query: &str) -> Result<()> {
    let server = ctx.resolve_server(query)?;
    ctx.orchestrator()
        .remove_server(&server.id)
        .await
        .map_err(user_error)?;
    print_success(&format!("Removed {} ({})", server.name, server.id));
    Ok(())
}
