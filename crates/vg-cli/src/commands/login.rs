//! Login command implementation

use anyhow::Result;

use super::{report_key_installation, user_error};
use crate::context::AppContext;
use crate::output::print_success;
use crate::prompt;

/// Log in again with a new password after authentication failed
pub async fn login_command(ctx: &AppContext, query: &str, password_stdin: bool) -> Result<()> {
    let server = ctx.resolve_server(query)?;
    let password = prompt::obtain_password(
        password_stdin,
        &format!("Password for {}@{}: ", server.username, server.host),
    )?;

    let orchestrator = ctx.orchestrator();
    let mut events = orchestrator.subscribe();
    if let Err(e) = orchestrator.reauthenticate(&server.id, &password).await {
        orchestrator.stop_all().await;
        return Err(user_error(e));
    }
    print_success(&format!("Logged in to {}", server.name));

    if !server.has_key_installed {
        report_key_installation(&mut events, &server.id).await;
    }
    orchestrator.stop_all().await;
    Ok(())
}
