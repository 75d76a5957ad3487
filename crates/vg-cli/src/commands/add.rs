//! Add command implementation

use anyhow::Result;

use vg_core::ServerIdentity;
use vg_orchestrator::OrchestratorEvent;

use super::{report_key_installation, user_error};
use crate::context::AppContext;
use crate::output::{format_snapshot, print_info, print_success, print_warning};
use crate::prompt;

/// Arguments of the add command
pub struct AddArgs {
    pub host: String,
    pub username: String,
    pub ssh_port: u16,
    pub agent_port: u16,
    pub name: Option<String>,
    pub password_stdin: bool,
}

/// Onboard a server: connect, check the agent, store it and install a key
pub async fn add_command(ctx: &AppContext, args: AddArgs) -> Result<()> {
    let mut identity = ServerIdentity::new(args.host, args.username);
    identity.ssh_port = args.ssh_port;
    identity.agent_port = args.agent_port;
    if let Some(name) = args.name {
        identity.name = name;
    }

    let password = prompt::obtain_password(
        args.password_stdin,
        &format!("Password for {}@{}: ", identity.username, identity.host),
    )?;

    if ctx.ephemeral {
        print_warning("Ephemeral mode: credentials are forgotten when this command exits");
    }

    let orchestrator = ctx.orchestrator();
    let mut events = orchestrator.subscribe();

    print_info(&format!("Connecting to {}...", identity.ssh_address()));
    let identity = orchestrator
        .connect_server(identity, &password)
        .await
        .map_err(user_error)?;
    print_success(&format!("Added {} ({})", identity.name, identity.id));

    // The onboarding snapshot is published right after the server is stored
    while let Ok(event) = events.try_recv() {
        if let OrchestratorEvent::Stats { snapshot, .. } = event {
            println!("  {}", format_snapshot(&snapshot));
            break;
        }
    }

    report_key_installation(&mut events, &identity.id).await;
    orchestrator.stop_all().await;
    Ok(())
}
