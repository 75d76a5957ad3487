//! Edit command implementation

use anyhow::{bail, Result};

use super::user_error;
use crate::context::AppContext;
use crate::output::{print_info, print_success};

/// Fields to change; `None` keeps the current value
#[derive(Debug, Default)]
pub struct EditArgs {
    pub name: Option<String>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub ssh_port: Option<u16>,
    pub agent_port: Option<u16>,
}

impl EditArgs {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.host.is_none()
            && self.username.is_none()
            && self.ssh_port.is_none()
            && self.agent_port.is_none()
    }
}

/// Change the settings of a configured server
pub async fn edit_command(ctx: &AppContext, query: &str, args: EditArgs) -> Result<()> {
    if args.is_empty() {
        bail!("Nothing to change; pass at least one of --name, --host, --user, --port, --agent-port");
    }
    let current = ctx.resolve_server(query)?;

    let mut edited = current.clone();
    if let Some(name) = args.name {
        edited.name = name;
    }
    if let Some(host) = args.host {
        edited.host = host;
    }
    if let Some(username) = args.username {
        edited.username = username;
    }
    if let Some(port) = args.ssh_port {
        edited.ssh_port = port;
    }
    if let Some(port) = args.agent_port {
        edited.agent_port = port;
    }

    let moved = current.connection_differs(&edited);
    ctx.orchestrator()
        .update_server(edited)
        .await
        .map_err(user_error)?;

    print_success(&format!("Updated {}", current.id));
    if moved {
        print_info("Connection settings changed; the host key is pinned again and a key is installed on the next connection");
    }
    Ok(())
}
