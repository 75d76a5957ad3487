//! CLI command implementations

mod add;
mod config;
mod edit;
mod list;
mod login;
mod pin;
mod remove;
mod watch;

pub use add::{add_command, AddArgs};
pub use config::{config_init, config_path, config_show};
pub use edit::{edit_command, EditArgs};
pub use list::list_command;
pub use login::login_command;
pub use pin::{pin_remove, pin_scope, pin_set, pin_status, pin_verify};
pub use remove::remove_command;
pub use watch::watch_command;

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};

use vg_core::ServerId;
use vg_orchestrator::{OrchestratorError, OrchestratorEvent};

use crate::output::{print_success, print_warning};

/// How long a foreground command waits for background key installation
const KEY_INSTALL_WAIT: Duration = Duration::from_secs(30);

/// Attach the classified, human-readable message to an orchestrator error
fn user_error(err: OrchestratorError) -> anyhow::Error {
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

/// Wait for the outcome of key provisioning for `id` and report it
async fn report_key_installation(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    id: &ServerId,
) {
    let outcome = tokio::time::timeout(KEY_INSTALL_WAIT, async {
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::KeyInstalled { server_id }) if server_id == *id => {
                    return Some(Ok(()));
                }
                Ok(OrchestratorEvent::KeyInstallFailed { server_id, error })
                    if server_id == *id =>
                {
                    return Some(Err(error));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match outcome {
        Ok(Some(Ok(()))) => print_success("Installed a client key; the password is now a fallback"),
        Ok(Some(Err(error))) => {
            print_warning(&format!("Could not install a client key: {}", error));
            print_warning("Password login keeps working; the key is retried on the next connection");
        }
        Ok(None) | Err(_) => {
            print_warning("Key installation did not finish; it is retried on the next connection")
        }
    }
}
