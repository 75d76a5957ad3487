//! Vigil CLI
//!
//! Single binary for Vigil operations:
//! - Onboarding servers over SSH and installing a client key
//! - Watching connection status and agent statistics
//! - Managing the server list, configuration and app lock PIN

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vg_core::types::{DEFAULT_AGENT_PORT, DEFAULT_SSH_PORT};
use vigil::commands::{self, AddArgs, EditArgs};
use vigil::context::AppContext;
use vigil::output::print_error;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about = "Server monitoring client over SSH tunnels")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the server list
    #[arg(long, global = true, env = "VIGIL_SERVERS")]
    servers: Option<PathBuf>,

    /// Keep credentials in memory instead of the OS credential store
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a server: log in with a password, check the agent and install a key
    Add {
        /// Host name or address
        host: String,
        /// SSH username (defaults to the local user)
        #[arg(short, long)]
        user: Option<String>,
        /// SSH port
        #[arg(short, long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,
        /// Agent port on the server's loopback interface
        #[arg(long, default_value_t = DEFAULT_AGENT_PORT)]
        agent_port: u16,
        /// Display name (defaults to the host)
        #[arg(short, long)]
        name: Option<String>,
        /// Read the password from standard input
        #[arg(long)]
        password_stdin: bool,
    },

    /// List configured servers
    #[command(alias = "ls")]
    List {
        /// Show full IDs and pinned host keys
        #[arg(short, long)]
        long: bool,
        /// Print the list as JSON
        #[arg(long, conflicts_with = "long")]
        json: bool,
    },

    /// Connect to configured servers and show status and statistics
    Watch {
        /// Only show this server (name, ID or ID prefix)
        server: Option<String>,
        /// Also print every statistics sample
        #[arg(short, long)]
        stats: bool,
    },

    /// Log in again with a new password after authentication failed
    Login {
        /// Server name, ID or ID prefix
        server: String,
        /// Read the password from standard input
        #[arg(long)]
        password_stdin: bool,
    },

    /// Change a server's settings
    Edit {
        /// Server name, ID or ID prefix
        server: String,
        /// New display name
        #[arg(short, long)]
        name: Option<String>,
        /// New host name or address
        #[arg(long)]
        host: Option<String>,
        /// New SSH username
        #[arg(short, long)]
        user: Option<String>,
        /// New SSH port
        #[arg(short, long)]
        port: Option<u16>,
        /// New agent port
        #[arg(long)]
        agent_port: Option<u16>,
    },

    /// Remove a server and its stored credentials
    #[command(alias = "rm")]
    Remove {
        /// Server name, ID or ID prefix
        server: String,
    },

    /// Manage the app lock PIN
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PinAction {
    /// Set or change the PIN
    Set,
    /// Remove the PIN
    Remove,
    /// Check a PIN
    Verify,
    /// Show PIN and lock settings
    Status,
    /// Choose what the PIN protects: 0 none, 1 window, 2 menu bar, 3 both
    Scope {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=3))]
        scope: u8,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show config and server list paths
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = AppContext::load(cli.config.as_deref(), cli.servers.as_deref(), cli.ephemeral)?;

    match cli.command {
        Commands::Add {
            host,
            user,
            port,
            agent_port,
            name,
            password_stdin,
        } => {
            let args = AddArgs {
                host,
                username: user.unwrap_or_else(whoami::username),
                ssh_port: port,
                agent_port,
                name,
                password_stdin,
            };
            commands::add_command(&ctx, args).await?;
        }

        Commands::List { long, json } => {
            commands::list_command(&ctx, long, json)?;
        }

        Commands::Watch { server, stats } => {
            commands::watch_command(&ctx, server.as_deref(), stats).await?;
        }

        Commands::Login {
            server,
            password_stdin,
        } => {
            commands::login_command(&ctx, &server, password_stdin).await?;
        }

        Commands::Edit {
            server,
            name,
            host,
            user,
            port,
            agent_port,
        } => {
            let args = EditArgs {
                name,
                host,
                username: user,
                ssh_port: port,
                agent_port,
            };
            commands::edit_command(&ctx, &server, args).await?;
        }

        Commands::Remove { server } => {
            commands::remove_command(&ctx, &server).await?;
        }

        Commands::Pin { action } => match action {
            PinAction::Set => commands::pin_set(&ctx)?,
            PinAction::Remove => commands::pin_remove(&ctx)?,
            PinAction::Verify => commands::pin_verify(&ctx)?,
            PinAction::Status => commands::pin_status(&ctx)?,
            PinAction::Scope { scope } => commands::pin_scope(&ctx, scope)?,
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&ctx)?,
            ConfigAction::Path => commands::config_path(&ctx)?,
            ConfigAction::Init { force } => commands::config_init(&ctx, force)?,
        },
    }

    Ok(())
}
