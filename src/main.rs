mod api;
mod client;
mod commands;
mod config;
mod domain;
mod error;
mod server;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden", version, about = "Proxmox dashboard backend with scheduled auto-restart")]
struct Cli {
    /// Path to config file (default: ~/.config/warden/config.yaml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the warden daemon (REST + GraphQL + scheduler)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Validate configuration and hypervisor reachability
    Check,

    /// Query a warden daemon's REST API
    Query {
        /// Output format (table or json)
        #[arg(long, global = true, default_value = "table")]
        format: String,

        #[command(subcommand)]
        command: commands::query::QueryCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
        } => commands::daemon::run(http_addr, log_level, cli.config),
        Commands::Check => commands::check::run(cli.config.as_deref()),
        Commands::Query { format, command } => {
            commands::query::run(cli.config.as_deref(), &format, &command)
        }
    }
}
