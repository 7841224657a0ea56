//! Command-line entry point. Mirrors the teacher's `Cli`/`Commands`
//! clap-derive shape and `run()` dispatch, trimmed to the operator
//! surface this runtime actually needs — onboarding wizards, credential
//! keyring management, and the dashboard/channel-QR flows stay out of
//! scope, since this crate drives configuration from `config.json`
//! directly rather than through an interactive setup CLI.

mod gateway_service;
mod subcommands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "clawlite")]
#[command(about = "Self-hosted, multi-channel autonomous assistant runtime")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: agent loop, channel adapters, cron, heartbeat, HTTP API
    Gateway,
    /// Send one message to the agent and print the reply
    Agent {
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },
    /// Manage scheduled cron jobs
    Cron {
        #[command(subcommand)]
        cmd: CronCommands,
    },
    /// Approve or reject pending sender pairing requests
    Pairing {
        #[command(subcommand)]
        cmd: PairingCommands,
    },
    /// Create, list, or restore full-state backups
    Backup {
        #[command(subcommand)]
        cmd: BackupCommands,
    },
    /// Show configuration and runtime status
    Status,
}

#[derive(Subcommand)]
enum CronCommands {
    /// List scheduled jobs
    List,
    /// Add a new job
    Add {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        chat_id: String,
        #[arg(long, default_value = "")]
        thread_id: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        interval_seconds: i64,
    },
    /// Remove a job
    Remove {
        #[arg(long)]
        id: i64,
    },
    /// Run one job now, or every due job if no id is given
    Run {
        #[arg(long)]
        id: Option<i64>,
    },
}

#[derive(Subcommand)]
enum PairingCommands {
    /// Approve a pending pairing request by channel + code
    Approve {
        channel: String,
        code: String,
        /// Stable client key to bind to this approval (e.g. sender id)
        client_key: String,
    },
    /// Reject a pending pairing request by channel + code
    Reject { channel: String, code: String },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a full-state backup archive
    Create {
        #[arg(long, default_value = "manual")]
        label: String,
        #[arg(long, default_value_t = crate::backup::DEFAULT_KEEP_LAST)]
        keep_last: usize,
    },
    /// List existing backup archives, newest first
    List,
    /// Restore a backup archive into the config directory
    Restore {
        /// Path to a `clawlite_backup_*.tar.gz` archive
        archive: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway => gateway_service::run().await?,
        Commands::Agent { message, session } => subcommands::agent_command(message, session).await?,
        Commands::Cron { cmd } => subcommands::cron_command(cmd).await?,
        Commands::Pairing { cmd } => subcommands::pairing_command(cmd)?,
        Commands::Backup { cmd } => subcommands::backup_command(cmd)?,
        Commands::Status => subcommands::status_command()?,
    }

    Ok(())
}
