use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand};
use statuspage::model::{IncidentStatus, ServiceStatus};

/// Real-time status pages for many organizations.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "statuspage.toml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the real-time channel hub.
    Serve,
    /// Follow an organization's status page and log every change.
    Watch {
        /// Organization slug.
        slug: String,
    },
    /// List the organizations known to the backend.
    Organizations,
    /// Change an organization's services and incidents.
    Admin {
        /// Organization slug.
        #[arg(long)]
        org: String,
        /// Use this organization id instead of the one the backend reports.
        #[arg(long)]
        organization_id: Option<String>,
        /// Do not announce the change to other viewers.
        #[arg(long)]
        quiet: bool,
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum AdminAction {
    CreateService {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        status: Option<ServiceStatus>,
    },
    UpdateService {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        status: Option<ServiceStatus>,
    },
    DeleteService {
        id: String,
    },
    CreateIncident {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        status: Option<IncidentStatus>,
        /// critical, high, medium or low.
        #[arg(long)]
        severity: Option<String>,
        /// Affected service id. Repeat for several.
        #[arg(long = "service")]
        services: Vec<String>,
    },
    UpdateIncident {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        status: Option<IncidentStatus>,
    },
    /// Append a message to an incident's history.
    AddUpdate {
        id: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        status: IncidentStatus,
    },
    DeleteIncident {
        id: String,
    },
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
