//! CLI argument parsing using clap.
//!
//! Defines the command-line interface for gantry-cli.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Gantry CLI - manage workflows and credentials from the terminal
#[derive(Parser, Debug, Clone)]
#[command(name = "gantry-cli")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding the store files (default: from settings,
    /// falling back to ~/.gantry)
    #[arg(long, env = "GANTRY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Master key for the credential vault
    #[arg(long, env = "GANTRY_MASTER_KEY", hide_env_values = true)]
    pub master_key: Option<String>,

    /// Output records as JSON (for scripting/parsing)
    #[arg(long)]
    pub json: bool,

    /// Show verbose output (debug information)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Workflow lifecycle operations
    #[command(subcommand)]
    Workflow(WorkflowCommand),

    /// Credential vault operations
    #[command(subcommand)]
    Credential(CredentialCommand),

    /// Show a workflow's event log, newest first
    Events {
        /// Workflow id
        workflow_id: String,
        /// Maximum events to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show or update the process-wide workflow policies
    Policies {
        /// Set the per-workflow concurrency ceiling
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Set the per-step timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorkflowCommand {
    /// Create a workflow from a JSON plan file
    Create {
        /// Plan file (CreateWorkflowInput as JSON)
        plan: PathBuf,
    },
    /// List workflows
    List {
        /// Only show workflows with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one workflow with its steps
    Show { workflow_id: String },
    /// Cancel a workflow; pending steps are skipped
    Cancel { workflow_id: String },
    /// Pause a running workflow
    Pause { workflow_id: String },
    /// Resume a paused workflow
    Resume { workflow_id: String },
    /// Reset a failed step to pending
    Retry {
        workflow_id: String,
        step_id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CredentialCommand {
    /// Create a credential; the secret is read from stdin
    Create {
        name: String,
        /// Category: ai_provider, service_account, oauth_token, ssh_key,
        /// db_credential, api_key, channel_bot, custom
        #[arg(long, default_value = "api_key")]
        category: String,
        #[arg(long)]
        provider: Option<String>,
    },
    /// List credentials (metadata only, never secrets)
    List,
    /// Grant an agent standing access
    Grant {
        credential_id: String,
        agent_id: String,
    },
    /// Revoke an agent's standing access
    Revoke {
        credential_id: String,
        agent_id: String,
    },
    /// Create a bounded lease for a task/agent pair
    Lease {
        credential_id: String,
        task_id: String,
        agent_id: String,
        /// Lease TTL in milliseconds
        #[arg(long, default_value = "300000")]
        ttl_ms: i64,
        /// Optional cap on checkouts under this lease
        #[arg(long)]
        max_uses: Option<u32>,
    },
    /// Tail the vault's audit log
    Audit {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}
