//! Command dispatch for gantry-cli.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;

use crate::cli::args::{Args, Command, CredentialCommand, WorkflowCommand};
use crate::credential::{
    CreateCredentialInput, CredentialCategory, CredentialFilter, CredentialService, LeaseRequest,
};
use crate::events::BroadcastHub;
use crate::git::GitCli;
use crate::settings::{GantrySettings, SettingsManager};
use crate::workflow::{
    CreateWorkflowInput, SessionPoliciesPatch, WorkflowPoliciesPatch, WorkflowStatus,
    WorkflowStore,
};

/// Everything a CLI invocation needs, wired once at startup.
pub struct CliContext {
    pub settings: GantrySettings,
    pub workflows: Arc<WorkflowStore>,
    pub credentials: Arc<CredentialService>,
    json: bool,
}

/// Build stores and services from settings plus CLI overrides.
pub async fn initialize(args: &Args) -> Result<CliContext> {
    let settings = SettingsManager::new().await?.get().await;
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| settings.data_dir());

    let hub = Arc::new(BroadcastHub::default());
    let git = Arc::new(GitCli);

    let workflows = Arc::new(WorkflowStore::new(
        data_dir.join("workflows.json"),
        git,
        hub.clone(),
    ));
    let credentials = Arc::new(CredentialService::new(
        data_dir.join("credentials.json"),
        hub,
    ));

    Ok(CliContext {
        settings,
        workflows,
        credentials,
        json: args.json,
    })
}

pub async fn run(ctx: &CliContext, args: &Args) -> Result<()> {
    match &args.command {
        Command::Workflow(command) => run_workflow(ctx, command).await,
        Command::Credential(command) => run_credential(ctx, args, command).await,
        Command::Events { workflow_id, limit } => {
            let events = ctx.workflows.events(workflow_id, Some(*limit)).await;
            if ctx.json {
                for event in &events {
                    println!("{}", serde_json::to_string(event)?);
                }
            } else {
                for event in &events {
                    println!(
                        "{} {:?} {}",
                        event.timestamp_ms,
                        event.kind,
                        event.message
                    );
                }
            }
            Ok(())
        }
        Command::Policies {
            max_concurrent,
            timeout_ms,
        } => {
            let policies = if max_concurrent.is_some() || timeout_ms.is_some() {
                ctx.workflows
                    .update_policies(WorkflowPoliciesPatch {
                        sessions: SessionPoliciesPatch {
                            max_concurrent: *max_concurrent,
                            timeout_ms: *timeout_ms,
                            ..Default::default()
                        },
                        ..Default::default()
                    })
                    .await?
            } else {
                ctx.workflows.policies().await
            };
            println!("{}", serde_json::to_string_pretty(&policies)?);
            Ok(())
        }
    }
}

async fn run_workflow(ctx: &CliContext, command: &WorkflowCommand) -> Result<()> {
    match command {
        WorkflowCommand::Create { plan } => {
            let raw = tokio::fs::read_to_string(plan)
                .await
                .with_context(|| format!("failed to read plan file {}", plan.display()))?;
            let input: CreateWorkflowInput =
                serde_json::from_str(&raw).context("plan file is not a valid workflow input")?;
            let workflow = ctx.workflows.create(input).await?;
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&workflow)?);
            } else {
                println!(
                    "created workflow {} ({}) on branch {}",
                    workflow.id, workflow.status, workflow.work_branch
                );
            }
            Ok(())
        }
        WorkflowCommand::List { status } => {
            let workflows = match status {
                Some(status) => {
                    let status = parse_status(status)?;
                    ctx.workflows.list_by_status(status).await
                }
                None => ctx.workflows.list().await,
            };
            if ctx.json {
                for workflow in &workflows {
                    println!("{}", serde_json::to_string(workflow)?);
                }
            } else {
                for workflow in &workflows {
                    println!(
                        "{}  {:<10} {}  ({}/{} steps done)",
                        workflow.id,
                        workflow.status.to_string(),
                        workflow.title,
                        workflow
                            .steps
                            .iter()
                            .filter(|s| s.status.is_terminal())
                            .count(),
                        workflow.steps.len()
                    );
                }
            }
            Ok(())
        }
        WorkflowCommand::Show { workflow_id } => {
            let Some(workflow) = ctx.workflows.get(workflow_id).await else {
                bail!("no workflow with id {workflow_id}");
            };
            println!("{}", serde_json::to_string_pretty(&workflow)?);
            Ok(())
        }
        WorkflowCommand::Cancel { workflow_id } => {
            match ctx.workflows.cancel(workflow_id).await? {
                Some(workflow) => println!("workflow {} is now {}", workflow.id, workflow.status),
                None => bail!("no workflow with id {workflow_id}"),
            }
            Ok(())
        }
        WorkflowCommand::Pause { workflow_id } => {
            match ctx.workflows.pause(workflow_id).await? {
                Some(_) => println!("paused {workflow_id}"),
                None => bail!("workflow {workflow_id} cannot be paused"),
            }
            Ok(())
        }
        WorkflowCommand::Resume { workflow_id } => {
            match ctx.workflows.resume(workflow_id).await? {
                Some(_) => println!("resumed {workflow_id}"),
                None => bail!("workflow {workflow_id} cannot be resumed"),
            }
            Ok(())
        }
        WorkflowCommand::Retry {
            workflow_id,
            step_id,
        } => {
            match ctx.workflows.retry_step(workflow_id, step_id).await? {
                Some(step) => println!("step {} reset to {:?}", step.id, step.status),
                None => bail!("step {step_id} is not in a failed state"),
            }
            Ok(())
        }
    }
}

async fn run_credential(ctx: &CliContext, args: &Args, command: &CredentialCommand) -> Result<()> {
    let master_key = args
        .master_key
        .clone()
        .or_else(|| std::env::var(&ctx.settings.master_key_env).ok())
        .context("a master key is required for credential operations")?;
    ctx.credentials.init(&master_key).await?;

    match command {
        CredentialCommand::Create {
            name,
            category,
            provider,
        } => {
            let secret = read_secret_from_stdin().await?;
            let credential = ctx
                .credentials
                .create(CreateCredentialInput {
                    name: name.clone(),
                    category: parse_category(category)?,
                    provider: provider.clone(),
                    secret,
                })
                .await?;
            println!("created credential {}", credential.id);
            Ok(())
        }
        CredentialCommand::List => {
            let credentials = ctx.credentials.list(&CredentialFilter::default()).await;
            for credential in &credentials {
                println!(
                    "{}  {:<16} {}  (grants: {}, leases: {}, uses: {})",
                    credential.id,
                    credential.category.to_string(),
                    credential.name,
                    credential.access_grants.len(),
                    credential.active_leases.len(),
                    credential.usage_count
                );
            }
            Ok(())
        }
        CredentialCommand::Grant {
            credential_id,
            agent_id,
        } => {
            if !ctx.credentials.grant_access(credential_id, agent_id).await? {
                bail!("no credential with id {credential_id}");
            }
            println!("granted {agent_id} access to {credential_id}");
            Ok(())
        }
        CredentialCommand::Revoke {
            credential_id,
            agent_id,
        } => {
            if !ctx.credentials.revoke_access(credential_id, agent_id).await? {
                bail!("no matching grant to revoke");
            }
            println!("revoked {agent_id}'s access to {credential_id}");
            Ok(())
        }
        CredentialCommand::Lease {
            credential_id,
            task_id,
            agent_id,
            ttl_ms,
            max_uses,
        } => {
            let lease = ctx
                .credentials
                .create_lease(LeaseRequest {
                    credential_id: credential_id.clone(),
                    task_id: task_id.clone(),
                    agent_id: agent_id.clone(),
                    ttl_ms: *ttl_ms,
                    max_uses: *max_uses,
                })
                .await?;
            println!(
                "lease {} expires at {} (uses: {})",
                lease.lease_id,
                lease.expires_at_ms,
                lease
                    .max_uses
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "unbounded".into())
            );
            Ok(())
        }
        CredentialCommand::Audit { limit } => {
            for entry in ctx.credentials.audit_log(*limit).await {
                println!("{entry}");
            }
            Ok(())
        }
    }
}

/// Read the secret value from stdin, prompting only on a terminal.
async fn read_secret_from_stdin() -> Result<String> {
    if atty::is(atty::Stream::Stdin) {
        eprintln!("Enter secret value, then EOF (ctrl-d):");
    }
    let mut secret = String::new();
    tokio::io::stdin()
        .read_to_string(&mut secret)
        .await
        .context("failed to read secret from stdin")?;
    let secret = secret.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        bail!("secret must not be empty");
    }
    Ok(secret)
}

fn parse_status(value: &str) -> Result<WorkflowStatus> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("unknown workflow status {value:?}"))
}

fn parse_category(value: &str) -> Result<CredentialCategory> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("unknown credential category {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_category_parsing() {
        assert_eq!(parse_status("running").unwrap(), WorkflowStatus::Running);
        assert_eq!(parse_status("pr_open").unwrap(), WorkflowStatus::PrOpen);
        assert!(parse_status("bogus").is_err());

        assert_eq!(
            parse_category("api_key").unwrap(),
            CredentialCategory::ApiKey
        );
        assert!(parse_category("nope").is_err());
    }
}
