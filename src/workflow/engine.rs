//! Workflow execution engine: the periodic scheduler that resolves
//! ready steps, spawns coding sessions, polls them with backoff, and
//! pushes + opens the draft PR when every step has finished.
//!
//! The tick is the sole scheduling point. A reentrancy guard drops
//! overlapping ticks, and nothing propagates an error out of a tick:
//! failures are logged and the scheduler keeps ticking. `activeSessions`
//! lives only in memory; after a restart it rebuilds empty and any step
//! still marked running is reaped by the step timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::credential::{CredentialLeaser, LeaseRequest};
use crate::error::{GantryError, Result};
use crate::events::{topics, Broadcaster};
use crate::git::{CreatePrArgs, GitAdapter};
use crate::now_ms;
use crate::workflow::model::{
    StepPatch, StepStatus, Workflow, WorkflowEventKind, WorkflowPatch, WorkflowPolicies,
    WorkflowStatus, WorkflowStep,
};
use crate::workflow::prompt::{build_step_prompt, build_system_prompt, render_pr_body};
use crate::workflow::store::WorkflowStore;

pub const TICK_INTERVAL_MS: u64 = 5_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 5_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 30_000;
pub const POLL_BACKOFF_FACTOR: f64 = 1.5;

/// Margin added to the session timeout when leasing step credentials,
/// so leases outlive the sessions they serve.
const LEASE_TTL_MARGIN_MS: i64 = 60_000;

/// Request handed to the session spawner.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_key: String,
    pub message: String,
    pub cwd: Option<PathBuf>,
    pub label: Option<String>,
    pub extra_system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpawnHandle {
    pub run_id: String,
}

/// Snapshot of a spawned session's progress.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub done: bool,
    pub success: Option<bool>,
    pub output: Option<String>,
    pub tokens_used: Option<u64>,
    pub tool_calls: Option<u64>,
}

/// External collaborator that runs the actual LLM-backed sessions.
#[async_trait]
pub trait SessionSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnHandle>;
    async fn status(&self, run_id: &str) -> Result<SessionStatus>;
}

/// In-memory record of a spawned-but-not-yet-reaped session.
#[derive(Debug, Clone)]
struct ActiveSession {
    workflow_id: String,
    step_id: String,
    #[allow(dead_code)]
    session_key: String,
    run_id: String,
    started_at_ms: i64,
    poll_interval_ms: u64,
    timeout_ms: u64,
    last_poll_ms: i64,
}

/// Tunables; the constants above are the production defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub min_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: TICK_INTERVAL_MS,
            min_poll_interval_ms: MIN_POLL_INTERVAL_MS,
            max_poll_interval_ms: MAX_POLL_INTERVAL_MS,
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<WorkflowStore>,
    leaser: Arc<dyn CredentialLeaser>,
    git: Arc<dyn GitAdapter>,
    spawner: Arc<dyn SessionSpawner>,
    broadcaster: Arc<dyn Broadcaster>,
    config: EngineConfig,
    /// Keyed by step id; mutated only from the tick path.
    active: tokio::sync::Mutex<HashMap<String, ActiveSession>>,
    ticking: AtomicBool,
    shutdown: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

fn session_key(workflow_id: &str, step_id: &str) -> String {
    format!("agent:default:workflow:{workflow_id}:step:{step_id}")
}

fn task_id(workflow_id: &str, step_id: &str) -> String {
    format!("workflow:{workflow_id}:step:{step_id}")
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<WorkflowStore>,
        leaser: Arc<dyn CredentialLeaser>,
        git: Arc<dyn GitAdapter>,
        spawner: Arc<dyn SessionSpawner>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self::with_config(store, leaser, git, spawner, broadcaster, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<WorkflowStore>,
        leaser: Arc<dyn CredentialLeaser>,
        git: Arc<dyn GitAdapter>,
        spawner: Arc<dyn SessionSpawner>,
        broadcaster: Arc<dyn Broadcaster>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            leaser,
            git,
            spawner,
            broadcaster,
            config,
            active: tokio::sync::Mutex::new(HashMap::new()),
            ticking: AtomicBool::new(false),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Install the periodic tick. In-flight sessions are not canceled by
    /// a later [`stop`](Self::stop); a fresh start recovers state from
    /// disk.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.shutdown.lock();
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);
        drop(guard);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(engine.config.tick_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!("workflow engine started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.tick().await;
                    }
                    _ = rx.changed() => {
                        tracing::info!("workflow engine stopped");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Number of active sessions for one workflow. Test/observability
    /// hook.
    pub async fn active_sessions_for(&self, workflow_id: &str) -> usize {
        self.active
            .lock()
            .await
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .count()
    }

    /// One pass of the scheduler. Drops itself if a previous tick is
    /// still in flight.
    pub async fn tick(&self) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            tracing::debug!("tick still in flight, dropping this one");
            return;
        }

        self.poll_sessions().await;
        self.schedule().await;

        self.ticking.store(false, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------

    async fn schedule(&self) {
        let policies = self.store.policies().await;
        let workflows = self.store.list_by_status(WorkflowStatus::Running).await;

        for workflow in workflows {
            self.reap_orphaned_steps(&workflow, &policies).await;

            if let Err(e) = self.schedule_workflow(&workflow.id, &policies).await {
                tracing::error!(workflow_id = %workflow.id, error = %e, "scheduling pass failed");
            }
        }
    }

    /// Reap steps marked running on disk with no in-memory session: a
    /// restart lost their handles, so they fail via the step timeout.
    async fn reap_orphaned_steps(&self, workflow: &Workflow, policies: &WorkflowPolicies) {
        let now = now_ms();
        let orphaned: Vec<String> = {
            let active = self.active.lock().await;
            workflow
                .steps
                .iter()
                .filter(|step| {
                    step.status == StepStatus::Running
                        && !active.contains_key(&step.id)
                        && step
                            .started_at_ms
                            .map(|started| now - started > policies.sessions.timeout_ms as i64)
                            .unwrap_or(true)
                })
                .map(|step| step.id.clone())
                .collect()
        };

        for step_id in orphaned {
            tracing::warn!(workflow_id = %workflow.id, step_id = %step_id, "reaping orphaned running step");
            self.fail_step_timeout(&workflow.id, &step_id).await;
        }
    }

    async fn schedule_workflow(&self, workflow_id: &str, policies: &WorkflowPolicies) -> Result<()> {
        // Re-read: the poll phase may have just mutated steps.
        let Some(workflow) = self.store.get(workflow_id).await else {
            return Ok(());
        };
        if workflow.status != WorkflowStatus::Running {
            return Ok(());
        }

        let running_here = self.active_sessions_for(workflow_id).await;
        let slots = policies.sessions.max_concurrent.saturating_sub(running_here);

        let ready: Vec<WorkflowStep> = {
            let active = self.active.lock().await;
            workflow
                .ready_steps()
                .into_iter()
                .filter(|step| !active.contains_key(&step.id))
                .cloned()
                .collect()
        };

        if ready.is_empty() {
            self.evaluate_terminal(&workflow, policies).await;
            return Ok(());
        }

        for step in ready.into_iter().take(slots) {
            if let Err(e) = self.spawn_step(&workflow, &step, policies).await {
                tracing::error!(
                    workflow_id = %workflow.id,
                    step_id = %step.id,
                    error = %e,
                    "failed to spawn step session"
                );
                let _ = self
                    .store
                    .update_step(
                        &workflow.id,
                        &step.id,
                        StepPatch {
                            status: Some(StepStatus::Failed),
                            error: Some(format!("failed to start session: {e}")),
                            completed_at_ms: Some(now_ms()),
                            ..Default::default()
                        },
                    )
                    .await;
                let _ = self
                    .store
                    .add_event(
                        &workflow.id,
                        Some(&step.id),
                        WorkflowEventKind::StepFailed,
                        format!("failed to start session: {e}"),
                        None,
                    )
                    .await;
                let _ = self
                    .leaser
                    .revoke_task_leases(&task_id(&workflow.id, &step.id))
                    .await;
            }
        }
        Ok(())
    }

    async fn evaluate_terminal(&self, workflow: &Workflow, policies: &WorkflowPolicies) {
        if workflow.steps.is_empty() {
            return;
        }

        if workflow.all_steps_terminal() && workflow.all_steps_successful() {
            self.handle_all_steps_complete(workflow, policies).await;
            return;
        }

        // A failed step with nothing left running or ready fails the
        // workflow. A failed+running mix stays running until the rest
        // resolves.
        if workflow.any_step_failed() && workflow.running_steps() == 0 {
            self.fail_workflow(&workflow.id, "one or more steps failed with no remaining work")
                .await;
        }
    }

    // -----------------------------------------------------------------
    // Step spawn
    // -----------------------------------------------------------------

    async fn spawn_step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        policies: &WorkflowPolicies,
    ) -> Result<()> {
        let now = now_ms();
        let repo = workflow
            .repo
            .as_ref()
            .ok_or_else(|| GantryError::Internal("workflow has no repo context".into()))?;

        self.store
            .update_step(
                &workflow.id,
                &step.id,
                StepPatch {
                    status: Some(StepStatus::Running),
                    started_at_ms: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        // Snapshot the commit log; a git hiccup here is not fatal.
        let commits_before = match self
            .git
            .commit_log(&repo.path, &workflow.base_branch, &workflow.work_branch)
            .await
        {
            Ok(commits) => commits,
            Err(e) => {
                tracing::warn!(error = %e, "commit snapshot before spawn failed");
                Vec::new()
            }
        };
        self.store
            .update_step(
                &workflow.id,
                &step.id,
                StepPatch {
                    commits_before: Some(commits_before),
                    ..Default::default()
                },
            )
            .await?;

        // Provision credentials. Missing required credentials abort the
        // spawn; optional ones log and proceed.
        let step_task = task_id(&workflow.id, &step.id);
        let agent = format!("workflow:{}", workflow.id);
        let ttl_ms = policies.sessions.timeout_ms as i64 + LEASE_TTL_MARGIN_MS;
        let mut provisioned: Vec<(String, String)> = Vec::new();
        for required in &step.required_credentials {
            let lease = self
                .leaser
                .create_lease(LeaseRequest {
                    credential_id: required.credential_id.clone(),
                    task_id: step_task.clone(),
                    agent_id: agent.clone(),
                    ttl_ms,
                    max_uses: None,
                })
                .await;
            match lease {
                Ok(_) => provisioned.push((required.purpose.clone(), required.credential_id.clone())),
                Err(e) if required.required => {
                    return Err(GantryError::Internal(format!(
                        "required credential {} unavailable: {e}",
                        required.credential_id
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        credential_id = %required.credential_id,
                        error = %e,
                        "optional credential unavailable, continuing without it"
                    );
                }
            }
        }

        let key = session_key(&workflow.id, &step.id);
        let handle = self
            .spawner
            .spawn(SpawnRequest {
                session_key: key.clone(),
                message: build_step_prompt(workflow, step, &provisioned),
                cwd: Some(repo.path.clone()),
                label: Some(format!("{}: {}", workflow.title, step.title)),
                extra_system_prompt: Some(build_system_prompt(workflow)),
            })
            .await?;

        let now = now_ms();
        self.active.lock().await.insert(
            step.id.clone(),
            ActiveSession {
                workflow_id: workflow.id.clone(),
                step_id: step.id.clone(),
                session_key: key,
                run_id: handle.run_id.clone(),
                started_at_ms: now,
                poll_interval_ms: self.config.min_poll_interval_ms,
                timeout_ms: policies.sessions.timeout_ms,
                last_poll_ms: now,
            },
        );

        self.store
            .add_event(
                &workflow.id,
                Some(&step.id),
                WorkflowEventKind::SessionSpawned,
                format!("session spawned for step {}", step.index + 1),
                Some(serde_json::json!({"runId": handle.run_id})),
            )
            .await?;

        tracing::info!(workflow_id = %workflow.id, step_id = %step.id, run_id = %handle.run_id, "step session spawned");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Session polling
    // -----------------------------------------------------------------

    async fn poll_sessions(&self) {
        let sessions: Vec<ActiveSession> = self.active.lock().await.values().cloned().collect();

        for session in sessions {
            let now = now_ms();

            if now - session.started_at_ms > session.timeout_ms as i64 {
                self.handle_session_timeout(&session).await;
                continue;
            }

            if now - session.last_poll_ms < session.poll_interval_ms as i64 {
                continue;
            }
            if let Some(entry) = self.active.lock().await.get_mut(&session.step_id) {
                entry.last_poll_ms = now;
            }

            let status = match self.spawner.status(&session.run_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(run_id = %session.run_id, error = %e, "session status poll failed");
                    self.backoff(&session.step_id).await;
                    continue;
                }
            };

            if !status.done {
                self.backoff(&session.step_id).await;
                continue;
            }

            if status.success.unwrap_or(false) {
                self.handle_session_complete(&session, &status).await;
            } else {
                self.handle_session_failed(&session, &status).await;
            }
        }
    }

    async fn backoff(&self, step_id: &str) {
        if let Some(entry) = self.active.lock().await.get_mut(step_id) {
            let next = (entry.poll_interval_ms as f64 * POLL_BACKOFF_FACTOR) as u64;
            entry.poll_interval_ms = next.min(self.config.max_poll_interval_ms);
        }
    }

    async fn handle_session_timeout(&self, session: &ActiveSession) {
        tracing::warn!(
            workflow_id = %session.workflow_id,
            step_id = %session.step_id,
            "session exceeded its timeout"
        );
        self.fail_step_timeout(&session.workflow_id, &session.step_id).await;
        self.active.lock().await.remove(&session.step_id);
    }

    async fn fail_step_timeout(&self, workflow_id: &str, step_id: &str) {
        let _ = self
            .store
            .update_step(
                workflow_id,
                step_id,
                StepPatch {
                    status: Some(StepStatus::Failed),
                    error: Some("Session timed out".into()),
                    completed_at_ms: Some(now_ms()),
                    ..Default::default()
                },
            )
            .await;
        let _ = self
            .store
            .add_event(
                workflow_id,
                Some(step_id),
                WorkflowEventKind::SessionTimeout,
                "session timed out",
                None,
            )
            .await;
        let _ = self.leaser.revoke_task_leases(&task_id(workflow_id, step_id)).await;
    }

    async fn handle_session_complete(&self, session: &ActiveSession, status: &SessionStatus) {
        let workflow = self.store.get(&session.workflow_id).await;

        // Change snapshots are best-effort; a git error leaves them
        // empty rather than failing the step.
        let (commits_after, files_changed) = match &workflow {
            Some(workflow) => {
                let repo = workflow.repo.as_ref();
                let commits = match repo {
                    Some(repo) => self
                        .git
                        .commit_log(&repo.path, &workflow.base_branch, &workflow.work_branch)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "commit snapshot after session failed");
                            Vec::new()
                        }),
                    None => Vec::new(),
                };
                let files = match repo {
                    Some(repo) => self
                        .git
                        .diff_stat(&repo.path, &workflow.base_branch, &workflow.work_branch)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "diff stat after session failed");
                            Vec::new()
                        }),
                    None => Vec::new(),
                };
                (commits, files)
            }
            None => (Vec::new(), Vec::new()),
        };

        let tokens = status.tokens_used.unwrap_or(0);
        let tool_calls = status.tool_calls.unwrap_or(0);
        let (step_tokens, step_calls) = workflow
            .as_ref()
            .and_then(|w| w.step(&session.step_id))
            .map(|s| (s.token_usage + tokens, s.tool_calls + tool_calls))
            .unwrap_or((tokens, tool_calls));

        let _ = self
            .store
            .update_step(
                &session.workflow_id,
                &session.step_id,
                StepPatch {
                    status: Some(StepStatus::Complete),
                    result: status.output.clone(),
                    completed_at_ms: Some(now_ms()),
                    token_usage: Some(step_tokens),
                    tool_calls: Some(step_calls),
                    commits_after: Some(commits_after),
                    files_changed: Some(files_changed),
                    ..Default::default()
                },
            )
            .await;
        let _ = self
            .store
            .accrue_usage(&session.workflow_id, tokens, tool_calls)
            .await;
        let _ = self
            .store
            .add_event(
                &session.workflow_id,
                Some(&session.step_id),
                WorkflowEventKind::SessionCompleted,
                "session completed",
                Some(serde_json::json!({"tokensUsed": tokens, "toolCalls": tool_calls})),
            )
            .await;
        let _ = self
            .leaser
            .revoke_task_leases(&task_id(&session.workflow_id, &session.step_id))
            .await;

        self.active.lock().await.remove(&session.step_id);
        tracing::info!(workflow_id = %session.workflow_id, step_id = %session.step_id, "step completed");
    }

    async fn handle_session_failed(&self, session: &ActiveSession, status: &SessionStatus) {
        let error = status
            .output
            .clone()
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| "Session failed".to_string());

        let _ = self
            .store
            .update_step(
                &session.workflow_id,
                &session.step_id,
                StepPatch {
                    status: Some(StepStatus::Failed),
                    error: Some(error.clone()),
                    completed_at_ms: Some(now_ms()),
                    token_usage: status.tokens_used,
                    tool_calls: status.tool_calls,
                    ..Default::default()
                },
            )
            .await;
        let _ = self
            .store
            .add_event(
                &session.workflow_id,
                Some(&session.step_id),
                WorkflowEventKind::StepFailed,
                error,
                None,
            )
            .await;
        let _ = self
            .leaser
            .revoke_task_leases(&task_id(&session.workflow_id, &session.step_id))
            .await;

        self.active.lock().await.remove(&session.step_id);
    }

    // -----------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------

    async fn handle_all_steps_complete(&self, workflow: &Workflow, policies: &WorkflowPolicies) {
        let Some(repo) = workflow.repo.as_ref() else {
            self.fail_workflow(&workflow.id, "workflow has no repo context to push").await;
            return;
        };

        if let Err(e) = self.git.push_branch(&repo.path, &workflow.work_branch).await {
            self.fail_workflow(&workflow.id, &format!("branch push failed: {e}")).await;
            return;
        }
        let _ = self
            .store
            .add_event(
                &workflow.id,
                None,
                WorkflowEventKind::BranchPushed,
                format!("pushed {}", workflow.work_branch),
                None,
            )
            .await;

        let pr = match self
            .git
            .create_pr(&CreatePrArgs {
                owner: repo.owner.clone(),
                repo: repo.name.clone(),
                title: workflow.title.clone(),
                body: render_pr_body(workflow),
                head: workflow.work_branch.clone(),
                base: workflow.base_branch.clone(),
                draft: true,
                labels: policies.pr.labels.clone(),
                assignees: policies.pr.assignees.clone(),
                linked_issues: workflow.issue_number.into_iter().collect(),
            })
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                self.fail_workflow(&workflow.id, &format!("PR creation failed: {e}")).await;
                return;
            }
        };

        let updated = self
            .store
            .update_workflow(
                &workflow.id,
                WorkflowPatch {
                    status: Some(WorkflowStatus::PrOpen),
                    pull_request: Some(pr.clone()),
                    completed_at_ms: Some(now_ms()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = updated {
            tracing::error!(workflow_id = %workflow.id, error = %e, "failed to persist pr_open");
            return;
        }

        let _ = self
            .store
            .add_event(
                &workflow.id,
                None,
                WorkflowEventKind::PrCreated,
                format!("opened draft PR #{}", pr.number),
                Some(serde_json::json!({"number": pr.number, "url": pr.url})),
            )
            .await;
        self.broadcaster.emit(
            topics::WORKFLOW_PR_CREATED,
            serde_json::json!({"workflowId": workflow.id, "number": pr.number, "url": pr.url}),
        );
        tracing::info!(workflow_id = %workflow.id, pr = pr.number, "workflow finished, draft PR open");
    }

    async fn fail_workflow(&self, workflow_id: &str, message: &str) {
        tracing::error!(workflow_id, message, "workflow failed");
        if let Err(e) = self
            .store
            .update_workflow(
                workflow_id,
                WorkflowPatch {
                    status: Some(WorkflowStatus::Failed),
                    completed_at_ms: Some(now_ms()),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::error!(workflow_id, error = %e, "failed to persist workflow failure");
        }
        let _ = self
            .store
            .add_event(
                workflow_id,
                None,
                WorkflowEventKind::Error,
                message.to_string(),
                None,
            )
            .await;
    }
}
