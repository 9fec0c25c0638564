//! Typed accessor over the workflow store file: workflow lifecycle,
//! step mutation, event append, and policy read/write.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{GantryError, Result};
use crate::events::{topics, Broadcaster};
use crate::git::GitAdapter;
use crate::now_ms;
use crate::store::{JsonStore, StoreDocument};
use crate::workflow::model::{
    slugify, validate_step_graph, CreateWorkflowInput, StepPatch, StepStatus, Workflow,
    WorkflowEvent, WorkflowEventKind, WorkflowPatch, WorkflowPolicies, WorkflowPoliciesPatch,
    WorkflowStatus, WorkflowStep, WorkflowStoreDoc, DEFAULT_BRANCH_PREFIX,
    MAX_EVENTS_PER_WORKFLOW,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusAudit<'a> {
    timestamp_ms: i64,
    workflow_id: &'a str,
    from: String,
    to: String,
}

pub struct WorkflowStore {
    store: JsonStore<WorkflowStoreDoc>,
    git: Arc<dyn GitAdapter>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl WorkflowStore {
    pub fn new(
        store_path: impl Into<PathBuf>,
        git: Arc<dyn GitAdapter>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            store: JsonStore::new(store_path),
            git,
            broadcaster,
        }
    }

    /// Create a workflow. Seeding it with steps starts it running;
    /// otherwise it lands in planning.
    pub async fn create(&self, input: CreateWorkflowInput) -> Result<Workflow> {
        if input.title.trim().is_empty() {
            return Err(GantryError::Validation("workflow title is required".into()));
        }
        validate_step_graph(&input.steps)?;

        let repo = match (input.repo, input.repo_path) {
            (Some(repo), _) => repo,
            (None, Some(path)) => self.git.resolve_repo_context(&path).await?,
            (None, None) => {
                return Err(GantryError::Validation(
                    "workflow needs a repo context or repo path".into(),
                ))
            }
        };

        let base_branch = match input.base_branch {
            Some(branch) => branch,
            None => self
                .git
                .current_branch(&repo.path)
                .await
                .unwrap_or_else(|_| "main".to_string()),
        };

        let work_branch = input.branch_name.unwrap_or_else(|| {
            let prefix = input
                .branch_prefix
                .unwrap_or_else(|| DEFAULT_BRANCH_PREFIX.to_string());
            let short_id = uuid::Uuid::new_v4().simple().to_string();
            format!("{prefix}{}-{}", slugify(&input.title), &short_id[..8])
        });
        if work_branch == base_branch {
            return Err(GantryError::Validation(format!(
                "work branch {work_branch:?} must differ from base branch"
            )));
        }

        let now = now_ms();
        let step_ids: Vec<String> = input
            .steps
            .iter()
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect();
        let steps: Vec<WorkflowStep> = input
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| WorkflowStep {
                id: step_ids[index].clone(),
                index,
                title: step.title,
                description: step.description,
                depends_on: step
                    .depends_on
                    .iter()
                    .map(|&dep| step_ids[dep].clone())
                    .collect(),
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at_ms: None,
                completed_at_ms: None,
                token_usage: 0,
                tool_calls: 0,
                commits_before: Vec::new(),
                commits_after: Vec::new(),
                files_changed: Vec::new(),
                required_credentials: step.required_credentials,
            })
            .collect();

        let status = if steps.is_empty() {
            WorkflowStatus::Planning
        } else {
            WorkflowStatus::Running
        };

        let workflow = Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            title: input.title,
            description: input.description,
            status,
            trigger: input.trigger.unwrap_or_else(|| "manual".to_string()),
            repo: Some(repo),
            base_branch,
            work_branch,
            created_at_ms: now,
            updated_at_ms: now,
            started_at_ms: (status == WorkflowStatus::Running).then_some(now),
            completed_at_ms: None,
            total_tokens: 0,
            total_tool_calls: 0,
            issue_number: input.issue_number,
            pull_request: None,
            steps,
        };

        let stored = workflow.clone();
        self.store
            .update(move |doc| {
                doc.version = WorkflowStoreDoc::VERSION;
                push_event(
                    doc,
                    &stored.id,
                    None,
                    WorkflowEventKind::StatusChange,
                    format!("workflow created ({status})"),
                    None,
                );
                doc.workflows.push(stored);
                Ok(())
            })
            .await?;

        self.broadcaster.emit(
            topics::WORKFLOW_CREATED,
            serde_json::json!({"workflowId": workflow.id, "status": workflow.status}),
        );
        Ok(workflow)
    }

    pub async fn get(&self, id: &str) -> Option<Workflow> {
        self.store.read().await.workflow(id).cloned()
    }

    pub async fn list(&self) -> Vec<Workflow> {
        self.store.read().await.workflows
    }

    pub async fn list_by_status(&self, status: WorkflowStatus) -> Vec<Workflow> {
        self.store
            .read()
            .await
            .workflows
            .into_iter()
            .filter(|w| w.status == status)
            .collect()
    }

    /// Apply a patch to a workflow. Status changes are validated against
    /// the state machine; an illegal transition is an invariant
    /// violation and errors without mutation.
    pub async fn update_workflow(
        &self,
        id: &str,
        patch: WorkflowPatch,
    ) -> Result<Option<Workflow>> {
        let id_owned = id.to_string();
        let result = self
            .store
            .update(move |doc| {
                let now = now_ms();
                let Some(workflow) = doc.workflow_mut(&id_owned) else {
                    return Ok(None);
                };
                let from = workflow.status;

                if let Some(to) = patch.status {
                    if !from.can_transition(to) {
                        return Err(GantryError::Validation(format!(
                            "illegal workflow transition {from} -> {to}"
                        )));
                    }
                    workflow.status = to;
                    if to == WorkflowStatus::Running && workflow.started_at_ms.is_none() {
                        workflow.started_at_ms = Some(now);
                    }
                }
                if let Some(completed) = patch.completed_at_ms {
                    workflow.completed_at_ms = Some(completed);
                }
                if let Some(started) = patch.started_at_ms {
                    workflow.started_at_ms = Some(started);
                }
                if let Some(pr) = patch.pull_request {
                    workflow.pull_request = Some(pr);
                }
                if let Some(issue) = patch.issue_number {
                    workflow.issue_number = Some(issue);
                }
                workflow.updated_at_ms = now;
                let snapshot = workflow.clone();

                if let Some(to) = patch.status {
                    push_event(
                        doc,
                        &id_owned,
                        None,
                        WorkflowEventKind::StatusChange,
                        format!("status {from} -> {to}"),
                        None,
                    );
                }
                Ok(Some((snapshot, patch.status.map(|to| (from, to)))))
            })
            .await?;

        let Some((workflow, status_change)) = result else {
            return Ok(None);
        };

        self.broadcaster.emit(
            topics::WORKFLOW_UPDATED,
            serde_json::json!({"workflowId": workflow.id, "status": workflow.status}),
        );
        if let Some((from, to)) = status_change {
            if to == WorkflowStatus::Failed {
                self.broadcaster.emit(
                    topics::WORKFLOW_FAILED,
                    serde_json::json!({"workflowId": workflow.id}),
                );
            }
            let audit = StatusAudit {
                timestamp_ms: now_ms(),
                workflow_id: &workflow.id,
                from: from.to_string(),
                to: to.to_string(),
            };
            if let Err(e) = self.store.append_audit(&audit).await {
                tracing::warn!(error = %e, "failed to append workflow audit entry");
            }
        }
        Ok(Some(workflow))
    }

    /// Apply a patch to one step. Works for any workflow status so late
    /// session completions keep their bookkeeping.
    pub async fn update_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<Option<WorkflowStep>> {
        let workflow_owned = workflow_id.to_string();
        let step_owned = step_id.to_string();
        let updated = self
            .store
            .update(move |doc| {
                let Some(workflow) = doc.workflow_mut(&workflow_owned) else {
                    return Ok(None);
                };
                let Some(step) = workflow.step_mut(&step_owned) else {
                    return Ok(None);
                };

                if let Some(status) = patch.status {
                    step.status = status;
                }
                if let Some(result) = patch.result {
                    step.result = Some(result);
                }
                if patch.clear_error {
                    step.error = None;
                } else if let Some(error) = patch.error {
                    step.error = Some(error);
                }
                if let Some(started) = patch.started_at_ms {
                    step.started_at_ms = Some(started);
                }
                if let Some(completed) = patch.completed_at_ms {
                    step.completed_at_ms = Some(completed);
                }
                if let Some(tokens) = patch.token_usage {
                    step.token_usage = tokens;
                }
                if let Some(calls) = patch.tool_calls {
                    step.tool_calls = calls;
                }
                if let Some(commits) = patch.commits_before {
                    step.commits_before = commits;
                }
                if let Some(commits) = patch.commits_after {
                    step.commits_after = commits;
                }
                if let Some(files) = patch.files_changed {
                    step.files_changed = files;
                }

                let snapshot = step.clone();
                workflow.updated_at_ms = now_ms();
                Ok(Some(snapshot))
            })
            .await?;

        if let Some(step) = &updated {
            self.broadcaster.emit(
                topics::WORKFLOW_UPDATED,
                serde_json::json!({"workflowId": workflow_id, "stepId": step.id, "stepStatus": step.status}),
            );
        }
        Ok(updated)
    }

    /// Accrue session spend onto the workflow's monotone totals.
    pub async fn accrue_usage(&self, workflow_id: &str, tokens: u64, tool_calls: u64) -> Result<()> {
        let id_owned = workflow_id.to_string();
        self.store
            .update(move |doc| {
                if let Some(workflow) = doc.workflow_mut(&id_owned) {
                    workflow.total_tokens += tokens;
                    workflow.total_tool_calls += tool_calls;
                    workflow.updated_at_ms = now_ms();
                }
                Ok(())
            })
            .await
    }

    /// Cancel a workflow: terminal status, pending steps skipped.
    /// Idempotent on already-terminal workflows.
    pub async fn cancel(&self, id: &str) -> Result<Option<Workflow>> {
        let id_owned = id.to_string();
        let result = self
            .store
            .update(move |doc| {
                let now = now_ms();
                let Some(workflow) = doc.workflow_mut(&id_owned) else {
                    return Ok(None);
                };
                if workflow.status.is_terminal() {
                    return Ok(Some((workflow.clone(), false)));
                }

                let from = workflow.status;
                workflow.status = WorkflowStatus::Cancelled;
                workflow.completed_at_ms = Some(now);
                workflow.updated_at_ms = now;
                for step in &mut workflow.steps {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Skipped;
                        step.completed_at_ms = Some(now);
                    }
                }
                let snapshot = workflow.clone();
                push_event(
                    doc,
                    &id_owned,
                    None,
                    WorkflowEventKind::StatusChange,
                    format!("status {from} -> cancelled"),
                    None,
                );
                Ok(Some((snapshot, true)))
            })
            .await?;

        let Some((workflow, changed)) = result else {
            return Ok(None);
        };
        if changed {
            self.broadcaster.emit(
                topics::WORKFLOW_UPDATED,
                serde_json::json!({"workflowId": workflow.id, "status": workflow.status}),
            );
        }
        Ok(Some(workflow))
    }

    /// Pause a running workflow. `Ok(None)` when the transition does not
    /// apply.
    pub async fn pause(&self, id: &str) -> Result<Option<Workflow>> {
        self.transition_if(id, WorkflowStatus::Paused).await
    }

    /// Resume a paused workflow.
    pub async fn resume(&self, id: &str) -> Result<Option<Workflow>> {
        self.transition_if(id, WorkflowStatus::Running).await
    }

    async fn transition_if(&self, id: &str, to: WorkflowStatus) -> Result<Option<Workflow>> {
        let current = match self.get(id).await {
            Some(workflow) => workflow.status,
            None => return Ok(None),
        };
        if !current.can_transition(to) {
            return Ok(None);
        }
        self.update_workflow(
            id,
            WorkflowPatch {
                status: Some(to),
                ..Default::default()
            },
        )
        .await
    }

    /// Reset a failed step to pending, keeping its accumulated budget
    /// and commit snapshots. `Ok(None)` unless the step is failed.
    pub async fn retry_step(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<WorkflowStep>> {
        let workflow_owned = workflow_id.to_string();
        let step_owned = step_id.to_string();
        self.store
            .update(move |doc| {
                let Some(workflow) = doc.workflow_mut(&workflow_owned) else {
                    return Ok(None);
                };
                let Some(step) = workflow.step_mut(&step_owned) else {
                    return Ok(None);
                };
                if step.status != StepStatus::Failed {
                    return Ok(None);
                }
                step.status = StepStatus::Pending;
                step.error = None;
                step.started_at_ms = None;
                step.completed_at_ms = None;
                let snapshot = step.clone();
                workflow.updated_at_ms = now_ms();
                Ok(Some(snapshot))
            })
            .await
    }

    /// Append an event to the workflow's bounded log.
    pub async fn add_event(
        &self,
        workflow_id: &str,
        step_id: Option<&str>,
        kind: WorkflowEventKind,
        message: impl Into<String>,
        detail: Option<serde_json::Value>,
    ) -> Result<WorkflowEvent> {
        let workflow_owned = workflow_id.to_string();
        let step_owned = step_id.map(str::to_string);
        let message = message.into();
        self.store
            .update(move |doc| {
                Ok(push_event(
                    doc,
                    &workflow_owned,
                    step_owned,
                    kind,
                    message,
                    detail,
                ))
            })
            .await
    }

    /// Newest-first slice of a workflow's events.
    pub async fn events(&self, workflow_id: &str, limit: Option<usize>) -> Vec<WorkflowEvent> {
        let doc = self.store.read().await;
        let mut events: Vec<WorkflowEvent> = doc
            .events
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id)
            .collect();
        events.reverse();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    /// Current policies; defaults when never configured.
    pub async fn policies(&self) -> WorkflowPolicies {
        self.store.read().await.policies.unwrap_or_default()
    }

    /// Deep-merge a policies patch and persist the result.
    pub async fn update_policies(&self, patch: WorkflowPoliciesPatch) -> Result<WorkflowPolicies> {
        let updated = self
            .store
            .update(move |doc| {
                let mut policies = doc.policies.take().unwrap_or_default();
                policies.apply(patch);
                doc.policies = Some(policies.clone());
                Ok(policies)
            })
            .await?;

        self.broadcaster.emit(
            topics::WORKFLOW_POLICIES_UPDATED,
            serde_json::to_value(&updated).unwrap_or_default(),
        );
        Ok(updated)
    }
}

/// Append an event and trim the workflow's log to its cap, oldest out.
fn push_event(
    doc: &mut WorkflowStoreDoc,
    workflow_id: &str,
    step_id: Option<String>,
    kind: WorkflowEventKind,
    message: String,
    detail: Option<serde_json::Value>,
) -> WorkflowEvent {
    let event = WorkflowEvent {
        id: uuid::Uuid::new_v4().to_string(),
        workflow_id: workflow_id.to_string(),
        step_id,
        kind,
        timestamp_ms: now_ms(),
        message,
        detail,
    };
    doc.events.push(event.clone());

    let count = doc
        .events
        .iter()
        .filter(|e| e.workflow_id == workflow_id)
        .count();
    if count > MAX_EVENTS_PER_WORKFLOW {
        let mut excess = count - MAX_EVENTS_PER_WORKFLOW;
        doc.events.retain(|e| {
            if excess > 0 && e.workflow_id == workflow_id {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
    event
}
