//! Approval gate: blocks a scheduled action on an asynchronously
//! resolved human decision.
//!
//! The gate creates a long-lived approval task through the surrounding
//! task service, polls it at a fixed cadence until it reaches a
//! terminal state, and applies the configured timeout action when the
//! human never answers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Terminal and non-terminal states of an approval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled | TaskState::Failed)
    }
}

/// Request to put in front of a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalTaskRequest {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

/// Snapshot of an approval task's progress.
#[derive(Debug, Clone, Copy)]
pub struct TaskSnapshot {
    pub state: TaskState,
    /// The human's answer, meaningful once `state` is `Completed`.
    pub approved: Option<bool>,
}

/// The surrounding task system, injected by the host application.
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, request: ApprovalTaskRequest) -> Result<String>;
    async fn task_status(&self, task_id: &str) -> Result<TaskSnapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
}

/// Outcome branch plus the task id for auditing.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub decision: Decision,
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Approve,
    #[default]
    Deny,
}

#[derive(Debug, Clone)]
pub struct ApprovalGateConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub timeout_action: TimeoutAction,
}

impl Default for ApprovalGateConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
            timeout_action: TimeoutAction::Deny,
        }
    }
}

pub struct ApprovalGate {
    tasks: Arc<dyn TaskService>,
    config: ApprovalGateConfig,
}

impl ApprovalGate {
    pub fn new(tasks: Arc<dyn TaskService>, config: ApprovalGateConfig) -> Self {
        Self { tasks, config }
    }

    /// Create the approval task and wait for its resolution.
    ///
    /// Cancelled and failed tasks deny. A poll error is transient and
    /// retried on the next cadence; only the overall timeout gives up.
    pub async fn await_decision(&self, request: ApprovalTaskRequest) -> Result<ApprovalOutcome> {
        let task_id = self.tasks.create_task(request).await?;
        tracing::debug!(task_id = %task_id, "approval task created");

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                let decision = match self.config.timeout_action {
                    TimeoutAction::Approve => Decision::Approved,
                    TimeoutAction::Deny => Decision::Denied,
                };
                tracing::warn!(task_id = %task_id, ?decision, "approval task timed out");
                return Ok(ApprovalOutcome { decision, task_id });
            }

            match self.tasks.task_status(&task_id).await {
                Ok(snapshot) if snapshot.state.is_terminal() => {
                    let decision = match (snapshot.state, snapshot.approved) {
                        (TaskState::Completed, Some(true)) => Decision::Approved,
                        _ => Decision::Denied,
                    };
                    return Ok(ApprovalOutcome { decision, task_id });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "approval task poll failed");
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
