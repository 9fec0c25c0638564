//! Workflow data model: workflows, steps, events, and policies.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};
use crate::git::{FileChange, PullRequest, RepoContext};
use crate::store::StoreDocument;

/// Events kept per workflow; older entries are trimmed newest-wins.
pub const MAX_EVENTS_PER_WORKFLOW: usize = 500;

/// Branch prefix applied when the caller supplies neither a branch name
/// nor a prefix.
pub const DEFAULT_BRANCH_PREFIX: &str = "feat/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Planning,
    Running,
    Paused,
    PrOpen,
    Complete,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Complete | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Legal transitions of the workflow state machine. Terminal states
    /// are sticky; `pr_open -> complete` is driven externally when the
    /// PR merges.
    pub fn can_transition(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if self == to {
            return false;
        }
        match self {
            Planning => matches!(to, Running | Cancelled),
            Running => matches!(to, Paused | PrOpen | Failed | Cancelled),
            Paused => matches!(to, Running | Cancelled),
            PrOpen => matches!(to, Complete | Failed | Cancelled),
            Complete | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::PrOpen => "pr_open",
            WorkflowStatus::Complete => "complete",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Complete | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Terminal and counting toward a successful workflow.
    pub fn is_successful_terminal(&self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Skipped)
    }
}

/// A credential a step needs provisioned before its session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredCredential {
    pub credential_id: String,
    pub purpose: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub description: String,
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    pub token_usage: u64,
    pub tool_calls: u64,
    pub commits_before: Vec<String>,
    pub commits_after: Vec<String>,
    pub files_changed: Vec<FileChange>,
    #[serde(default)]
    pub required_credentials: Vec<RequiredCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoContext>,
    pub base_branch: String,
    pub work_branch: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    pub total_tokens: u64,
    pub total_tool_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequest>,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Steps eligible to run: pending with every dependency complete or
    /// skipped. Ordered by index for deterministic scheduling.
    pub fn ready_steps(&self) -> Vec<&WorkflowStep> {
        let mut ready: Vec<&WorkflowStep> = self
            .steps
            .iter()
            .filter(|step| {
                step.status == StepStatus::Pending
                    && step.depends_on.iter().all(|dep| {
                        self.step(dep)
                            .map(|d| d.status.is_successful_terminal())
                            .unwrap_or(false)
                    })
            })
            .collect();
        ready.sort_by_key(|s| s.index);
        ready
    }

    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn all_steps_successful(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_successful_terminal())
    }

    pub fn any_step_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn running_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    StatusChange,
    SessionSpawned,
    SessionCompleted,
    SessionTimeout,
    StepFailed,
    BranchPushed,
    PrCreated,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: WorkflowEventKind,
    pub timestamp_ms: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPolicies {
    /// Per-workflow ceiling on concurrently running steps.
    pub max_concurrent: usize,
    /// Per-step wall clock budget.
    pub timeout_ms: u64,
    pub max_tokens_per_step: u64,
    pub max_tokens_per_workflow: u64,
    pub allowed_modes: Vec<String>,
}

impl Default for SessionPolicies {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            timeout_ms: 300_000,
            max_tokens_per_step: 100_000,
            max_tokens_per_workflow: 500_000,
            allowed_modes: vec!["Claude".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrPolicies {
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowPolicies {
    pub sessions: SessionPolicies,
    pub pr: PrPolicies,
}

/// Deep-merge patch for [`WorkflowPolicies`]; unset fields keep their
/// current values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowPoliciesPatch {
    pub sessions: SessionPoliciesPatch,
    pub pr: PrPoliciesPatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPoliciesPatch {
    pub max_concurrent: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub max_tokens_per_step: Option<u64>,
    pub max_tokens_per_workflow: Option<u64>,
    pub allowed_modes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrPoliciesPatch {
    pub labels: Option<Vec<String>>,
    pub assignees: Option<Vec<String>>,
}

impl WorkflowPolicies {
    pub fn apply(&mut self, patch: WorkflowPoliciesPatch) {
        if let Some(v) = patch.sessions.max_concurrent {
            self.sessions.max_concurrent = v;
        }
        if let Some(v) = patch.sessions.timeout_ms {
            self.sessions.timeout_ms = v;
        }
        if let Some(v) = patch.sessions.max_tokens_per_step {
            self.sessions.max_tokens_per_step = v;
        }
        if let Some(v) = patch.sessions.max_tokens_per_workflow {
            self.sessions.max_tokens_per_workflow = v;
        }
        if let Some(v) = patch.sessions.allowed_modes {
            self.sessions.allowed_modes = v;
        }
        if let Some(v) = patch.pr.labels {
            self.pr.labels = v;
        }
        if let Some(v) = patch.pr.assignees {
            self.pr.assignees = v;
        }
    }
}

// ---------------------------------------------------------------------
// Inputs and patches
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepInput {
    pub title: String,
    pub description: String,
    /// Indices into the input step list.
    pub depends_on: Vec<usize>,
    pub required_credentials: Vec<RequiredCredential>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateWorkflowInput {
    pub title: String,
    pub description: String,
    pub trigger: Option<String>,
    /// Explicit repo context; when absent it is resolved from
    /// `repo_path` via the git adapter.
    pub repo: Option<RepoContext>,
    pub repo_path: Option<std::path::PathBuf>,
    pub base_branch: Option<String>,
    pub branch_name: Option<String>,
    pub branch_prefix: Option<String>,
    pub issue_number: Option<u64>,
    pub steps: Vec<StepInput>,
}

/// Patch for workflow fields the engine and callers mutate.
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub status: Option<WorkflowStatus>,
    pub completed_at_ms: Option<i64>,
    pub started_at_ms: Option<i64>,
    pub pull_request: Option<PullRequest>,
    pub issue_number: Option<u64>,
}

/// Patch for step fields.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub clear_error: bool,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub token_usage: Option<u64>,
    pub tool_calls: Option<u64>,
    pub commits_before: Option<Vec<String>>,
    pub commits_after: Option<Vec<String>>,
    pub files_changed: Option<Vec<FileChange>>,
}

// ---------------------------------------------------------------------
// Store document
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowStoreDoc {
    pub version: u32,
    pub workflows: Vec<Workflow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<WorkflowPolicies>,
    pub events: Vec<WorkflowEvent>,
}

impl StoreDocument for WorkflowStoreDoc {
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }
}

impl WorkflowStoreDoc {
    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.id == id)
    }

    pub fn workflow_mut(&mut self, id: &str) -> Option<&mut Workflow> {
        self.workflows.iter_mut().find(|w| w.id == id)
    }
}

// ---------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------

pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(50)
        .collect()
}

/// Validate a step list's dependency indices form a DAG with no
/// self-references or out-of-range edges.
pub fn validate_step_graph(steps: &[StepInput]) -> Result<()> {
    for (i, step) in steps.iter().enumerate() {
        for &dep in &step.depends_on {
            if dep >= steps.len() {
                return Err(GantryError::Validation(format!(
                    "step {i} depends on unknown step index {dep}"
                )));
            }
            if dep == i {
                return Err(GantryError::Validation(format!(
                    "step {i} depends on itself"
                )));
            }
        }
    }

    // DFS cycle check over the index graph.
    fn visit(
        node: usize,
        steps: &[StepInput],
        visiting: &mut HashSet<usize>,
        done: &mut HashSet<usize>,
    ) -> Result<()> {
        if done.contains(&node) {
            return Ok(());
        }
        if !visiting.insert(node) {
            return Err(GantryError::Validation(
                "step dependencies contain a cycle".into(),
            ));
        }
        for &dep in &steps[node].depends_on {
            visit(dep, steps, visiting, done)?;
        }
        visiting.remove(&node);
        done.insert(node);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for i in 0..steps.len() {
        visit(i, steps, &mut visiting, &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(deps: Vec<usize>) -> StepInput {
        StepInput {
            title: "step".into(),
            description: String::new(),
            depends_on: deps,
            required_credentials: vec![],
        }
    }

    #[test]
    fn slugify_matches_branch_expectations() {
        assert_eq!(slugify("Add JWT auth!"), "add-jwt-auth");
        assert_eq!(slugify("  weird -- spacing  "), "weird-spacing");
        assert!(slugify(&"long title ".repeat(20)).len() <= 50);
    }

    #[test]
    fn graph_validation_accepts_diamond() {
        let steps = vec![step(vec![]), step(vec![0]), step(vec![0]), step(vec![1, 2])];
        assert!(validate_step_graph(&steps).is_ok());
    }

    #[test]
    fn graph_validation_rejects_cycle() {
        let steps = vec![step(vec![2]), step(vec![0]), step(vec![1])];
        assert!(validate_step_graph(&steps).is_err());
    }

    #[test]
    fn graph_validation_rejects_self_and_unknown() {
        assert!(validate_step_graph(&[step(vec![0])]).is_err());
        assert!(validate_step_graph(&[step(vec![5])]).is_err());
    }

    #[test]
    fn workflow_status_transitions() {
        use WorkflowStatus::*;
        assert!(Planning.can_transition(Running));
        assert!(Running.can_transition(PrOpen));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(PrOpen.can_transition(Complete));
        assert!(Planning.can_transition(Cancelled));

        // Terminal states are sticky.
        for terminal in [Complete, Failed, Cancelled] {
            for target in [Planning, Running, Paused, PrOpen, Complete, Failed, Cancelled] {
                assert!(!terminal.can_transition(target));
            }
        }

        assert!(!Planning.can_transition(PrOpen));
        assert!(!Paused.can_transition(PrOpen));
    }

    #[test]
    fn ready_steps_respect_dependencies_and_index_order() {
        let mk = |id: &str, index: usize, deps: Vec<&str>, status: StepStatus| WorkflowStep {
            id: id.into(),
            index,
            title: id.into(),
            description: String::new(),
            depends_on: deps.into_iter().map(String::from).collect(),
            status,
            result: None,
            error: None,
            started_at_ms: None,
            completed_at_ms: None,
            token_usage: 0,
            tool_calls: 0,
            commits_before: vec![],
            commits_after: vec![],
            files_changed: vec![],
            required_credentials: vec![],
        };

        let workflow = Workflow {
            id: "w".into(),
            title: "t".into(),
            description: String::new(),
            status: WorkflowStatus::Running,
            trigger: "manual".into(),
            repo: None,
            base_branch: "main".into(),
            work_branch: "feat/x".into(),
            created_at_ms: 0,
            updated_at_ms: 0,
            started_at_ms: None,
            completed_at_ms: None,
            total_tokens: 0,
            total_tool_calls: 0,
            issue_number: None,
            pull_request: None,
            steps: vec![
                mk("a", 0, vec![], StepStatus::Complete),
                mk("b", 1, vec!["a"], StepStatus::Pending),
                mk("c", 2, vec!["a"], StepStatus::Pending),
                mk("d", 3, vec!["b", "c"], StepStatus::Pending),
                mk("e", 4, vec![], StepStatus::Skipped),
            ],
        };

        let ready: Vec<&str> = workflow.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn policies_deep_merge_is_idempotent() {
        let mut policies = WorkflowPolicies::default();
        let patch = WorkflowPoliciesPatch {
            sessions: SessionPoliciesPatch {
                max_concurrent: Some(4),
                ..Default::default()
            },
            pr: PrPoliciesPatch {
                labels: Some(vec!["automated".into()]),
                ..Default::default()
            },
        };

        policies.apply(patch);
        let after_first = policies.clone();

        // An empty patch changes nothing.
        policies.apply(WorkflowPoliciesPatch::default());
        assert_eq!(policies, after_first);
        assert_eq!(policies.sessions.max_concurrent, 4);
        // Untouched fields keep their defaults.
        assert_eq!(policies.sessions.timeout_ms, 300_000);
    }
}
