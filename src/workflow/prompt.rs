//! Prompt and pull-request body rendering for workflow sessions.

use crate::workflow::model::{StepStatus, Workflow, WorkflowStep};

/// Per-step file listing cap in the PR body.
const PR_BODY_MAX_FILES: usize = 10;

/// Build the message handed to a step's coding session.
///
/// Layout: step heading, description, dependency results, provisioned
/// credentials, then workflow context.
pub fn build_step_prompt(
    workflow: &Workflow,
    step: &WorkflowStep,
    credentials: &[(String, String)],
) -> String {
    let mut prompt = format!("# Step {}: {}\n\n{}\n", step.index + 1, step.title, step.description);

    let dependency_results: Vec<&WorkflowStep> = step
        .depends_on
        .iter()
        .filter_map(|dep| workflow.step(dep))
        .filter(|dep| dep.result.is_some())
        .collect();
    if !dependency_results.is_empty() {
        prompt.push_str("\n## Previous step results:\n");
        for dep in dependency_results {
            prompt.push_str(&format!(
                "- {}: {}\n",
                dep.title,
                dep.result.as_deref().unwrap_or("")
            ));
        }
    }

    if !credentials.is_empty() {
        prompt.push_str("\n## Available Credentials:\n");
        for (purpose, credential_id) in credentials {
            prompt.push_str(&format!("- {purpose} ({credential_id})\n"));
        }
    }

    prompt.push_str("\n## Workflow context:\n");
    prompt.push_str(&format!("- Workflow: {}\n", workflow.title));
    if !workflow.description.is_empty() {
        prompt.push_str(&format!("- Goal: {}\n", workflow.description));
    }
    if let Some(issue) = workflow.issue_number {
        prompt.push_str(&format!("- Related issue: #{issue}\n"));
    }

    prompt
}

/// System prompt prepended to every step session: where to work and the
/// commit-but-do-not-push directive.
pub fn build_system_prompt(workflow: &Workflow) -> String {
    let repo = workflow
        .repo
        .as_ref()
        .map(|r| format!("{}/{}", r.owner, r.name))
        .unwrap_or_else(|| "the repository".to_string());

    format!(
        "You are executing one step of an automated workflow in {repo}.\n\
         Work on branch `{}` (branched from `{}`). Commit your changes with\n\
         clear messages as you go. Do NOT push; the orchestrator pushes the\n\
         branch and opens the pull request once every step has finished.",
        workflow.work_branch, workflow.base_branch
    )
}

/// Render the draft PR body for a finished workflow.
pub fn render_pr_body(workflow: &Workflow) -> String {
    let mut body = String::from("## Summary\n");
    body.push_str(&workflow.description);
    body.push('\n');

    if let Some(issue) = workflow.issue_number {
        body.push_str(&format!("\nCloses #{issue}\n"));
    }

    body.push_str("\n## Steps Completed\n");
    for step in &workflow.steps {
        let marker = match step.status {
            StepStatus::Complete => "+",
            StepStatus::Skipped => "-",
            _ => "x",
        };
        body.push_str(&format!("- [{marker}] Step {}: {}\n", step.index + 1, step.title));

        for change in step.files_changed.iter().take(PR_BODY_MAX_FILES) {
            body.push_str(&format!(
                "  - `{}` (+{}/-{})\n",
                change.path, change.additions, change.deletions
            ));
        }
        if step.files_changed.len() > PR_BODY_MAX_FILES {
            body.push_str(&format!(
                "  - ... and {} more files\n",
                step.files_changed.len() - PR_BODY_MAX_FILES
            ));
        }
    }

    let completed = workflow
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Complete)
        .count();
    body.push_str("\n## Budget\n");
    body.push_str(&format!("- tokens: {}\n", workflow.total_tokens));
    body.push_str(&format!("- toolCalls: {}\n", workflow.total_tool_calls));
    body.push_str(&format!("- {completed}/{} steps complete\n", workflow.steps.len()));

    body.push_str("\n---\nGenerated by gantry\n");
    body
}
