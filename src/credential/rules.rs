//! Permission rule compilation and evaluation.
//!
//! Rules are small textual predicates attached to a credential, e.g.
//!
//! ```text
//! deny: tool=execute_code
//! deny: agent=workflow:* && hour<6
//! allow: tool=web_fetch && action=read
//! ```
//!
//! A rule is `[allow:|deny:]` followed by `&&`-joined clauses over
//! `tool`, `action`, `agent`, `task`, and `hour`. String clauses accept
//! `=` / `!=` with a trailing `*` prefix wildcard; `hour` accepts `<` /
//! `>=` against the checkout hour (UTC, 0-23). A rule with no prefix
//! denies. Compilation is deterministic and evaluation is side-effect
//! free; deny wins over allow.

use chrono::{DateTime, Timelike, Utc};

use crate::credential::model::PermissionRule;
use crate::error::{GantryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    StrEq { key: StrKey, value: String, negated: bool },
    HourLt(u32),
    HourGte(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrKey {
    Tool,
    Action,
    Agent,
    Task,
}

/// A compiled permission rule.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub effect: RuleEffect,
    clauses: Vec<Clause>,
}

/// Context a rule is evaluated against.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub tool_name: Option<&'a str>,
    pub action: Option<&'a str>,
    pub agent_id: &'a str,
    pub task_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Outcome of evaluating a rule set.
#[derive(Debug, Clone)]
pub struct RuleVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub matched_rules: Vec<String>,
}

/// Compile a rule text into its predicate form.
pub fn compile_rule(text: &str) -> Result<CompiledRule> {
    let trimmed = text.trim();
    let (effect, body) = if let Some(rest) = trimmed.strip_prefix("allow:") {
        (RuleEffect::Allow, rest)
    } else if let Some(rest) = trimmed.strip_prefix("deny:") {
        (RuleEffect::Deny, rest)
    } else {
        (RuleEffect::Deny, trimmed)
    };

    let mut clauses = Vec::new();
    for raw in body.split("&&") {
        let clause = raw.trim();
        if clause.is_empty() {
            return Err(GantryError::Validation(format!(
                "empty clause in rule: {text:?}"
            )));
        }
        clauses.push(parse_clause(clause)?);
    }

    Ok(CompiledRule { effect, clauses })
}

fn parse_clause(clause: &str) -> Result<Clause> {
    if let Some((key, value)) = split_once_trim(clause, "!=") {
        return Ok(Clause::StrEq {
            key: parse_str_key(key, clause)?,
            value: value.to_string(),
            negated: true,
        });
    }
    if let Some((key, value)) = split_once_trim(clause, ">=") {
        if key == "hour" {
            return Ok(Clause::HourGte(parse_hour(value, clause)?));
        }
        return Err(invalid_clause(clause));
    }
    if let Some((key, value)) = split_once_trim(clause, "<") {
        if key == "hour" {
            return Ok(Clause::HourLt(parse_hour(value, clause)?));
        }
        return Err(invalid_clause(clause));
    }
    if let Some((key, value)) = split_once_trim(clause, "=") {
        return Ok(Clause::StrEq {
            key: parse_str_key(key, clause)?,
            value: value.to_string(),
            negated: false,
        });
    }
    Err(invalid_clause(clause))
}

fn split_once_trim<'a>(clause: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    clause
        .split_once(op)
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
}

fn parse_str_key(key: &str, clause: &str) -> Result<StrKey> {
    match key {
        "tool" => Ok(StrKey::Tool),
        "action" => Ok(StrKey::Action),
        "agent" => Ok(StrKey::Agent),
        "task" => Ok(StrKey::Task),
        _ => Err(invalid_clause(clause)),
    }
}

fn parse_hour(value: &str, clause: &str) -> Result<u32> {
    let hour: u32 = value.parse().map_err(|_| invalid_clause(clause))?;
    if hour > 23 {
        return Err(invalid_clause(clause));
    }
    Ok(hour)
}

fn invalid_clause(clause: &str) -> GantryError {
    GantryError::Validation(format!("invalid rule clause: {clause:?}"))
}

impl CompiledRule {
    /// A rule matches when every clause holds.
    pub fn matches(&self, ctx: &RuleContext<'_>) -> bool {
        self.clauses.iter().all(|clause| clause_matches(clause, ctx))
    }
}

fn clause_matches(clause: &Clause, ctx: &RuleContext<'_>) -> bool {
    match clause {
        Clause::StrEq { key, value, negated } => {
            let actual = match key {
                StrKey::Tool => ctx.tool_name,
                StrKey::Action => ctx.action,
                StrKey::Agent => Some(ctx.agent_id),
                StrKey::Task => ctx.task_id,
            };
            let hit = actual.map(|a| str_match(value, a)).unwrap_or(false);
            hit != *negated
        }
        Clause::HourLt(hour) => ctx.now.hour() < *hour,
        Clause::HourGte(hour) => ctx.now.hour() >= *hour,
    }
}

fn str_match(pattern: &str, actual: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => actual.starts_with(prefix),
        None => actual == pattern,
    }
}

/// Evaluate every enabled rule against the context. Uncompilable rules
/// are skipped with a warning (they cannot deny what they cannot
/// express). Any matching deny rule blocks; matching allow rules are
/// reported in `matched_rules`.
pub fn evaluate_rules(rules: &[PermissionRule], ctx: &RuleContext<'_>) -> RuleVerdict {
    let mut matched_rules = Vec::new();
    let mut denied_by: Option<String> = None;

    for rule in rules.iter().filter(|r| r.enabled) {
        let compiled = match compile_rule(&rule.text) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, error = %e, "skipping uncompilable permission rule");
                continue;
            }
        };

        if compiled.matches(ctx) {
            matched_rules.push(rule.id.clone());
            if compiled.effect == RuleEffect::Deny && denied_by.is_none() {
                denied_by = Some(rule.id.clone());
            }
        }
    }

    match denied_by {
        Some(id) => RuleVerdict {
            allowed: false,
            reason: Some(format!("denied by rule {id}")),
            matched_rules,
        },
        None => RuleVerdict {
            allowed: true,
            reason: None,
            matched_rules,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx<'a>(tool: Option<&'a str>, agent: &'a str, hour: u32) -> RuleContext<'a> {
        RuleContext {
            tool_name: tool,
            action: None,
            agent_id: agent,
            task_id: None,
            now: Utc.with_ymd_and_hms(2026, 3, 1, hour, 30, 0).unwrap(),
        }
    }

    fn rule(id: &str, text: &str) -> PermissionRule {
        PermissionRule {
            id: id.to_string(),
            text: text.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn compile_rejects_garbage() {
        assert!(compile_rule("deny: tool=").is_err());
        assert!(compile_rule("deny: color=red").is_err());
        assert!(compile_rule("deny: hour<99").is_err());
        assert!(compile_rule("deny: && tool=x").is_err());
    }

    #[test]
    fn bare_rule_defaults_to_deny() {
        let compiled = compile_rule("tool=execute_code").unwrap();
        assert_eq!(compiled.effect, RuleEffect::Deny);
    }

    #[test]
    fn deny_rule_blocks_matching_tool() {
        let rules = vec![rule("r1", "deny: tool=execute_code")];

        let verdict = evaluate_rules(&rules, &ctx(Some("execute_code"), "agent-1", 12));
        assert!(!verdict.allowed);
        assert_eq!(verdict.matched_rules, vec!["r1".to_string()]);

        let verdict = evaluate_rules(&rules, &ctx(Some("read_file"), "agent-1", 12));
        assert!(verdict.allowed);
        assert!(verdict.matched_rules.is_empty());
    }

    #[test]
    fn wildcard_and_conjunction() {
        let rules = vec![rule("night", "deny: agent=workflow:* && hour<6")];

        assert!(!evaluate_rules(&rules, &ctx(None, "workflow:w1", 3)).allowed);
        assert!(evaluate_rules(&rules, &ctx(None, "workflow:w1", 9)).allowed);
        assert!(evaluate_rules(&rules, &ctx(None, "chat:u1", 3)).allowed);
    }

    #[test]
    fn disabled_rules_are_ignored() {
        let mut r = rule("r1", "deny: tool=execute_code");
        r.enabled = false;

        let verdict = evaluate_rules(&[r], &ctx(Some("execute_code"), "a", 12));
        assert!(verdict.allowed);
    }

    #[test]
    fn deny_wins_over_allow() {
        let rules = vec![
            rule("allow-reads", "allow: tool=read_file"),
            rule("deny-agent", "deny: agent=intern"),
        ];

        let verdict = evaluate_rules(&rules, &ctx(Some("read_file"), "intern", 12));
        assert!(!verdict.allowed);
        assert_eq!(verdict.matched_rules.len(), 2);
        assert!(verdict.reason.unwrap().contains("deny-agent"));
    }

    #[test]
    fn negated_clause() {
        let rules = vec![rule("r1", "deny: tool!=read_file")];

        assert!(!evaluate_rules(&rules, &ctx(Some("write_file"), "a", 12)).allowed);
        assert!(evaluate_rules(&rules, &ctx(Some("read_file"), "a", 12)).allowed);
        // Missing tool is "not read_file".
        assert!(!evaluate_rules(&rules, &ctx(None, "a", 12)).allowed);
    }

    #[test]
    fn compile_is_deterministic() {
        let a = compile_rule("deny: tool=x && hour>=22").unwrap();
        let b = compile_rule("deny: tool=x && hour>=22").unwrap();
        assert_eq!(a.effect, b.effect);
        assert_eq!(a.clauses, b.clauses);
    }
}
