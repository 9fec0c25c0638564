//! Sensitivity rules: built-in and policy-supplied matchers that can
//! block a tool call or route it through human approval.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::policy::domains::DomainCategory;
use crate::policy::EnforceAction;

/// A sensitivity rule. Custom rules arrive with the session policy;
/// built-ins are always evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityRule {
    pub id: String,
    pub description: String,
    pub action: EnforceAction,
    pub matcher: SensitivityMatcher,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensitivityMatcher {
    /// Browser URL classifies into one of these categories.
    DomainCategory { categories: Vec<DomainCategory> },
    /// Browser URL contains one of these substrings.
    UrlSubstring { patterns: Vec<String> },
    /// Command line contains one of these substrings.
    CommandSubstring { patterns: Vec<String> },
    /// File path contains one of these substrings.
    PathSubstring { patterns: Vec<String> },
    /// Tool name is one of these.
    ToolName { tools: Vec<String> },
}

/// What a sensitivity rule sees of the tool call.
#[derive(Debug, Clone, Default)]
pub struct SensitivityContext<'a> {
    pub tool_name: &'a str,
    pub url: Option<&'a str>,
    pub command: Option<&'a str>,
    pub file_path: Option<&'a str>,
    pub browser_action: Option<&'a str>,
    pub domain_categories: &'a [DomainCategory],
}

impl SensitivityRule {
    pub fn matches(&self, ctx: &SensitivityContext<'_>) -> bool {
        match &self.matcher {
            SensitivityMatcher::DomainCategory { categories } => categories
                .iter()
                .any(|c| ctx.domain_categories.contains(c)),
            SensitivityMatcher::UrlSubstring { patterns } => ctx
                .url
                .map(|u| patterns.iter().any(|p| u.contains(p.as_str())))
                .unwrap_or(false),
            SensitivityMatcher::CommandSubstring { patterns } => ctx
                .command
                .map(|c| patterns.iter().any(|p| c.contains(p.as_str())))
                .unwrap_or(false),
            SensitivityMatcher::PathSubstring { patterns } => ctx
                .file_path
                .map(|f| patterns.iter().any(|p| f.contains(p.as_str())))
                .unwrap_or(false),
            SensitivityMatcher::ToolName { tools } => {
                tools.iter().any(|t| t == ctx.tool_name)
            }
        }
    }
}

/// Built-in rules evaluated for every session.
pub fn builtin_rules() -> &'static [SensitivityRule] {
    static RULES: OnceLock<Vec<SensitivityRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            SensitivityRule {
                id: "financial.bank_site".into(),
                description: "Browser access to banking and payment sites".into(),
                action: EnforceAction::RequireApproval,
                matcher: SensitivityMatcher::DomainCategory {
                    categories: vec![DomainCategory::Financial],
                },
            },
            SensitivityRule {
                id: "adult.site".into(),
                description: "Browser access to adult sites".into(),
                action: EnforceAction::Block,
                matcher: SensitivityMatcher::DomainCategory {
                    categories: vec![DomainCategory::Adult],
                },
            },
            SensitivityRule {
                id: "gambling.site".into(),
                description: "Browser access to gambling sites".into(),
                action: EnforceAction::Block,
                matcher: SensitivityMatcher::DomainCategory {
                    categories: vec![DomainCategory::Gambling],
                },
            },
            SensitivityRule {
                id: "credentials.secret_file".into(),
                description: "Touching files that commonly hold secrets".into(),
                action: EnforceAction::RequireApproval,
                matcher: SensitivityMatcher::PathSubstring {
                    patterns: vec![
                        ".env".into(),
                        ".pem".into(),
                        "id_rsa".into(),
                        "credentials".into(),
                        ".npmrc".into(),
                    ],
                },
            },
            SensitivityRule {
                id: "exec.package_publish".into(),
                description: "Publishing or force-pushing from a session".into(),
                action: EnforceAction::RequireApproval,
                matcher: SensitivityMatcher::CommandSubstring {
                    patterns: vec![
                        "npm publish".into(),
                        "cargo publish".into(),
                        "git push --force".into(),
                        "gem push".into(),
                    ],
                },
            },
        ]
    })
}

/// Evaluate built-in plus custom rules, returning the triggered ones.
pub fn triggered_rules<'a>(
    custom: &'a [SensitivityRule],
    ctx: &SensitivityContext<'_>,
) -> Vec<&'a SensitivityRule> {
    builtin_rules()
        .iter()
        .chain(custom.iter())
        .filter(|rule| rule.matches(ctx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::domains::classify_domain;

    #[test]
    fn bank_site_requires_approval() {
        let categories = classify_domain("https://chase.com/login");
        let ctx = SensitivityContext {
            tool_name: "browser",
            url: Some("https://chase.com/login"),
            domain_categories: &categories,
            ..Default::default()
        };

        let triggered = triggered_rules(&[], &ctx);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].id, "financial.bank_site");
        assert_eq!(triggered[0].action, EnforceAction::RequireApproval);
    }

    #[test]
    fn secret_file_paths_trigger() {
        let ctx = SensitivityContext {
            tool_name: "write",
            file_path: Some("/repo/.env.production"),
            ..Default::default()
        };
        let triggered = triggered_rules(&[], &ctx);
        assert!(triggered.iter().any(|r| r.id == "credentials.secret_file"));
    }

    #[test]
    fn custom_rules_are_evaluated_alongside_builtins() {
        let custom = vec![SensitivityRule {
            id: "org.internal_wiki".into(),
            description: "internal wiki".into(),
            action: EnforceAction::Block,
            matcher: SensitivityMatcher::UrlSubstring {
                patterns: vec!["wiki.internal".into()],
            },
        }];

        let ctx = SensitivityContext {
            tool_name: "browser",
            url: Some("https://wiki.internal.example.com/page"),
            ..Default::default()
        };
        let triggered = triggered_rules(&custom, &ctx);
        assert!(triggered.iter().any(|r| r.id == "org.internal_wiki"));
    }

    #[test]
    fn quiet_context_triggers_nothing() {
        let ctx = SensitivityContext {
            tool_name: "read_file",
            file_path: Some("/repo/src/main.rs"),
            ..Default::default()
        };
        assert!(triggered_rules(&[], &ctx).is_empty());
    }
}
