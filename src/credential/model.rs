//! Credential vault data model: credentials, grants, leases, rules, and
//! the persisted store document.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::StoreDocument;

/// Usage history ring size per credential.
pub const MAX_USAGE_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialCategory {
    AiProvider,
    ServiceAccount,
    OauthToken,
    SshKey,
    DbCredential,
    ApiKey,
    ChannelBot,
    Custom,
}

impl std::fmt::Display for CredentialCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialCategory::AiProvider => "ai_provider",
            CredentialCategory::ServiceAccount => "service_account",
            CredentialCategory::OauthToken => "oauth_token",
            CredentialCategory::SshKey => "ssh_key",
            CredentialCategory::DbCredential => "db_credential",
            CredentialCategory::ApiKey => "api_key",
            CredentialCategory::ChannelBot => "channel_bot",
            CredentialCategory::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// Authenticated-encryption record wrapping a secret. All fields base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
    pub algorithm: String,
}

/// Non-expiring permission for an agent to check out a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub agent_id: String,
    pub granted_at_ms: i64,
}

/// Time- and optionally use-bounded permission for a task/agent pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub lease_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub credential_id: String,
    pub granted_at_ms: i64,
    pub expires_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uses_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<i64>,
}

impl Lease {
    /// A lease is active while unrevoked, unexpired, and not used up.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.revoked_at_ms.is_none()
            && self.expires_at_ms > now_ms
            && self.uses_remaining.map(|u| u > 0).unwrap_or(true)
    }
}

/// A rule gating checkout, compiled on evaluation from its text form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    pub id: String,
    pub text: String,
    pub enabled: bool,
}

/// One entry in a credential's bounded usage history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub timestamp_ms: i64,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// "success" or "blocked".
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub category: CredentialCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Key into the store's secret envelope map.
    pub secret_ref: String,
    pub enabled: bool,
    pub access_grants: Vec<AccessGrant>,
    pub active_leases: Vec<Lease>,
    pub permission_rules: Vec<PermissionRule>,
    pub usage_history: Vec<UsageRecord>,
    pub usage_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_by_agent: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Credential {
    pub fn has_grant(&self, agent_id: &str) -> bool {
        self.access_grants.iter().any(|g| g.agent_id == agent_id)
    }

    /// Find an active lease for this agent (and task, when given).
    pub fn active_lease(&self, agent_id: &str, task_id: Option<&str>, now_ms: i64) -> Option<&Lease> {
        self.active_leases.iter().find(|l| {
            l.is_active(now_ms)
                && l.agent_id == agent_id
                && task_id.map(|t| l.task_id == t).unwrap_or(true)
        })
    }

    /// Push a usage record, trimming the ring to [`MAX_USAGE_HISTORY`].
    pub fn record_usage(&mut self, record: UsageRecord) {
        self.usage_history.push(record);
        if self.usage_history.len() > MAX_USAGE_HISTORY {
            let excess = self.usage_history.len() - MAX_USAGE_HISTORY;
            self.usage_history.drain(..excess);
        }
    }
}

/// Input for creating a credential. The plaintext secret never lands in
/// the store; it is sealed into an envelope first.
#[derive(Debug, Clone)]
pub struct CreateCredentialInput {
    pub name: String,
    pub category: CredentialCategory,
    pub provider: Option<String>,
    pub secret: String,
}

/// Patch for credential metadata. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialPatch {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialFilter {
    pub category: Option<CredentialCategory>,
    pub enabled: Option<bool>,
    pub provider: Option<String>,
}

impl CredentialFilter {
    pub fn matches(&self, credential: &Credential) -> bool {
        if let Some(category) = self.category {
            if credential.category != category {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if credential.enabled != enabled {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if credential.provider.as_deref() != Some(provider.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Request for a bounded-time lease.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub credential_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub ttl_ms: i64,
    pub max_uses: Option<u32>,
}

/// Checkout request evaluated against grants, leases, and rules.
#[derive(Debug, Clone, Default)]
pub struct CheckoutRequest {
    pub credential_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub tool_name: Option<String>,
    pub action: Option<String>,
}

/// A successful checkout. The decrypted secret is redacted from Debug
/// output so it cannot leak through logging.
#[derive(Clone)]
pub struct Checkout {
    pub credential_id: String,
    pub secret: String,
    pub expires_at_ms: Option<i64>,
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("credential_id", &self.credential_id)
            .field("secret", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Persisted credential store document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialStoreDoc {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key_check: Option<Envelope>,
    pub credentials: Vec<Credential>,
    pub secrets: HashMap<String, Envelope>,
}

impl StoreDocument for CredentialStoreDoc {
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }
}

impl CredentialStoreDoc {
    pub fn credential(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn credential_mut(&mut self, id: &str) -> Option<&mut Credential> {
        self.credentials.iter_mut().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(expires_at_ms: i64, uses_remaining: Option<u32>) -> Lease {
        Lease {
            lease_id: "l1".into(),
            task_id: "t1".into(),
            agent_id: "a1".into(),
            credential_id: "c1".into(),
            granted_at_ms: 0,
            expires_at_ms,
            max_uses: uses_remaining,
            uses_remaining,
            revoked_at_ms: None,
        }
    }

    #[test]
    fn lease_activity() {
        assert!(lease(100, None).is_active(50));
        assert!(!lease(100, None).is_active(100));
        assert!(!lease(100, Some(0)).is_active(50));
        assert!(lease(100, Some(2)).is_active(50));

        let mut revoked = lease(100, None);
        revoked.revoked_at_ms = Some(10);
        assert!(!revoked.is_active(50));
    }

    #[test]
    fn usage_history_is_ring_trimmed() {
        let mut credential = Credential {
            id: "c1".into(),
            name: "test".into(),
            category: CredentialCategory::ApiKey,
            provider: None,
            secret_ref: "s1".into(),
            enabled: true,
            access_grants: vec![],
            active_leases: vec![],
            permission_rules: vec![],
            usage_history: vec![],
            usage_count: 0,
            last_used_at_ms: None,
            last_used_by_agent: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        };

        for i in 0..(MAX_USAGE_HISTORY + 25) {
            credential.record_usage(UsageRecord {
                timestamp_ms: i as i64,
                agent_id: "a1".into(),
                task_id: None,
                tool_name: None,
                action: None,
                outcome: "success".into(),
            });
        }

        assert_eq!(credential.usage_history.len(), MAX_USAGE_HISTORY);
        // Newest entries survive the trim.
        assert_eq!(
            credential.usage_history.last().unwrap().timestamp_ms,
            (MAX_USAGE_HISTORY + 24) as i64
        );
    }

    #[test]
    fn checkout_debug_redacts_secret() {
        let checkout = Checkout {
            credential_id: "c1".into(),
            secret: "sk-super-secret-value".into(),
            expires_at_ms: None,
        };
        let formatted = format!("{checkout:?}");
        assert!(!formatted.contains("sk-super-secret-value"));
        assert!(formatted.contains("<redacted>"));
    }
}
