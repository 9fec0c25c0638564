//! Encrypted credential vault with grants, leases, rules, and a usage
//! audit trail.
//!
//! All mutations run inside the store's critical section, so checkout's
//! access check, rule evaluation, decryption bookkeeping, and usage
//! recording are atomic with respect to every other vault operation.
//! Decrypted secrets are returned to the caller and never logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::credential::crypto::SecretCipher;
use crate::credential::model::{
    AccessGrant, Checkout, CheckoutRequest, CreateCredentialInput, Credential, CredentialFilter,
    CredentialPatch, CredentialStoreDoc, Lease, LeaseRequest, PermissionRule, UsageRecord,
};
use crate::credential::rules::{compile_rule, evaluate_rules, RuleContext};
use crate::error::{GantryError, Result};
use crate::events::{topics, Broadcaster};
use crate::now_ms;
use crate::store::{JsonStore, StoreDocument};

/// Default interval for the lease expiry sweep.
pub const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditEntry<'a> {
    timestamp_ms: i64,
    operation: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a str>,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

enum CheckoutOutcome {
    NotFound,
    Blocked {
        reason: String,
        matched_rules: Vec<String>,
    },
    Success(Checkout),
}

pub struct CredentialService {
    store: JsonStore<CredentialStoreDoc>,
    cipher: parking_lot::RwLock<Option<SecretCipher>>,
    /// Set when envelope decryption fails; further decryption is refused
    /// until an operator re-initializes with the master key.
    poisoned: AtomicBool,
    broadcaster: Arc<dyn Broadcaster>,
    sweep_shutdown: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl CredentialService {
    pub fn new(store_path: impl Into<std::path::PathBuf>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            store: JsonStore::new(store_path),
            cipher: parking_lot::RwLock::new(None),
            poisoned: AtomicBool::new(false),
            broadcaster,
            sweep_shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Validate (or establish) the master key. A fresh store gets a
    /// `masterKeyCheck` envelope; an existing one validates the key
    /// against it and aborts with `InvalidMasterKey` on mismatch.
    pub async fn init(&self, master_key: &str) -> Result<()> {
        let cipher = SecretCipher::new(master_key);
        let check_cipher = cipher.clone();

        self.store
            .update(move |doc| {
                match &doc.master_key_check {
                    Some(check) => {
                        if !check_cipher.verify_check(check) {
                            return Err(GantryError::InvalidMasterKey);
                        }
                    }
                    None => {
                        doc.version = CredentialStoreDoc::VERSION;
                        doc.master_key_check = Some(check_cipher.key_check()?);
                    }
                }
                Ok(())
            })
            .await?;

        *self.cipher.write() = Some(cipher);
        self.poisoned.store(false, Ordering::SeqCst);
        tracing::info!("credential service initialized");
        Ok(())
    }

    fn cipher(&self) -> Result<SecretCipher> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(GantryError::Crypto(
                "decryption disabled after crypto failure; re-initialize the vault".into(),
            ));
        }
        self.cipher
            .read()
            .clone()
            .ok_or_else(|| GantryError::Internal("credential service not initialized".into()))
    }

    pub async fn create(&self, input: CreateCredentialInput) -> Result<Credential> {
        if input.name.trim().is_empty() {
            return Err(GantryError::Validation("credential name is required".into()));
        }
        let cipher = self.cipher()?;
        let envelope = cipher.seal(input.secret.as_bytes())?;

        let now = now_ms();
        let credential = Credential {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            category: input.category,
            provider: input.provider,
            secret_ref: uuid::Uuid::new_v4().to_string(),
            enabled: true,
            access_grants: Vec::new(),
            active_leases: Vec::new(),
            permission_rules: Vec::new(),
            usage_history: Vec::new(),
            usage_count: 0,
            last_used_at_ms: None,
            last_used_by_agent: None,
            created_at_ms: now,
            updated_at_ms: now,
        };

        let stored = credential.clone();
        self.store
            .update(move |doc| {
                doc.version = CredentialStoreDoc::VERSION;
                doc.secrets.insert(stored.secret_ref.clone(), envelope);
                doc.credentials.push(stored);
                Ok(())
            })
            .await?;

        self.audit("create", Some(&credential.id), None, "success", None)
            .await;
        self.broadcaster.emit(
            topics::CREDENTIAL_CREATED,
            serde_json::json!({"credentialId": credential.id, "category": credential.category}),
        );
        Ok(credential)
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.store.read().await.credential(id).cloned()
    }

    pub async fn list(&self, filter: &CredentialFilter) -> Vec<Credential> {
        self.store
            .read()
            .await
            .credentials
            .into_iter()
            .filter(|c| filter.matches(c))
            .collect()
    }

    /// Patch credential metadata. `Ok(None)` when the id is unknown.
    pub async fn update(&self, id: &str, patch: CredentialPatch) -> Result<Option<Credential>> {
        let id_owned = id.to_string();
        let updated = self
            .store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&id_owned) else {
                    return Ok(None);
                };
                if let Some(name) = patch.name {
                    credential.name = name;
                }
                if let Some(provider) = patch.provider {
                    credential.provider = Some(provider);
                }
                if let Some(enabled) = patch.enabled {
                    credential.enabled = enabled;
                }
                credential.updated_at_ms = now_ms();
                Ok(Some(credential.clone()))
            })
            .await?;

        if let Some(credential) = &updated {
            self.broadcaster.emit(
                topics::CREDENTIAL_UPDATED,
                serde_json::json!({"credentialId": credential.id}),
            );
        }
        Ok(updated)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        Ok(self
            .update(id, CredentialPatch { enabled: Some(enabled), ..Default::default() })
            .await?
            .is_some())
    }

    /// Delete a credential and its envelope. A credential that still has
    /// grants or active leases is protected: returns `false` with no
    /// mutation unless `force` is set.
    pub async fn delete(&self, id: &str, force: bool) -> Result<bool> {
        let id_owned = id.to_string();
        let now = now_ms();
        let deleted = self
            .store
            .update(move |doc| {
                let Some(credential) = doc.credential(&id_owned) else {
                    return Ok(false);
                };
                let in_use = !credential.access_grants.is_empty()
                    || credential.active_leases.iter().any(|l| l.is_active(now));
                if in_use && !force {
                    return Ok(false);
                }
                let secret_ref = credential.secret_ref.clone();
                doc.credentials.retain(|c| c.id != id_owned);
                doc.secrets.remove(&secret_ref);
                Ok(true)
            })
            .await?;

        if deleted {
            self.audit("delete", Some(id), None, "success", None).await;
            self.broadcaster.emit(
                topics::CREDENTIAL_DELETED,
                serde_json::json!({"credentialId": id}),
            );
        }
        Ok(deleted)
    }

    /// Re-encrypt the credential's secret with a new value.
    pub async fn rotate_secret(&self, id: &str, new_secret: &str) -> Result<bool> {
        let cipher = self.cipher()?;
        let envelope = cipher.seal(new_secret.as_bytes())?;

        let id_owned = id.to_string();
        let rotated = self
            .store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&id_owned) else {
                    return Ok(false);
                };
                credential.updated_at_ms = now_ms();
                let secret_ref = credential.secret_ref.clone();
                doc.secrets.insert(secret_ref, envelope);
                Ok(true)
            })
            .await?;

        if rotated {
            self.audit("rotate_secret", Some(id), None, "success", None)
                .await;
            self.broadcaster.emit(
                topics::CREDENTIAL_UPDATED,
                serde_json::json!({"credentialId": id, "rotated": true}),
            );
        }
        Ok(rotated)
    }

    pub async fn grant_access(&self, id: &str, agent_id: &str) -> Result<bool> {
        let id_owned = id.to_string();
        let agent_owned = agent_id.to_string();
        let granted = self
            .store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&id_owned) else {
                    return Ok(false);
                };
                if !credential.has_grant(&agent_owned) {
                    credential.access_grants.push(AccessGrant {
                        agent_id: agent_owned,
                        granted_at_ms: now_ms(),
                    });
                    credential.updated_at_ms = now_ms();
                }
                Ok(true)
            })
            .await?;

        if granted {
            self.broadcaster.emit(
                topics::CREDENTIAL_GRANT_ADDED,
                serde_json::json!({"credentialId": id, "agentId": agent_id}),
            );
        }
        Ok(granted)
    }

    pub async fn revoke_access(&self, id: &str, agent_id: &str) -> Result<bool> {
        let id_owned = id.to_string();
        let agent_owned = agent_id.to_string();
        let revoked = self
            .store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&id_owned) else {
                    return Ok(false);
                };
                let before = credential.access_grants.len();
                credential.access_grants.retain(|g| g.agent_id != agent_owned);
                let removed = credential.access_grants.len() != before;
                if removed {
                    credential.updated_at_ms = now_ms();
                }
                Ok(removed)
            })
            .await?;

        if revoked {
            self.broadcaster.emit(
                topics::CREDENTIAL_GRANT_REVOKED,
                serde_json::json!({"credentialId": id, "agentId": agent_id}),
            );
        }
        Ok(revoked)
    }

    /// Create a TTL-bound lease for a task/agent pair.
    pub async fn create_lease(&self, request: LeaseRequest) -> Result<Lease> {
        if request.ttl_ms <= 0 {
            return Err(GantryError::Validation("lease ttl must be positive".into()));
        }

        let now = now_ms();
        let lease = Lease {
            lease_id: uuid::Uuid::new_v4().to_string(),
            task_id: request.task_id,
            agent_id: request.agent_id,
            credential_id: request.credential_id.clone(),
            granted_at_ms: now,
            expires_at_ms: now + request.ttl_ms,
            max_uses: request.max_uses,
            uses_remaining: request.max_uses,
            revoked_at_ms: None,
        };

        let stored = lease.clone();
        let credential_id = request.credential_id;
        self.store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&credential_id) else {
                    return Err(GantryError::NotFound(format!("credential {credential_id}")));
                };
                credential.active_leases.push(stored);
                credential.updated_at_ms = now_ms();
                Ok(())
            })
            .await?;

        self.broadcaster.emit(
            topics::CREDENTIAL_LEASE_CREATED,
            serde_json::json!({
                "credentialId": lease.credential_id,
                "leaseId": lease.lease_id,
                "taskId": lease.task_id,
                "expiresAtMs": lease.expires_at_ms,
            }),
        );
        Ok(lease)
    }

    /// Revoke one lease. `true` the first time, `false` after.
    pub async fn revoke_lease(&self, credential_id: &str, lease_id: &str) -> Result<bool> {
        let credential_owned = credential_id.to_string();
        let lease_owned = lease_id.to_string();
        self.store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&credential_owned) else {
                    return Ok(false);
                };
                let Some(lease) = credential
                    .active_leases
                    .iter_mut()
                    .find(|l| l.lease_id == lease_owned)
                else {
                    return Ok(false);
                };
                if lease.revoked_at_ms.is_some() {
                    return Ok(false);
                }
                lease.revoked_at_ms = Some(now_ms());
                Ok(true)
            })
            .await
    }

    /// Revoke every unrevoked lease belonging to a task. Returns the
    /// number revoked.
    pub async fn revoke_task_leases(&self, task_id: &str) -> Result<u32> {
        let task_owned = task_id.to_string();
        self.store
            .update(move |doc| {
                let now = now_ms();
                let mut count = 0u32;
                for credential in &mut doc.credentials {
                    for lease in &mut credential.active_leases {
                        if lease.task_id == task_owned && lease.revoked_at_ms.is_none() {
                            lease.revoked_at_ms = Some(now);
                            count += 1;
                        }
                    }
                }
                Ok(count)
            })
            .await
    }

    /// Mark every lapsed lease revoked. Returns the number expired.
    pub async fn expire_leases(&self) -> Result<u32> {
        let expired = self
            .store
            .update(move |doc| {
                let now = now_ms();
                let mut expired = Vec::new();
                for credential in &mut doc.credentials {
                    for lease in &mut credential.active_leases {
                        if lease.revoked_at_ms.is_none() && lease.expires_at_ms <= now {
                            lease.revoked_at_ms = Some(now);
                            expired.push((credential.id.clone(), lease.lease_id.clone()));
                        }
                    }
                }
                Ok(expired)
            })
            .await?;

        for (credential_id, lease_id) in &expired {
            self.broadcaster.emit(
                topics::CREDENTIAL_LEASE_EXPIRED,
                serde_json::json!({"credentialId": credential_id, "leaseId": lease_id}),
            );
        }
        Ok(expired.len() as u32)
    }

    /// Add a permission rule, validating its text compiles.
    pub async fn add_rule(&self, credential_id: &str, text: &str) -> Result<Option<PermissionRule>> {
        compile_rule(text)?;

        let rule = PermissionRule {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            enabled: true,
        };
        let stored = rule.clone();
        let credential_owned = credential_id.to_string();
        let added = self
            .store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&credential_owned) else {
                    return Ok(false);
                };
                credential.permission_rules.push(stored);
                credential.updated_at_ms = now_ms();
                Ok(true)
            })
            .await?;

        Ok(added.then_some(rule))
    }

    pub async fn remove_rule(&self, credential_id: &str, rule_id: &str) -> Result<bool> {
        let credential_owned = credential_id.to_string();
        let rule_owned = rule_id.to_string();
        self.store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&credential_owned) else {
                    return Ok(false);
                };
                let before = credential.permission_rules.len();
                credential.permission_rules.retain(|r| r.id != rule_owned);
                Ok(credential.permission_rules.len() != before)
            })
            .await
    }

    pub async fn update_rule(
        &self,
        credential_id: &str,
        rule_id: &str,
        text: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<bool> {
        if let Some(text) = text {
            compile_rule(text)?;
        }

        let credential_owned = credential_id.to_string();
        let rule_owned = rule_id.to_string();
        let text_owned = text.map(str::to_string);
        self.store
            .update(move |doc| {
                let Some(credential) = doc.credential_mut(&credential_owned) else {
                    return Ok(false);
                };
                let Some(rule) = credential
                    .permission_rules
                    .iter_mut()
                    .find(|r| r.id == rule_owned)
                else {
                    return Ok(false);
                };
                if let Some(text) = text_owned {
                    rule.text = text;
                }
                if let Some(enabled) = enabled {
                    rule.enabled = enabled;
                }
                Ok(true)
            })
            .await
    }

    /// Decrypt a credential for an authorized caller.
    ///
    /// Access requires a grant for the agent or an active lease for the
    /// agent (and task, when supplied); permission rules can still deny.
    /// Every attempt lands in the audit log; blocked attempts never
    /// touch the envelope.
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<Checkout> {
        let cipher = self.cipher()?;
        let req = request.clone();

        let outcome = self
            .store
            .update(move |doc| {
                let now = now_ms();
                let Some(credential) = doc.credential_mut(&req.credential_id) else {
                    return Ok(CheckoutOutcome::NotFound);
                };

                let secret_ref = credential.secret_ref.clone();

                if !credential.enabled {
                    return Ok(blocked(credential, &req, now, "credential disabled", vec![]));
                }

                let lease = credential
                    .active_lease(&req.agent_id, req.task_id.as_deref(), now)
                    .cloned();
                if !credential.has_grant(&req.agent_id) && lease.is_none() {
                    return Ok(blocked(
                        credential,
                        &req,
                        now,
                        "no access: agent has neither grant nor active lease",
                        vec![],
                    ));
                }

                let verdict = evaluate_rules(
                    &credential.permission_rules,
                    &RuleContext {
                        tool_name: req.tool_name.as_deref(),
                        action: req.action.as_deref(),
                        agent_id: &req.agent_id,
                        task_id: req.task_id.as_deref(),
                        now: Utc::now(),
                    },
                );
                if !verdict.allowed {
                    let reason = verdict
                        .reason
                        .unwrap_or_else(|| "denied by permission rules".into());
                    return Ok(blocked(credential, &req, now, &reason, verdict.matched_rules));
                }

                let envelope = doc.secrets.get(&secret_ref).cloned().ok_or_else(|| {
                    GantryError::Crypto("missing secret envelope for credential".into())
                })?;
                let plaintext = cipher.open(&envelope)?;
                let secret = String::from_utf8(plaintext)
                    .map_err(|_| GantryError::Crypto("secret is not valid UTF-8".into()))?;

                let Some(credential) = doc.credential_mut(&req.credential_id) else {
                    return Err(GantryError::Internal("credential vanished mid-checkout".into()));
                };
                let mut expires_at_ms = None;
                if let Some(lease) = lease {
                    expires_at_ms = Some(lease.expires_at_ms);
                    if let Some(stored) = credential
                        .active_leases
                        .iter_mut()
                        .find(|l| l.lease_id == lease.lease_id)
                    {
                        if let Some(uses) = stored.uses_remaining.as_mut() {
                            *uses = uses.saturating_sub(1);
                        }
                    }
                }

                credential.record_usage(UsageRecord {
                    timestamp_ms: now,
                    agent_id: req.agent_id.clone(),
                    task_id: req.task_id.clone(),
                    tool_name: req.tool_name.clone(),
                    action: req.action.clone(),
                    outcome: "success".into(),
                });
                credential.usage_count += 1;
                credential.last_used_at_ms = Some(now);
                credential.last_used_by_agent = Some(req.agent_id.clone());
                credential.updated_at_ms = now;

                Ok(CheckoutOutcome::Success(Checkout {
                    credential_id: req.credential_id.clone(),
                    secret,
                    expires_at_ms,
                }))
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, GantryError::Crypto(_)) {
                    self.poisoned.store(true, Ordering::SeqCst);
                    tracing::error!(credential_id = %request.credential_id, "envelope decryption failed; vault poisoned until re-init");
                }
                return Err(e);
            }
        };

        match outcome {
            CheckoutOutcome::NotFound => Err(GantryError::NotFound(format!(
                "credential {}",
                request.credential_id
            ))),
            CheckoutOutcome::Blocked {
                reason,
                matched_rules,
            } => {
                self.audit(
                    "checkout",
                    Some(&request.credential_id),
                    Some(&request.agent_id),
                    "blocked",
                    Some(&reason),
                )
                .await;
                self.broadcaster.emit(
                    topics::CREDENTIAL_CHECKOUT_BLOCKED,
                    serde_json::json!({
                        "credentialId": request.credential_id,
                        "agentId": request.agent_id,
                        "reason": reason,
                    }),
                );
                Err(GantryError::denied(reason, matched_rules))
            }
            CheckoutOutcome::Success(checkout) => {
                self.audit(
                    "checkout",
                    Some(&request.credential_id),
                    Some(&request.agent_id),
                    "success",
                    None,
                )
                .await;
                self.broadcaster.emit(
                    topics::CREDENTIAL_CHECKOUT,
                    serde_json::json!({
                        "credentialId": request.credential_id,
                        "agentId": request.agent_id,
                    }),
                );
                Ok(checkout)
            }
        }
    }

    pub async fn usage_history(&self, id: &str, limit: usize) -> Vec<UsageRecord> {
        let Some(credential) = self.get(id).await else {
            return Vec::new();
        };
        let skip = credential.usage_history.len().saturating_sub(limit);
        credential.usage_history.into_iter().skip(skip).collect()
    }

    /// Tail the vault's audit log.
    pub async fn audit_log(&self, limit: usize) -> Vec<serde_json::Value> {
        self.store.read_audit(limit).await
    }

    /// Spawn the periodic lease expiry sweep.
    pub fn start_expiry_sweep(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.sweep_shutdown.lock();
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);
        drop(guard);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!("lease expiry sweep started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match service.expire_leases().await {
                            Ok(0) => {}
                            Ok(n) => tracing::debug!(expired = n, "lease expiry sweep"),
                            Err(e) => tracing::error!(error = %e, "lease expiry sweep failed"),
                        }
                    }
                    _ = rx.changed() => {
                        tracing::info!("lease expiry sweep stopped");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop_expiry_sweep(&self) {
        if let Some(tx) = self.sweep_shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    async fn audit(
        &self,
        operation: &str,
        credential_id: Option<&str>,
        agent_id: Option<&str>,
        outcome: &str,
        reason: Option<&str>,
    ) {
        let entry = AuditEntry {
            timestamp_ms: now_ms(),
            operation,
            credential_id,
            agent_id,
            outcome,
            reason,
        };
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::warn!(error = %e, "failed to append credential audit entry");
        }
    }
}

fn blocked(
    credential: &mut Credential,
    req: &CheckoutRequest,
    now: i64,
    reason: &str,
    matched_rules: Vec<String>,
) -> CheckoutOutcome {
    credential.record_usage(UsageRecord {
        timestamp_ms: now,
        agent_id: req.agent_id.clone(),
        task_id: req.task_id.clone(),
        tool_name: req.tool_name.clone(),
        action: req.action.clone(),
        outcome: "blocked".into(),
    });
    CheckoutOutcome::Blocked {
        reason: reason.to_string(),
        matched_rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::model::CredentialCategory;
    use crate::events::BroadcastHub;

    async fn vault(dir: &std::path::Path) -> Arc<CredentialService> {
        let service = Arc::new(CredentialService::new(
            dir.join("credentials.json"),
            Arc::new(BroadcastHub::default()),
        ));
        service.init("test-master-key").await.unwrap();
        service
    }

    fn api_key(name: &str, secret: &str) -> CreateCredentialInput {
        CreateCredentialInput {
            name: name.to_string(),
            category: CredentialCategory::ApiKey,
            provider: None,
            secret: secret.to_string(),
        }
    }

    #[tokio::test]
    async fn init_rejects_wrong_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let _ = vault(dir.path()).await;

        let other = CredentialService::new(
            dir.path().join("credentials.json"),
            Arc::new(BroadcastHub::default()),
        );
        assert!(matches!(
            other.init("wrong-key").await,
            Err(GantryError::InvalidMasterKey)
        ));
    }

    #[tokio::test]
    async fn checkout_with_grant_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("gh token", "ghp_abc123")).await.unwrap();
        service.grant_access(&credential.id, "agent-1").await.unwrap();

        let checkout = service
            .checkout(CheckoutRequest {
                credential_id: credential.id.clone(),
                agent_id: "agent-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(checkout.secret, "ghp_abc123");

        let stored = service.get(&credential.id).await.unwrap();
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.last_used_by_agent.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn checkout_without_access_is_blocked_and_never_decrypts() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("db", "postgres://secret")).await.unwrap();

        let result = service
            .checkout(CheckoutRequest {
                credential_id: credential.id.clone(),
                agent_id: "stranger".into(),
                ..Default::default()
            })
            .await;
        match result {
            Err(GantryError::AccessDenied { reason, .. }) => {
                assert!(reason.contains("no access"));
            }
            other => panic!("expected AccessDenied, got {other:?}"),
        }

        // No successful use was recorded.
        let stored = service.get(&credential.id).await.unwrap();
        assert_eq!(stored.usage_count, 0);
        assert_eq!(stored.usage_history.last().unwrap().outcome, "blocked");

        let audit = service.audit_log(10).await;
        assert_eq!(audit.last().unwrap()["outcome"], "blocked");
    }

    #[tokio::test]
    async fn disabled_credential_blocks_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("k", "v")).await.unwrap();
        service.grant_access(&credential.id, "agent-1").await.unwrap();
        service.set_enabled(&credential.id, false).await.unwrap();

        let result = service
            .checkout(CheckoutRequest {
                credential_id: credential.id,
                agent_id: "agent-1".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(GantryError::AccessDenied { reason, .. }) if reason.contains("disabled")));
    }

    #[tokio::test]
    async fn lease_grants_then_expiry_revokes_access() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::default());
        let service = Arc::new(CredentialService::new(
            dir.path().join("credentials.json"),
            hub.clone(),
        ));
        service.init("test-master-key").await.unwrap();

        let credential = service.create(api_key("leased", "s3cret")).await.unwrap();
        service
            .create_lease(LeaseRequest {
                credential_id: credential.id.clone(),
                task_id: "task-1".into(),
                agent_id: "agent-1".into(),
                ttl_ms: 100,
                max_uses: None,
            })
            .await
            .unwrap();

        // Within the TTL the lease authorizes checkout.
        let checkout = service
            .checkout(CheckoutRequest {
                credential_id: credential.id.clone(),
                agent_id: "agent-1".into(),
                task_id: Some("task-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(checkout.secret, "s3cret");
        assert!(checkout.expires_at_ms.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut rx = hub.subscribe();
        assert_eq!(service.expire_leases().await.unwrap(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "credential.lease.expired");

        let result = service
            .checkout(CheckoutRequest {
                credential_id: credential.id,
                agent_id: "agent-1".into(),
                task_id: Some("task-1".into()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(GantryError::AccessDenied { reason, .. }) if reason.contains("no access")));
    }

    #[tokio::test]
    async fn lease_uses_are_decremented_to_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("limited", "x")).await.unwrap();
        service
            .create_lease(LeaseRequest {
                credential_id: credential.id.clone(),
                task_id: "t".into(),
                agent_id: "a".into(),
                ttl_ms: 60_000,
                max_uses: Some(2),
            })
            .await
            .unwrap();

        let req = CheckoutRequest {
            credential_id: credential.id.clone(),
            agent_id: "a".into(),
            task_id: Some("t".into()),
            ..Default::default()
        };
        service.checkout(req.clone()).await.unwrap();
        service.checkout(req.clone()).await.unwrap();
        assert!(service.checkout(req).await.is_err());
    }

    #[tokio::test]
    async fn revoke_lease_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("k", "v")).await.unwrap();
        let lease = service
            .create_lease(LeaseRequest {
                credential_id: credential.id.clone(),
                task_id: "t".into(),
                agent_id: "a".into(),
                ttl_ms: 60_000,
                max_uses: None,
            })
            .await
            .unwrap();

        assert!(service.revoke_lease(&credential.id, &lease.lease_id).await.unwrap());
        assert!(!service.revoke_lease(&credential.id, &lease.lease_id).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_task_leases_revokes_all_for_task() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let a = service.create(api_key("a", "1")).await.unwrap();
        let b = service.create(api_key("b", "2")).await.unwrap();
        for credential_id in [&a.id, &b.id] {
            service
                .create_lease(LeaseRequest {
                    credential_id: credential_id.clone(),
                    task_id: "workflow:w:step:s".into(),
                    agent_id: "workflow:w".into(),
                    ttl_ms: 60_000,
                    max_uses: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(service.revoke_task_leases("workflow:w:step:s").await.unwrap(), 2);
        assert_eq!(service.revoke_task_leases("workflow:w:step:s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permission_rule_denies_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("guarded", "v")).await.unwrap();
        service.grant_access(&credential.id, "agent-1").await.unwrap();
        let rule = service
            .add_rule(&credential.id, "deny: tool=execute_code")
            .await
            .unwrap()
            .unwrap();

        let result = service
            .checkout(CheckoutRequest {
                credential_id: credential.id.clone(),
                agent_id: "agent-1".into(),
                tool_name: Some("execute_code".into()),
                ..Default::default()
            })
            .await;
        match result {
            Err(GantryError::AccessDenied { matched_rules, .. }) => {
                assert_eq!(matched_rules, vec![rule.id]);
            }
            other => panic!("expected AccessDenied, got {other:?}"),
        }

        // Other tools still pass.
        assert!(service
            .checkout(CheckoutRequest {
                credential_id: credential.id,
                agent_id: "agent-1".into(),
                tool_name: Some("read_file".into()),
                ..Default::default()
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rotate_secret_changes_checkout_result() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("rotating", "old")).await.unwrap();
        service.grant_access(&credential.id, "a").await.unwrap();
        assert!(service.rotate_secret(&credential.id, "new").await.unwrap());

        let checkout = service
            .checkout(CheckoutRequest {
                credential_id: credential.id,
                agent_id: "a".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(checkout.secret, "new");
    }

    #[tokio::test]
    async fn delete_protects_credentials_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service.create(api_key("held", "v")).await.unwrap();
        service.grant_access(&credential.id, "a").await.unwrap();

        assert!(!service.delete(&credential.id, false).await.unwrap());
        assert!(service.get(&credential.id).await.is_some());

        assert!(service.delete(&credential.id, true).await.unwrap());
        assert!(service.get(&credential.id).await.is_none());
    }

    #[tokio::test]
    async fn audit_log_never_contains_secret_material() {
        let dir = tempfile::tempdir().unwrap();
        let service = vault(dir.path()).await;

        let credential = service
            .create(api_key("sensitive", "sk-ant-very-secret-token"))
            .await
            .unwrap();
        service.grant_access(&credential.id, "a").await.unwrap();
        service
            .checkout(CheckoutRequest {
                credential_id: credential.id,
                agent_id: "a".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("credentials.json.audit")).unwrap();
        assert!(!raw.contains("sk-ant-very-secret-token"));

        // The store itself only holds the envelope.
        let store_raw = std::fs::read_to_string(dir.path().join("credentials.json")).unwrap();
        assert!(!store_raw.contains("sk-ant-very-secret-token"));
    }
}
