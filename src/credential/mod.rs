//! Credential vault: encrypted secrets, agent grants, task leases,
//! permission rules, and checkout with an audit trail.

mod crypto;
mod model;
mod rules;
mod service;

pub use crypto::SecretCipher;
pub use model::{
    AccessGrant, Checkout, CheckoutRequest, CreateCredentialInput, Credential, CredentialCategory,
    CredentialFilter, CredentialPatch, CredentialStoreDoc, Envelope, Lease, LeaseRequest,
    PermissionRule, UsageRecord, MAX_USAGE_HISTORY,
};
pub use rules::{compile_rule, evaluate_rules, CompiledRule, RuleContext, RuleVerdict};
pub use service::{CredentialService, LEASE_SWEEP_INTERVAL};

use async_trait::async_trait;

use crate::error::Result;

/// The narrow slice of the vault the workflow engine depends on.
#[async_trait]
pub trait CredentialLeaser: Send + Sync {
    async fn create_lease(&self, request: LeaseRequest) -> Result<Lease>;
    async fn revoke_task_leases(&self, task_id: &str) -> Result<u32>;
}

#[async_trait]
impl CredentialLeaser for CredentialService {
    async fn create_lease(&self, request: LeaseRequest) -> Result<Lease> {
        CredentialService::create_lease(self, request).await
    }

    async fn revoke_task_leases(&self, task_id: &str) -> Result<u32> {
        CredentialService::revoke_task_leases(self, task_id).await
    }
}
