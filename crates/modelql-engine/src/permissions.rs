//! Pluggable access control, evaluated operation -> object -> field.

use std::sync::Arc;

use tracing::trace;

use modelql_datasource::Record;

use crate::context::{Identity, RequestContext};
use crate::schema::RootKind;

/// One policy's answer for an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Access granted; later policies are not consulted.
    Allow,
    /// Access refused with a caller-visible reason.
    Deny(String),
    /// This policy has no opinion; the next one decides.
    Abstain,
}

impl AccessDecision {
    /// Returns whether access was granted.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// The denial reason, if denied.
    #[must_use]
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            Self::Deny(reason) => Some(reason),
            _ => None,
        }
    }
}

/// A single access policy. Implementations override only the levels they
/// care about; the default at every level is [`AccessDecision::Abstain`].
pub trait PermissionPolicy: Send + Sync {
    /// May the caller run this operation kind on this entity at all?
    fn check_operation(
        &self,
        identity: &Identity,
        entity: &str,
        operation: RootKind,
    ) -> AccessDecision {
        let _ = (identity, entity, operation);
        AccessDecision::Abstain
    }

    /// May the caller see this particular instance?
    fn check_object(&self, identity: &Identity, entity: &str, record: &Record) -> AccessDecision {
        let _ = (identity, entity, record);
        AccessDecision::Abstain
    }

    /// May the caller read this field of this instance?
    fn check_field(
        &self,
        identity: &Identity,
        entity: &str,
        field: &str,
        record: &Record,
    ) -> AccessDecision {
        let _ = (identity, entity, field, record);
        AccessDecision::Abstain
    }
}

/// Grants everything. The default when no policies are installed explicitly.
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn check_operation(&self, _: &Identity, _: &str, _: RootKind) -> AccessDecision {
        AccessDecision::Allow
    }

    fn check_object(&self, _: &Identity, _: &str, _: &Record) -> AccessDecision {
        AccessDecision::Allow
    }

    fn check_field(&self, _: &Identity, _: &str, _: &str, _: &Record) -> AccessDecision {
        AccessDecision::Allow
    }
}

/// An ordered list of policies. The first non-abstain decision wins; when
/// every policy abstains the chain denies, so an empty or silent chain never
/// grants access by accident.
pub struct PolicyChain {
    policies: Vec<Arc<dyn PermissionPolicy>>,
}

impl PolicyChain {
    /// Creates a chain from ordered policies.
    #[must_use]
    pub fn new(policies: Vec<Arc<dyn PermissionPolicy>>) -> Self {
        Self { policies }
    }

    /// A chain that grants everything.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(vec![Arc::new(AllowAll)])
    }

    /// Resolves the operation-level decision, memoized per request.
    pub fn check_operation(
        &self,
        ctx: &RequestContext,
        entity: &str,
        operation: RootKind,
    ) -> AccessDecision {
        if let Some(decision) = ctx.memoized_decision(entity, operation) {
            return decision;
        }
        let decision = self.resolve(|policy| {
            policy.check_operation(&ctx.identity, entity, operation)
        });
        trace!(entity, ?operation, ?decision, "Operation access resolved");
        ctx.memoize_decision(entity, operation, decision.clone());
        decision
    }

    /// Resolves the object-level decision.
    pub fn check_object(&self, ctx: &RequestContext, entity: &str, record: &Record) -> AccessDecision {
        self.resolve(|policy| policy.check_object(&ctx.identity, entity, record))
    }

    /// Resolves the field-level decision.
    pub fn check_field(
        &self,
        ctx: &RequestContext,
        entity: &str,
        field: &str,
        record: &Record,
    ) -> AccessDecision {
        self.resolve(|policy| policy.check_field(&ctx.identity, entity, field, record))
    }

    fn resolve(&self, check: impl Fn(&dyn PermissionPolicy) -> AccessDecision) -> AccessDecision {
        for policy in &self.policies {
            match check(policy.as_ref()) {
                AccessDecision::Abstain => continue,
                decision => return decision,
            }
        }
        AccessDecision::Deny("access not granted by any policy".into())
    }
}
