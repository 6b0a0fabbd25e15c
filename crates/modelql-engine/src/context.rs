//! Per-request state: caller identity, cancellation, permission memo.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::permissions::AccessDecision;
use crate::schema::RootKind;

/// Who is making the request.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Stable caller id, `None` for anonymous callers.
    pub subject: Option<String>,
    /// Roles granted to the caller.
    pub roles: Vec<String>,
}

impl Identity {
    /// An anonymous caller with no roles.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A named caller.
    #[must_use]
    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            roles: Vec::new(),
        }
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Returns whether the caller holds a role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Cache partition for this caller, so responses never leak across
    /// identities.
    #[must_use]
    pub fn partition(&self) -> &str {
        self.subject.as_deref().unwrap_or("anonymous")
    }
}

/// Cooperative cancellation flag shared with the calling transport.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the request as abandoned.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether the request was abandoned.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State scoped to one request, discarded when the request ends.
pub struct RequestContext {
    /// The caller.
    pub identity: Identity,
    cancel: CancelFlag,
    permission_memo: DashMap<(String, RootKind), AccessDecision>,
}

impl RequestContext {
    /// Creates a context with its own cancellation flag.
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self::with_cancel(identity, CancelFlag::new())
    }

    /// Creates a context wired to a transport-owned cancellation flag.
    #[must_use]
    pub fn with_cancel(identity: Identity, cancel: CancelFlag) -> Self {
        Self {
            identity,
            cancel,
            permission_memo: DashMap::new(),
        }
    }

    /// Returns whether the transport abandoned this request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the memoized operation decision, if already evaluated.
    #[must_use]
    pub fn memoized_decision(&self, entity: &str, operation: RootKind) -> Option<AccessDecision> {
        self.permission_memo
            .get(&(entity.to_string(), operation))
            .map(|d| d.clone())
    }

    /// Memoizes an operation decision for the rest of this request.
    pub fn memoize_decision(&self, entity: &str, operation: RootKind, decision: AccessDecision) {
        self.permission_memo
            .insert((entity.to_string(), operation), decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_partition() {
        assert_eq!(Identity::anonymous().partition(), "anonymous");
        assert_eq!(Identity::user("alice").partition(), "alice");
    }

    #[test]
    fn test_roles() {
        let identity = Identity::user("bob").with_role("editor");
        assert!(identity.has_role("editor"));
        assert!(!identity.has_role("admin"));
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let ctx = RequestContext::with_cancel(Identity::anonymous(), flag.clone());
        assert!(!ctx.is_cancelled());
        flag.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_memo_round_trip() {
        let ctx = RequestContext::new(Identity::anonymous());
        assert!(ctx.memoized_decision("User", RootKind::Read).is_none());
        ctx.memoize_decision("User", RootKind::Read, AccessDecision::Allow);
        assert!(matches!(
            ctx.memoized_decision("User", RootKind::Read),
            Some(AccessDecision::Allow)
        ));
    }
}
