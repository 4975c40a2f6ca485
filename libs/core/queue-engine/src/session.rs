//! Tenant-scoped persistence sessions.
//!
//! The persistence layer is an external collaborator; only its contract
//! lives here. Workers acquire a session for the job's class, bind the
//! tenant, pass it into the handler, and release it on every exit path.
//! A handler must not touch persistence except through the injected session.

use crate::error::EngineResult;
use async_trait::async_trait;

/// Which flavor of tenant scope a job class executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Tenant isolation plus the inbound-event idempotency guard.
    Webhook,
    /// Tenant isolation plus AI-usage metering.
    Ai,
    /// Tenant-scoped when a merchant id is present, otherwise unscoped.
    Generic,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Ai => "ai",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live persistence session scoped to one tenant for one job.
///
/// Ownership stays with the worker; handlers only borrow it.
#[async_trait]
pub trait TenantSession: Send {
    /// The tenant this session is bound to, if any.
    fn tenant_id(&self) -> Option<&str>;

    /// The kind this session was opened as.
    fn kind(&self) -> SessionKind;

    /// Return the underlying connection to the pool. Called by the worker on
    /// every exit path, including cancellation; must be idempotent.
    async fn release(&mut self);
}

/// Factory for tenant sessions, implemented by the database layer.
#[async_trait]
pub trait TenantSessionProvider: Send + Sync {
    /// Acquire a connection, set the tenant isolation scope, and hand the
    /// session to the caller. Blocks only on pool I/O.
    async fn acquire(
        &self,
        kind: SessionKind,
        tenant_id: Option<&str>,
    ) -> EngineResult<Box<dyn TenantSession>>;
}
