//! Per-request caller identity threaded from the HTTP layer.

use lp_core::security::audit::{AuditAction, AuditEvent};

/// Who is performing an operation: the resolved session user (if any)
/// plus the client's network identity. Services carry this into audit
/// events so every log row can be traced back to a caller.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub user_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestIdentity {
    /// Identity for an unauthenticated caller, e.g. a login attempt.
    pub fn anonymous(ip: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            user_id: None,
            ip_address: Some(ip.into()),
            user_agent,
        }
    }

    /// Start an audit event pre-filled with this caller's identity.
    pub fn event(&self, action: AuditAction, entity: impl Into<String>) -> AuditEvent {
        let mut event = AuditEvent::new(action, entity);
        if let Some(user_id) = self.user_id {
            event = event.user(user_id);
        }
        if let Some(ref ip) = self.ip_address {
            event = event.client(ip.clone(), self.user_agent.clone());
        }
        event
    }
}
