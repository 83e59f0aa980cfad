use async_trait::async_trait;
use serde_json::Value;

/// Why an audit record could not be written.
#[derive(Debug)]
pub struct AuditError(pub String);

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "audit sink failed: {}", self.0)
    }
}

impl std::error::Error for AuditError {}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(
        &self,
        tenant: &str,
        action: &str,
        actor_id: &str,
        target_id: &str,
        details: Value,
    ) -> Result<(), AuditError>;
}

/// Writes audit records as structured events on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(
        &self,
        tenant: &str,
        action: &str,
        actor_id: &str,
        target_id: &str,
        details: Value,
    ) -> Result<(), AuditError> {
        tracing::info!(target: "audit", tenant, action, actor_id, target_id, %details, "audit");
        Ok(())
    }
}

pub mod actions {
    pub const REQUEST_CREATED: &str = "service_request.created";
    pub const BOOKING_CREATED: &str = "booking.created";
    pub const SERIES_CREATED: &str = "booking.series_created";
    pub const RATE_LIMITED: &str = "security.rate_limited";
}
