mod memory;
mod query;
mod wal_store;

pub use memory::MemoryStore;
pub use query::{ListQuery, Page, RequestKind, SortField, SortOrder};
pub(crate) use query::parse_enum;
pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

/// Which backend served an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Primary,
    Fallback,
}

impl StoreKind {
    pub fn label(self) -> &'static str {
        match self {
            StoreKind::Primary => "primary",
            StoreKind::Fallback => "fallback",
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    /// The backend is not configured or cannot be reached. Callers may retry
    /// the same operation against the fallback store.
    Unavailable(String),
    /// A referenced client/service/team member does not exist in the tenant.
    InvalidReference { field: &'static str, id: String },
    NotFound(Ulid),
    LimitExceeded(&'static str),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::InvalidReference { field, id } => write!(f, "invalid {field}: {id}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Tenant-scoped persistence for service requests. Every method takes the
/// tenant id; implementations must never return rows of another tenant.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Readiness check for health reporting.
    fn is_available(&self) -> bool {
        true
    }

    /// `None` when the backend cannot verify references.
    async fn client_exists(&self, tenant: &str, client_id: &str) -> Result<Option<bool>, StoreError>;

    /// `None` when the backend cannot verify references.
    async fn service_exists(&self, tenant: &str, service_id: &str) -> Result<Option<bool>, StoreError>;

    async fn create_request(
        &self,
        tenant: &str,
        new: NewServiceRequest,
    ) -> Result<ServiceRequest, StoreError>;

    async fn get_request(&self, tenant: &str, id: Ulid) -> Result<Option<ServiceRequest>, StoreError>;

    async fn list_requests(
        &self,
        tenant: &str,
        query: &ListQuery,
    ) -> Result<Page<ServiceRequest>, StoreError>;

    /// Rows of `service_id` whose occupied span overlaps `window`.
    async fn bookings_overlapping(
        &self,
        tenant: &str,
        service_id: &str,
        window: Span,
    ) -> Result<Vec<ServiceRequest>, StoreError>;

    async fn add_comment(
        &self,
        tenant: &str,
        request_id: Ulid,
        author_id: &str,
        body: String,
    ) -> Result<Comment, StoreError>;

    async fn comments(&self, tenant: &str, request_id: Ulid) -> Result<Vec<Comment>, StoreError>;

    async fn team_members_for_service(
        &self,
        tenant: &str,
        service_id: &str,
    ) -> Result<Vec<TeamMember>, StoreError>;

    /// Number of open (not closed) requests assigned to a team member.
    async fn open_assignments(&self, tenant: &str, team_member_id: &str) -> Result<usize, StoreError>;

    async fn assign(
        &self,
        tenant: &str,
        request_id: Ulid,
        team_member_id: &str,
    ) -> Result<ServiceRequest, StoreError>;
}
