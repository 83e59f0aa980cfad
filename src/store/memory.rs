use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::{MAX_COMMENT_LEN, MAX_TENANTS, is_valid_tenant_name};
use crate::model::*;

use super::{ListQuery, Page, PersistentStore, StoreError, StoreKind};

#[derive(Default)]
struct TenantRows {
    requests: Vec<ServiceRequest>,
    comments: Vec<Comment>,
    team_members: Vec<TeamMember>,
}

/// Degraded-mode store: process-local, no referential integrity, nothing
/// survives a restart. Lists and conflict lookups scan every row of the tenant.
pub struct MemoryStore {
    tenants: DashMap<String, TenantRows>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    pub fn request_count(&self, tenant: &str) -> usize {
        self.tenants.get(tenant).map_or(0, |t| t.requests.len())
    }

    pub fn register_team_member(&self, tenant: &str, member: TeamMember) {
        let mut rows = self.tenants.entry(tenant.to_string()).or_default();
        rows.team_members.retain(|m| m.id != member.id);
        rows.team_members.push(member);
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Fallback
    }

    async fn client_exists(&self, _tenant: &str, _client_id: &str) -> Result<Option<bool>, StoreError> {
        Ok(None)
    }

    async fn service_exists(&self, _tenant: &str, _service_id: &str) -> Result<Option<bool>, StoreError> {
        Ok(None)
    }

    async fn create_request(
        &self,
        tenant: &str,
        new: NewServiceRequest,
    ) -> Result<ServiceRequest, StoreError> {
        if !self.tenants.contains_key(tenant) {
            if !is_valid_tenant_name(tenant) {
                return Err(StoreError::LimitExceeded("invalid tenant name"));
            }
            if self.tenants.len() >= MAX_TENANTS {
                return Err(StoreError::LimitExceeded("too many tenants"));
            }
        }
        let request = new.into_request(Ulid::new(), tenant, now_ms());
        tracing::debug!(store = "fallback", tenant, id = %request.id, "request stored in memory");
        self.tenants
            .entry(tenant.to_string())
            .or_default()
            .requests
            .push(request.clone());
        Ok(request)
    }

    async fn get_request(&self, tenant: &str, id: Ulid) -> Result<Option<ServiceRequest>, StoreError> {
        Ok(self
            .tenants
            .get(tenant)
            .and_then(|t| t.requests.iter().find(|r| r.id == id).cloned()))
    }

    async fn list_requests(
        &self,
        tenant: &str,
        query: &ListQuery,
    ) -> Result<Page<ServiceRequest>, StoreError> {
        Ok(match self.tenants.get(tenant) {
            Some(rows) => query.apply(rows.requests.iter()),
            None => query.apply(std::iter::empty()),
        })
    }

    async fn bookings_overlapping(
        &self,
        tenant: &str,
        service_id: &str,
        window: Span,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        let Some(rows) = self.tenants.get(tenant) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .requests
            .iter()
            .filter(|r| r.service_id == service_id)
            .filter(|r| r.occupied_span().is_some_and(|s| s.overlaps(&window)))
            .cloned()
            .collect())
    }

    async fn add_comment(
        &self,
        tenant: &str,
        request_id: Ulid,
        author_id: &str,
        body: String,
    ) -> Result<Comment, StoreError> {
        let mut rows = self
            .tenants
            .get_mut(tenant)
            .ok_or(StoreError::NotFound(request_id))?;
        if !rows.requests.iter().any(|r| r.id == request_id) {
            return Err(StoreError::NotFound(request_id));
        }
        if body.len() > MAX_COMMENT_LEN {
            return Err(StoreError::LimitExceeded("comment too long"));
        }
        let comment = Comment {
            id: Ulid::new(),
            request_id,
            author_id: author_id.to_string(),
            body,
            created_at: now_ms(),
        };
        rows.comments.push(comment.clone());
        Ok(comment)
    }

    async fn comments(&self, tenant: &str, request_id: Ulid) -> Result<Vec<Comment>, StoreError> {
        Ok(self.tenants.get(tenant).map_or_else(Vec::new, |rows| {
            rows.comments
                .iter()
                .filter(|c| c.request_id == request_id)
                .cloned()
                .collect()
        }))
    }

    async fn team_members_for_service(
        &self,
        tenant: &str,
        service_id: &str,
    ) -> Result<Vec<TeamMember>, StoreError> {
        Ok(self.tenants.get(tenant).map_or_else(Vec::new, |rows| {
            rows.team_members
                .iter()
                .filter(|m| m.service_ids.iter().any(|s| s == service_id))
                .cloned()
                .collect()
        }))
    }

    async fn open_assignments(&self, tenant: &str, team_member_id: &str) -> Result<usize, StoreError> {
        Ok(self.tenants.get(tenant).map_or(0, |rows| {
            rows.requests
                .iter()
                .filter(|r| r.assigned_to.as_deref() == Some(team_member_id) && !r.status.is_closed())
                .count()
        }))
    }

    async fn assign(
        &self,
        tenant: &str,
        request_id: Ulid,
        team_member_id: &str,
    ) -> Result<ServiceRequest, StoreError> {
        let mut rows = self
            .tenants
            .get_mut(tenant)
            .ok_or(StoreError::NotFound(request_id))?;
        let request = rows
            .requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or(StoreError::NotFound(request_id))?;
        request.assigned_to = Some(team_member_id.to_string());
        request.status = RequestStatus::Assigned;
        request.updated_at = now_ms();
        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_booking(service_id: &str, start: Ms, minutes: u32) -> NewServiceRequest {
        NewServiceRequest {
            client_id: "c1".into(),
            service_id: service_id.into(),
            title: "Checkup".into(),
            description: None,
            priority: Priority::Low,
            budget: None,
            assigned_to: None,
            created_by: "u1".into(),
            booking: Some(BookingDetails {
                scheduled_at: start,
                duration_minutes: minutes,
                booking_type: BookingType::Standard,
                contact: ClientContact::default(),
                payment_status: PaymentStatus::Unpaid,
                recurring_pattern: None,
                parent_booking_id: None,
            }),
        }
    }

    #[tokio::test]
    async fn accepts_unknown_references() {
        let store = MemoryStore::new();
        assert_eq!(store.client_exists("acme", "ghost").await.unwrap(), None);
        let mut new = new_booking("s1", 0, 30);
        new.client_id = "ghost".into();
        let created = store.create_request("acme", new).await.unwrap();
        assert_eq!(created.tenant_id, "acme");
        assert_eq!(store.request_count("acme"), 1);
    }

    #[tokio::test]
    async fn overlap_lookup_scoped_to_tenant_and_service() {
        let store = MemoryStore::new();
        let hour = 60 * MINUTE_MS;
        store.create_request("acme", new_booking("s1", 0, 60)).await.unwrap();
        store.create_request("acme", new_booking("s2", 0, 60)).await.unwrap();
        store.create_request("globex", new_booking("s1", 0, 60)).await.unwrap();

        let hits = store
            .bookings_overlapping("acme", "s1", Span::new(hour / 2, 2 * hour))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tenant_id, "acme");
        assert_eq!(hits[0].service_id, "s1");

        let adjacent = store
            .bookings_overlapping("acme", "s1", Span::new(hour, 2 * hour))
            .await
            .unwrap();
        assert!(adjacent.is_empty());
    }

    #[tokio::test]
    async fn list_reapplies_filters() {
        let store = MemoryStore::new();
        store.create_request("acme", new_booking("s1", 0, 60)).await.unwrap();
        let mut plain = new_booking("s1", 0, 60);
        plain.booking = None;
        store.create_request("acme", plain).await.unwrap();

        let query = ListQuery {
            kind: Some(super::super::RequestKind::Appointments),
            ..Default::default()
        };
        let page = store.list_requests("acme", &query).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items[0].is_booking());
        let other = store.list_requests("globex", &query).await.unwrap();
        assert_eq!(other.total, 0);
    }

    #[tokio::test]
    async fn comments_and_assignment() {
        let store = MemoryStore::new();
        let created = store.create_request("acme", new_booking("s1", 0, 60)).await.unwrap();
        store
            .add_comment("acme", created.id, "u1", "skipped".into())
            .await
            .unwrap();
        assert_eq!(store.comments("acme", created.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.add_comment("acme", Ulid::new(), "u1", "x".into()).await,
            Err(StoreError::NotFound(_))
        ));

        let assigned = store.assign("acme", created.id, "tm1").await.unwrap();
        assert_eq!(assigned.status, RequestStatus::Assigned);
        assert_eq!(store.open_assignments("acme", "tm1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tenant_ceiling_and_names_match_the_primary() {
        let store = MemoryStore::new();
        for n in 0..MAX_TENANTS {
            store
                .create_request(&format!("t{n}"), new_booking("s1", 0, 30))
                .await
                .unwrap();
        }
        assert!(matches!(
            store.create_request("one_too_many", new_booking("s1", 0, 30)).await,
            Err(StoreError::LimitExceeded("too many tenants"))
        ));
        // Existing tenants keep working at the ceiling.
        store.create_request("t0", new_booking("s1", 0, 30)).await.unwrap();
        assert_eq!(store.request_count("t0"), 2);

        let fresh = MemoryStore::new();
        assert!(matches!(
            fresh.create_request("a.c.m.e", new_booking("s1", 0, 30)).await,
            Err(StoreError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn overlong_comment_is_rejected() {
        let store = MemoryStore::new();
        let created = store.create_request("acme", new_booking("s1", 0, 60)).await.unwrap();
        assert!(matches!(
            store
                .add_comment("acme", created.id, "u1", "x".repeat(MAX_COMMENT_LEN + 1))
                .await,
            Err(StoreError::LimitExceeded("comment too long"))
        ));
        assert!(store.comments("acme", created.id).await.unwrap().is_empty());
    }
}
