use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{ListQuery, Page, PersistentStore, StoreError, StoreKind};

#[derive(Debug, Clone, Copy)]
struct Slot {
    request_id: Ulid,
    span: Span,
}

/// Occupied windows of one service, sorted by `span.start`.
#[derive(Debug, Default)]
struct ServiceSchedule {
    slots: Vec<Slot>,
}

impl ServiceSchedule {
    fn insert(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Slots overlapping `query`. Binary search skips slots starting at or after `query.end`.
    fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

#[derive(Default)]
struct TenantState {
    requests: Vec<ServiceRequest>,
    index: HashMap<Ulid, usize>,
    schedules: HashMap<String, ServiceSchedule>,
    clients: HashMap<String, Client>,
    services: HashMap<String, Service>,
    team_members: HashMap<String, TeamMember>,
    comments: HashMap<Ulid, Vec<Comment>>,
}

impl TenantState {
    fn apply(&mut self, event: Event) {
        match event {
            Event::ClientRegistered(client) => {
                self.clients.insert(client.id.clone(), client);
            }
            Event::ServiceRegistered(service) => {
                self.services.insert(service.id.clone(), service);
            }
            Event::TeamMemberRegistered(member) => {
                self.team_members.insert(member.id.clone(), member);
            }
            Event::RequestCreated(request) => {
                if let Some(span) = request.occupied_span() {
                    self.schedules
                        .entry(request.service_id.clone())
                        .or_default()
                        .insert(Slot {
                            request_id: request.id,
                            span,
                        });
                }
                self.index.insert(request.id, self.requests.len());
                self.requests.push(request);
            }
            Event::RequestAssigned { id, team_member_id, at } => {
                if let Some(&pos) = self.index.get(&id) {
                    let request = &mut self.requests[pos];
                    request.assigned_to = Some(team_member_id);
                    request.status = RequestStatus::Assigned;
                    request.updated_at = at;
                }
            }
            Event::CommentAdded(comment) => {
                self.comments.entry(comment.request_id).or_default().push(comment);
            }
        }
    }

    fn get(&self, id: &Ulid) -> Option<&ServiceRequest> {
        self.index.get(id).map(|&pos| &self.requests[pos])
    }

    fn check_references(&self, new: &NewServiceRequest) -> Result<(), StoreError> {
        if !self.clients.contains_key(&new.client_id) {
            return Err(StoreError::InvalidReference {
                field: "clientId",
                id: new.client_id.clone(),
            });
        }
        if !self.services.get(&new.service_id).is_some_and(|s| s.active) {
            return Err(StoreError::InvalidReference {
                field: "serviceId",
                id: new.service_id.clone(),
            });
        }
        if let Some(ref member) = new.assigned_to
            && !self.team_members.contains_key(member)
        {
            return Err(StoreError::InvalidReference {
                field: "teamMemberId",
                id: member.clone(),
            });
        }
        if let Some(parent) = new.booking.as_ref().and_then(|b| b.parent_booking_id)
            && self.get(&parent).is_none()
        {
            return Err(StoreError::InvalidReference {
                field: "parentBookingId",
                id: parent.to_string(),
            });
        }
        Ok(())
    }
}

/// One tenant's log and the state replayed from it.
struct TenantLedger {
    state: RwLock<TenantState>,
    wal: Mutex<Wal>,
}

impl TenantLedger {
    /// WAL-append then apply, while the caller holds the state write lock.
    async fn commit(&self, state: &mut TenantState, event: Event) -> Result<(), StoreError> {
        self.wal
            .lock()
            .await
            .append(&event)
            .map_err(|e| StoreError::Unavailable(format!("wal append failed: {e}")))?;
        state.apply(event);
        Ok(())
    }
}

/// Primary store: one append-only log per tenant under `data_dir`, replayed
/// into memory when the tenant is first touched. Enforces that clients,
/// services, and team members referenced by a request exist.
pub struct WalStore {
    data_dir: Option<PathBuf>,
    tenants: DashMap<String, Arc<TenantLedger>>,
}

impl WalStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir: Some(data_dir),
            tenants: DashMap::new(),
        }
    }

    /// A store with no backing directory: every call reports `Unavailable`.
    pub fn unconfigured() -> Self {
        Self {
            data_dir: None,
            tenants: DashMap::new(),
        }
    }

    /// Get or lazily open the ledger for a tenant.
    fn ledger(&self, tenant: &str) -> Result<Arc<TenantLedger>, StoreError> {
        if let Some(ledger) = self.tenants.get(tenant) {
            return Ok(ledger.value().clone());
        }
        let Some(ref data_dir) = self.data_dir else {
            return Err(StoreError::Unavailable("primary store not configured".into()));
        };
        if !is_valid_tenant_name(tenant) {
            return Err(StoreError::LimitExceeded("invalid tenant name"));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(StoreError::LimitExceeded("too many tenants"));
        }
        let wal_path = data_dir.join(format!("{tenant}.wal"));

        let ledger = self
            .tenants
            .entry(tenant.to_string())
            .or_try_insert_with(|| {
                let (events, wal) = Wal::recover(&wal_path)?;
                let mut state = TenantState::default();
                let replayed = events.len();
                for event in events {
                    state.apply(event);
                }
                tracing::info!(tenant, replayed, "opened tenant ledger");
                Ok::<_, std::io::Error>(Arc::new(TenantLedger {
                    state: RwLock::new(state),
                    wal: Mutex::new(wal),
                }))
            })
            .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {e}", wal_path.display())))?
            .value()
            .clone();
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(ledger)
    }

    pub async fn register_client(&self, tenant: &str, client: Client) -> Result<(), StoreError> {
        let ledger = self.ledger(tenant)?;
        let mut state = ledger.state.write().await;
        if state.clients.get(&client.id) == Some(&client) {
            return Ok(());
        }
        ledger.commit(&mut state, Event::ClientRegistered(client)).await
    }

    pub async fn register_service(&self, tenant: &str, service: Service) -> Result<(), StoreError> {
        let ledger = self.ledger(tenant)?;
        let mut state = ledger.state.write().await;
        if state.services.get(&service.id) == Some(&service) {
            return Ok(());
        }
        ledger.commit(&mut state, Event::ServiceRegistered(service)).await
    }

    pub async fn register_team_member(&self, tenant: &str, member: TeamMember) -> Result<(), StoreError> {
        let ledger = self.ledger(tenant)?;
        let mut state = ledger.state.write().await;
        if state.team_members.get(&member.id) == Some(&member) {
            return Ok(());
        }
        ledger.commit(&mut state, Event::TeamMemberRegistered(member)).await
    }
}

#[async_trait]
impl PersistentStore for WalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Primary
    }

    fn is_available(&self) -> bool {
        self.data_dir.as_ref().is_some_and(|dir| dir.is_dir())
    }

    async fn client_exists(&self, tenant: &str, client_id: &str) -> Result<Option<bool>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        Ok(Some(state.clients.contains_key(client_id)))
    }

    async fn service_exists(&self, tenant: &str, service_id: &str) -> Result<Option<bool>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        Ok(Some(state.services.get(service_id).is_some_and(|s| s.active)))
    }

    async fn create_request(
        &self,
        tenant: &str,
        new: NewServiceRequest,
    ) -> Result<ServiceRequest, StoreError> {
        let ledger = self.ledger(tenant)?;
        let mut state = ledger.state.write().await;
        state.check_references(&new)?;
        let request = new.into_request(Ulid::new(), tenant, now_ms());
        ledger
            .commit(&mut state, Event::RequestCreated(request.clone()))
            .await?;
        Ok(request)
    }

    async fn get_request(&self, tenant: &str, id: Ulid) -> Result<Option<ServiceRequest>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        Ok(state.get(&id).cloned())
    }

    async fn list_requests(
        &self,
        tenant: &str,
        query: &ListQuery,
    ) -> Result<Page<ServiceRequest>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        Ok(query.apply(state.requests.iter()))
    }

    async fn bookings_overlapping(
        &self,
        tenant: &str,
        service_id: &str,
        window: Span,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        let Some(schedule) = state.schedules.get(service_id) else {
            return Ok(Vec::new());
        };
        Ok(schedule
            .overlapping(&window)
            .filter_map(|slot| state.get(&slot.request_id))
            .filter(|r| r.occupied_span().is_some())
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
        let ledger = self.ledger(tenant)?;
        let mut state = ledger.state.write().await;
        if state.get(&request_id).is_none() {
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
        ledger
            .commit(&mut state, Event::CommentAdded(comment.clone()))
            .await?;
        Ok(comment)
    }

    async fn comments(&self, tenant: &str, request_id: Ulid) -> Result<Vec<Comment>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        Ok(state.comments.get(&request_id).cloned().unwrap_or_default())
    }

    async fn team_members_for_service(
        &self,
        tenant: &str,
        service_id: &str,
    ) -> Result<Vec<TeamMember>, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        let mut members: Vec<TeamMember> = state
            .team_members
            .values()
            .filter(|m| m.service_ids.iter().any(|s| s == service_id))
            .cloned()
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(members)
    }

    async fn open_assignments(&self, tenant: &str, team_member_id: &str) -> Result<usize, StoreError> {
        let ledger = self.ledger(tenant)?;
        let state = ledger.state.read().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.assigned_to.as_deref() == Some(team_member_id) && !r.status.is_closed())
            .count())
    }

    async fn assign(
        &self,
        tenant: &str,
        request_id: Ulid,
        team_member_id: &str,
    ) -> Result<ServiceRequest, StoreError> {
        let ledger = self.ledger(tenant)?;
        let mut state = ledger.state.write().await;
        if state.get(&request_id).is_none() {
            return Err(StoreError::NotFound(request_id));
        }
        if !state.team_members.contains_key(team_member_id) {
            return Err(StoreError::InvalidReference {
                field: "teamMemberId",
                id: team_member_id.to_string(),
            });
        }
        let event = Event::RequestAssigned {
            id: request_id,
            team_member_id: team_member_id.to_string(),
            at: now_ms(),
        };
        ledger.commit(&mut state, event).await?;
        state.get(&request_id).cloned().ok_or(StoreError::NotFound(request_id))
    }
}
