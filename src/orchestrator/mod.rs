//! Service-request creation and listing.
//!
//! A create call moves through validate → identity → permission → rate
//! limit → one of three write paths → post-commit effects. When the primary
//! store reports `Unavailable` before anything was written, the same path is
//! replayed against the fallback store.

mod effects;
mod error;
mod validate;


pub use effects::{EffectError, EffectReport, Effects, PostCommitEffect};
pub use error::RequestError;
pub use validate::{BookingFields, CreateRequest, FieldError, RequestFields, ValidationError, parse_create};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use ulid::Ulid;

use crate::assign::{AutoAssigner, WorkloadAssigner};
use crate::audit::{AuditLogger, TracingAuditLogger, actions};
use crate::auth::{Capability, PermissionCheck, RequestContext, RolePermissions};
use crate::conflict::{ConflictVerdict, ResourceRef, Window, check_conflict};
use crate::limits::DEFAULT_MAX_OCCURRENCES;
use crate::model::*;
use crate::notify::{NotifyHub, RealtimeBroadcaster};
use crate::observability::*;
use crate::rate_limit::RateLimiter;
use crate::series::{self, Occurrence};
use crate::store::{ListQuery, Page, PersistentStore, StoreError, StoreKind};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Most occurrences a recurring series may expand to.
    pub max_occurrences: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
        }
    }
}

/// A result plus the store that produced it.
#[derive(Debug)]
pub struct Served<T> {
    pub value: T,
    pub store: StoreKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOccurrence {
    #[serde(with = "rfc3339")]
    pub start: Ms,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesOutcome {
    pub parent: ServiceRequest,
    pub children_created: Vec<ServiceRequest>,
    pub skipped: Vec<Occurrence>,
    /// Occurrences whose write failed after the parent existed.
    pub failed: Vec<FailedOccurrence>,
    /// Expansion stopped at the occurrence ceiling.
    pub capped: bool,
}

impl SeriesOutcome {
    pub fn planned(&self) -> usize {
        self.children_created.len() + self.skipped.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Created {
    Request(ServiceRequest),
    Series(SeriesOutcome),
}

pub struct Orchestrator {
    primary: Arc<dyn PersistentStore>,
    fallback: Arc<dyn PersistentStore>,
    permissions: Arc<dyn PermissionCheck>,
    audit: Arc<dyn AuditLogger>,
    broadcaster: Arc<dyn RealtimeBroadcaster>,
    assigner: Arc<dyn AutoAssigner>,
    rate_limiter: Arc<RateLimiter>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Orchestrator with the stock collaborators; replace them with `with_*`.
    pub fn new(primary: Arc<dyn PersistentStore>, fallback: Arc<dyn PersistentStore>) -> Self {
        Self {
            primary,
            fallback,
            permissions: Arc::new(RolePermissions),
            audit: Arc::new(TracingAuditLogger),
            broadcaster: Arc::new(NotifyHub::new()),
            assigner: Arc::new(WorkloadAssigner),
            rate_limiter: Arc::new(RateLimiter::default()),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionCheck>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn RealtimeBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_assigner(mut self, assigner: Arc<dyn AutoAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn primary_available(&self) -> bool {
        self.primary.is_available()
    }

    // ── create ──────────────────────────────────────────────────

    pub async fn create(
        &self,
        ctx: Option<&RequestContext>,
        client_addr: &str,
        body: &[u8],
    ) -> Result<Served<Created>, RequestError> {
        let started = Instant::now();
        let result = self.create_inner(ctx, client_addr, body).await;
        record("create", started, &result);
        result
    }

    async fn create_inner(
        &self,
        ctx: Option<&RequestContext>,
        client_addr: &str,
        body: &[u8],
    ) -> Result<Served<Created>, RequestError> {
        let request = parse_create(body, self.config.max_occurrences)?;
        let ctx = ctx.ok_or_else(|| RequestError::Unauthorized("missing tenant or user identity".into()))?;
        if !self.permissions.allows(ctx.role, Capability::CreateServiceRequest) {
            return Err(RequestError::Unauthorized(
                "role may not create service requests".into(),
            ));
        }
        if !self.rate_limiter.allow(client_addr) {
            self.reject_rate_limited(ctx, client_addr).await;
            return Err(RequestError::RateLimited {
                limit: self.rate_limiter.limit(),
            });
        }

        match self.dispatch(self.primary.as_ref(), ctx, &request).await {
            Err(RequestError::Unavailable(reason)) => {
                tracing::warn!(
                    store = "fallback",
                    operation = "create",
                    tenant = %ctx.tenant_id,
                    shape = request.kind(),
                    %reason,
                    "primary store unavailable, creating in fallback store"
                );
                metrics::counter!(FALLBACK_ACTIVATIONS_TOTAL, "operation" => "create").increment(1);
                let value = self.dispatch(self.fallback.as_ref(), ctx, &request).await?;
                Ok(Served {
                    value,
                    store: StoreKind::Fallback,
                })
            }
            Err(e) => Err(e),
            Ok(value) => Ok(Served {
                value,
                store: self.primary.kind(),
            }),
        }
    }

    async fn reject_rate_limited(&self, ctx: &RequestContext, client_addr: &str) {
        tracing::warn!(tenant = %ctx.tenant_id, user = %ctx.user_id, client_addr, "rate limit exceeded");
        metrics::counter!(RATE_LIMITED_TOTAL).increment(1);
        let details = json!({ "clientAddr": client_addr, "limit": self.rate_limiter.limit() });
        if let Err(e) = self
            .audit
            .log(&ctx.tenant_id, actions::RATE_LIMITED, &ctx.user_id, client_addr, details)
            .await
        {
            tracing::warn!(effect = "audit", tenant = %ctx.tenant_id, error = %e, "security audit failed");
            metrics::counter!(EFFECT_FAILURES_TOTAL, "effect" => "audit").increment(1);
        }
    }

    fn effects<'a>(&'a self, store: &'a dyn PersistentStore, ctx: &'a RequestContext) -> Effects<'a> {
        Effects {
            store,
            audit: self.audit.as_ref(),
            broadcaster: self.broadcaster.as_ref(),
            assigner: self.assigner.as_ref(),
            tenant: &ctx.tenant_id,
            actor: &ctx.user_id,
        }
    }

    /// Run one write path against `store`. Returns `Unavailable` only if
    /// nothing was written.
    async fn dispatch(
        &self,
        store: &dyn PersistentStore,
        ctx: &RequestContext,
        request: &CreateRequest,
    ) -> Result<Created, RequestError> {
        check_references(store, &ctx.tenant_id, request.request()).await?;
        match request {
            CreateRequest::Plain(fields) => {
                let new = new_request(fields, &ctx.user_id, None);
                let row = store.create_request(&ctx.tenant_id, new).await?;
                let row = self.after_write(store, ctx, row, actions::REQUEST_CREATED).await;
                Ok(Created::Request(row))
            }
            CreateRequest::SingleBooking {
                request,
                booking,
                booking_type,
            } => self
                .single_booking(store, ctx, request, booking, *booking_type)
                .await
                .map(Created::Request),
            CreateRequest::RecurringBooking {
                request,
                booking,
                pattern,
            } => self
                .recurring_booking(store, ctx, request, booking, pattern)
                .await
                .map(Created::Series),
        }
    }

    /// Post-commit effects for one row, returning the row as assigned.
    async fn after_write(
        &self,
        store: &dyn PersistentStore,
        ctx: &RequestContext,
        mut row: ServiceRequest,
        action: &'static str,
    ) -> ServiceRequest {
        let mut pending = effects::for_created(&row, action);
        pending.extend(effects::availability_updates([&row]));
        let report = self.effects(store, ctx).run(pending).await;
        apply_assignments(&report, std::slice::from_mut(&mut row));
        row
    }

    async fn single_booking(
        &self,
        store: &dyn PersistentStore,
        ctx: &RequestContext,
        request: &RequestFields,
        booking: &BookingFields,
        booking_type: BookingType,
    ) -> Result<ServiceRequest, RequestError> {
        let resource = resource_of(request);
        let window = Window {
            start: booking.scheduled_at,
            duration_minutes: booking.duration_minutes,
        };
        let verdict = check_conflict(store, &ctx.tenant_id, &resource, window, None).await?;
        if verdict.conflict {
            metrics::counter!(CONFLICTS_TOTAL).increment(1);
            return Err(conflict_error(verdict));
        }

        let details = booking_details(booking, booking_type, booking.scheduled_at, None, None);
        let new = new_request(request, &ctx.user_id, Some(details));
        let row = store.create_request(&ctx.tenant_id, new).await?;
        tracing::info!(
            tenant = %ctx.tenant_id,
            id = %row.id,
            service = %row.service_id,
            store = store.kind().label(),
            "booking created"
        );
        Ok(self.after_write(store, ctx, row, actions::BOOKING_CREATED).await)
    }

    async fn recurring_booking(
        &self,
        store: &dyn PersistentStore,
        ctx: &RequestContext,
        request: &RequestFields,
        booking: &BookingFields,
        pattern: &RecurringPattern,
    ) -> Result<SeriesOutcome, RequestError> {
        let tenant = ctx.tenant_id.as_str();
        let resource = resource_of(request);
        let plan = series::plan(
            store,
            tenant,
            &resource,
            booking.scheduled_at,
            booking.duration_minutes,
            pattern,
            self.config.max_occurrences,
        )
        .await?;

        let parent_details = booking_details(
            booking,
            BookingType::Recurring,
            booking.scheduled_at,
            Some(pattern.clone()),
            None,
        );
        let parent = store
            .create_request(tenant, new_request(request, &ctx.user_id, Some(parent_details)))
            .await?;

        // Nothing below may return early: the parent exists.
        let mut children = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        for occurrence in plan.occurrences {
            if occurrence.verdict.conflict {
                skipped.push(occurrence);
                continue;
            }
            let window = Window {
                start: occurrence.start,
                duration_minutes: booking.duration_minutes,
            };
            match check_conflict(store, tenant, &resource, window, None).await {
                Ok(verdict) if verdict.conflict => {
                    skipped.push(Occurrence {
                        start: occurrence.start,
                        verdict,
                    });
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    failed.push(FailedOccurrence {
                        start: occurrence.start,
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            let details = booking_details(
                booking,
                BookingType::Recurring,
                occurrence.start,
                None,
                Some(parent.id),
            );
            match store
                .create_request(tenant, new_request(request, &ctx.user_id, Some(details)))
                .await
            {
                Ok(child) => {
                    let child = self.after_child_write(store, ctx, child).await;
                    children.push(child);
                }
                Err(e) => {
                    tracing::warn!(
                        tenant,
                        parent = %parent.id,
                        at = %format_instant(occurrence.start),
                        store = store.kind().label(),
                        error = %e,
                        "series occurrence not written"
                    );
                    failed.push(FailedOccurrence {
                        start: occurrence.start,
                        error: e.to_string(),
                    });
                }
            }
        }

        for occurrence in &skipped {
            if let Err(e) = store
                .add_comment(tenant, parent.id, &ctx.user_id, series::skip_note(occurrence))
                .await
            {
                tracing::warn!(tenant, parent = %parent.id, error = %e, "skip comment not recorded");
                metrics::counter!(EFFECT_FAILURES_TOTAL, "effect" => "skip_comment").increment(1);
            }
        }

        metrics::counter!(SERIES_OCCURRENCES_TOTAL, "outcome" => "created").increment(children.len() as u64);
        metrics::counter!(SERIES_OCCURRENCES_TOTAL, "outcome" => "skipped").increment(skipped.len() as u64);
        metrics::counter!(SERIES_OCCURRENCES_TOTAL, "outcome" => "failed").increment(failed.len() as u64);
        tracing::info!(
            tenant,
            parent = %parent.id,
            created = children.len(),
            skipped = skipped.len(),
            failed = failed.len(),
            capped = plan.capped,
            store = store.kind().label(),
            "recurring series created"
        );

        let mut parent_effects = effects::for_created(&parent, actions::SERIES_CREATED);
        if let Some(PostCommitEffect::Audit { details, .. }) = parent_effects
            .iter_mut()
            .find(|e| matches!(e, PostCommitEffect::Audit { .. }))
        {
            details["childrenCreated"] = json!(children.len());
            details["skipped"] = json!(skipped.len());
            details["failed"] = json!(failed.len());
        }
        parent_effects.extend(effects::availability_updates(&children));
        self.effects(store, ctx).run(parent_effects).await;

        Ok(SeriesOutcome {
            parent,
            children_created: children,
            skipped,
            failed,
            capped: plan.capped,
        })
    }

    /// Per-child effects, without availability; the series reports dates once.
    async fn after_child_write(
        &self,
        store: &dyn PersistentStore,
        ctx: &RequestContext,
        mut child: ServiceRequest,
    ) -> ServiceRequest {
        let pending = effects::for_created(&child, actions::BOOKING_CREATED);
        let report = self.effects(store, ctx).run(pending).await;
        apply_assignments(&report, std::slice::from_mut(&mut child));
        child
    }

    // ── reads ───────────────────────────────────────────────────

    /// Identity plus the read-all capability, as every read endpoint needs.
    pub fn authorize_read<'a>(&self, ctx: Option<&'a RequestContext>) -> Result<&'a RequestContext, RequestError> {
        let ctx = ctx.ok_or_else(|| RequestError::Unauthorized("missing tenant or user identity".into()))?;
        if !self.permissions.allows(ctx.role, Capability::ReadAllServiceRequests) {
            return Err(RequestError::Unauthorized(
                "role may not read all service requests".into(),
            ));
        }
        Ok(ctx)
    }

    pub async fn list(
        &self,
        ctx: Option<&RequestContext>,
        params: &HashMap<String, String>,
    ) -> Result<Served<Page<ServiceRequest>>, RequestError> {
        let started = Instant::now();
        let result = self.list_inner(ctx, params).await;
        record("list", started, &result);
        result
    }

    async fn list_inner(
        &self,
        ctx: Option<&RequestContext>,
        params: &HashMap<String, String>,
    ) -> Result<Served<Page<ServiceRequest>>, RequestError> {
        let ctx = self.authorize_read(ctx)?;
        let query = ListQuery::from_params(params)?;
        let tenant = ctx.tenant_id.as_str();
        match self.primary.list_requests(tenant, &query).await {
            Ok(value) => Ok(Served {
                value,
                store: self.primary.kind(),
            }),
            Err(e) if e.is_unavailable() => {
                tracing::warn!(store = "fallback", operation = "list", tenant, error = %e, "listing from fallback store");
                metrics::counter!(FALLBACK_ACTIVATIONS_TOTAL, "operation" => "list").increment(1);
                let value = self.fallback.list_requests(tenant, &query).await?;
                Ok(Served {
                    value,
                    store: StoreKind::Fallback,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn comments(
        &self,
        ctx: Option<&RequestContext>,
        request_id: Ulid,
    ) -> Result<Served<Vec<Comment>>, RequestError> {
        let started = Instant::now();
        let result = self.comments_inner(ctx, request_id).await;
        record("comments", started, &result);
        result
    }

    async fn comments_inner(
        &self,
        ctx: Option<&RequestContext>,
        request_id: Ulid,
    ) -> Result<Served<Vec<Comment>>, RequestError> {
        let ctx = self.authorize_read(ctx)?;
        let tenant = ctx.tenant_id.as_str();
        match read_comments(self.primary.as_ref(), tenant, request_id).await {
            Err(e) if e.is_unavailable() => {
                tracing::warn!(store = "fallback", operation = "comments", tenant, error = %e, "reading comments from fallback store");
                metrics::counter!(FALLBACK_ACTIVATIONS_TOTAL, "operation" => "comments").increment(1);
                let value = read_comments(self.fallback.as_ref(), tenant, request_id).await?;
                Ok(Served {
                    value,
                    store: StoreKind::Fallback,
                })
            }
            Err(e) => Err(e.into()),
            Ok(value) => Ok(Served {
                value,
                store: self.primary.kind(),
            }),
        }
    }
}

async fn read_comments(
    store: &dyn PersistentStore,
    tenant: &str,
    request_id: Ulid,
) -> Result<Vec<Comment>, StoreError> {
    if store.get_request(tenant, request_id).await?.is_none() {
        return Err(StoreError::NotFound(request_id));
    }
    store.comments(tenant, request_id).await
}

fn record<T>(operation: &'static str, started: Instant, result: &Result<T, RequestError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::counter!(REQUESTS_TOTAL, "operation" => operation, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Ask the store whether client and service exist. Stores that cannot tell
/// answer `None` and the write proceeds.
async fn check_references(
    store: &dyn PersistentStore,
    tenant: &str,
    fields: &RequestFields,
) -> Result<(), RequestError> {
    if store.client_exists(tenant, &fields.client_id).await? == Some(false) {
        return Err(RequestError::InvalidReference {
            field: "clientId",
            id: fields.client_id.clone(),
        });
    }
    if store.service_exists(tenant, &fields.service_id).await? == Some(false) {
        return Err(RequestError::InvalidReference {
            field: "serviceId",
            id: fields.service_id.clone(),
        });
    }
    Ok(())
}

/// A blocking verdict as a request error. A verdict without a blocker id
/// still refuses the write.
fn conflict_error(verdict: ConflictVerdict) -> RequestError {
    let reason = verdict.reason.unwrap_or_else(|| "time slot unavailable".into());
    match verdict.conflicting_booking_id {
        Some(conflicting_booking_id) => RequestError::Conflict {
            reason,
            conflicting_booking_id,
        },
        None => RequestError::Internal(format!("conflict without a blocking booking: {reason}")),
    }
}

fn resource_of(fields: &RequestFields) -> ResourceRef {
    ResourceRef {
        service_id: fields.service_id.clone(),
        team_member_id: fields.team_member_id.clone(),
    }
}

fn booking_details(
    booking: &BookingFields,
    booking_type: BookingType,
    scheduled_at: Ms,
    recurring_pattern: Option<RecurringPattern>,
    parent_booking_id: Option<Ulid>,
) -> BookingDetails {
    BookingDetails {
        scheduled_at,
        duration_minutes: booking.duration_minutes,
        booking_type,
        contact: booking.contact.clone(),
        payment_status: booking.payment_status,
        recurring_pattern,
        parent_booking_id,
    }
}

fn new_request(fields: &RequestFields, actor: &str, booking: Option<BookingDetails>) -> NewServiceRequest {
    NewServiceRequest {
        client_id: fields.client_id.clone(),
        service_id: fields.service_id.clone(),
        title: fields.title.clone(),
        description: fields.description.clone(),
        priority: fields.priority,
        budget: fields.budget,
        assigned_to: fields.team_member_id.clone(),
        created_by: actor.to_string(),
        booking,
    }
}

/// Reflect successful auto-assignments in rows about to be returned.
fn apply_assignments(report: &EffectReport, rows: &mut [ServiceRequest]) {
    for (id, member) in &report.assignments {
        if let Some(row) = rows.iter_mut().find(|r| r.id == *id) {
            row.assigned_to = Some(member.clone());
            row.status = RequestStatus::Assigned;
        }
    }
}
