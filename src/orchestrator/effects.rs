//! Secondary work after a committed write. Every effect runs on its own;
//! a failure is logged and counted, then dropped.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate};
use serde_json::{Value, json};
use ulid::Ulid;

use crate::assign::AutoAssigner;
use crate::audit::{AuditError, AuditLogger};
use crate::model::*;
use crate::notify::{NotifyError, RealtimeBroadcaster};
use crate::observability::EFFECT_FAILURES_TOTAL;
use crate::store::{PersistentStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum PostCommitEffect {
    AutoAssign { request_id: Ulid },
    Audit {
        action: &'static str,
        target_id: String,
        details: Value,
    },
    EntityUpdate { id: Ulid, payload: Value },
    AvailabilityUpdate { resource_id: String, date: NaiveDate },
}

impl PostCommitEffect {
    pub fn name(&self) -> &'static str {
        match self {
            PostCommitEffect::AutoAssign { .. } => "auto_assign",
            PostCommitEffect::Audit { .. } => "audit",
            PostCommitEffect::EntityUpdate { .. } => "entity_update",
            PostCommitEffect::AvailabilityUpdate { .. } => "availability_update",
        }
    }

    /// Id of the entity the effect is about, for logs.
    pub fn target(&self) -> String {
        match self {
            PostCommitEffect::AutoAssign { request_id } => request_id.to_string(),
            PostCommitEffect::Audit { target_id, .. } => target_id.clone(),
            PostCommitEffect::EntityUpdate { id, .. } => id.to_string(),
            PostCommitEffect::AvailabilityUpdate { resource_id, date } => format!("{resource_id}@{date}"),
        }
    }
}

#[derive(Debug)]
pub enum EffectError {
    Assign(StoreError),
    Audit(AuditError),
    Notify(NotifyError),
}

impl std::fmt::Display for EffectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectError::Assign(e) => write!(f, "auto-assignment failed: {e}"),
            EffectError::Audit(e) => write!(f, "{e}"),
            EffectError::Notify(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EffectError {}

/// What the effects changed or failed to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EffectReport {
    pub assignments: Vec<(Ulid, String)>,
    pub failed: Vec<&'static str>,
}

/// Collaborators an effect may touch, bound to one request.
pub struct Effects<'a> {
    pub store: &'a dyn PersistentStore,
    pub audit: &'a dyn AuditLogger,
    pub broadcaster: &'a dyn RealtimeBroadcaster,
    pub assigner: &'a dyn AutoAssigner,
    pub tenant: &'a str,
    pub actor: &'a str,
}

impl Effects<'_> {
    async fn apply(&self, effect: &PostCommitEffect) -> Result<Option<(Ulid, String)>, EffectError> {
        match effect {
            PostCommitEffect::AutoAssign { request_id } => self
                .assigner
                .assign(self.store, self.tenant, *request_id)
                .await
                .map(|member| member.map(|m| (*request_id, m)))
                .map_err(EffectError::Assign),
            PostCommitEffect::Audit {
                action,
                target_id,
                details,
            } => self
                .audit
                .log(self.tenant, action, self.actor, target_id, details.clone())
                .await
                .map(|()| None)
                .map_err(EffectError::Audit),
            PostCommitEffect::EntityUpdate { id, payload } => self
                .broadcaster
                .emit_entity_update(self.tenant, *id, payload.clone())
                .map(|()| None)
                .map_err(EffectError::Notify),
            PostCommitEffect::AvailabilityUpdate { resource_id, date } => self
                .broadcaster
                .emit_availability_update(self.tenant, resource_id, *date)
                .map(|()| None)
                .map_err(EffectError::Notify),
        }
    }

    /// Run effects in order. Never fails.
    pub async fn run(&self, effects: Vec<PostCommitEffect>) -> EffectReport {
        let mut report = EffectReport::default();
        for effect in effects {
            match self.apply(&effect).await {
                Ok(Some(assignment)) => report.assignments.push(assignment),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        effect = effect.name(),
                        tenant = self.tenant,
                        target_id = %effect.target(),
                        actor = self.actor,
                        store = self.store.kind().label(),
                        error = %e,
                        "post-commit effect failed"
                    );
                    metrics::counter!(EFFECT_FAILURES_TOTAL, "effect" => effect.name()).increment(1);
                    report.failed.push(effect.name());
                }
            }
        }
        report
    }
}

fn audit_details(row: &ServiceRequest) -> Value {
    let mut details = json!({
        "clientId": row.client_id,
        "serviceId": row.service_id,
        "title": row.title,
        "priority": row.priority,
    });
    if let Some(ref booking) = row.booking {
        details["scheduledAt"] = json!(format_instant(booking.scheduled_at));
        details["durationMinutes"] = json!(booking.duration_minutes);
        details["bookingType"] = json!(booking.booking_type);
        if let Some(parent) = booking.parent_booking_id {
            details["parentBookingId"] = json!(parent.to_string());
        }
    }
    details
}

/// Assignment, audit entry, and entity update for one newly created row.
/// Pre-assigned rows and series parents are not auto-assigned.
pub fn for_created(row: &ServiceRequest, action: &'static str) -> Vec<PostCommitEffect> {
    let mut effects = Vec::with_capacity(3);
    let is_series_parent = row
        .booking
        .as_ref()
        .is_some_and(|b| b.recurring_pattern.is_some());
    if row.assigned_to.is_none() && !is_series_parent {
        effects.push(PostCommitEffect::AutoAssign { request_id: row.id });
    }
    effects.push(PostCommitEffect::Audit {
        action,
        target_id: row.id.to_string(),
        details: audit_details(row),
    });
    effects.push(PostCommitEffect::EntityUpdate {
        id: row.id,
        payload: serde_json::to_value(row).unwrap_or(Value::Null),
    });
    effects
}

/// One availability update per distinct (service, UTC date) the rows occupy.
pub fn availability_updates<'a>(rows: impl IntoIterator<Item = &'a ServiceRequest>) -> Vec<PostCommitEffect> {
    let dates: BTreeSet<(String, NaiveDate)> = rows
        .into_iter()
        .filter_map(|r| {
            let span = r.occupied_span()?;
            let date = DateTime::from_timestamp_millis(span.start)?.date_naive();
            Some((r.service_id.clone(), date))
        })
        .collect();
    dates
        .into_iter()
        .map(|(resource_id, date)| PostCommitEffect::AvailabilityUpdate { resource_id, date })
        .collect()
}
