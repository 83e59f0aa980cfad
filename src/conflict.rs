//! Time-window conflict detection for bookings.
//!
//! Two windows conflict when they overlap at all under half-open comparison.
//! The resource is the service; naming a team member narrows the search to
//! that member's bookings, so several members can serve one service at once.

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::store::{PersistentStore, StoreError};

/// What a booking occupies: a service, optionally one team member of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub service_id: String,
    pub team_member_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Ms,
    pub duration_minutes: u32,
}

impl Window {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.duration_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictVerdict {
    pub conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_booking_id: Option<Ulid>,
}

impl ConflictVerdict {
    pub fn clear() -> Self {
        Self {
            conflict: false,
            reason: None,
            conflicting_booking_id: None,
        }
    }

    fn blocked_by(booking: &ServiceRequest, span: Span) -> Self {
        Self {
            conflict: true,
            reason: Some(format!(
                "time slot overlaps booking {} from {} to {}",
                booking.id,
                format_instant(span.start),
                format_instant(span.end)
            )),
            conflicting_booking_id: Some(booking.id),
        }
    }
}

/// Earliest booking among `candidates` that blocks `span` for `resource`.
pub fn find_conflict<'a>(
    candidates: impl IntoIterator<Item = &'a ServiceRequest>,
    tenant: &str,
    resource: &ResourceRef,
    span: Span,
    exclude: Option<Ulid>,
) -> Option<(&'a ServiceRequest, Span)> {
    candidates
        .into_iter()
        .filter(|r| r.tenant_id == tenant && r.service_id == resource.service_id)
        .filter(|r| Some(r.id) != exclude)
        .filter(|r| match resource.team_member_id {
            Some(ref member) => r.assigned_to.as_deref() == Some(member.as_str()),
            None => true,
        })
        .filter_map(|r| r.occupied_span().map(|s| (r, s)))
        .filter(|(_, s)| s.overlaps(&span))
        .min_by_key(|(r, s)| (s.start, r.id))
}

/// Check a proposed window against the store. Read-only; safe to repeat.
pub async fn check_conflict(
    store: &dyn PersistentStore,
    tenant: &str,
    resource: &ResourceRef,
    window: Window,
    exclude: Option<Ulid>,
) -> Result<ConflictVerdict, StoreError> {
    let span = window.span();
    let candidates = store
        .bookings_overlapping(tenant, &resource.service_id, span)
        .await?;
    Ok(match find_conflict(&candidates, tenant, resource, span, exclude) {
        Some((booking, booked)) => ConflictVerdict::blocked_by(booking, booked),
        None => ConflictVerdict::clear(),
    })
}
