use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span starting at `start` lasting `minutes`.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + Ms::from(minutes) * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Submitted,
    InReview,
    Approved,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl RequestStatus {
    /// Finished work no longer holds its time slot.
    pub fn is_closed(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingType {
    Standard,
    Recurring,
    Emergency,
    Consultation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringPattern {
    pub frequency: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    #[serde(with = "rfc3339::option")]
    pub until: Option<Ms>,
    /// Weekdays 0 (Sunday) through 6 (Saturday), sorted, no duplicates.
    pub by_weekday: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Scheduling data carried only by bookings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    #[serde(with = "rfc3339")]
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub booking_type: BookingType,
    pub contact: ClientContact,
    pub payment_status: PaymentStatus,
    /// Present on the parent row of a recurring series only.
    pub recurring_pattern: Option<RecurringPattern>,
    /// Present on the child rows of a recurring series.
    pub parent_booking_id: Option<Ulid>,
}

impl BookingDetails {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.scheduled_at, self.duration_minutes)
    }
}

/// The persisted unit of work. A booking is a request with `booking` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub id: Ulid,
    pub tenant_id: String,
    pub client_id: String,
    pub service_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub budget: Option<BudgetRange>,
    pub status: RequestStatus,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub booking: Option<BookingDetails>,
    #[serde(with = "rfc3339")]
    pub created_at: Ms,
    #[serde(with = "rfc3339")]
    pub updated_at: Ms,
}

impl ServiceRequest {
    pub fn is_booking(&self) -> bool {
        self.booking.is_some()
    }

    /// The window this row holds on its service's calendar, if any.
    /// Recurring parents only describe a series and never hold a slot.
    pub fn occupied_span(&self) -> Option<Span> {
        let booking = self.booking.as_ref()?;
        if booking.recurring_pattern.is_some() || self.status.is_closed() {
            return None;
        }
        Some(booking.span())
    }
}

/// Fields supplied by the caller; the store assigns the id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewServiceRequest {
    pub client_id: String,
    pub service_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub budget: Option<BudgetRange>,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub booking: Option<BookingDetails>,
}

impl NewServiceRequest {
    pub fn into_request(self, id: Ulid, tenant_id: &str, now: Ms) -> ServiceRequest {
        ServiceRequest {
            id,
            tenant_id: tenant_id.to_string(),
            client_id: self.client_id,
            service_id: self.service_id,
            title: self.title,
            description: self.description,
            priority: self.priority,
            budget: self.budget,
            status: RequestStatus::Submitted,
            assigned_to: self.assigned_to,
            created_by: self.created_by,
            booking: self.booking,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Ulid,
    pub request_id: Ulid,
    pub author_id: String,
    pub body: String,
    #[serde(with = "rfc3339")]
    pub created_at: Ms,
}

// ── Directory entities ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub service_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ClientRegistered(Client),
    ServiceRegistered(Service),
    TeamMemberRegistered(TeamMember),
    RequestCreated(ServiceRequest),
    RequestAssigned {
        id: Ulid,
        team_member_id: String,
        at: Ms,
    },
    CommentAdded(Comment),
}

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Accepts RFC 3339 (`2025-03-10T09:00:00Z`) or a bare UTC date-time
/// (`2025-03-10T09:00`, `2025-03-10T09:00:00`).
pub fn parse_instant(s: &str) -> Option<Ms> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_instant(ms: Ms) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Serde adapter: `Ms` on the Rust side, RFC 3339 text on the wire.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_instant, parse_instant, Ms};

    pub fn serialize<S: Serializer>(ms: &Ms, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_instant(*ms))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ms, D::Error> {
        let raw = String::deserialize(d)?;
        parse_instant(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid instant: {raw}")))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::super::{format_instant, parse_instant, Ms};

        pub fn serialize<S: Serializer>(ms: &Option<Ms>, s: S) -> Result<S::Ok, S::Error> {
            match ms {
                Some(ms) => s.serialize_some(&format_instant(*ms)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Ms>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => parse_instant(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid instant: {raw}"))),
                None => Ok(None),
            }
        }
    }
}
