//! Inbound create payloads, resolved once into a tagged union.

use serde::{Deserialize, Serialize};

use crate::limits::*;
use crate::model::*;
use crate::store::parse_enum;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every problem found in a payload, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut err = Self::default();
        err.push(field, message);
        err
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation failed")?;
        for (i, e) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} {}", e.field, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Fields shared by every shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFields {
    pub client_id: String,
    pub service_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub budget: Option<BudgetRange>,
    /// Pre-assigned handler; also narrows the conflict scope of a booking.
    pub team_member_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingFields {
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub contact: ClientContact,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateRequest {
    Plain(RequestFields),
    SingleBooking {
        request: RequestFields,
        booking: BookingFields,
        booking_type: BookingType,
    },
    RecurringBooking {
        request: RequestFields,
        booking: BookingFields,
        pattern: RecurringPattern,
    },
}

impl CreateRequest {
    pub fn request(&self) -> &RequestFields {
        match self {
            CreateRequest::Plain(request)
            | CreateRequest::SingleBooking { request, .. }
            | CreateRequest::RecurringBooking { request, .. } => request,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CreateRequest::Plain(_) => "plain",
            CreateRequest::SingleBooking { .. } => "single_booking",
            CreateRequest::RecurringBooking { .. } => "recurring_booking",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPattern {
    frequency: Option<String>,
    interval: Option<i64>,
    count: Option<i64>,
    until: Option<String>,
    #[serde(default)]
    by_weekday: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCreate {
    client_id: Option<String>,
    service_id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    priority: Option<String>,
    budget_min: Option<f64>,
    budget_max: Option<f64>,
    #[serde(default)]
    is_booking: bool,
    scheduled_at: Option<String>,
    duration: Option<i64>,
    team_member_id: Option<String>,
    client_name: Option<String>,
    client_email: Option<String>,
    client_phone: Option<String>,
    booking_type: Option<String>,
    payment_status: Option<String>,
    recurring_pattern: Option<RawPattern>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn reference(errors: &mut ValidationError, field: &str, value: Option<String>) -> String {
    match non_blank(value) {
        Some(id) if id.len() > MAX_REF_ID_LEN => {
            errors.push(field, format!("must be at most {MAX_REF_ID_LEN} characters"));
            id
        }
        Some(id) => id,
        None => {
            errors.push(field, "is required");
            String::new()
        }
    }
}

fn contact_field(errors: &mut ValidationError, field: &str, value: Option<String>) -> Option<String> {
    let value = non_blank(value)?;
    if value.len() > MAX_CONTACT_FIELD_LEN {
        errors.push(field, format!("must be at most {MAX_CONTACT_FIELD_LEN} characters"));
    }
    Some(value)
}

fn instant(errors: &mut ValidationError, field: &str, raw: &str) -> Option<Ms> {
    match parse_instant(raw) {
        Some(ms) if (MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ms) => Some(ms),
        Some(_) => {
            errors.push(field, "is out of range");
            None
        }
        None => {
            errors.push(field, "must be an ISO-8601 date-time");
            None
        }
    }
}

fn request_fields(raw: &mut RawCreate, errors: &mut ValidationError) -> RequestFields {
    let client_id = reference(errors, "clientId", raw.client_id.take());
    let service_id = reference(errors, "serviceId", raw.service_id.take());

    let title = match non_blank(raw.title.take()) {
        Some(t) if t.chars().count() > MAX_TITLE_LEN => {
            errors.push("title", format!("must be at most {MAX_TITLE_LEN} characters"));
            t
        }
        Some(t) => t,
        None => {
            errors.push("title", "is required");
            String::new()
        }
    };
    let description = non_blank(raw.description.take());
    if description.as_ref().is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN) {
        errors.push("description", format!("must be at most {MAX_DESCRIPTION_LEN} characters"));
    }

    let priority = match raw.priority.as_deref() {
        None => Priority::Medium,
        Some(p) => parse_enum(p).unwrap_or_else(|| {
            errors.push("priority", "must be one of LOW, MEDIUM, HIGH, URGENT");
            Priority::Medium
        }),
    };

    let budget = match (raw.budget_min, raw.budget_max) {
        (None, None) => None,
        (min, max) => {
            if min.is_some_and(|v| !v.is_finite() || v < 0.0) {
                errors.push("budgetMin", "must be a non-negative number");
            }
            if max.is_some_and(|v| !v.is_finite() || v < 0.0) {
                errors.push("budgetMax", "must be a non-negative number");
            }
            if let (Some(lo), Some(hi)) = (min, max)
                && lo > hi
            {
                errors.push("budgetMax", "must not be below budgetMin");
            }
            Some(BudgetRange { min, max })
        }
    };

    let team_member_id = non_blank(raw.team_member_id.take());
    if team_member_id.as_ref().is_some_and(|id| id.len() > MAX_REF_ID_LEN) {
        errors.push("teamMemberId", format!("must be at most {MAX_REF_ID_LEN} characters"));
    }

    RequestFields {
        client_id,
        service_id,
        title,
        description,
        priority,
        budget,
        team_member_id,
    }
}

fn booking_fields(raw: &mut RawCreate, errors: &mut ValidationError) -> BookingFields {
    let scheduled_at = match raw.scheduled_at.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => instant(errors, "scheduledAt", s).unwrap_or_default(),
        _ => {
            errors.push("scheduledAt", "is required for bookings");
            0
        }
    };
    let duration_minutes = match raw.duration {
        Some(d) if (1..=i64::from(MAX_DURATION_MINUTES)).contains(&d) => d as u32,
        Some(_) => {
            errors.push("duration", format!("must be between 1 and {MAX_DURATION_MINUTES} minutes"));
            0
        }
        None => {
            errors.push("duration", "is required for bookings");
            0
        }
    };

    let contact = ClientContact {
        name: contact_field(errors, "clientName", raw.client_name.take()),
        email: contact_field(errors, "clientEmail", raw.client_email.take()),
        phone: contact_field(errors, "clientPhone", raw.client_phone.take()),
    };
    if contact.email.as_ref().is_some_and(|e| !e.contains('@')) {
        errors.push("clientEmail", "must be an email address");
    }

    let payment_status = match raw.payment_status.as_deref() {
        None => PaymentStatus::Unpaid,
        Some(p) => parse_enum(p).unwrap_or_else(|| {
            errors.push("paymentStatus", "must be one of UNPAID, PAID, REFUNDED, FAILED");
            PaymentStatus::Unpaid
        }),
    };

    BookingFields {
        scheduled_at,
        duration_minutes,
        contact,
        payment_status,
    }
}

fn pattern(
    raw: RawPattern,
    start: Ms,
    max_occurrences: usize,
    errors: &mut ValidationError,
) -> RecurringPattern {
    let frequency = match raw.frequency.as_deref() {
        Some(f) => parse_enum(f).unwrap_or_else(|| {
            errors.push("recurringPattern.frequency", "must be one of DAILY, WEEKLY, MONTHLY");
            Frequency::Weekly
        }),
        None => {
            errors.push("recurringPattern.frequency", "is required");
            Frequency::Weekly
        }
    };
    let interval = match raw.interval {
        None => 1,
        Some(i) if (1..=i64::from(MAX_PATTERN_INTERVAL)).contains(&i) => i as u32,
        Some(_) => {
            errors.push(
                "recurringPattern.interval",
                format!("must be between 1 and {MAX_PATTERN_INTERVAL}"),
            );
            1
        }
    };
    let count = match raw.count {
        None => None,
        Some(c) if c >= 1 && (c as u64) <= max_occurrences as u64 => Some(c as u32),
        Some(_) => {
            errors.push(
                "recurringPattern.count",
                format!("must be between 1 and {max_occurrences}"),
            );
            None
        }
    };
    let until = raw
        .until
        .as_deref()
        .and_then(|u| instant(errors, "recurringPattern.until", u.trim()));
    if until.is_some_and(|u| u < start) {
        errors.push("recurringPattern.until", "must not be before scheduledAt");
    }

    let mut by_weekday = Vec::with_capacity(raw.by_weekday.len());
    for day in raw.by_weekday {
        match u8::try_from(day) {
            Ok(d) if d <= 6 => by_weekday.push(d),
            _ => {
                errors.push("recurringPattern.byWeekday", "weekdays are 0 (Sunday) to 6 (Saturday)");
                break;
            }
        }
    }
    by_weekday.sort_unstable();
    by_weekday.dedup();
    if frequency == Frequency::Daily && !by_weekday.is_empty() {
        errors.push("recurringPattern.byWeekday", "is not supported for DAILY");
    }

    RecurringPattern {
        frequency,
        interval,
        count,
        until,
        by_weekday,
    }
}

/// Parse and validate a create payload. `isBooking` picks between a plain
/// request and a booking; `bookingType = RECURRING` picks a series.
pub fn parse_create(body: &[u8], max_occurrences: usize) -> Result<CreateRequest, ValidationError> {
    let mut raw: RawCreate = serde_json::from_slice(body)
        .map_err(|e| ValidationError::single("body", format!("malformed JSON: {e}")))?;
    let mut errors = ValidationError::default();
    let request = request_fields(&mut raw, &mut errors);

    if !raw.is_booking {
        let stray = [
            ("scheduledAt", raw.scheduled_at.is_some()),
            ("duration", raw.duration.is_some()),
            ("bookingType", raw.booking_type.is_some()),
            ("recurringPattern", raw.recurring_pattern.is_some()),
        ];
        for (field, present) in stray {
            if present {
                errors.push(field, "only allowed when isBooking is true");
            }
        }
        return errors.into_result(CreateRequest::Plain(request));
    }

    let booking = booking_fields(&mut raw, &mut errors);
    let booking_type = match raw.booking_type.as_deref() {
        None => BookingType::Standard,
        Some(t) => parse_enum(t).unwrap_or_else(|| {
            errors.push(
                "bookingType",
                "must be one of STANDARD, RECURRING, EMERGENCY, CONSULTATION",
            );
            BookingType::Standard
        }),
    };

    let shape = match (booking_type, raw.recurring_pattern) {
        (BookingType::Recurring, Some(raw_pattern)) => {
            let pattern = pattern(raw_pattern, booking.scheduled_at, max_occurrences, &mut errors);
            CreateRequest::RecurringBooking {
                request,
                booking,
                pattern,
            }
        }
        (BookingType::Recurring, None) => {
            errors.push("recurringPattern", "is required when bookingType is RECURRING");
            CreateRequest::SingleBooking {
                request,
                booking,
                booking_type,
            }
        }
        (_, Some(_)) => {
            errors.push("recurringPattern", "only allowed when bookingType is RECURRING");
            CreateRequest::SingleBooking {
                request,
                booking,
                booking_type,
            }
        }
        (_, None) => CreateRequest::SingleBooking {
            request,
            booking,
            booking_type,
        },
    };
    errors.into_result(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<CreateRequest, ValidationError> {
        parse_create(value.to_string().as_bytes(), DEFAULT_MAX_OCCURRENCES)
    }

    fn fields(err: &ValidationError) -> Vec<&str> {
        err.errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn plain_request_with_defaults() {
        let req = parse(json!({"clientId": "c1", "serviceId": "s1", "title": "  Fix tap  "})).unwrap();
        match req {
            CreateRequest::Plain(r) => {
                assert_eq!(r.title, "Fix tap");
                assert_eq!(r.priority, Priority::Medium);
                assert!(r.budget.is_none());
            }
            other => panic!("expected plain, got {other:?}"),
        }
    }

    #[test]
    fn single_booking() {
        let req = parse(json!({
            "clientId": "c1", "serviceId": "S1", "title": "Visit", "priority": "high",
            "isBooking": true, "scheduledAt": "2025-03-10T09:00", "duration": 60,
            "clientEmail": "ada@example.com", "bookingType": "EMERGENCY"
        }))
        .unwrap();
        let CreateRequest::SingleBooking { request, booking, booking_type } = req else {
            panic!("expected single booking");
        };
        assert_eq!(request.priority, Priority::High);
        assert_eq!(booking_type, BookingType::Emergency);
        assert_eq!(booking.scheduled_at, parse_instant("2025-03-10T09:00:00Z").unwrap());
        assert_eq!(booking.duration_minutes, 60);
        assert_eq!(booking.payment_status, PaymentStatus::Unpaid);
        assert_eq!(booking.contact.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn recurring_booking() {
        let req = parse(json!({
            "clientId": "c1", "serviceId": "S1", "title": "Weekly clean",
            "isBooking": true, "scheduledAt": "2025-03-03T10:00:00Z", "duration": 90,
            "bookingType": "RECURRING",
            "recurringPattern": {"frequency": "WEEKLY", "count": 4, "byWeekday": [3, 1, 3]}
        }))
        .unwrap();
        let CreateRequest::RecurringBooking { pattern, .. } = req else {
            panic!("expected recurring booking");
        };
        assert_eq!(pattern.frequency, Frequency::Weekly);
        assert_eq!(pattern.interval, 1);
        assert_eq!(pattern.count, Some(4));
        assert_eq!(pattern.by_weekday, vec![1, 3]);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = parse_create(b"{not json", 52).unwrap_err();
        assert_eq!(fields(&err), vec!["body"]);
        let err = parse_create(br#"{"duration": "sixty"}"#, 52).unwrap_err();
        assert_eq!(fields(&err), vec!["body"]);
    }

    #[test]
    fn reports_every_missing_field() {
        let err = parse(json!({"isBooking": true})).unwrap_err();
        assert_eq!(fields(&err), vec!["clientId", "serviceId", "title", "scheduledAt", "duration"]);
    }

    #[test]
    fn booking_fields_without_flag_are_ambiguous() {
        let err = parse(json!({
            "clientId": "c1", "serviceId": "s1", "title": "t",
            "scheduledAt": "2025-03-10T09:00", "duration": 60
        }))
        .unwrap_err();
        assert_eq!(fields(&err), vec!["scheduledAt", "duration"]);
    }

    #[test]
    fn pattern_and_booking_type_must_agree() {
        let base = json!({
            "clientId": "c1", "serviceId": "s1", "title": "t",
            "isBooking": true, "scheduledAt": "2025-03-10T09:00", "duration": 60
        });
        let mut missing = base.clone();
        missing["bookingType"] = json!("RECURRING");
        assert_eq!(fields(&parse(missing).unwrap_err()), vec!["recurringPattern"]);

        let mut stray = base;
        stray["recurringPattern"] = json!({"frequency": "DAILY", "count": 2});
        assert_eq!(fields(&parse(stray).unwrap_err()), vec!["recurringPattern"]);
    }

    #[test]
    fn pattern_bounds() {
        let err = parse(json!({
            "clientId": "c1", "serviceId": "s1", "title": "t",
            "isBooking": true, "scheduledAt": "2025-03-10T09:00", "duration": 60,
            "bookingType": "RECURRING",
            "recurringPattern": {
                "frequency": "DAILY", "interval": 0, "count": 500,
                "until": "2025-01-01T00:00", "byWeekday": [1]
            }
        }))
        .unwrap_err();
        assert_eq!(
            fields(&err),
            vec![
                "recurringPattern.interval",
                "recurringPattern.count",
                "recurringPattern.until",
                "recurringPattern.byWeekday",
            ]
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = parse(json!({
            "clientId": "c1", "serviceId": "s1", "title": "t", "priority": "CRITICAL",
            "budgetMin": 500.0, "budgetMax": 100.0,
            "isBooking": true, "scheduledAt": "1970-01-01T00:00", "duration": 0,
            "clientEmail": "nope", "paymentStatus": "MAYBE"
        }))
        .unwrap_err();
        assert_eq!(
            fields(&err),
            vec!["priority", "budgetMax", "scheduledAt", "duration", "clientEmail", "paymentStatus"]
        );
        assert!(err.to_string().starts_with("validation failed: priority"));
    }
}
