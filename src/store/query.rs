use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::limits::*;
use crate::model::*;
use crate::orchestrator::ValidationError;

/// `type=` on the list endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Plain requests without a schedule.
    Requests,
    /// Bookings.
    Appointments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    ScheduledAt,
    Priority,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Filter, sort, and page over service requests. Both stores evaluate it
/// row by row; there is no query planner.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub kind: Option<RequestKind>,
    pub status: Option<RequestStatus>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<String>,
    pub client_id: Option<String>,
    pub service_id: Option<String>,
    pub q: Option<String>,
    pub date_from: Option<Ms>,
    pub date_to: Option<Ms>,
    pub booking_type: Option<BookingType>,
    pub payment_status: Option<PaymentStatus>,
    pub page: usize,
    pub limit: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            kind: None,
            status: None,
            priority: None,
            assigned_to: None,
            client_id: None,
            service_id: None,
            q: None,
            date_from: None,
            date_to: None,
            booking_type: None,
            payment_status: None,
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            sort_by: SortField::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.limit.max(1))
    }
}

/// Parse an upper-case enum value the same way the JSON payloads do.
pub(crate) fn parse_enum<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_uppercase())).ok()
}

/// `YYYY-MM-DD` or any instant `parse_instant` accepts. A bare date used as
/// an upper bound covers the whole day.
fn parse_bound(raw: &str, end_of_day: bool) -> Option<Ms> {
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let start = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
        return Some(if end_of_day { start + DAY_MS - 1 } else { start });
    }
    parse_instant(raw)
}

impl ListQuery {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ValidationError> {
        let mut query = ListQuery::default();
        let mut errors = ValidationError::default();
        let get = |key: &str| params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(raw) = get("type") {
            query.kind = match raw {
                "requests" => Some(RequestKind::Requests),
                "appointments" => Some(RequestKind::Appointments),
                _ => {
                    errors.push("type", "must be `requests` or `appointments`");
                    None
                }
            };
        }
        if let Some(raw) = get("status") {
            query.status = parse_enum(raw);
            if query.status.is_none() {
                errors.push("status", "unknown status");
            }
        }
        if let Some(raw) = get("priority") {
            query.priority = parse_enum(raw);
            if query.priority.is_none() {
                errors.push("priority", "unknown priority");
            }
        }
        if let Some(raw) = get("bookingType") {
            query.booking_type = parse_enum(raw);
            if query.booking_type.is_none() {
                errors.push("bookingType", "unknown booking type");
            }
        }
        if let Some(raw) = get("paymentStatus") {
            query.payment_status = parse_enum(raw);
            if query.payment_status.is_none() {
                errors.push("paymentStatus", "unknown payment status");
            }
        }
        query.assigned_to = get("assignedTo").map(str::to_string);
        query.client_id = get("clientId").map(str::to_string);
        query.service_id = get("serviceId").map(str::to_string);
        query.q = get("q").map(str::to_lowercase);

        if let Some(raw) = get("dateFrom") {
            query.date_from = parse_bound(raw, false);
            if query.date_from.is_none() {
                errors.push("dateFrom", "invalid date");
            }
        }
        if let Some(raw) = get("dateTo") {
            query.date_to = parse_bound(raw, true);
            if query.date_to.is_none() {
                errors.push("dateTo", "invalid date");
            }
        }
        if let (Some(from), Some(to)) = (query.date_from, query.date_to)
            && from > to
        {
            errors.push("dateTo", "must not be before dateFrom");
        }

        if let Some(raw) = get("page") {
            match raw.parse::<usize>() {
                Ok(p) if p >= 1 => query.page = p,
                _ => errors.push("page", "must be a positive integer"),
            }
        }
        if let Some(raw) = get("limit") {
            match raw.parse::<usize>() {
                Ok(l) if (1..=MAX_PAGE_SIZE).contains(&l) => query.limit = l,
                _ => errors.push("limit", "must be between 1 and 100"),
            }
        }
        if let Some(raw) = get("sortBy") {
            query.sort_by = match raw {
                "createdAt" => SortField::CreatedAt,
                "updatedAt" => SortField::UpdatedAt,
                "scheduledAt" => SortField::ScheduledAt,
                "priority" => SortField::Priority,
                "title" => SortField::Title,
                _ => {
                    errors.push("sortBy", "unknown sort field");
                    SortField::CreatedAt
                }
            };
        }
        if let Some(raw) = get("sortOrder") {
            query.sort_order = match raw.to_ascii_lowercase().as_str() {
                "asc" => SortOrder::Asc,
                "desc" => SortOrder::Desc,
                _ => {
                    errors.push("sortOrder", "must be `asc` or `desc`");
                    SortOrder::Desc
                }
            };
        }

        errors.into_result(query)
    }

    pub fn matches(&self, r: &ServiceRequest) -> bool {
        match self.kind {
            Some(RequestKind::Requests) if r.is_booking() => return false,
            Some(RequestKind::Appointments) if !r.is_booking() => return false,
            _ => {}
        }
        if self.status.is_some_and(|s| s != r.status)
            || self.priority.is_some_and(|p| p != r.priority)
        {
            return false;
        }
        if let Some(ref who) = self.assigned_to
            && r.assigned_to.as_deref() != Some(who.as_str())
        {
            return false;
        }
        if self.client_id.as_ref().is_some_and(|c| *c != r.client_id)
            || self.service_id.as_ref().is_some_and(|s| *s != r.service_id)
        {
            return false;
        }
        if let Some(ref needle) = self.q {
            let in_title = r.title.to_lowercase().contains(needle);
            let in_description = r
                .description
                .as_ref()
                .is_some_and(|d| d.to_lowercase().contains(needle));
            if !in_title && !in_description {
                return false;
            }
        }
        if self.booking_type.is_some() || self.payment_status.is_some() {
            let Some(ref booking) = r.booking else { return false };
            if self.booking_type.is_some_and(|t| t != booking.booking_type)
                || self.payment_status.is_some_and(|p| p != booking.payment_status)
            {
                return false;
            }
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let at = match self.kind {
                Some(RequestKind::Appointments) => match r.booking {
                    Some(ref b) => b.scheduled_at,
                    None => return false,
                },
                _ => r.created_at,
            };
            if self.date_from.is_some_and(|from| at < from) || self.date_to.is_some_and(|to| at > to) {
                return false;
            }
        }
        true
    }

    fn compare(&self, a: &ServiceRequest, b: &ServiceRequest) -> Ordering {
        let ord = match self.sort_by {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::Priority => a.priority.cmp(&b.priority),
            SortField::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            SortField::ScheduledAt => {
                let at = |r: &ServiceRequest| r.booking.as_ref().map(|b| b.scheduled_at);
                match (at(a), at(b)) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    // Unscheduled rows always sort last.
                    (Some(_), None) => return Ordering::Less,
                    (None, Some(_)) => return Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
        };
        let ord = match self.sort_order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        ord.then_with(|| a.id.cmp(&b.id))
    }

    /// Filter, sort, and slice one page out of `rows`.
    pub fn apply<'a>(&self, rows: impl Iterator<Item = &'a ServiceRequest>) -> Page<ServiceRequest> {
        let mut hits: Vec<&ServiceRequest> = rows.filter(|r| self.matches(r)).collect();
        hits.sort_by(|a, b| self.compare(a, b));
        let total = hits.len();
        let items = hits
            .into_iter()
            .skip((self.page - 1).saturating_mul(self.limit))
            .take(self.limit)
            .cloned()
            .collect();
        Page {
            items,
            total,
            page: self.page,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn row(title: &str, created_at: Ms, booking_at: Option<Ms>) -> ServiceRequest {
        NewServiceRequest {
            client_id: "c1".into(),
            service_id: "s1".into(),
            title: title.into(),
            description: Some("Leaking pipe under the sink".into()),
            priority: Priority::Medium,
            budget: None,
            assigned_to: None,
            created_by: "u1".into(),
            booking: booking_at.map(|at| BookingDetails {
                scheduled_at: at,
                duration_minutes: 60,
                booking_type: BookingType::Standard,
                contact: ClientContact::default(),
                payment_status: PaymentStatus::Unpaid,
                recurring_pattern: None,
                parent_booking_id: None,
            }),
        }
        .into_request(Ulid::new(), "acme", created_at)
    }

    #[test]
    fn defaults_when_no_params() {
        let q = ListQuery::from_params(&HashMap::new()).unwrap();
        assert_eq!(q, ListQuery::default());
    }

    #[test]
    fn parses_every_filter() {
        let q = ListQuery::from_params(&params(&[
            ("type", "appointments"),
            ("status", "submitted"),
            ("priority", "HIGH"),
            ("bookingType", "recurring"),
            ("paymentStatus", "paid"),
            ("assignedTo", "tm1"),
            ("q", "Pipe"),
            ("dateFrom", "2025-03-01"),
            ("dateTo", "2025-03-31"),
            ("page", "2"),
            ("limit", "50"),
            ("sortBy", "scheduledAt"),
            ("sortOrder", "ASC"),
        ]))
        .unwrap();
        assert_eq!(q.kind, Some(RequestKind::Appointments));
        assert_eq!(q.status, Some(RequestStatus::Submitted));
        assert_eq!(q.priority, Some(Priority::High));
        assert_eq!(q.booking_type, Some(BookingType::Recurring));
        assert_eq!(q.payment_status, Some(PaymentStatus::Paid));
        assert_eq!(q.q.as_deref(), Some("pipe"));
        assert_eq!(q.date_to.unwrap() - q.date_from.unwrap(), 31 * DAY_MS - 1);
        assert_eq!((q.page, q.limit), (2, 50));
        assert_eq!(q.sort_by, SortField::ScheduledAt);
        assert_eq!(q.sort_order, SortOrder::Asc);
    }

    #[test]
    fn collects_all_bad_params() {
        let err = ListQuery::from_params(&params(&[
            ("type", "everything"),
            ("priority", "CRITICAL"),
            ("limit", "1000"),
            ("page", "0"),
        ]))
        .unwrap_err();
        let fields: Vec<&str> = err.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["type", "priority", "page", "limit"]);
    }

    #[test]
    fn kind_separates_requests_and_appointments() {
        let rows = [row("a", 1, None), row("b", 2, Some(10))];
        let appts = ListQuery {
            kind: Some(RequestKind::Appointments),
            ..Default::default()
        };
        let plain = ListQuery {
            kind: Some(RequestKind::Requests),
            ..Default::default()
        };
        assert_eq!(appts.apply(rows.iter()).items[0].title, "b");
        assert_eq!(plain.apply(rows.iter()).items[0].title, "a");
        assert_eq!(ListQuery::default().apply(rows.iter()).total, 2);
    }

    #[test]
    fn free_text_searches_title_and_description() {
        let rows = [row("Boiler service", 1, None)];
        let by_title = ListQuery {
            q: Some("boiler".into()),
            ..Default::default()
        };
        let by_description = ListQuery {
            q: Some("sink".into()),
            ..Default::default()
        };
        let miss = ListQuery {
            q: Some("roof".into()),
            ..Default::default()
        };
        assert_eq!(by_title.apply(rows.iter()).total, 1);
        assert_eq!(by_description.apply(rows.iter()).total, 1);
        assert_eq!(miss.apply(rows.iter()).total, 0);
    }

    #[test]
    fn appointment_date_range_uses_scheduled_at() {
        let rows = [row("early", 500, Some(1_000)), row("late", 500, Some(5_000))];
        let q = ListQuery {
            kind: Some(RequestKind::Appointments),
            date_from: Some(2_000),
            ..Default::default()
        };
        let page = q.apply(rows.iter());
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].title, "late");
    }

    #[test]
    fn sorts_and_pages() {
        let rows: Vec<_> = (0..5).map(|i| row(&format!("r{i}"), i, None)).collect();
        let q = ListQuery {
            page: 2,
            limit: 2,
            ..Default::default()
        };
        let page = q.apply(rows.iter());
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages(), 3);
        let titles: Vec<_> = page.items.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["r2", "r1"]); // created_at desc
    }

    #[test]
    fn scheduled_sort_puts_unscheduled_last() {
        let rows = [row("plain", 1, None), row("later", 2, Some(9)), row("sooner", 3, Some(5))];
        for order in [SortOrder::Asc, SortOrder::Desc] {
            let q = ListQuery {
                sort_by: SortField::ScheduledAt,
                sort_order: order,
                ..Default::default()
            };
            let page = q.apply(rows.iter());
            assert_eq!(page.items.last().unwrap().title, "plain");
        }
    }
}
