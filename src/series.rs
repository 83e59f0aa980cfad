//! Recurring series planning.
//!
//! `expand` turns a start instant and a pattern into candidate start instants
//! (pure calendar arithmetic in UTC, time of day taken from the start).
//! `plan` annotates every candidate with a conflict verdict and never stops
//! early, so callers can report exactly what was skipped.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime};
use serde::Serialize;

use crate::conflict::{check_conflict, ConflictVerdict, ResourceRef, Window};
use crate::model::*;
use crate::store::{PersistentStore, StoreError};

/// Upper bound on empty periods walked before giving up.
const MAX_PERIODS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub starts: Vec<Ms>,
    /// Generation stopped at the ceiling rather than at `count` or `until`.
    pub capped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    #[serde(with = "rfc3339")]
    pub start: Ms,
    #[serde(flatten)]
    pub verdict: ConflictVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPlan {
    pub occurrences: Vec<Occurrence>,
    pub capped: bool,
}

impl SeriesPlan {
    pub fn bookable(&self) -> impl Iterator<Item = &Occurrence> {
        self.occurrences.iter().filter(|o| !o.verdict.conflict)
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt().map(|d| d.day())
}

fn shift_month(year: i32, month: u32, by: u64) -> Option<(i32, u32)> {
    let zero_based = i64::from(year) * 12 + i64::from(month - 1) + i64::try_from(by).ok()?;
    let year = i32::try_from(zero_based.div_euclid(12)).ok()?;
    Some((year, zero_based.rem_euclid(12) as u32 + 1))
}

fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Candidate dates of the `k`-th period, ascending. `None` once the calendar
/// runs out of representable dates.
fn period_dates(first: NaiveDate, pattern: &RecurringPattern, k: u64) -> Option<Vec<NaiveDate>> {
    let step = k.checked_mul(u64::from(pattern.interval.max(1)))?;
    let dates = match pattern.frequency {
        Frequency::Daily => vec![first.checked_add_days(Days::new(step))?],
        Frequency::Weekly if pattern.by_weekday.is_empty() => {
            vec![first.checked_add_days(Days::new(step.checked_mul(7)?))?]
        }
        Frequency::Weekly => {
            let week_start = first
                .checked_sub_days(Days::new(u64::from(weekday_index(first))))?
                .checked_add_days(Days::new(step.checked_mul(7)?))?;
            pattern
                .by_weekday
                .iter()
                .map(|&wd| week_start.checked_add_days(Days::new(u64::from(wd))))
                .collect::<Option<Vec<_>>>()?
        }
        Frequency::Monthly => {
            let (year, month) = shift_month(first.year(), first.month(), step)?;
            let last = last_day_of_month(year, month)?;
            if pattern.by_weekday.is_empty() {
                // Anchor on the original day so Jan 31 -> Feb 28 -> Mar 31.
                vec![NaiveDate::from_ymd_opt(year, month, first.day().min(last))?]
            } else {
                (1..=last)
                    .filter_map(|day| NaiveDate::from_ymd_opt(year, month, day))
                    .filter(|d| pattern.by_weekday.contains(&weekday_index(*d)))
                    .collect()
            }
        }
    };
    Some(dates)
}

/// Expand `pattern` from `start`. Stops at `count`, past `until`, or at
/// `ceiling` occurrences, whichever comes first.
pub fn expand(start: Ms, pattern: &RecurringPattern, ceiling: usize) -> Expansion {
    let mut starts = Vec::new();
    let Some(start_dt) = DateTime::from_timestamp_millis(start) else {
        return Expansion { starts, capped: false };
    };
    let first = start_dt.date_naive();
    let time: NaiveTime = start_dt.time();

    // With no count, generate one past the ceiling to learn whether it truncated.
    let target = match pattern.count {
        Some(count) => (count as usize).min(ceiling.saturating_add(1)),
        None => ceiling.saturating_add(1),
    };

    'periods: for k in 0..MAX_PERIODS {
        let Some(dates) = period_dates(first, pattern, k) else { break };
        for date in dates {
            let at = date.and_time(time).and_utc().timestamp_millis();
            if at < start {
                continue;
            }
            if pattern.until.is_some_and(|until| at > until) {
                break 'periods;
            }
            starts.push(at);
            if starts.len() >= target {
                break 'periods;
            }
        }
    }

    let capped = starts.len() > ceiling;
    starts.truncate(ceiling);
    Expansion { starts, capped }
}

/// Expand and check every candidate against existing bookings.
pub async fn plan(
    store: &dyn PersistentStore,
    tenant: &str,
    resource: &ResourceRef,
    start: Ms,
    duration_minutes: u32,
    pattern: &RecurringPattern,
    ceiling: usize,
) -> Result<SeriesPlan, StoreError> {
    let expansion = expand(start, pattern, ceiling);
    let mut occurrences = Vec::with_capacity(expansion.starts.len());
    for at in expansion.starts {
        let window = Window {
            start: at,
            duration_minutes,
        };
        let verdict = check_conflict(store, tenant, resource, window, None).await?;
        occurrences.push(Occurrence { start: at, verdict });
    }
    Ok(SeriesPlan {
        occurrences,
        capped: expansion.capped,
    })
}

/// Text recorded on the parent for an occurrence that was not booked.
pub fn skip_note(occurrence: &Occurrence) -> String {
    let reason = occurrence
        .verdict
        .reason
        .as_deref()
        .unwrap_or("time slot unavailable");
    match occurrence.verdict.conflicting_booking_id {
        Some(id) => format!(
            "Skipped occurrence at {}: {reason} (conflicting booking {id})",
            format_instant(occurrence.start)
        ),
        None => format!("Skipped occurrence at {}: {reason}", format_instant(occurrence.start)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn at(s: &str) -> Ms {
        parse_instant(s).unwrap()
    }

    fn pattern(frequency: Frequency, interval: u32, count: Option<u32>) -> RecurringPattern {
        RecurringPattern {
            frequency,
            interval,
            count,
            until: None,
            by_weekday: vec![],
        }
    }

    fn dates(exp: &Expansion) -> Vec<String> {
        exp.starts.iter().map(|&ms| format_instant(ms)[..10].to_string()).collect()
    }

    #[test]
    fn weekly_count_is_exact_and_seven_days_apart() {
        let start = at("2025-03-03T10:00");
        let exp = expand(start, &pattern(Frequency::Weekly, 1, Some(5)), 52);
        assert_eq!(exp.starts.len(), 5);
        assert!(!exp.capped);
        for (i, s) in exp.starts.iter().enumerate() {
            assert_eq!(*s, start + 7 * DAY_MS * i as Ms);
        }
    }

    #[test]
    fn weekly_by_weekday_visits_each_listed_day() {
        let mut p = pattern(Frequency::Weekly, 1, Some(4));
        p.by_weekday = vec![1, 3]; // Monday, Wednesday
        let exp = expand(at("2025-03-03T10:00"), &p, 52);
        assert_eq!(dates(&exp), vec!["2025-03-03", "2025-03-05", "2025-03-10", "2025-03-12"]);
        assert!(exp.starts.iter().all(|s| format_instant(*s).ends_with("T10:00:00.000Z")));
    }

    #[test]
    fn weekly_by_weekday_skips_days_before_start() {
        let mut p = pattern(Frequency::Weekly, 2, Some(3));
        p.by_weekday = vec![1, 3];
        // Starts on a Wednesday; that week's Monday is already past.
        let exp = expand(at("2025-03-05T08:00"), &p, 52);
        assert_eq!(dates(&exp), vec!["2025-03-05", "2025-03-17", "2025-03-19"]);
    }

    #[test]
    fn daily_interval_and_until() {
        let mut p = pattern(Frequency::Daily, 2, None);
        p.until = Some(at("2025-03-09T10:00"));
        let exp = expand(at("2025-03-01T10:00"), &p, 52);
        assert_eq!(
            dates(&exp),
            vec!["2025-03-01", "2025-03-03", "2025-03-05", "2025-03-07", "2025-03-09"]
        );
        assert!(!exp.capped);
    }

    #[test]
    fn until_is_inclusive_of_exact_instant_only() {
        let mut p = pattern(Frequency::Daily, 1, None);
        p.until = Some(at("2025-03-02T09:59"));
        let exp = expand(at("2025-03-01T10:00"), &p, 52);
        assert_eq!(dates(&exp), vec!["2025-03-01"]);
    }

    #[test]
    fn monthly_clamps_to_end_of_month_without_drift() {
        let exp = expand(at("2025-01-31T09:00"), &pattern(Frequency::Monthly, 1, Some(4)), 52);
        assert_eq!(dates(&exp), vec!["2025-01-31", "2025-02-28", "2025-03-31", "2025-04-30"]);
    }

    #[test]
    fn monthly_clamps_in_leap_year() {
        let exp = expand(at("2024-01-30T09:00"), &pattern(Frequency::Monthly, 1, Some(3)), 52);
        assert_eq!(dates(&exp), vec!["2024-01-30", "2024-02-29", "2024-03-30"]);
    }

    #[test]
    fn monthly_interval_crosses_year() {
        let exp = expand(at("2025-11-15T09:00"), &pattern(Frequency::Monthly, 2, Some(3)), 52);
        assert_eq!(dates(&exp), vec!["2025-11-15", "2026-01-15", "2026-03-15"]);
    }

    #[test]
    fn monthly_by_weekday_lists_matching_days() {
        let mut p = pattern(Frequency::Monthly, 1, Some(6));
        p.by_weekday = vec![5]; // Fridays
        let exp = expand(at("2025-03-10T09:00"), &p, 52);
        assert_eq!(
            dates(&exp),
            vec!["2025-03-14", "2025-03-21", "2025-03-28", "2025-04-04", "2025-04-11", "2025-04-18"]
        );
    }

    #[test]
    fn unbounded_series_is_capped() {
        let exp = expand(at("2025-03-03T10:00"), &pattern(Frequency::Daily, 1, None), 10);
        assert_eq!(exp.starts.len(), 10);
        assert!(exp.capped);
    }

    #[test]
    fn exact_fit_under_until_is_not_capped() {
        let mut p = pattern(Frequency::Daily, 1, None);
        p.until = Some(at("2025-03-05T10:00"));
        let exp = expand(at("2025-03-01T10:00"), &p, 5);
        assert_eq!(exp.starts.len(), 5);
        assert!(!exp.capped);
    }

    #[test]
    fn expansion_is_deterministic() {
        let mut p = pattern(Frequency::Weekly, 1, Some(8));
        p.by_weekday = vec![0, 6];
        let start = at("2025-06-01T12:00");
        assert_eq!(expand(start, &p, 52), expand(start, &p, 52));
    }

    #[tokio::test]
    async fn plan_marks_conflicts_without_short_circuit() {
        let store = MemoryStore::new();
        let blocker = store
            .create_request(
                "acme",
                NewServiceRequest {
                    client_id: "c1".into(),
                    service_id: "S1".into(),
                    title: "Existing".into(),
                    description: None,
                    priority: Priority::Medium,
                    budget: None,
                    assigned_to: None,
                    created_by: "u1".into(),
                    booking: Some(BookingDetails {
                        scheduled_at: at("2025-03-17T10:30"),
                        duration_minutes: 60,
                        booking_type: BookingType::Standard,
                        contact: ClientContact::default(),
                        payment_status: PaymentStatus::Unpaid,
                        recurring_pattern: None,
                        parent_booking_id: None,
                    }),
                },
            )
            .await
            .unwrap();

        let resource = ResourceRef {
            service_id: "S1".into(),
            team_member_id: None,
        };
        let plan = plan(
            &store,
            "acme",
            &resource,
            at("2025-03-03T10:00"),
            60,
            &pattern(Frequency::Weekly, 1, Some(4)),
            52,
        )
        .await
        .unwrap();

        assert_eq!(plan.occurrences.len(), 4);
        let flags: Vec<bool> = plan.occurrences.iter().map(|o| o.verdict.conflict).collect();
        assert_eq!(flags, vec![false, false, true, false]);
        assert_eq!(plan.occurrences[2].verdict.conflicting_booking_id, Some(blocker.id));
        assert_eq!(plan.bookable().count(), 3);
        assert!(skip_note(&plan.occurrences[2]).contains(&blocker.id.to_string()));
    }

    #[test]
    fn occurrence_json_flattens_verdict() {
        let o = Occurrence {
            start: at("2025-03-17T10:00"),
            verdict: ConflictVerdict::clear(),
        };
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["start"], "2025-03-17T10:00:00.000Z");
        assert_eq!(json["conflict"], false);
        assert!(json.get("reason").is_none());
    }
}
