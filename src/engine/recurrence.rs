use std::future::Future;

use chrono::{Datelike, Days, NaiveDate};
use futures::future::join_all;
use ulid::Ulid;

use crate::limits::MAX_RECURRENCE_DAYS;
use crate::model::*;

use super::availability::check_availability;
use super::error::ValidationError;

// ── Recurrence expansion ──────────────────────────────────────────

/// A rule that passed validation, with its candidate dates enumerated.
struct Plan {
    court_id: Ulid,
    start: TimeOfDay,
    end: TimeOfDay,
    dates: Vec<NaiveDate>,
}

fn plan(rule: &RecurrenceRule) -> Result<Plan, ValidationError> {
    let base_date = rule.base_date.ok_or(ValidationError::Missing("base_date"))?;
    let court_id = rule.court_id.ok_or(ValidationError::Missing("court_id"))?;
    let start = rule.start_time.ok_or(ValidationError::Missing("start_time"))?;
    let end = rule.end_time.ok_or(ValidationError::Missing("end_time"))?;
    if rule.sport_id.trim().is_empty() {
        return Err(ValidationError::Missing("sport_id"));
    }
    if rule.duration_days <= 0 {
        return Err(ValidationError::invalid("duration_days", "must be positive"));
    }
    if rule.duration_days > MAX_RECURRENCE_DAYS {
        return Err(ValidationError::invalid(
            "duration_days",
            format!("must be at most {MAX_RECURRENCE_DAYS}"),
        ));
    }
    if rule.frequency == RecurrenceFrequency::Weekly && rule.weekdays.is_empty() {
        return Err(ValidationError::Missing("weekdays"));
    }
    if let Some(bad) = rule.weekdays.iter().find(|d| **d > 6) {
        return Err(ValidationError::invalid(
            "weekdays",
            format!("{bad} is not a weekday (0 = Sunday .. 6 = Saturday)"),
        ));
    }
    if start >= end {
        return Err(ValidationError::invalid("end_time", "must be after start_time"));
    }
    // end date is exclusive
    base_date
        .checked_add_days(Days::new(rule.duration_days as u64))
        .ok_or_else(|| ValidationError::invalid("duration_days", "runs past the end of the calendar"))?;

    let dates = base_date
        .iter_days()
        .take(rule.duration_days as usize)
        .filter(|d| match rule.frequency {
            RecurrenceFrequency::Daily => true,
            RecurrenceFrequency::Weekly => rule
                .weekdays
                .contains(&(d.weekday().num_days_from_sunday() as u8)),
        })
        .collect();

    Ok(Plan {
        court_id,
        start,
        end,
        dates,
    })
}

/// Check a rule without enumerating availability.
pub fn validate(rule: &RecurrenceRule) -> Result<(), ValidationError> {
    plan(rule).map(|_| ())
}

/// Candidate occurrence dates in chronological order.
pub fn occurrence_dates(rule: &RecurrenceRule) -> Result<Vec<NaiveDate>, ValidationError> {
    plan(rule).map(|p| p.dates)
}

fn assemble(plan: &Plan, available: impl Iterator<Item = bool>) -> RecurrencePreview {
    let entries: Vec<RecurrencePreviewEntry> = plan
        .dates
        .iter()
        .zip(available)
        .map(|(&date, available)| RecurrencePreviewEntry {
            date,
            start_time: plan.start,
            end_time: plan.end,
            available,
        })
        .collect();
    let available_count = entries.iter().filter(|e| e.available).count();
    RecurrencePreview {
        total_count: entries.len(),
        available_count,
        entries,
    }
}

/// Enumerate every occurrence of `rule` and mark each as available or not
/// against the reservations `fetch` returns for that date.
///
/// The rule is validated in full before `fetch` is called for any date.
/// Nothing is booked; unavailable dates are reported, not treated as errors.
pub fn generate_preview<F, R>(rule: &RecurrenceRule, mut fetch: F) -> Result<RecurrencePreview, ValidationError>
where
    F: FnMut(NaiveDate) -> R,
    R: AsRef<[Reservation]>,
{
    let plan = plan(rule)?;
    let available: Vec<bool> = plan
        .dates
        .iter()
        .map(|&date| {
            let existing = fetch(date);
            check_availability(plan.court_id, date, plan.start, plan.end, existing.as_ref())
        })
        .collect();
    Ok(assemble(&plan, available.into_iter()))
}

/// Same as [`generate_preview`], but issues every per-date fetch at once.
/// Entries stay in chronological order whatever order the fetches finish in.
pub async fn generate_preview_concurrent<F, Fut, R>(
    rule: &RecurrenceRule,
    fetch: F,
) -> Result<RecurrencePreview, ValidationError>
where
    F: Fn(NaiveDate) -> Fut,
    Fut: Future<Output = R>,
    R: AsRef<[Reservation]>,
{
    let plan = plan(rule)?;
    let fetched = join_all(plan.dates.iter().map(|&date| fetch(date))).await;
    let available = plan
        .dates
        .iter()
        .zip(&fetched)
        .map(|(&date, existing)| check_availability(plan.court_id, date, plan.start, plan.end, existing.as_ref()));
    Ok(assemble(&plan, available))
}
