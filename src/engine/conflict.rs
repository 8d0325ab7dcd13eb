use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, ValidationError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Overlap predicate shared by every availability check.
///
/// Besides a true intersection, any shared boundary value counts as a
/// conflict, including back-to-back intervals (`candidate_end == existing_start`).
pub fn overlaps(
    candidate_start: TimeOfDay,
    candidate_end: TimeOfDay,
    existing_start: TimeOfDay,
    existing_end: TimeOfDay,
) -> bool {
    candidate_start == existing_start
        || candidate_end == existing_end
        || candidate_start == existing_end
        || candidate_end == existing_start
        || (candidate_start > existing_start && candidate_start < existing_end)
        || (candidate_end > existing_start && candidate_end < existing_end)
        || (candidate_start < existing_start && candidate_end > existing_end)
}

/// First non-canceled reservation on the same court and date that overlaps
/// `[start, end)`.
pub fn first_conflict<'a>(
    court_id: Ulid,
    date: NaiveDate,
    start: TimeOfDay,
    end: TimeOfDay,
    existing: &'a [Reservation],
) -> Option<&'a Reservation> {
    existing.iter().find(|r| {
        r.is_active()
            && r.court_id == court_id
            && r.date == date
            && overlaps(start, end, r.start_time, r.end_time)
    })
}

pub fn has_conflict(
    court_id: Ulid,
    date: NaiveDate,
    start: TimeOfDay,
    end: TimeOfDay,
    existing: &[Reservation],
) -> bool {
    first_conflict(court_id, date, start, end, existing).is_some()
}

// ── Write-time checks (storage side) ─────────────────────────────

pub(crate) fn validate_reservation(r: &Reservation) -> Result<(), EngineError> {
    if r.start_time >= r.end_time {
        return Err(ValidationError::invalid("end_time", "must be after start_time").into());
    }
    if r.sport_id.trim().is_empty() {
        return Err(ValidationError::Missing("sport_id").into());
    }
    if r.sport_id.len() > MAX_REF_LEN {
        return Err(EngineError::LimitExceeded("sport_id too long"));
    }
    if let Some(ref pm) = r.payment_method_id
        && pm.len() > MAX_REF_LEN {
            return Err(EngineError::LimitExceeded("payment_method_id too long"));
        }
    if r.total_amount.cents() < 0 {
        return Err(ValidationError::invalid("total_amount", "must not be negative").into());
    }
    Ok(())
}

/// Enforce the storage uniqueness constraint (court, date, start time) among
/// non-canceled reservations, then the overlap predicate. This is the source
/// of truth for concurrent bookings; availability queries are only advisory.
pub(crate) fn check_no_conflict(court: &CourtState, r: &Reservation) -> Result<(), EngineError> {
    check_against(court.on_date(r.date), r)
}

/// Same checks as [`check_no_conflict`] against an arbitrary set, e.g. the
/// earlier entries of a batch.
pub(crate) fn check_against(existing: &[Reservation], r: &Reservation) -> Result<(), EngineError> {
    if let Some(held) = existing.iter().find(|e| {
        e.is_active() && e.court_id == r.court_id && e.date == r.date && e.start_time == r.start_time
    }) {
        return Err(EngineError::SlotTaken(held.id));
    }
    if let Some(held) = first_conflict(r.court_id, r.date, r.start_time, r.end_time, existing) {
        return Err(EngineError::Conflict(held.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn reservation(court_id: Ulid, d: &str, start: &str, end: &str, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id,
            date: date(d),
            start_time: t(start),
            end_time: t(end),
            status,
            sport_id: "padel".into(),
            payment_method_id: Some("pix".into()),
            total_amount: Money(9_000),
            payment_deadline: None,
        }
    }

    fn ov(a: (&str, &str), b: (&str, &str)) -> bool {
        overlaps(t(a.0), t(a.1), t(b.0), t(b.1))
    }

    #[test]
    fn true_intersections_conflict() {
        assert!(ov(("09:00", "11:00"), ("10:00", "12:00")));
        assert!(ov(("10:00", "12:00"), ("09:00", "11:00")));
        assert!(ov(("08:00", "12:00"), ("09:00", "10:00"))); // candidate contains existing
        assert!(ov(("09:15", "09:45"), ("09:00", "10:00"))); // existing contains candidate
    }

    #[test]
    fn identical_and_shared_edges_conflict() {
        assert!(ov(("09:00", "10:00"), ("09:00", "10:00")));
        assert!(ov(("09:00", "10:00"), ("09:00", "11:00")));
        assert!(ov(("08:00", "10:00"), ("09:00", "10:00")));
    }

    #[test]
    fn back_to_back_counts_as_conflict() {
        assert!(ov(("09:00", "10:00"), ("10:00", "11:00")));
        assert!(ov(("10:00", "11:00"), ("09:00", "10:00")));
    }

    #[test]
    fn disjoint_intervals_do_not_conflict() {
        assert!(!ov(("08:00", "09:00"), ("10:00", "11:00")));
        assert!(!ov(("12:00", "13:00"), ("10:00", "11:00")));
        assert!(!ov(("09:00", "09:30"), ("09:45", "10:30")));
    }

    #[test]
    fn has_conflict_ignores_canceled_other_courts_and_dates() {
        let court = Ulid::new();
        let other = Ulid::new();
        let existing = vec![
            reservation(court, "2024-01-01", "10:00", "11:00", ReservationStatus::Canceled),
            reservation(other, "2024-01-01", "10:00", "11:00", ReservationStatus::Confirmed),
            reservation(court, "2024-01-02", "10:00", "11:00", ReservationStatus::Confirmed),
        ];
        assert!(!has_conflict(court, date("2024-01-01"), t("10:00"), t("11:00"), &existing));
    }

    #[test]
    fn has_conflict_counts_pending() {
        let court = Ulid::new();
        let existing = vec![reservation(court, "2024-01-01", "10:00", "11:00", ReservationStatus::Pending)];
        assert!(has_conflict(court, date("2024-01-01"), t("10:00"), t("11:00"), &existing));
        let hit = first_conflict(court, date("2024-01-01"), t("10:30"), t("12:00"), &existing).unwrap();
        assert_eq!(hit.id, existing[0].id);
    }

    #[test]
    fn validate_rejects_inverted_interval() {
        let r = reservation(Ulid::new(), "2024-01-01", "11:00", "10:00", ReservationStatus::Pending);
        match validate_reservation(&r) {
            Err(EngineError::Validation(e)) => assert_eq!(e.field(), "end_time"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn validate_requires_sport() {
        let mut r = reservation(Ulid::new(), "2024-01-01", "10:00", "11:00", ReservationStatus::Pending);
        r.sport_id = "  ".into();
        match validate_reservation(&r) {
            Err(EngineError::Validation(e)) => assert_eq!(e.field(), "sport_id"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn uniqueness_reported_before_overlap() {
        let mut court = CourtState::new(Ulid::new(), None);
        let held = reservation(court.id, "2024-01-01", "10:00", "11:00", ReservationStatus::Confirmed);
        let held_id = held.id;
        court.insert_reservation(held);

        let dup = reservation(court.id, "2024-01-01", "10:00", "12:00", ReservationStatus::Pending);
        assert!(matches!(check_no_conflict(&court, &dup), Err(EngineError::SlotTaken(id)) if id == held_id));

        let overlap = reservation(court.id, "2024-01-01", "10:30", "11:30", ReservationStatus::Pending);
        assert!(matches!(check_no_conflict(&court, &overlap), Err(EngineError::Conflict(id)) if id == held_id));

        let free = reservation(court.id, "2024-01-01", "14:00", "15:00", ReservationStatus::Pending);
        assert!(check_no_conflict(&court, &free).is_ok());
    }

    #[test]
    fn canceled_reservation_frees_uniqueness_slot() {
        let mut court = CourtState::new(Ulid::new(), None);
        court.insert_reservation(reservation(court.id, "2024-01-01", "10:00", "11:00", ReservationStatus::Canceled));
        let again = reservation(court.id, "2024-01-01", "10:00", "11:00", ReservationStatus::Pending);
        assert!(check_no_conflict(&court, &again).is_ok());
    }
}
