use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ulid::Ulid;

use crate::model::*;

use super::calendar::{hour_boundaries, is_peak_hour, price_for};
use super::conflict::has_conflict;
use super::error::ConfigError;

// ── Slot availability ─────────────────────────────────────────────

/// Compute the full day of one-hour slots for a court, ordered by start time.
///
/// A slot is `Reserved` when it conflicts with a non-canceled reservation on
/// the same court and date, otherwise `PastCutoff` when it starts before
/// `now + min_lead_minutes`. Reserved takes precedence.
pub fn compute_day_slots(
    court_id: Ulid,
    date: NaiveDate,
    existing: &[Reservation],
    config: &BusinessConfig,
    now: NaiveDateTime,
) -> Result<Vec<Slot>, ConfigError> {
    let boundaries = hour_boundaries(config)?;
    let cutoff = now
        .checked_add_signed(TimeDelta::minutes(config.min_lead_minutes as i64))
        .unwrap_or(NaiveDateTime::MAX);

    let slots = boundaries
        .into_iter()
        .map(|(start, end)| {
            let reserved = has_conflict(court_id, date, start, end, existing);
            let past_cutoff = start.on(date) < cutoff;
            let block_reason = if reserved {
                BlockReason::Reserved
            } else if past_cutoff {
                BlockReason::PastCutoff
            } else {
                BlockReason::None
            };
            Slot {
                start_time: start,
                end_time: end,
                available: block_reason == BlockReason::None,
                is_peak_hour: is_peak_hour(start, config),
                price: price_for(start, config),
                block_reason,
                is_popular: false,
            }
        })
        .collect();

    Ok(slots)
}

/// Advisory single-interval check against a reservation snapshot. Nothing is
/// remembered between calls; the storage layer has the final word.
pub fn check_availability(
    court_id: Ulid,
    date: NaiveDate,
    start: TimeOfDay,
    end: TimeOfDay,
    existing: &[Reservation],
) -> bool {
    !has_conflict(court_id, date, start, end, existing)
}

/// Mark slots whose start time is one of the week's most booked start times.
pub fn annotate_popular(slots: &mut [Slot], analysis: &PeakHourAnalysis) {
    for slot in slots.iter_mut() {
        slot.is_popular = analysis.top_start_times.contains(&slot.start_time);
    }
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

    fn at(d: &str, time: &str) -> NaiveDateTime {
        t(time).on(date(d))
    }

    fn config() -> BusinessConfig {
        let mut c = BusinessConfig::new(t("08:00"), t("22:00"), Money(10_000));
        c.peak_rate = Some(Money(15_000));
        c
    }

    fn reservation(court_id: Ulid, d: &str, start: &str, end: &str, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id,
            date: date(d),
            start_time: t(start),
            end_time: t(end),
            status,
            sport_id: "futsal".into(),
            payment_method_id: None,
            total_amount: Money(10_000),
            payment_deadline: None,
        }
    }

    fn slot<'a>(slots: &'a [Slot], start: &str) -> &'a Slot {
        slots.iter().find(|s| s.start_time == t(start)).unwrap()
    }

    // Far in the past so the cutoff never applies.
    const EARLY: &str = "2000-01-01";

    #[test]
    fn full_day_coverage() {
        let court = Ulid::new();
        let slots = compute_day_slots(court, date("2024-05-10"), &[], &config(), at(EARLY, "00:00")).unwrap();
        assert_eq!(slots.len(), 14);
        assert_eq!(slots[0].start_time, t("08:00"));
        assert_eq!(slots[13].end_time, t("22:00"));
        for s in &slots {
            assert_eq!(s.end_time.hour(), s.start_time.hour() + 1);
            assert_eq!(s.start_time.minute(), 0);
        }
        for pair in slots.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
        assert!(slots.iter().all(|s| s.available && s.block_reason == BlockReason::None));
    }

    #[test]
    fn identical_inputs_identical_output() {
        let court = Ulid::new();
        let existing = vec![reservation(court, "2024-05-10", "10:00", "11:00", ReservationStatus::Confirmed)];
        let now = at("2024-05-10", "09:10");
        let a = compute_day_slots(court, date("2024-05-10"), &existing, &config(), now).unwrap();
        let b = compute_day_slots(court, date("2024-05-10"), &existing, &config(), now).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn canceled_reservation_does_not_block() {
        let court = Ulid::new();
        let existing = vec![reservation(court, "2024-05-10", "10:00", "11:00", ReservationStatus::Canceled)];
        let slots = compute_day_slots(court, date("2024-05-10"), &existing, &config(), at(EARLY, "00:00")).unwrap();
        let ten = slot(&slots, "10:00");
        assert!(ten.available);
        assert_eq!(ten.block_reason, BlockReason::None);
    }

    #[test]
    fn past_cutoff_today() {
        let court = Ulid::new();
        let now = at("2024-05-10", "14:30");
        let slots = compute_day_slots(court, date("2024-05-10"), &[], &config(), now).unwrap();
        let two = slot(&slots, "14:00");
        assert!(!two.available);
        assert_eq!(two.block_reason, BlockReason::PastCutoff);
        let three = slot(&slots, "15:00");
        assert!(three.available);
        assert_eq!(three.block_reason, BlockReason::None);
        assert!(slots.iter().filter(|s| s.start_time < t("15:00")).all(|s| !s.available));
    }

    #[test]
    fn min_lead_extends_cutoff() {
        let court = Ulid::new();
        let mut c = config();
        c.min_lead_minutes = 60;
        let slots = compute_day_slots(court, date("2024-05-10"), &[], &c, at("2024-05-10", "14:30")).unwrap();
        assert_eq!(slot(&slots, "15:00").block_reason, BlockReason::PastCutoff);
        assert!(slot(&slots, "16:00").available);
    }

    #[test]
    fn future_date_ignores_current_time() {
        let court = Ulid::new();
        let slots = compute_day_slots(court, date("2024-05-11"), &[], &config(), at("2024-05-10", "21:30")).unwrap();
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn reserved_takes_precedence_over_cutoff() {
        let court = Ulid::new();
        let existing = vec![reservation(court, "2024-05-10", "09:00", "10:00", ReservationStatus::Confirmed)];
        let slots = compute_day_slots(court, date("2024-05-10"), &existing, &config(), at("2024-05-10", "12:00")).unwrap();
        assert_eq!(slot(&slots, "09:00").block_reason, BlockReason::Reserved);
        assert_eq!(slot(&slots, "11:00").block_reason, BlockReason::PastCutoff);
    }

    #[test]
    fn reservation_blocks_its_slot_and_shared_boundaries() {
        let court = Ulid::new();
        let existing = vec![reservation(court, "2024-05-10", "18:00", "19:00", ReservationStatus::Pending)];
        let slots = compute_day_slots(court, date("2024-05-10"), &existing, &config(), at(EARLY, "00:00")).unwrap();
        let blocked: Vec<String> = slots
            .iter()
            .filter(|s| !s.available)
            .map(|s| s.start_time.to_string())
            .collect();
        assert_eq!(blocked, vec!["17:00", "18:00", "19:00"]);
        assert!(slots.iter().filter(|s| !s.available).all(|s| s.block_reason == BlockReason::Reserved));
    }

    #[test]
    fn other_courts_and_dates_are_ignored() {
        let court = Ulid::new();
        let existing = vec![
            reservation(Ulid::new(), "2024-05-10", "10:00", "11:00", ReservationStatus::Confirmed),
            reservation(court, "2024-05-11", "10:00", "11:00", ReservationStatus::Confirmed),
        ];
        let slots = compute_day_slots(court, date("2024-05-10"), &existing, &config(), at(EARLY, "00:00")).unwrap();
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn peak_flags_and_prices() {
        let court = Ulid::new();
        let slots = compute_day_slots(court, date("2024-05-10"), &[], &config(), at(EARLY, "00:00")).unwrap();
        let peak: Vec<String> = slots
            .iter()
            .filter(|s| s.is_peak_hour)
            .map(|s| s.start_time.to_string())
            .collect();
        assert_eq!(peak, vec!["18:00", "19:00", "20:00", "21:00"]);
        assert_eq!(slot(&slots, "17:00").price, Money(10_000));
        assert_eq!(slot(&slots, "18:00").price, Money(15_000));
    }

    #[test]
    fn invalid_config_propagates() {
        let mut c = config();
        c.closing_time = t("07:00");
        let err = compute_day_slots(Ulid::new(), date("2024-05-10"), &[], &c, at(EARLY, "00:00")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHours { .. }));
    }

    #[test]
    fn check_availability_matches_conflict_rule() {
        let court = Ulid::new();
        let existing = vec![reservation(court, "2024-05-10", "10:00", "11:00", ReservationStatus::Confirmed)];
        let d = date("2024-05-10");
        assert!(!check_availability(court, d, t("10:00"), t("11:00"), &existing));
        assert!(!check_availability(court, d, t("11:00"), t("12:00"), &existing));
        assert!(check_availability(court, d, t("12:00"), t("13:00"), &existing));
    }

    #[test]
    fn availability_is_advisory_and_never_cached() {
        // Two clients looking at the same snapshot both see the slot as free;
        // only the write path can decide who gets it.
        let court = Ulid::new();
        let snapshot: Vec<Reservation> = Vec::new();
        let d = date("2024-05-10");
        let first = check_availability(court, d, t("19:00"), t("20:00"), &snapshot);
        let second = check_availability(court, d, t("19:00"), t("20:00"), &snapshot);
        assert!(first);
        assert!(second);
    }

    #[test]
    fn slot_json_shape() {
        let court = Ulid::new();
        let now = at("2024-05-10", "08:30");
        let slots = compute_day_slots(court, date("2024-05-10"), &[], &config(), now).unwrap();
        let json = serde_json::to_value(&slots[0]).unwrap();
        assert_eq!(json["startTime"], "08:00");
        assert_eq!(json["endTime"], "09:00");
        assert_eq!(json["available"], false);
        assert_eq!(json["isPeakHour"], false);
        assert_eq!(json["price"], 10_000);
        assert_eq!(json["blockReason"], "pastCutoff");
        assert_eq!(json["isPopular"], false);
    }

    #[test]
    fn popular_annotation_is_informational() {
        let court = Ulid::new();
        let mut slots = compute_day_slots(court, date("2024-05-10"), &[], &config(), at(EARLY, "00:00")).unwrap();
        let before = slots.clone();
        let analysis = PeakHourAnalysis {
            week_start: date("2024-05-05"),
            week_end: date("2024-05-11"),
            top_start_times: vec![t("10:00"), t("19:00")],
        };
        annotate_popular(&mut slots, &analysis);
        let popular: Vec<String> = slots
            .iter()
            .filter(|s| s.is_popular)
            .map(|s| s.start_time.to_string())
            .collect();
        assert_eq!(popular, vec!["10:00", "19:00"]);
        for (a, b) in before.iter().zip(&slots) {
            assert_eq!(a.available, b.available);
            assert_eq!(a.price, b.price);
        }
    }
}
