use std::collections::BTreeMap;

use chrono::{Datelike, Days, NaiveDate};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

/// How many popular start times a weekly analysis reports.
pub const TOP_START_TIMES: usize = 2;

/// Sunday..Saturday week containing `reference`.
pub fn week_bounds(reference: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let offset = reference.weekday().num_days_from_sunday() as u64;
    let start = reference.checked_sub_days(Days::new(offset))?;
    let end = start.checked_add_days(Days::new(6))?;
    Some((start, end))
}

/// Most frequently booked start times on `court_id` during the week that
/// contains `reference`.
///
/// Never fails: if the analysis cannot be computed the result carries no
/// start times, which callers must read as "no signal".
pub fn analyze_week(court_id: Ulid, reference: NaiveDate, reservations: &[Reservation]) -> PeakHourAnalysis {
    let Some((week_start, week_end)) = week_bounds(reference) else {
        warn!(%court_id, %reference, "peak analysis skipped: week out of calendar range");
        return PeakHourAnalysis::empty(reference, reference);
    };

    let mut counts: BTreeMap<TimeOfDay, u32> = BTreeMap::new();
    for r in reservations {
        if r.court_id == court_id && r.is_active() && r.date >= week_start && r.date <= week_end {
            *counts.entry(r.start_time).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(TimeOfDay, u32)> = counts.into_iter().collect();
    // Count descending, then earlier start time on ties.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    PeakHourAnalysis {
        week_start,
        week_end,
        top_start_times: ranked
            .into_iter()
            .take(TOP_START_TIMES)
            .map(|(time, _)| time)
            .collect(),
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

    fn booked(court_id: Ulid, d: &str, start: &str, status: ReservationStatus) -> Reservation {
        let start = t(start);
        Reservation {
            id: Ulid::new(),
            court_id,
            date: date(d),
            start_time: start,
            end_time: TimeOfDay::new(start.hour() + 1, 0).unwrap(),
            status,
            sport_id: "volei".into(),
            payment_method_id: None,
            total_amount: Money(5_000),
            payment_deadline: None,
        }
    }

    fn times(a: &PeakHourAnalysis) -> Vec<String> {
        a.top_start_times.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn week_runs_sunday_to_saturday() {
        // 2024-01-03 is a Wednesday
        assert_eq!(week_bounds(date("2024-01-03")), Some((date("2023-12-31"), date("2024-01-06"))));
        // Sunday is its own week start
        assert_eq!(week_bounds(date("2023-12-31")), Some((date("2023-12-31"), date("2024-01-06"))));
        // Saturday is the last day
        assert_eq!(week_bounds(date("2024-01-06")), Some((date("2023-12-31"), date("2024-01-06"))));
    }

    #[test]
    fn tie_goes_to_earlier_time() {
        let court = Ulid::new();
        let mut rs = Vec::new();
        for d in ["2024-01-01", "2024-01-02", "2024-01-03"] {
            rs.push(booked(court, d, "19:00", ReservationStatus::Confirmed));
            rs.push(booked(court, d, "18:00", ReservationStatus::Confirmed));
        }
        rs.push(booked(court, "2024-01-04", "20:00", ReservationStatus::Confirmed));

        let a = analyze_week(court, date("2024-01-03"), &rs);
        assert_eq!(times(&a), vec!["18:00", "19:00"]);
        assert_eq!(a.week_start, date("2023-12-31"));
        assert_eq!(a.week_end, date("2024-01-06"));
    }

    #[test]
    fn higher_count_wins() {
        let court = Ulid::new();
        let rs = vec![
            booked(court, "2024-01-01", "08:00", ReservationStatus::Confirmed),
            booked(court, "2024-01-01", "20:00", ReservationStatus::Confirmed),
            booked(court, "2024-01-02", "20:00", ReservationStatus::Pending),
            booked(court, "2024-01-02", "09:00", ReservationStatus::Confirmed),
            booked(court, "2024-01-03", "09:00", ReservationStatus::Confirmed),
            booked(court, "2024-01-04", "20:00", ReservationStatus::Confirmed),
        ];
        let a = analyze_week(court, date("2024-01-01"), &rs);
        assert_eq!(times(&a), vec!["20:00", "09:00"]);
    }

    #[test]
    fn filters_court_week_and_canceled() {
        let court = Ulid::new();
        let rs = vec![
            booked(court, "2024-01-02", "10:00", ReservationStatus::Confirmed),
            booked(court, "2024-01-02", "11:00", ReservationStatus::Canceled),
            booked(court, "2024-01-03", "11:00", ReservationStatus::Canceled),
            booked(Ulid::new(), "2024-01-02", "12:00", ReservationStatus::Confirmed),
            booked(court, "2024-01-08", "13:00", ReservationStatus::Confirmed), // next week
            booked(court, "2023-12-30", "14:00", ReservationStatus::Confirmed), // previous week
        ];
        let a = analyze_week(court, date("2024-01-02"), &rs);
        assert_eq!(times(&a), vec!["10:00"]);
    }

    #[test]
    fn no_reservations_no_signal() {
        let a = analyze_week(Ulid::new(), date("2024-01-02"), &[]);
        assert!(a.top_start_times.is_empty());
    }

    #[test]
    fn calendar_edge_is_soft_failure() {
        // The week containing the first representable date starts before it.
        let a = analyze_week(Ulid::new(), NaiveDate::MIN, &[]);
        assert!(a.top_start_times.is_empty());
    }

    #[test]
    fn json_shape() {
        let court = Ulid::new();
        let rs = vec![booked(court, "2024-01-02", "18:00", ReservationStatus::Confirmed)];
        let json = serde_json::to_value(analyze_week(court, date("2024-01-02"), &rs)).unwrap();
        assert_eq!(json["weekStart"], "2023-12-31");
        assert_eq!(json["weekEnd"], "2024-01-06");
        assert_eq!(json["topStartTimes"], serde_json::json!(["18:00"]));
    }
}
