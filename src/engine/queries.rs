use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RECURRENCE_PREVIEWS_TOTAL, SLOTS_COMPUTED_TOTAL};

use super::availability::{annotate_popular, check_availability, compute_day_slots};
use super::peak::{analyze_week, week_bounds};
use super::recurrence::{generate_preview_concurrent, validate};
use super::{Engine, EngineError, ValidationError};

impl Engine {
    /// Hourly slots for a court and date, with the week's popular start
    /// times marked.
    pub async fn day_slots(&self, court_id: Ulid, date: NaiveDate, now: NaiveDateTime) -> Result<Vec<Slot>, EngineError> {
        let config = self.current_config().await?;
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = court.read().await;

        let mut slots = compute_day_slots(court_id, date, guard.on_date(date), &config, now)?;
        let week = week_bounds(date).map_or(&[][..], |(first, last)| guard.between(first, last));
        annotate_popular(&mut slots, &analyze_week(court_id, date, week));

        metrics::counter!(SLOTS_COMPUTED_TOTAL).increment(slots.len() as u64);
        Ok(slots)
    }

    /// Advisory check for a single interval. The answer may be stale by the
    /// time a reservation is placed.
    pub async fn check_slot(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    ) -> Result<bool, EngineError> {
        if start >= end {
            return Err(ValidationError::invalid("end_time", "must be after start_time").into());
        }
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = court.read().await;
        Ok(check_availability(court_id, date, start, end, guard.on_date(date)))
    }

    /// Expand a recurrence rule and mark each date available or not. Each
    /// date is read under its own short read lock, all at once.
    pub async fn recurrence_preview(&self, rule: &RecurrenceRule) -> Result<RecurrencePreview, EngineError> {
        validate(rule)?;
        let court_id = rule.court_id.ok_or(ValidationError::Missing("court_id"))?;
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;

        let preview = generate_preview_concurrent(rule, |date| {
            let court = court.clone();
            async move { court.read().await.on_date(date).to_vec() }
        })
        .await?;

        metrics::counter!(RECURRENCE_PREVIEWS_TOTAL).increment(1);
        Ok(preview)
    }

    pub async fn peak_hours(&self, court_id: Ulid, reference: NaiveDate) -> Result<PeakHourAnalysis, EngineError> {
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = court.read().await;
        let week = week_bounds(reference).map_or(&[][..], |(first, last)| guard.between(first, last));
        Ok(analyze_week(court_id, reference, week))
    }

    pub async fn list_courts(&self) -> Vec<CourtInfo> {
        let courts: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(courts.len());
        for court in courts {
            let guard = court.read().await;
            infos.push(CourtInfo {
                id: guard.id,
                name: guard.name.clone(),
                active_reservations: guard.active_count(),
            });
        }
        infos.sort_by_key(|c| c.id);
        infos
    }

    /// Reservations on a court, canceled ones included, ordered by date and
    /// start time. Unknown courts have none.
    pub async fn get_reservations(&self, court_id: Ulid, date: Option<NaiveDate>) -> Vec<Reservation> {
        let Some(court) = self.get_court(&court_id) else {
            return Vec::new();
        };
        let guard = court.read().await;
        match date {
            Some(d) => guard.on_date(d).to_vec(),
            None => guard.reservations.clone(),
        }
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let court_id = self.get_court_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = court.read().await;
        guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }
}
