use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{PENDING_EXPIRED_TOTAL, RESERVATION_CONFLICTS_TOTAL};

use super::calendar::{price_interval, validate_config};
use super::conflict::{check_against, check_no_conflict, validate_reservation};
use super::recurrence::generate_preview;
use super::{apply_to_court, ConfigError, Engine, EngineError, ValidationError, WalCommand};

fn count_conflict(e: &EngineError) {
    if matches!(e, EngineError::SlotTaken(_) | EngineError::Conflict(_)) {
        metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
    }
}

impl Engine {
    /// Replace the venue configuration. Every court's listeners are told.
    pub async fn set_config(&self, config: BusinessConfig) -> Result<(), EngineError> {
        validate_config(&config)?;
        if config.peak_hour_windows.len() > MAX_PEAK_WINDOWS {
            return Err(EngineError::LimitExceeded("too many peak hour windows"));
        }

        let mut guard = self.config.write().await;
        let event = Event::ConfigUpdated { config: config.clone() };
        self.wal_append(&event).await?;
        *guard = Some(config);
        drop(guard);

        for entry in self.courts.iter() {
            self.notify.send(*entry.key(), &event);
        }
        Ok(())
    }

    pub async fn create_court(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.courts.len() >= MAX_COURTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("court name too long"));
            }
        if self.courts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CourtCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.courts.insert(id, Arc::new(RwLock::new(CourtState::new(id, name))));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Remove a court and its reservation history. Refused while any
    /// reservation on it is still pending or confirmed.
    pub async fn delete_court(&self, id: Ulid) -> Result<(), EngineError> {
        let court = self.get_court(&id).ok_or(EngineError::NotFound(id))?;
        let guard = court.write().await;
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::CourtDeleted { id };
        self.wal_append(&event).await?;
        for r in &guard.reservations {
            self.reservation_to_court.remove(&r.id);
        }
        drop(guard);
        self.courts.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Pending reservations get a payment deadline; confirmed ones don't.
    fn admit(&self, mut r: Reservation, now: Ms) -> Result<Reservation, EngineError> {
        validate_reservation(&r)?;
        r.payment_deadline = match r.status {
            ReservationStatus::Pending => Some(now.saturating_add(self.payment_window_ms)),
            ReservationStatus::Confirmed => None,
            ReservationStatus::Canceled => {
                return Err(ValidationError::invalid("status", "a new reservation cannot be canceled").into());
            }
        };
        Ok(r)
    }

    /// Store one reservation. The storage constraints are checked under the
    /// court's write lock, so of two racing requests for the same slot exactly
    /// one succeeds and the other gets [`EngineError::SlotTaken`].
    pub async fn place_reservation(&self, reservation: Reservation, now: Ms) -> Result<Reservation, EngineError> {
        let reservation = self.admit(reservation, now)?;
        let court_id = reservation.court_id;
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let mut guard = court.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_COURT {
            return Err(EngineError::LimitExceeded("too many reservations on court"));
        }
        if self.reservation_to_court.contains_key(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }
        check_no_conflict(&guard, &reservation).inspect_err(count_conflict)?;

        let event = Event::ReservationPlaced { reservation: reservation.clone() };
        self.persist_and_apply(court_id, &mut guard, &event).await?;
        Ok(reservation)
    }

    /// Store several reservations, possibly on different courts. Either all
    /// of them are stored or none is.
    pub async fn place_reservations(
        &self,
        reservations: Vec<Reservation>,
        now: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        if reservations.is_empty() {
            return Ok(Vec::new());
        }
        if reservations.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::new();
        let mut admitted = Vec::with_capacity(reservations.len());
        for r in reservations {
            if !seen.insert(r.id) || self.reservation_to_court.contains_key(&r.id) {
                return Err(EngineError::AlreadyExists(r.id));
            }
            admitted.push(self.admit(r, now)?);
        }

        // Lock courts in id order.
        let mut guards = BTreeMap::new();
        for court_id in admitted.iter().map(|r| r.court_id).collect::<BTreeSet<_>>() {
            let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
            guards.insert(court_id, court.write_owned().await);
        }

        // Phase 1: validate against stored state and earlier batch entries.
        for (court_id, guard) in &guards {
            let on_court: Vec<&Reservation> = admitted.iter().filter(|r| r.court_id == *court_id).collect();
            if guard.reservations.len() + on_court.len() > MAX_RESERVATIONS_PER_COURT {
                return Err(EngineError::LimitExceeded("too many reservations on court"));
            }
            let mut accepted: Vec<Reservation> = Vec::with_capacity(on_court.len());
            for r in on_court {
                check_no_conflict(guard, r).inspect_err(count_conflict)?;
                check_against(&accepted, r).inspect_err(count_conflict)?;
                accepted.push(r.clone());
            }
        }

        // Phase 2: commit as a single WAL record.
        let event = Event::ReservationsPlaced { reservations: admitted.clone() };
        self.wal_append(&event).await?;
        for r in &admitted {
            let placed = Event::ReservationPlaced { reservation: r.clone() };
            if let Some(guard) = guards.get_mut(&r.court_id) {
                apply_to_court(guard, &placed, &self.reservation_to_court);
            }
            self.notify.send(r.court_id, &placed);
        }
        Ok(admitted)
    }

    /// Payment received: pending → confirmed.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (court_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: ReservationStatus::Confirmed,
            });
        }

        let event = Event::ReservationConfirmed { id, court_id };
        self.persist_and_apply(court_id, &mut guard, &event).await?;
        guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Soft cancel. The reservation stays in history and frees its slot.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (court_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if current.status == ReservationStatus::Canceled {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: ReservationStatus::Canceled,
            });
        }

        let event = Event::ReservationCanceled { id, court_id };
        self.persist_and_apply(court_id, &mut guard, &event).await?;
        guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Book every currently available occurrence of `rule` as a pending
    /// reservation and skip the rest. Availability is recomputed under the
    /// court's write lock, so the result may differ from an earlier preview.
    ///
    /// Without a `total_amount` each occurrence is priced from the venue's
    /// hourly rates.
    pub async fn confirm_recurrence(
        &self,
        rule: &RecurrenceRule,
        payment_method_id: Option<String>,
        total_amount: Option<Money>,
        now: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        super::recurrence::validate(rule)?;
        let court_id = rule.court_id.ok_or(ValidationError::Missing("court_id"))?;
        let config = match total_amount {
            Some(_) => None,
            None => Some(self.current_config().await?),
        };
        let court = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let mut guard = court.write().await;

        let preview = generate_preview(rule, |date| guard.on_date(date))?;
        if guard.reservations.len() + preview.available_count > MAX_RESERVATIONS_PER_COURT {
            return Err(EngineError::LimitExceeded("too many reservations on court"));
        }

        let mut created = Vec::with_capacity(preview.available_count);
        for entry in preview.entries.iter().filter(|e| e.available) {
            let amount = total_amount
                .or_else(|| config.as_ref().map(|c| price_interval(entry.start_time, entry.end_time, c)))
                .ok_or(ConfigError::Missing)?;
            created.push(self.admit(
                Reservation {
                    id: Ulid::new(),
                    court_id,
                    date: entry.date,
                    start_time: entry.start_time,
                    end_time: entry.end_time,
                    status: ReservationStatus::Pending,
                    sport_id: rule.sport_id.clone(),
                    payment_method_id: payment_method_id.clone(),
                    total_amount: amount,
                    payment_deadline: None,
                },
                now,
            )?);
        }
        if created.is_empty() {
            return Ok(created);
        }

        let event = Event::ReservationsPlaced { reservations: created.clone() };
        self.wal_append(&event).await?;
        for r in &created {
            let placed = Event::ReservationPlaced { reservation: r.clone() };
            apply_to_court(&mut guard, &placed, &self.reservation_to_court);
            self.notify.send(court_id, &placed);
        }
        Ok(created)
    }

    /// `(reservation_id, court_id)` of pending reservations whose payment
    /// deadline is at or before `now`. Courts that are locked are skipped
    /// until the next sweep.
    pub fn collect_expired_pending(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.courts.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for r in &guard.reservations {
                    if r.status == ReservationStatus::Pending
                        && r.payment_deadline.is_some_and(|d| d <= now) {
                            expired.push((r.id, guard.id));
                        }
                }
            }
        }
        expired
    }

    /// Cancel a pending reservation whose payment window has run out.
    /// Returns `false` if it was paid or canceled in the meantime.
    pub async fn expire_pending(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (court_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let still_due = guard.reservations.iter().any(|r| {
            r.id == id
                && r.status == ReservationStatus::Pending
                && r.payment_deadline.is_some_and(|d| d <= now)
        });
        if !still_due {
            return Ok(false);
        }
        let event = Event::ReservationCanceled { id, court_id };
        self.persist_and_apply(court_id, &mut guard, &event).await?;
        metrics::counter!(PENDING_EXPIRED_TOTAL).increment(1);
        Ok(true)
    }

    /// Rewrite the WAL as the config, the courts and their reservations.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        if let Some(config) = self.config.read().await.clone() {
            events.push(Event::ConfigUpdated { config });
        }

        let courts: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        for court in courts {
            let guard = court.read().await;
            events.push(Event::CourtCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            events.extend(
                guard
                    .reservations
                    .iter()
                    .map(|r| Event::ReservationPlaced { reservation: r.clone() }),
            );
        }

        self.wal_compact(events).await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
