mod availability;
mod calendar;
mod conflict;
mod error;
mod mutations;
mod peak;
mod queries;
mod recurrence;

pub use availability::{annotate_popular, check_availability, compute_day_slots};
pub use calendar::{hour_boundaries, is_peak_hour, peak_rate, price_for, price_interval, validate_config};
pub use conflict::{first_conflict, has_conflict, overlaps};
pub(crate) use conflict::now_ms;
pub use error::{ConfigError, EngineError, ValidationError};
pub use peak::{analyze_week, week_bounds, TOP_START_TIMES};
pub use recurrence::{generate_preview, generate_preview_concurrent, occurrence_dates, validate as validate_recurrence};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCourtState = Arc<RwLock<CourtState>>;

/// Pending reservations are canceled if unpaid after this long.
pub const DEFAULT_PAYMENT_WINDOW_MS: Ms = 15 * 60 * 1000;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Every append that is already queued when the first one
/// arrives is written in the same batch and shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in the buffer.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One venue: its business configuration and its courts.
pub struct Engine {
    pub courts: DashMap<Ulid, SharedCourtState>,
    pub(super) config: RwLock<Option<BusinessConfig>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reservation id → court id, canceled reservations included.
    pub(super) reservation_to_court: DashMap<Ulid, Ulid>,
    pub(super) payment_window_ms: Ms,
}

/// Apply a reservation event to its court. Caller holds the court's write lock.
fn apply_to_court(court: &mut CourtState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationPlaced { reservation } => {
            index.insert(reservation.id, reservation.court_id);
            court.insert_reservation(reservation.clone());
        }
        Event::ReservationConfirmed { id, .. } => {
            if let Some(r) = court.get_reservation_mut(*id) {
                r.status = ReservationStatus::Confirmed;
                r.payment_deadline = None;
            }
        }
        Event::ReservationCanceled { id, .. } => {
            if let Some(r) = court.get_reservation_mut(*id) {
                r.status = ReservationStatus::Canceled;
                r.payment_deadline = None;
            }
        }
        Event::ReservationsPlaced { reservations } => {
            let court_id = court.id;
            for r in reservations.iter().filter(|r| r.court_id == court_id) {
                index.insert(r.id, r.court_id);
                court.insert_reservation(r.clone());
            }
        }
        // Venue-level events are applied by the engine itself.
        Event::ConfigUpdated { .. } | Event::CourtCreated { .. } | Event::CourtDeleted { .. } => {}
    }
}

/// Court a reservation event belongs to.
fn event_court_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationPlaced { reservation } => Some(reservation.court_id),
        Event::ReservationConfirmed { court_id, .. } | Event::ReservationCanceled { court_id, .. } => {
            Some(*court_id)
        }
        // May span courts.
        Event::ReservationsPlaced { .. } => None,
        Event::ConfigUpdated { .. } | Event::CourtCreated { .. } | Event::CourtDeleted { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_payment_window(wal_path, notify, DEFAULT_PAYMENT_WINDOW_MS)
    }

    pub fn with_payment_window(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        payment_window_ms: Ms,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Rebuild plain state first, then wrap it in locks.
        let reservation_to_court = DashMap::new();
        let mut config = None;
        let mut courts: HashMap<Ulid, CourtState> = HashMap::new();
        for event in &events {
            match event {
                Event::ConfigUpdated { config: c } => config = Some(c.clone()),
                Event::CourtCreated { id, name } => {
                    courts.insert(*id, CourtState::new(*id, name.clone()));
                }
                Event::CourtDeleted { id } => {
                    if let Some(court) = courts.remove(id) {
                        for r in &court.reservations {
                            reservation_to_court.remove(&r.id);
                        }
                    }
                }
                Event::ReservationsPlaced { reservations } => {
                    let batch_courts: HashSet<Ulid> = reservations.iter().map(|r| r.court_id).collect();
                    for court_id in batch_courts {
                        if let Some(court) = courts.get_mut(&court_id) {
                            apply_to_court(court, event, &reservation_to_court);
                        }
                    }
                }
                other => {
                    if let Some(court_id) = event_court_id(other)
                        && let Some(court) = courts.get_mut(&court_id)
                    {
                        apply_to_court(court, other, &reservation_to_court);
                    }
                }
            }
        }

        Ok(Self {
            courts: courts
                .into_iter()
                .map(|(id, court)| (id, Arc::new(RwLock::new(court))))
                .collect(),
            config: RwLock::new(config),
            wal_tx,
            notify,
            reservation_to_court,
            payment_window_ms,
        })
    }

    async fn send_wal(&self, cmd: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))
    }

    /// Durably append one event through the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Compact { events, response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_court(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn get_court_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_court.get(reservation_id).map(|e| *e.value())
    }

    /// Current venue configuration, or [`ConfigError::Missing`].
    pub async fn current_config(&self) -> Result<BusinessConfig, ConfigError> {
        self.config.read().await.clone().ok_or(ConfigError::Missing)
    }

    /// Log, apply, then broadcast on the court's channel.
    pub(super) async fn persist_and_apply(
        &self,
        court_id: Ulid,
        court: &mut CourtState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_court(court, event, &self.reservation_to_court);
        self.notify.send(court_id, event);
        Ok(())
    }

    /// Look up a reservation's court and take its write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<CourtState>), EngineError> {
        let court_id = self
            .get_court_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let court = self
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        Ok((court_id, court.write_owned().await))
    }
}
