use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

/// Background task that cancels pending reservations left unpaid past
/// their payment deadline.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = now_ms();
        for (reservation_id, court_id) in engine.collect_expired_pending(now) {
            match engine.expire_pending(reservation_id, now).await {
                Ok(true) => info!("expired unpaid reservation {reservation_id} on court {court_id}"),
                Ok(false) => debug!("reaper skip {reservation_id}: settled meanwhile"),
                // Court deleted or reservation gone since the sweep.
                Err(e) => debug!("reaper skip {reservation_id}: {e}"),
            }
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn pending(court_id: Ulid, start: &str, end: &str) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id,
            date: NaiveDate::from_ymd_opt(2030, 3, 4).unwrap(),
            start_time: start.parse().unwrap(),
            end_time: end.parse().unwrap(),
            status: ReservationStatus::Pending,
            sport_id: "padel".into(),
            payment_method_id: None,
            total_amount: Money(15_000),
            payment_deadline: None,
        }
    }

    #[tokio::test]
    async fn reaper_collects_expired_pending() {
        let path = test_wal_path("reaper_collect.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::with_payment_window(path, notify, 1_000).unwrap());

        let court = Ulid::new();
        engine.create_court(court, None).await.unwrap();

        let now = now_ms();
        // Placed two seconds ago with a one second window.
        let placed = engine
            .place_reservation(pending(court, "18:00", "19:00"), now - 2_000)
            .await
            .unwrap();

        let expired = engine.collect_expired_pending(now);
        assert_eq!(expired, vec![(placed.id, court)]);

        assert!(engine.expire_pending(placed.id, now).await.unwrap());
        assert!(engine.collect_expired_pending(now).is_empty());
        assert_eq!(
            engine.get_reservation(placed.id).await.unwrap().status,
            ReservationStatus::Canceled
        );
    }

    #[tokio::test]
    async fn confirmed_reservation_is_not_expired() {
        let path = test_wal_path("reaper_confirmed.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::with_payment_window(path, notify, 1_000).unwrap());

        let court = Ulid::new();
        engine.create_court(court, None).await.unwrap();

        let now = now_ms();
        let placed = engine
            .place_reservation(pending(court, "09:00", "10:00"), now - 2_000)
            .await
            .unwrap();
        engine.confirm_reservation(placed.id).await.unwrap();

        assert!(engine.collect_expired_pending(now).is_empty());
        assert!(!engine.expire_pending(placed.id, now).await.unwrap());
    }
}
