use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::{Engine, DEFAULT_PAYMENT_WINDOW_MS};
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::observability::TENANTS_ACTIVE;
use crate::reaper;

/// One engine per venue. The venue is the database name of the pgwire
/// connection; each gets its own WAL, payment reaper and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    payment_window_ms: Ms,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self::with_payment_window(data_dir, compact_threshold, DEFAULT_PAYMENT_WINDOW_MS)
    }

    pub fn with_payment_window(data_dir: PathBuf, compact_threshold: u64, payment_window_ms: Ms) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            payment_window_ms,
        }
    }

    pub fn get_or_create(&self, venue: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(venue) {
            return Ok(engine.value().clone());
        }
        if venue.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "venue name too long"));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many venues"));
        }

        // Keep the WAL inside data_dir.
        let file_stem: String = venue
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if file_stem.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty venue name"));
        }

        let wal_path = self.data_dir.join(format!("{file_stem}.wal"));
        let engine = Arc::new(Engine::with_payment_window(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.payment_window_ms,
        )?);

        tokio::spawn(reaper::run_reaper(engine.clone()));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        // Two connections may race to open the same venue; the first one wins.
        let engine = self.engines.entry(venue.to_string()).or_insert(engine).value().clone();
        metrics::gauge!(TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("venue {venue} loaded");
        Ok(engine)
    }
}
