use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const CHANNEL_PREFIX: &str = "court_";

/// LISTEN channel name for a court.
pub fn channel_name(court_id: Ulid) -> String {
    format!("{CHANNEL_PREFIX}{court_id}")
}

/// Court id from a `court_{ulid}` channel name. Case-insensitive, since
/// Postgres clients fold unquoted identifiers to lower case.
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let prefix = channel.get(..CHANNEL_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(CHANNEL_PREFIX) {
        return None;
    }
    Ulid::from_string(&channel[CHANNEL_PREFIX.len()..].to_ascii_uppercase()).ok()
}

/// JSON body carried by a court notification.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

/// Per-court broadcast of every event applied to that court.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, court_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(court_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op when nobody listens on the court.
    pub fn send(&self, court_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&court_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, court_id: &Ulid) {
        self.channels.remove(court_id);
    }
}
