use ulid::Ulid;

use crate::model::{ReservationStatus, TimeOfDay};

/// Business configuration is missing or structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing,
    InvalidHours {
        opening: TimeOfDay,
        closing: TimeOfDay,
    },
    InvalidRate(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing => write!(f, "business configuration not set"),
            ConfigError::InvalidHours { opening, closing } => {
                write!(f, "opening time {opening} must be before closing time {closing}")
            }
            ConfigError::InvalidRate(field) => write!(f, "{field} must be non-negative and fit a full day of bookings"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Caller-supplied parameters are incomplete or malformed. Always names the
/// offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Missing(&'static str),
    Invalid { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::Missing(field) | ValidationError::Invalid { field, .. } => field,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Missing(field) => write!(f, "{field} is required"),
            ValidationError::Invalid { field, reason } => write!(f, "{field}: {reason}"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Another non-canceled reservation already holds this court, date and start time.
    SlotTaken(Ulid),
    /// Overlaps an existing non-canceled reservation.
    Conflict(Ulid),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    HasActiveReservations(Ulid),
    Config(ConfigError),
    Validation(ValidationError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotTaken(id) => {
                write!(f, "this slot was just taken, please pick another (held by {id})")
            }
            EngineError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot go from {from} to {to}")
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete court {id}: has active reservations")
            }
            EngineError::Config(e) => write!(f, "scheduling temporarily unavailable: {e}"),
            EngineError::Validation(e) => write!(f, "invalid request: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}
