use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for payment deadlines; scheduling works on
/// calendar dates and wall-clock times.
pub type Ms = i64;

// ── Time of day ──────────────────────────────────────────────────

/// Wall-clock time on the 24-hour clock, rendered as zero-padded `HH:MM`.
///
/// Ordering is numeric and agrees with the lexicographic order of the
/// rendered form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn minutes_since_midnight(&self) -> u32 {
        self.hour as u32 * 60 + self.minute as u32
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0)
            .expect("TimeOfDay is always a valid wall-clock time")
    }

    /// Start of this time on `date`.
    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.to_naive_time())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeParseError(pub String);

impl fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day {:?} (expected HH:MM)", self.0)
    }
}

impl std::error::Error for TimeParseError {}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeParseError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        TimeOfDay::new(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

// ── Money ────────────────────────────────────────────────────────

/// Amount in minor currency units (centavos).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub fn cents(&self) -> i64 {
        self.0
    }

    /// `self` increased by `pct` percent, rounded down. `None` on overflow.
    pub fn checked_plus_percent(self, pct: u32) -> Option<Money> {
        let scaled = i128::from(self.0) * (100 + i128::from(pct)) / 100;
        i64::try_from(scaled).ok().map(Money)
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_mul(self, n: i64) -> Option<Money> {
        self.0.checked_mul(n).map(Money)
    }
}

/// Saturating.
impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money(0), |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Parses a decimal amount in major units with at most two fraction digits:
/// `"150"`, `"150.5"`, `"150.00"`.
impl FromStr for Money {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || format!("invalid amount: {s:?}");
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || frac.len() > 2 {
            return Err(err());
        }
        if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let whole: i64 = whole.parse().map_err(|_| err())?;
        let frac: i64 = format!("{frac:0<2}").parse().map_err(|_| err())?;
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .ok_or_else(err)?;
        Ok(Money(if negative { -cents } else { cents }))
    }
}

// ── Business configuration ───────────────────────────────────────

/// Start times of the fixed 18:00–22:00 peak window.
pub fn default_peak_windows() -> BTreeSet<TimeOfDay> {
    (18..22).filter_map(|h| TimeOfDay::new(h, 0)).collect()
}

/// Operating hours and pricing for a venue. Treated as an immutable
/// snapshot by every scheduling computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessConfig {
    pub opening_time: TimeOfDay,
    pub closing_time: TimeOfDay,
    pub standard_rate: Money,
    /// Explicit peak rate. When unset the peak rate is derived from
    /// `standard_rate` and `peak_rate_percentage`.
    pub peak_rate: Option<Money>,
    pub peak_rate_percentage: u32,
    pub min_lead_minutes: u32,
    pub peak_hour_windows: BTreeSet<TimeOfDay>,
}

impl BusinessConfig {
    pub fn new(opening_time: TimeOfDay, closing_time: TimeOfDay, standard_rate: Money) -> Self {
        Self {
            opening_time,
            closing_time,
            standard_rate,
            peak_rate: None,
            peak_rate_percentage: 0,
            min_lead_minutes: 0,
            peak_hour_windows: default_peak_windows(),
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "canceled" | "cancelled" => Ok(ReservationStatus::Canceled),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// A booked interval on a court. Canceled reservations are kept for history
/// but never take part in conflict checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub status: ReservationStatus,
    pub sport_id: String,
    pub payment_method_id: Option<String>,
    pub total_amount: Money,
    /// Pending reservations are canceled once this passes without payment.
    pub payment_deadline: Option<Ms>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status != ReservationStatus::Canceled
    }

    fn sort_key(&self) -> (NaiveDate, TimeOfDay) {
        (self.date, self.start_time)
    }
}

// ── Derived scheduling values ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockReason {
    None,
    Reserved,
    PastCutoff,
}

/// One bookable hour of a court's day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub available: bool,
    pub is_peak_hour: bool,
    pub price: Money,
    pub block_reason: BlockReason,
    /// Informational "popular time" flag from the weekly analysis.
    pub is_popular: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceFrequency {
    #[default]
    Weekly,
    Daily,
}

impl FromStr for RecurrenceFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weekly" => Ok(RecurrenceFrequency::Weekly),
            "daily" => Ok(RecurrenceFrequency::Daily),
            other => Err(format!("unknown recurrence frequency: {other}")),
        }
    }
}

/// Caller-supplied recurring booking request. Required fields are optional
/// here so that an incomplete request can be rejected naming the gap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    pub base_date: Option<NaiveDate>,
    pub duration_days: i64,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekdays: BTreeSet<u8>,
    pub start_time: Option<TimeOfDay>,
    pub end_time: Option<TimeOfDay>,
    pub court_id: Option<Ulid>,
    pub sport_id: String,
    pub frequency: RecurrenceFrequency,
}

impl RecurrenceRule {
    pub fn weekly(court_id: Ulid, base_date: NaiveDate, duration_days: i64) -> Self {
        Self {
            base_date: Some(base_date),
            duration_days,
            court_id: Some(court_id),
            ..Self::default()
        }
    }

    pub fn daily(court_id: Ulid, base_date: NaiveDate, duration_days: i64) -> Self {
        Self {
            frequency: RecurrenceFrequency::Daily,
            ..Self::weekly(court_id, base_date, duration_days)
        }
    }

    pub fn on_weekdays(mut self, weekdays: impl IntoIterator<Item = u8>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    pub fn between(mut self, start: TimeOfDay, end: TimeOfDay) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn for_sport(mut self, sport_id: impl Into<String>) -> Self {
        self.sport_id = sport_id.into();
        self
    }

    /// Replace the duration with the number of days between `base_date` and
    /// the same day `months` later. Leaves a zero duration when there is no
    /// base date or the result falls off the calendar.
    pub fn for_months(mut self, months: u32) -> Self {
        self.duration_days = self
            .base_date
            .and_then(|base| {
                base.checked_add_months(chrono::Months::new(months))
                    .map(|end| (end - base).num_days())
            })
            .unwrap_or(0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrencePreviewEntry {
    pub date: NaiveDate,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub available: bool,
}

/// Preview of a recurring booking. The caller turns the available entries
/// into real reservations in a separate confirmation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrencePreview {
    pub entries: Vec<RecurrencePreviewEntry>,
    pub total_count: usize,
    pub available_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakHourAnalysis {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    /// At most two start times, most booked first, earlier time on ties.
    pub top_start_times: Vec<TimeOfDay>,
}

impl PeakHourAnalysis {
    pub fn empty(week_start: NaiveDate, week_end: NaiveDate) -> Self {
        Self {
            week_start,
            week_end,
            top_start_times: Vec::new(),
        }
    }
}

// ── Court state ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CourtState {
    pub id: Ulid,
    pub name: Option<String>,
    /// All reservations including canceled ones, sorted by `(date, start_time)`.
    pub reservations: Vec<Reservation>,
}

impl CourtState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `(date, start_time)`.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = reservation.sort_key();
        let pos = self.reservations.partition_point(|r| r.sort_key() <= key);
        self.reservations.insert(pos, reservation);
    }

    pub fn get_reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations on a single date.
    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        self.between(date, date)
    }

    /// Reservations with `first <= date <= last`.
    pub fn between(&self, first: NaiveDate, last: NaiveDate) -> &[Reservation] {
        let lo = self.reservations.partition_point(|r| r.date < first);
        let hi = self.reservations.partition_point(|r| r.date <= last);
        if lo >= hi {
            return &[];
        }
        &self.reservations[lo..hi]
    }

    pub fn active_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_active()).count()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ConfigUpdated {
        config: BusinessConfig,
    },
    CourtCreated {
        id: Ulid,
        name: Option<String>,
    },
    CourtDeleted {
        id: Ulid,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        court_id: Ulid,
    },
    ReservationCanceled {
        id: Ulid,
        court_id: Ulid,
    },
    /// A batch stored in one record, so replay sees all of it or none.
    ReservationsPlaced {
        reservations: Vec<Reservation>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active_reservations: usize,
}
