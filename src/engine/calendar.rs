use crate::model::*;

use super::error::ConfigError;

// ── Business calendar ─────────────────────────────────────────────

/// Longest interval any single price covers.
const HOURS_PER_DAY: i64 = 24;

pub fn validate_config(config: &BusinessConfig) -> Result<(), ConfigError> {
    if config.opening_time >= config.closing_time {
        return Err(ConfigError::InvalidHours {
            opening: config.opening_time,
            closing: config.closing_time,
        });
    }
    if config.standard_rate.cents() < 0 {
        return Err(ConfigError::InvalidRate("standard_rate"));
    }
    if config.peak_rate.is_some_and(|p| p.cents() < 0) {
        return Err(ConfigError::InvalidRate("peak_rate"));
    }
    // A full day at either rate must stay representable.
    let (field, peak) = match config.peak_rate {
        Some(rate) => ("peak_rate", Some(rate)),
        None => (
            "peak_rate_percentage",
            config.standard_rate.checked_plus_percent(config.peak_rate_percentage),
        ),
    };
    if config.standard_rate.checked_mul(HOURS_PER_DAY).is_none() {
        return Err(ConfigError::InvalidRate("standard_rate"));
    }
    if peak.and_then(|p| p.checked_mul(HOURS_PER_DAY)).is_none() {
        return Err(ConfigError::InvalidRate(field));
    }
    Ok(())
}

/// One-hour `(start, end)` boundaries from the opening hour up to the closing
/// hour. Always yields `closing_hour - opening_hour` entries, none when both
/// times fall in the same hour.
pub fn hour_boundaries(config: &BusinessConfig) -> Result<Vec<(TimeOfDay, TimeOfDay)>, ConfigError> {
    validate_config(config)?;
    let opening = config.opening_time.hour();
    let closing = config.closing_time.hour();
    // closing <= 23, so h + 1 is always a valid hour
    Ok((opening..closing)
        .filter_map(|h| Some((TimeOfDay::new(h, 0)?, TimeOfDay::new(h + 1, 0)?)))
        .collect())
}

pub fn peak_rate(config: &BusinessConfig) -> Money {
    config
        .peak_rate
        .or_else(|| config.standard_rate.checked_plus_percent(config.peak_rate_percentage))
        .unwrap_or(Money(i64::MAX))
}

/// Fixed, configured peak window. Independent of the weekly popularity analysis.
pub fn is_peak_hour(start: TimeOfDay, config: &BusinessConfig) -> bool {
    config.peak_hour_windows.contains(&start)
}

pub fn price_for(start: TimeOfDay, config: &BusinessConfig) -> Money {
    if is_peak_hour(start, config) {
        peak_rate(config)
    } else {
        config.standard_rate
    }
}

/// Price of `[start, end)` as the sum of the hourly price of every hour the
/// interval touches.
pub fn price_interval(start: TimeOfDay, end: TimeOfDay, config: &BusinessConfig) -> Money {
    (start.hour()..24)
        .filter_map(|h| TimeOfDay::new(h, 0))
        .take_while(|hour_start| *hour_start < end)
        .map(|hour_start| price_for(hour_start, config))
        .sum()
}
