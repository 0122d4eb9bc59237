//! Time-based guards in front of the pump.
//!
//! Freshness fails closed: a reading we cannot date is never trusted.
//! Cooldown fails open: a plant that has never been watered has no cooldown
//! to respect.

use time::{Duration, OffsetDateTime};

/// True only when `last_seen` is known and no older than the window.
/// The window is clamped to at least one minute.
pub fn is_fresh(last_seen: Option<OffsetDateTime>, window_min: i64, now: OffsetDateTime) -> bool {
    let Some(last_seen) = last_seen else {
        return false;
    };
    now - last_seen <= Duration::minutes(window_min.max(1))
}

/// True when enough time has passed since the last watering.
/// Strictly greater: exactly at the boundary is still cooling down.
pub fn cooldown_ok(last_watered: Option<OffsetDateTime>, cooldown_min: i64, now: OffsetDateTime) -> bool {
    if cooldown_min <= 0 {
        return true;
    }
    match last_watered {
        None => true,
        Some(last) => now - last > Duration::minutes(cooldown_min),
    }
}
