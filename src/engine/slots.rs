use chrono::{NaiveDate, Weekday};

use crate::model::*;

use super::ledger::FacilityLedger;

// ── Slot grid ────────────────────────────────────────────────────

/// Cut `[open, close)` into back-to-back sessions of `session_minutes`.
/// A trailing remainder shorter than one session is dropped.
pub fn generate_slots(open: SlotTime, close: SlotTime, session_minutes: u32) -> Vec<Slot> {
    if session_minutes == 0 || open >= close {
        return Vec::new();
    }
    let close_minutes = close.minutes();
    let mut slots = Vec::with_capacity(((close_minutes - open.minutes()) / session_minutes) as usize);
    let mut current = open.minutes();
    while current + session_minutes <= close_minutes {
        // Both ends are <= close, so they are valid times of day.
        let (Some(start), Some(end)) = (
            SlotTime::from_minutes(current),
            SlotTime::from_minutes(current + session_minutes),
        ) else {
            break;
        };
        slots.push(Slot::new(start, end));
        current += session_minutes;
    }
    slots
}

/// The grid for one weekday of a facility. Closed days have no slots.
pub fn day_grid(config: &FacilityScheduleConfig, weekday: Weekday) -> Vec<Slot> {
    let hours = config.hours_for(weekday);
    if !hours.opens {
        return Vec::new();
    }
    generate_slots(hours.open, hours.close, config.session_minutes)
}

/// Convert an hour-denominated session length into whole minutes.
/// Returns `None` for non-positive lengths or ones that are not a whole minute.
pub fn session_minutes_from_hours(hours: f64) -> Option<u32> {
    if !hours.is_finite() || hours <= 0.0 {
        return None;
    }
    let minutes = hours * 60.0;
    let rounded = minutes.round();
    if (minutes - rounded).abs() > 1e-6 || rounded > f64::from(24 * 60) {
        return None;
    }
    Some(rounded as u32)
}

/// Join the day's grid against the ledger's active reservations for `date`.
/// Output follows grid order (chronological).
pub fn slot_availability(
    ledger: &FacilityLedger,
    weekday: Weekday,
    date: NaiveDate,
) -> Vec<SlotAvailability> {
    let max = ledger.config.max_per_slot;
    day_grid(&ledger.config, weekday)
        .into_iter()
        .map(|slot| {
            let current = ledger.count_active(date, &slot);
            SlotAvailability {
                slot,
                is_available: current < max,
                current_reservations: current,
                max_reservations: max,
            }
        })
        .collect()
}
