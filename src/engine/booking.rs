use chrono::{Datelike, NaiveDate, Weekday};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_NOTES_LEN;
use crate::model::*;
use crate::observability;

use super::slots::{day_grid, slot_availability};
use super::{Engine, EngineError};

/// A member's request for one slot on one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    /// Id for the row if this turns into a new booking. Ignored on a move
    /// or an idempotent rebook, which keep the existing row's id.
    pub id: Ulid,
    pub date: NaiveDate,
    pub slot: Slot,
    pub weekday: Weekday,
    pub notes: Option<String>,
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::SlotFullyBooked { .. } => "fully_booked",
        EngineError::AllowanceExhausted { .. } => "allowance_exhausted",
        EngineError::SlotOffGrid(_) => "off_grid",
        EngineError::ReservationsDisabled => "disabled",
        _ => "rejected",
    }
}

impl Engine {
    /// Book, move, or re-confirm the member's reservation for `req.date`.
    ///
    /// A member holds at most one active reservation per facility and day.
    /// Asking for the slot they already hold returns that row untouched;
    /// asking for another slot moves the row in place.
    pub async fn create_reservation(
        &self,
        member_id: Ulid,
        facility_id: Ulid,
        req: ReservationRequest,
    ) -> Result<Reservation, EngineError> {
        let result = self.book(member_id, facility_id, req).await;
        match &result {
            Ok((_, outcome)) => record_outcome(outcome),
            Err(e) => record_outcome(rejection_label(e)),
        }
        result.map(|(reservation, _)| reservation)
    }

    async fn book(
        &self,
        member_id: Ulid,
        facility_id: Ulid,
        req: ReservationRequest,
    ) -> Result<(Reservation, &'static str), EngineError> {
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let _gate = self.write_gate.read().await;
        let facility = self.facility_handle(facility_id)?;
        let mut ledger = facility.write().await;
        if !ledger.config.allows_user_reservations {
            return Err(EngineError::ReservationsDisabled);
        }
        let member = self.member_handle(member_id)?;
        let mut member = member.write().await;

        if req.date.weekday() != req.weekday {
            return Err(EngineError::WeekdayMismatch);
        }
        if !day_grid(&ledger.config, req.weekday).contains(&req.slot) {
            return Err(EngineError::SlotOffGrid(req.slot));
        }

        let now = self.clock.now();
        let capacity = ledger.config.max_per_slot;

        let held = ledger
            .find_active_for_member_on_date(member_id, req.date)
            .cloned();
        if let Some(existing) = held {
            if existing.slot == req.slot {
                debug!(reservation = %existing.id, "rebooking held slot");
                return Ok((existing, "unchanged"));
            }
            let id = existing.id;
            // The member's own row sits on a different slot, so the target
            // count never includes it.
            if ledger.count_active(req.date, &req.slot) >= capacity {
                return Err(EngineError::SlotFullyBooked { slot: req.slot, capacity });
            }
            let event = Event::ReservationMoved {
                id,
                facility_id,
                member_id,
                slot: req.slot,
                weekday: req.weekday,
                notes: req.notes,
                at: now,
            };
            self.persist_and_apply(&event, Some(&mut *ledger), Some(&mut *member))
                .await?;
            info!(reservation = %id, member = %member_id, "moved reservation to {}", req.slot);
            let moved = ledger.get(id).cloned().ok_or(EngineError::ReservationNotFound)?;
            return Ok((moved, "moved"));
        }

        if ledger.count_active(req.date, &req.slot) >= capacity {
            return Err(EngineError::SlotFullyBooked { slot: req.slot, capacity });
        }
        if self.reservation_index.contains_key(&req.id) {
            return Err(EngineError::DuplicateId);
        }
        if member.used_reservations >= member.allowed_reservations {
            return Err(EngineError::AllowanceExhausted {
                allowed: member.allowed_reservations,
                used: member.used_reservations,
            });
        }

        let reservation = Reservation {
            id: req.id,
            member_id,
            facility_id,
            date: req.date,
            slot: req.slot,
            weekday: req.weekday,
            notes: req.notes,
            status: ReservationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&event, Some(&mut *ledger), Some(&mut *member))
            .await?;
        info!(
            reservation = %reservation.id,
            member = %member_id,
            facility = %facility_id,
            "booked {} on {}",
            reservation.slot,
            reservation.date
        );
        Ok((reservation, "booked"))
    }

    /// Cancel one of the member's active reservations and refund its allowance.
    pub async fn cancel_reservation(
        &self,
        member_id: Ulid,
        reservation_id: Ulid,
    ) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let facility_id = self
            .reservation_index
            .get(&reservation_id)
            .map(|e| *e.value())
            .ok_or(EngineError::ReservationNotFound)?;
        let facility = self.facility_handle(facility_id)?;
        let mut ledger = facility.write().await;

        // Someone else's reservation is reported as missing, not forbidden.
        let owned_and_active = ledger
            .get(reservation_id)
            .is_some_and(|r| r.member_id == member_id && r.is_active());
        if !owned_and_active {
            return Err(EngineError::ReservationNotFound);
        }

        let member = self.member_handle(member_id)?;
        let mut member = member.write().await;
        let event = Event::ReservationCancelled {
            id: reservation_id,
            facility_id,
            member_id,
            at: self.clock.now(),
        };
        self.persist_and_apply(&event, Some(&mut *ledger), Some(&mut *member))
            .await?;
        record_outcome("cancelled");
        info!(reservation = %reservation_id, member = %member_id, "cancelled reservation");
        Ok(())
    }

    /// The facility's grid for `weekday` with live occupancy for `date`.
    /// A closed day is an empty list.
    pub async fn get_available_slots(
        &self,
        weekday: Weekday,
        facility_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        if date.weekday() != weekday {
            return Err(EngineError::WeekdayMismatch);
        }
        let facility = self.facility_handle(facility_id)?;
        let ledger = facility.read().await;
        Ok(slot_availability(&ledger, weekday, date))
    }

    /// Every reservation the member ever made, cancelled ones included,
    /// ordered by date then creation.
    pub async fn member_reservations(&self, member_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        self.member_handle(member_id)?;
        let facilities: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for facility in facilities {
            let ledger = facility.read().await;
            rows.extend(
                ledger
                    .reservations()
                    .filter(|r| r.member_id == member_id)
                    .cloned(),
            );
        }
        rows.sort_by_key(|r| (r.date, r.created_at, r.id));
        Ok(rows)
    }

    pub async fn reservation(&self, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let facility_id = self
            .reservation_index
            .get(&reservation_id)
            .map(|e| *e.value())
            .ok_or(EngineError::ReservationNotFound)?;
        let facility = self.facility_handle(facility_id)?;
        let ledger = facility.read().await;
        ledger
            .get(reservation_id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound)
    }
}
