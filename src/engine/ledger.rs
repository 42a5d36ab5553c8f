use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

/// One facility's schedule plus every reservation ever made against it.
/// Cancelled rows stay in place for audit.
#[derive(Debug, Clone)]
pub struct FacilityLedger {
    pub config: FacilityScheduleConfig,
    by_date: BTreeMap<NaiveDate, Vec<Reservation>>,
    dates: HashMap<Ulid, NaiveDate>,
}

impl FacilityLedger {
    pub fn new(config: FacilityScheduleConfig) -> Self {
        Self {
            config,
            by_date: BTreeMap::new(),
            dates: HashMap::new(),
        }
    }

    /// Active reservations sitting exactly on `slot` for `date`.
    pub fn count_active(&self, date: NaiveDate, slot: &Slot) -> u32 {
        self.active_on(date).filter(|r| r.slot == *slot).count() as u32
    }

    pub fn find_active_for_member_on_date(
        &self,
        member_id: Ulid,
        date: NaiveDate,
    ) -> Option<&Reservation> {
        self.active_on(date).find(|r| r.member_id == member_id)
    }

    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Reservation> {
        self.by_date
            .get(&date)
            .into_iter()
            .flatten()
            .filter(|r| r.is_active())
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        let date = self.dates.get(&id)?;
        self.by_date.get(date)?.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        let date = self.dates.get(&id)?;
        self.by_date.get_mut(date)?.iter_mut().find(|r| r.id == id)
    }

    /// Insert a new row or overwrite the row with the same id. The date of an
    /// existing row never changes.
    pub fn upsert(&mut self, reservation: Reservation) {
        debug_assert!(
            !reservation.is_active()
                || self
                    .find_active_for_member_on_date(reservation.member_id, reservation.date)
                    .is_none_or(|r| r.id == reservation.id),
            "second active reservation for member on the same day"
        );
        if let Some(existing) = self.get_mut(reservation.id) {
            *existing = reservation;
            return;
        }
        self.dates.insert(reservation.id, reservation.date);
        self.by_date
            .entry(reservation.date)
            .or_default()
            .push(reservation);
    }

    /// Mark a reservation cancelled. Returns `false` if it was not active.
    pub fn deactivate(&mut self, id: Ulid, at: NaiveDateTime) -> bool {
        match self.get_mut(id) {
            Some(r) if r.is_active() => {
                r.status = ReservationStatus::Cancelled;
                r.updated_at = at;
                true
            }
            _ => false,
        }
    }

    /// Move an active reservation to another slot on the same day.
    pub fn relocate(
        &mut self,
        id: Ulid,
        slot: Slot,
        weekday: chrono::Weekday,
        notes: Option<String>,
        at: NaiveDateTime,
    ) -> bool {
        match self.get_mut(id) {
            Some(r) if r.is_active() => {
                r.slot = slot;
                r.weekday = weekday;
                r.notes = notes;
                r.updated_at = at;
                true
            }
            _ => false,
        }
    }

    /// Every row, ordered by date then insertion.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.by_date.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    fn at() -> NaiveDateTime {
        date().and_hms_opt(8, 0, 0).unwrap()
    }

    fn slot(a: &str, b: &str) -> Slot {
        Slot::new(a.parse().unwrap(), b.parse().unwrap())
    }

    fn reservation(member_id: Ulid, slot: Slot) -> Reservation {
        Reservation {
            id: Ulid::new(),
            member_id,
            facility_id: Ulid::nil(),
            date: date(),
            slot,
            weekday: Weekday::Wed,
            notes: None,
            status: ReservationStatus::Active,
            created_at: at(),
            updated_at: at(),
        }
    }

    fn ledger() -> FacilityLedger {
        FacilityLedger::new(FacilityScheduleConfig::new(Ulid::nil(), 60, 3))
    }

    #[test]
    fn count_matches_exact_slot_only() {
        let mut l = ledger();
        l.upsert(reservation(Ulid::new(), slot("09:00", "10:00")));
        l.upsert(reservation(Ulid::new(), slot("09:00", "10:00")));
        l.upsert(reservation(Ulid::new(), slot("09:30", "10:30")));

        assert_eq!(l.count_active(date(), &slot("09:00", "10:00")), 2);
        assert_eq!(l.count_active(date(), &slot("09:30", "10:30")), 1);
        assert_eq!(l.count_active(date(), &slot("10:00", "11:00")), 0);
        let other_day = date().succ_opt().unwrap();
        assert_eq!(l.count_active(other_day, &slot("09:00", "10:00")), 0);
    }

    #[test]
    fn deactivate_keeps_row_but_frees_slot() {
        let mut l = ledger();
        let r = reservation(Ulid::new(), slot("09:00", "10:00"));
        let id = r.id;
        l.upsert(r);

        assert!(l.deactivate(id, at()));
        assert!(!l.deactivate(id, at()), "second cancel is a no-op");
        assert_eq!(l.count_active(date(), &slot("09:00", "10:00")), 0);
        assert_eq!(l.get(id).unwrap().status, ReservationStatus::Cancelled);
        assert_eq!(l.reservations().count(), 1);
    }

    #[test]
    fn find_active_ignores_cancelled_rows() {
        let mut l = ledger();
        let member = Ulid::new();
        let r = reservation(member, slot("09:00", "10:00"));
        let id = r.id;
        l.upsert(r);
        assert_eq!(l.find_active_for_member_on_date(member, date()).unwrap().id, id);

        l.deactivate(id, at());
        assert!(l.find_active_for_member_on_date(member, date()).is_none());

        let again = reservation(member, slot("11:00", "12:00"));
        let again_id = again.id;
        l.upsert(again);
        assert_eq!(l.find_active_for_member_on_date(member, date()).unwrap().id, again_id);
    }

    #[test]
    fn relocate_moves_in_place() {
        let mut l = ledger();
        let r = reservation(Ulid::new(), slot("09:00", "10:00"));
        let id = r.id;
        l.upsert(r);

        assert!(l.relocate(id, slot("10:00", "11:00"), Weekday::Wed, Some("late".into()), at()));
        let moved = l.get(id).unwrap();
        assert_eq!(moved.slot, slot("10:00", "11:00"));
        assert_eq!(moved.notes.as_deref(), Some("late"));
        assert_eq!(l.count_active(date(), &slot("09:00", "10:00")), 0);
        assert_eq!(l.count_active(date(), &slot("10:00", "11:00")), 1);
        assert_eq!(l.reservations().count(), 1);
    }

    #[test]
    fn upsert_same_id_overwrites() {
        let mut l = ledger();
        let mut r = reservation(Ulid::new(), slot("09:00", "10:00"));
        l.upsert(r.clone());
        r.notes = Some("bring towel".into());
        l.upsert(r.clone());
        assert_eq!(l.reservations().count(), 1);
        assert_eq!(l.get(r.id).unwrap().notes.as_deref(), Some("bring towel"));
    }
}
