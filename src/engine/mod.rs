mod booking;
mod catalog;
mod entitlements;
mod error;
mod grants;
mod journal;
mod ledger;
mod slots;

pub use booking::ReservationRequest;
pub use error::{EngineError, ErrorKind};
pub use grants::{GrantOverrides, Settlement, grant_window, settle_payment};
pub use ledger::FacilityLedger;
pub use slots::{day_grid, generate_slots, session_minutes_from_hours, slot_availability};

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

use journal::{WalCommand, wal_writer_loop};

pub type SharedFacility = Arc<RwLock<FacilityLedger>>;
pub type SharedMember = Arc<RwLock<MemberState>>;

/// One tenant's entitlement and reservation state.
///
/// Lock order is write gate, facility, then member. Booking takes both
/// aggregates; grant issuance takes only the member. Every mutation holds the
/// gate shared; compaction holds it exclusively so its snapshot is complete.
pub struct Engine {
    pub(super) facilities: DashMap<Ulid, SharedFacility>,
    pub(super) members: DashMap<Ulid, SharedMember>,
    pub(super) plans: DashMap<Ulid, Plan>,
    /// Reverse lookup: reservation id → facility id
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: grant id → member id
    pub(super) grant_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) write_gate: RwLock<()>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            facilities: DashMap::new(),
            members: DashMap::new(),
            plans: DashMap::new(),
            reservation_index: DashMap::new(),
            grant_index: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            clock,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // blocking_write would panic when a tenant is created lazily inside a task.
        for event in &events {
            engine.replay_event(event)?;
        }
        tracing::debug!(events = events.len(), "replayed WAL");

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> std::io::Result<()> {
        match event {
            Event::FacilityConfigured { config } => self.install_facility(config.clone())?,
            Event::PlanDefined { plan } => {
                self.plans.insert(plan.id, plan.clone());
            }
            Event::MemberRegistered { id, name } => self.install_member(*id, name.clone())?,
            other => {
                let (facility_id, member_id) = event_targets(other);
                if let Some(fid) = facility_id
                    && let Some(facility) = self.facilities.get(&fid).map(|e| e.value().clone())
                {
                    let mut guard = facility.try_write().map_err(replay_contended)?;
                    self.apply_to_facility(&mut guard, other);
                }
                if let Some(mid) = member_id
                    && let Some(member) = self.members.get(&mid).map(|e| e.value().clone())
                {
                    let mut guard = member.try_write().map_err(replay_contended)?;
                    self.apply_to_member(&mut guard, other);
                }
            }
        }
        Ok(())
    }

    /// Insert a facility or replace its configuration, keeping its reservations.
    fn install_facility(&self, config: FacilityScheduleConfig) -> std::io::Result<()> {
        if let Some(existing) = self.facilities.get(&config.id) {
            let shared = existing.value().clone();
            drop(existing);
            shared.try_write().map_err(replay_contended)?.config = config;
            return Ok(());
        }
        self.facilities
            .insert(config.id, Arc::new(RwLock::new(FacilityLedger::new(config))));
        Ok(())
    }

    fn install_member(&self, id: Ulid, name: Option<String>) -> std::io::Result<()> {
        if let Some(existing) = self.members.get(&id) {
            let shared = existing.value().clone();
            drop(existing);
            shared.try_write().map_err(replay_contended)?.name = name;
            return Ok(());
        }
        self.members
            .insert(id, Arc::new(RwLock::new(MemberState::new(id, name))));
        Ok(())
    }

    /// Apply the ledger half of an event. Caller holds the facility lock.
    pub(super) fn apply_to_facility(&self, ledger: &mut FacilityLedger, event: &Event) {
        match event {
            Event::ReservationBooked { reservation } => {
                self.reservation_index
                    .insert(reservation.id, reservation.facility_id);
                ledger.upsert(reservation.clone());
            }
            Event::ReservationMoved { id, slot, weekday, notes, at, .. } => {
                ledger.relocate(*id, *slot, *weekday, notes.clone(), *at);
            }
            Event::ReservationCancelled { id, at, .. } => {
                ledger.deactivate(*id, *at);
            }
            Event::FacilityConfigured { config } => {
                ledger.config = config.clone();
            }
            _ => {}
        }
    }

    /// Apply the member half of an event. Caller holds the member lock.
    pub(super) fn apply_to_member(&self, member: &mut MemberState, event: &Event) {
        match event {
            Event::AllowanceSet { allowed, used, .. } => {
                member.allowed_reservations = *allowed;
                member.used_reservations = *used;
            }
            Event::ReservationBooked { reservation } => {
                if reservation.is_active() {
                    member.used_reservations = member.used_reservations.saturating_add(1);
                }
            }
            Event::ReservationCancelled { .. } => {
                member.used_reservations = member.used_reservations.saturating_sub(1);
            }
            Event::GrantIssued { grant, reset } => {
                self.grant_index.insert(grant.id, grant.member_id);
                member.grants.push(grant.clone());
                reset.apply(member);
            }
            Event::GrantInvalidated { id, at, .. } => {
                if let Some(grant) = member.grant_mut(*id)
                    && grant.invalidated_at.is_none()
                {
                    grant.invalidated_at = Some(*at);
                }
            }
            Event::GrantExtended { id, end_date, .. } => {
                if let Some(grant) = member.grant_mut(*id) {
                    grant.end_date = *end_date;
                }
            }
            Event::MemberRegistered { name, .. } => {
                member.name = name.clone();
            }
            _ => {}
        }
    }

    /// WAL-append, then apply to whichever aggregates the caller has locked.
    /// Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        ledger: Option<&mut FacilityLedger>,
        member: Option<&mut MemberState>,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        if let Some(ledger) = ledger {
            self.apply_to_facility(ledger, event);
        }
        if let Some(member) = member {
            self.apply_to_member(member, event);
        }
        Ok(())
    }

    pub(super) fn facility_handle(&self, id: Ulid) -> Result<SharedFacility, EngineError> {
        self.facilities
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::FacilityNotFound)
    }

    pub(super) fn member_handle(&self, id: Ulid) -> Result<SharedMember, EngineError> {
        self.members
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::MemberNotFound)
    }

    pub fn now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }
}

fn replay_contended(_: tokio::sync::TryLockError) -> std::io::Error {
    std::io::Error::other("aggregate locked during WAL replay")
}

/// Which aggregates an event touches: (facility, member).
fn event_targets(event: &Event) -> (Option<Ulid>, Option<Ulid>) {
    match event {
        Event::ReservationBooked { reservation } => {
            (Some(reservation.facility_id), Some(reservation.member_id))
        }
        Event::ReservationMoved { facility_id, member_id, .. }
        | Event::ReservationCancelled { facility_id, member_id, .. } => {
            (Some(*facility_id), Some(*member_id))
        }
        Event::AllowanceSet { member_id, .. }
        | Event::GrantInvalidated { member_id, .. }
        | Event::GrantExtended { member_id, .. } => (None, Some(*member_id)),
        Event::GrantIssued { grant, .. } => (None, Some(grant.member_id)),
        Event::FacilityConfigured { config } => (Some(config.id), None),
        Event::MemberRegistered { id, .. } => (None, Some(*id)),
        Event::PlanDefined { .. } => (None, None),
    }
}
