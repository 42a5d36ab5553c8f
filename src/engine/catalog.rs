use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_FACILITY_CAPACITY, MAX_NAME_LEN, MAX_PLAN_DURATION_DAYS};
use crate::model::*;

use super::ledger::FacilityLedger;
use super::{Engine, EngineError};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_hours(hours: &DayHours) -> Result<(), EngineError> {
    if hours.opens && hours.open >= hours.close {
        return Err(EngineError::InvalidSchedule("open time must be before close time"));
    }
    Ok(())
}

/// Checks a facility configuration before it is stored.
pub fn validate_schedule(config: &FacilityScheduleConfig) -> Result<(), EngineError> {
    check_name(&config.name)?;
    if config.session_minutes == 0 || config.session_minutes > 24 * 60 {
        return Err(EngineError::InvalidSchedule("session length must be between 1 minute and 24 hours"));
    }
    if config.max_per_slot == 0 {
        return Err(EngineError::InvalidSchedule("capacity per slot must be positive"));
    }
    if config.max_per_slot > MAX_FACILITY_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity per slot"));
    }
    for (i, hours) in config.weekly_hours.iter().enumerate() {
        if hours.weekday.num_days_from_monday() as usize != i {
            return Err(EngineError::InvalidSchedule("weekly hours must be Monday-first"));
        }
        validate_hours(hours)?;
    }
    Ok(())
}

fn validate_plan(plan: &Plan) -> Result<(), EngineError> {
    check_name(&plan.name)?;
    if plan.duration_units == 0 {
        return Err(EngineError::InvalidSchedule("plan duration must be at least one day"));
    }
    if plan.duration_units > MAX_PLAN_DURATION_DAYS {
        return Err(EngineError::LimitExceeded("plan duration"));
    }
    Ok(())
}

// Creating or redefining catalog entries holds the write gate exclusively:
// no booking or grant can observe an entry before its event is durable.
impl Engine {
    /// Create a facility or replace its configuration. Existing reservations
    /// are kept even if they no longer sit on the new grid.
    pub async fn configure_facility(
        &self,
        config: FacilityScheduleConfig,
    ) -> Result<FacilityScheduleConfig, EngineError> {
        validate_schedule(&config)?;
        let _gate = self.write_gate.write().await;
        let event = Event::FacilityConfigured {
            config: config.clone(),
        };

        match self.facilities.get(&config.id).map(|e| e.value().clone()) {
            Some(facility) => {
                let mut ledger = facility.write().await;
                self.persist_and_apply(&event, Some(&mut *ledger), None).await?;
            }
            None => {
                self.wal_append(&event).await?;
                self.facilities.insert(
                    config.id,
                    Arc::new(RwLock::new(FacilityLedger::new(config.clone()))),
                );
            }
        }
        info!(facility = %config.id, "configured facility");
        Ok(config)
    }

    /// Replace one weekday's hours on an existing facility.
    pub async fn set_facility_hours(
        &self,
        facility_id: Ulid,
        hours: DayHours,
    ) -> Result<FacilityScheduleConfig, EngineError> {
        validate_hours(&hours)?;
        let _gate = self.write_gate.read().await;
        let facility = self.facility_handle(facility_id)?;
        let mut ledger = facility.write().await;
        let mut config = ledger.config.clone();
        config.set_hours(hours);
        let event = Event::FacilityConfigured {
            config: config.clone(),
        };
        self.persist_and_apply(&event, Some(&mut *ledger), None).await?;
        info!(facility = %facility_id, weekday = %hours.weekday, opens = hours.opens, "updated hours");
        Ok(config)
    }

    pub async fn facility(&self, id: Ulid) -> Result<FacilityScheduleConfig, EngineError> {
        let facility = self.facility_handle(id)?;
        let ledger = facility.read().await;
        Ok(ledger.config.clone())
    }

    pub async fn define_plan(&self, plan: Plan) -> Result<Plan, EngineError> {
        validate_plan(&plan)?;
        let _gate = self.write_gate.write().await;
        self.wal_append(&Event::PlanDefined { plan: plan.clone() })
            .await?;
        self.plans.insert(plan.id, plan.clone());
        info!(plan = %plan.id, kind = plan.kind.as_str(), days = plan.duration_units, "defined plan");
        Ok(plan)
    }

    /// Register a member, or rename one that already exists.
    pub async fn register_member(&self, id: Ulid, name: Option<String>) -> Result<Member, EngineError> {
        check_name(&name)?;
        let _gate = self.write_gate.write().await;
        let event = Event::MemberRegistered {
            id,
            name: name.clone(),
        };

        match self.members.get(&id).map(|e| e.value().clone()) {
            Some(member) => {
                let mut guard = member.write().await;
                self.persist_and_apply(&event, None, Some(&mut *guard)).await?;
                Ok(guard.profile())
            }
            None => {
                self.wal_append(&event).await?;
                let state = MemberState::new(id, name);
                let profile = state.profile();
                self.members.insert(id, Arc::new(RwLock::new(state)));
                info!(member = %id, "registered member");
                Ok(profile)
            }
        }
    }

    pub async fn member(&self, id: Ulid) -> Result<Member, EngineError> {
        let member = self.member_handle(id)?;
        let guard = member.read().await;
        Ok(guard.profile())
    }

    /// Overwrite the member's allowance counters. Usage above the allowance
    /// is accepted here; booking is where the allowance is enforced.
    pub async fn set_allowance(
        &self,
        member_id: Ulid,
        allowed: u32,
        used: u32,
    ) -> Result<Member, EngineError> {
        let _gate = self.write_gate.read().await;
        let member = self.member_handle(member_id)?;
        let mut guard = member.write().await;
        let event = Event::AllowanceSet {
            member_id,
            allowed,
            used,
        };
        self.persist_and_apply(&event, None, Some(&mut *guard)).await?;
        info!(member = %member_id, allowed, used, "allowance overridden");
        Ok(guard.profile())
    }
}
