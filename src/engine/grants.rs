use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_EXTENSION_DAYS;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

/// Caller-supplied knobs for a single grant issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantOverrides {
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    /// Day passes only: run 24h from start instead of ending at midnight.
    pub give_full_day: bool,
    pub will_pay_later: bool,
    pub paid_amount: Option<Money>,
    pub for_free: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub payment_state: PaymentState,
    pub paid_amount: Money,
    pub original_amount: Money,
    pub paid_at: Option<NaiveDateTime>,
}

fn shift(at: NaiveDateTime, by: TimeDelta) -> Result<NaiveDateTime, EngineError> {
    at.checked_add_signed(by).ok_or(EngineError::DateOutOfRange)
}

fn end_of_day(at: NaiveDateTime) -> NaiveDateTime {
    let last_ms = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    at.date().and_time(last_ms)
}

/// Validity window for a new grant.
///
/// An explicit end date always wins. A single-day daily plan is a day pass:
/// either 24h from start or until the end of the start's calendar day.
/// Everything else runs `duration_units` days.
pub fn grant_window(
    plan: &Plan,
    overrides: &GrantOverrides,
    now: NaiveDateTime,
) -> Result<(NaiveDateTime, NaiveDateTime), EngineError> {
    let start = overrides.start_date.unwrap_or(now);
    let end = match overrides.end_date {
        Some(end) => end,
        None if plan.kind == PlanKind::Daily && plan.duration_units <= 1 => {
            if overrides.give_full_day {
                shift(start, TimeDelta::hours(24))?
            } else {
                end_of_day(start)
            }
        }
        None => shift(start, TimeDelta::days(i64::from(plan.duration_units)))?,
    };
    if end < start {
        return Err(EngineError::InvalidWindow);
    }
    Ok((start, end))
}

/// Payment state for a new grant. First matching rule wins:
/// free, partial payment, pay later, paid in full.
///
/// A recorded payment of zero against a priced plan is treated as nothing
/// received (unpaid), not as a partial payment.
pub fn settle_payment(
    plan: &Plan,
    overrides: &GrantOverrides,
    now: NaiveDateTime,
) -> Result<Settlement, EngineError> {
    if overrides.for_free {
        return Ok(Settlement {
            payment_state: PaymentState::Free,
            paid_amount: 0,
            original_amount: 0,
            paid_at: None,
        });
    }

    let price = plan.price;
    if let Some(paid) = overrides.paid_amount {
        if paid > price {
            return Err(EngineError::PaidAmountExceedsPrice { paid, price });
        }
        if paid > 0 && paid < price {
            return Ok(Settlement {
                payment_state: PaymentState::PartiallyPaid,
                paid_amount: paid,
                original_amount: price,
                paid_at: Some(now),
            });
        }
    }

    let nothing_received = overrides.paid_amount == Some(0) && price > 0;
    if overrides.will_pay_later || nothing_received {
        return Ok(Settlement {
            payment_state: PaymentState::Unpaid,
            paid_amount: 0,
            original_amount: price,
            paid_at: None,
        });
    }

    Ok(Settlement {
        payment_state: PaymentState::Paid,
        paid_amount: price,
        original_amount: price,
        paid_at: Some(now),
    })
}

impl AllowanceReset {
    pub fn for_plan(member_id: Ulid, plan: &Plan) -> Self {
        Self {
            member_id,
            allowed_reservations: plan.allowed_reservations.unwrap_or(0),
        }
    }

    /// Allowances never carry over: the previous grant's leftovers are discarded.
    pub fn apply(&self, member: &mut MemberState) {
        member.allowed_reservations = self.allowed_reservations;
        member.used_reservations = 0;
    }
}

/// Build the grant record and the counter reset it implies, without touching state.
pub fn draft_grant(
    id: Ulid,
    member_id: Ulid,
    plan: &Plan,
    overrides: &GrantOverrides,
    now: NaiveDateTime,
) -> Result<(EntitlementGrant, AllowanceReset), EngineError> {
    let (start_date, end_date) = grant_window(plan, overrides, now)?;
    let settlement = settle_payment(plan, overrides, now)?;
    let grant = EntitlementGrant {
        id,
        member_id,
        plan_id: plan.id,
        start_date,
        end_date,
        paid_amount: settlement.paid_amount,
        original_amount: settlement.original_amount,
        payment_state: settlement.payment_state,
        paid_at: settlement.paid_at,
        invalidated_at: None,
        created_at: now,
    };
    Ok((grant, AllowanceReset::for_plan(member_id, plan)))
}

impl Engine {
    /// Issue a new subscription grant and reset the member's reservation allowance.
    pub async fn issue_grant(
        &self,
        id: Ulid,
        member_id: Ulid,
        plan_id: Ulid,
        overrides: GrantOverrides,
    ) -> Result<EntitlementGrant, EngineError> {
        let _gate = self.write_gate.read().await;
        let plan = self.plan(plan_id)?;
        let member = self.member_handle(member_id)?;
        let mut guard = member.write().await;
        self.issue_locked(id, &mut guard, &plan, &overrides).await
    }

    /// Issue a grant for the plan of the member's most recent grant.
    pub async fn renew_grant(
        &self,
        id: Ulid,
        member_id: Ulid,
        overrides: GrantOverrides,
    ) -> Result<EntitlementGrant, EngineError> {
        let _gate = self.write_gate.read().await;
        let member = self.member_handle(member_id)?;
        let mut guard = member.write().await;
        let plan_id = guard
            .latest_grant()
            .map(|g| g.plan_id)
            .ok_or(EngineError::GrantNotFound)?;
        let plan = self.plan(plan_id)?;
        self.issue_locked(id, &mut guard, &plan, &overrides).await
    }

    async fn issue_locked(
        &self,
        id: Ulid,
        member: &mut MemberState,
        plan: &Plan,
        overrides: &GrantOverrides,
    ) -> Result<EntitlementGrant, EngineError> {
        if self.grant_index.contains_key(&id) {
            return Err(EngineError::DuplicateId);
        }
        let (grant, reset) = draft_grant(id, member.id, plan, overrides, self.clock.now())?;
        let event = Event::GrantIssued {
            grant: grant.clone(),
            reset,
        };
        self.persist_and_apply(&event, None, Some(member)).await?;

        metrics::counter!(
            observability::GRANTS_ISSUED_TOTAL,
            "payment_state" => grant.payment_state.as_str()
        )
        .increment(1);
        info!(
            grant = %grant.id,
            member = %grant.member_id,
            plan = %grant.plan_id,
            state = grant.payment_state.as_str(),
            "issued grant until {}",
            grant.end_date
        );
        Ok(grant)
    }

    /// Soft-invalidate a grant. Counters are left alone.
    pub async fn invalidate_grant(&self, member_id: Ulid, grant_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let member = self.member_handle(member_id)?;
        let mut guard = member.write().await;
        let grant = guard
            .grants
            .iter()
            .find(|g| g.id == grant_id)
            .ok_or(EngineError::GrantNotFound)?;
        if grant.is_invalidated() {
            debug!(grant = %grant_id, "grant already invalidated");
            return Ok(());
        }

        let event = Event::GrantInvalidated {
            id: grant_id,
            member_id,
            at: self.clock.now(),
        };
        self.persist_and_apply(&event, None, Some(&mut *guard)).await?;
        info!(grant = %grant_id, member = %member_id, "invalidated grant");
        Ok(())
    }

    /// Push the end date of the member's current grant out by `extra_days`.
    pub async fn extend_grant(
        &self,
        grant_id: Ulid,
        extra_days: u32,
    ) -> Result<EntitlementGrant, EngineError> {
        if extra_days == 0 || extra_days > MAX_EXTENSION_DAYS {
            return Err(EngineError::InvalidExtension {
                max: MAX_EXTENSION_DAYS,
            });
        }
        let _gate = self.write_gate.read().await;
        let member_id = self
            .grant_index
            .get(&grant_id)
            .map(|e| *e.value())
            .ok_or(EngineError::GrantNotFound)?;
        let member = self.member_handle(member_id)?;
        let mut guard = member.write().await;

        let now = self.clock.now();
        let current = guard.active_grants(now).into_iter().next();
        let Some(current) = current.filter(|g| g.id == grant_id) else {
            return Err(EngineError::NotCurrentGrant);
        };

        let end_date = shift(current.end_date, TimeDelta::days(i64::from(extra_days)))?;
        let event = Event::GrantExtended {
            id: grant_id,
            member_id,
            end_date,
        };
        self.persist_and_apply(&event, None, Some(&mut *guard)).await?;
        info!(grant = %grant_id, days = extra_days, "extended grant until {end_date}");

        guard
            .grants
            .iter()
            .find(|g| g.id == grant_id)
            .cloned()
            .ok_or(EngineError::GrantNotFound)
    }

    pub fn plan(&self, id: Ulid) -> Result<Plan, EngineError> {
        self.plans
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::PlanNotFound)
    }
}
