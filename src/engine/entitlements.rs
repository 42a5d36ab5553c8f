use std::cmp::Reverse;

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl MemberState {
    /// Non-invalidated grants that have not ended, newest first.
    /// Grants created at the same instant keep reverse issuance order.
    pub fn active_grants(&self, now: NaiveDateTime) -> Vec<EntitlementGrant> {
        let mut active: Vec<_> = self
            .grants
            .iter()
            .rev()
            .filter(|g| g.is_valid_at(now))
            .cloned()
            .collect();
        active.sort_by_key(|g| Reverse(g.created_at));
        active
    }

    /// Most recently created grant, valid or not.
    pub fn latest_grant(&self) -> Option<&EntitlementGrant> {
        // max_by_key keeps the last of equal keys, i.e. the latest issued.
        self.grants.iter().max_by_key(|g| g.created_at)
    }

    /// Expired when the latest grant has ended or was invalidated.
    /// A member with no grants at all has nothing to be entitled by.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        match self.latest_grant() {
            Some(g) => g.end_date < now || g.is_invalidated(),
            None => true,
        }
    }

    /// Full grant history, newest first.
    pub fn grant_history(&self) -> Vec<EntitlementGrant> {
        let mut all: Vec<_> = self.grants.iter().rev().cloned().collect();
        all.sort_by_key(|g| Reverse(g.created_at));
        all
    }
}

impl Engine {
    /// Valid grants for the member, newest first. Empty means no entitlement.
    pub async fn has_active_grant(&self, member_id: Ulid) -> Result<Vec<EntitlementGrant>, EngineError> {
        let member = self.member_handle(member_id)?;
        let guard = member.read().await;
        Ok(guard.active_grants(self.clock.now()))
    }

    pub async fn latest_grant(&self, member_id: Ulid) -> Result<Option<EntitlementGrant>, EngineError> {
        let member = self.member_handle(member_id)?;
        let guard = member.read().await;
        Ok(guard.latest_grant().cloned())
    }

    pub async fn is_expired(&self, member_id: Ulid) -> Result<bool, EngineError> {
        let member = self.member_handle(member_id)?;
        let guard = member.read().await;
        Ok(guard.is_expired(self.clock.now()))
    }

    pub async fn grant_history(&self, member_id: Ulid) -> Result<Vec<EntitlementGrant>, EngineError> {
        let member = self.member_handle(member_id)?;
        let guard = member.read().await;
        Ok(guard.grant_history())
    }
}
