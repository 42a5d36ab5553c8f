use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Money in minor units (cents).
pub type Money = u64;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day as minutes since midnight. `24:00` is a valid close time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotTime(u16);

impl SlotTime {
    pub const MIDNIGHT: SlotTime = SlotTime(0);
    pub const END_OF_DAY: SlotTime = SlotTime(MINUTES_PER_DAY);

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        u16::try_from(minutes)
            .ok()
            .filter(|m| *m <= MINUTES_PER_DAY)
            .map(SlotTime)
    }

    pub fn hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        hour.checked_mul(60)
            .and_then(|m| m.checked_add(minute))
            .and_then(Self::from_minutes)
    }

    pub fn minutes(self) -> u32 {
        u32::from(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?} (expected HH:MM)")]
pub struct ParseSlotTimeError(String);

impl FromStr for SlotTime {
    type Err = ParseSlotTimeError;

    /// Accepts `HH:MM` and `HH:MM:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSlotTimeError(s.to_string());
        let mut parts = s.trim().split(':');
        let hour: u32 = parts.next().and_then(|h| h.parse().ok()).ok_or_else(err)?;
        let minute: u32 = parts.next().and_then(|m| m.parse().ok()).ok_or_else(err)?;
        if let Some(sec) = parts.next()
            && sec != "00"
        {
            return Err(err());
        }
        if parts.next().is_some() {
            return Err(err());
        }
        SlotTime::hm(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// One bookable cell of a facility's daily grid, `[start, end)`.
///
/// An inverted pair can be built from client input; it never equals a grid
/// cell, so booking rejects it as off-grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: SlotTime,
    pub end: SlotTime,
}

impl Slot {
    pub fn new(start: SlotTime, end: SlotTime) -> Self {
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end.minutes().saturating_sub(self.start.minutes())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ── Facility schedule ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub weekday: Weekday,
    pub opens: bool,
    pub open: SlotTime,
    pub close: SlotTime,
}

impl DayHours {
    pub fn open(weekday: Weekday, open: SlotTime, close: SlotTime) -> Self {
        Self { weekday, opens: true, open, close }
    }

    pub fn closed(weekday: Weekday) -> Self {
        Self {
            weekday,
            opens: false,
            open: SlotTime::MIDNIGHT,
            close: SlotTime::MIDNIGHT,
        }
    }
}

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityScheduleConfig {
    pub id: Ulid,
    pub name: Option<String>,
    pub allows_user_reservations: bool,
    /// Indexed Monday-first.
    pub weekly_hours: [DayHours; 7],
    pub session_minutes: u32,
    pub max_per_slot: u32,
}

impl FacilityScheduleConfig {
    /// A facility that is closed every day until hours are set.
    pub fn new(id: Ulid, session_minutes: u32, max_per_slot: u32) -> Self {
        Self {
            id,
            name: None,
            allows_user_reservations: true,
            weekly_hours: WEEK.map(DayHours::closed),
            session_minutes,
            max_per_slot,
        }
    }

    pub fn hours_for(&self, weekday: Weekday) -> &DayHours {
        &self.weekly_hours[weekday.num_days_from_monday() as usize]
    }

    pub fn set_hours(&mut self, hours: DayHours) {
        self.weekly_hours[hours.weekday.num_days_from_monday() as usize] = hours;
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub member_id: Ulid,
    pub facility_id: Ulid,
    pub date: NaiveDate,
    pub slot: Slot,
    pub weekday: Weekday,
    pub notes: Option<String>,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

// ── Plans and grants ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Daily => "daily",
            PlanKind::Weekly => "weekly",
            PlanKind::Monthly => "monthly",
            PlanKind::Yearly => "yearly",
        }
    }
}

impl FromStr for PlanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(PlanKind::Daily),
            "weekly" => Ok(PlanKind::Weekly),
            "monthly" => Ok(PlanKind::Monthly),
            "yearly" => Ok(PlanKind::Yearly),
            other => Err(format!("unknown plan kind: {other}")),
        }
    }
}

/// A sellable subscription plan. `duration_units` is already normalized to days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Ulid,
    pub name: Option<String>,
    pub price: Money,
    pub duration_units: u32,
    pub kind: PlanKind,
    pub allowed_reservations: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    Paid,
    PartiallyPaid,
    Unpaid,
    Free,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Paid => "paid",
            PaymentState::PartiallyPaid => "partially_paid",
            PaymentState::Unpaid => "unpaid",
            PaymentState::Free => "free",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementGrant {
    pub id: Ulid,
    pub member_id: Ulid,
    pub plan_id: Ulid,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub paid_amount: Money,
    pub original_amount: Money,
    pub payment_state: PaymentState,
    pub paid_at: Option<NaiveDateTime>,
    pub invalidated_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl EntitlementGrant {
    pub fn is_invalidated(&self) -> bool {
        self.invalidated_at.is_some()
    }

    /// Valid = not invalidated and not yet ended.
    pub fn is_valid_at(&self, now: NaiveDateTime) -> bool {
        !self.is_invalidated() && self.end_date > now
    }
}

/// Counter write emitted by grant issuance: every new grant replaces the
/// member's allowance and zeroes usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceReset {
    pub member_id: Ulid,
    pub allowed_reservations: u32,
}

// ── Members ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: Ulid,
    pub name: Option<String>,
    pub allowed_reservations: u32,
    pub used_reservations: u32,
}

#[derive(Debug, Clone)]
pub struct MemberState {
    pub id: Ulid,
    pub name: Option<String>,
    pub allowed_reservations: u32,
    pub used_reservations: u32,
    /// Every grant ever issued, in issuance order.
    pub grants: Vec<EntitlementGrant>,
}

impl MemberState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            allowed_reservations: 0,
            used_reservations: 0,
            grants: Vec::new(),
        }
    }

    pub fn profile(&self) -> Member {
        Member {
            id: self.id,
            name: self.name.clone(),
            allowed_reservations: self.allowed_reservations,
            used_reservations: self.used_reservations,
        }
    }

    pub fn grant_mut(&mut self, id: Ulid) -> Option<&mut EntitlementGrant> {
        self.grants.iter_mut().find(|g| g.id == id)
    }
}

/// One flat event per state transition. This is the WAL record format.
///
/// A transition touching two aggregates (ledger + member counters) is a single
/// event so replay never observes half of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityConfigured {
        config: FacilityScheduleConfig,
    },
    PlanDefined {
        plan: Plan,
    },
    MemberRegistered {
        id: Ulid,
        name: Option<String>,
    },
    AllowanceSet {
        member_id: Ulid,
        allowed: u32,
        used: u32,
    },
    /// New reservation; consumes one allowance unit when active.
    ReservationBooked {
        reservation: Reservation,
    },
    ReservationMoved {
        id: Ulid,
        facility_id: Ulid,
        member_id: Ulid,
        slot: Slot,
        weekday: Weekday,
        notes: Option<String>,
        at: NaiveDateTime,
    },
    /// Soft delete; refunds one allowance unit.
    ReservationCancelled {
        id: Ulid,
        facility_id: Ulid,
        member_id: Ulid,
        at: NaiveDateTime,
    },
    GrantIssued {
        grant: EntitlementGrant,
        reset: AllowanceReset,
    },
    GrantInvalidated {
        id: Ulid,
        member_id: Ulid,
        at: NaiveDateTime,
    },
    GrantExtended {
        id: Ulid,
        member_id: Ulid,
        end_date: NaiveDateTime,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub slot: Slot,
    pub is_available: bool,
    pub current_reservations: u32,
    pub max_reservations: u32,
}
