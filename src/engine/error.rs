use crate::model::Slot;

/// Coarse category a caller can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("facility not found")]
    FacilityNotFound,
    #[error("member not found")]
    MemberNotFound,
    #[error("plan not found")]
    PlanNotFound,
    #[error("subscription not found")]
    GrantNotFound,
    #[error("reservation not found")]
    ReservationNotFound,

    #[error("this facility does not accept member reservations")]
    ReservationsDisabled,
    #[error("slot {0} is not on the facility's schedule for that day")]
    SlotOffGrid(Slot),
    #[error("slot {slot} is fully booked ({capacity} of {capacity} taken)")]
    SlotFullyBooked { slot: Slot, capacity: u32 },
    #[error("no reservations left on the current subscription ({used} of {allowed} used)")]
    AllowanceExhausted { allowed: u32, used: u32 },
    #[error("weekday does not match the requested date")]
    WeekdayMismatch,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(&'static str),
    #[error("paid amount {paid} exceeds plan price {price}")]
    PaidAmountExceedsPrice { paid: u64, price: u64 },
    #[error("end date is before start date")]
    InvalidWindow,
    #[error("date is outside the supported calendar range")]
    DateOutOfRange,
    #[error("only the member's current subscription can be extended")]
    NotCurrentGrant,
    #[error("extension must be between 1 and {max} days")]
    InvalidExtension { max: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("id is already in use")]
    DuplicateId,

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::FacilityNotFound
            | EngineError::MemberNotFound
            | EngineError::PlanNotFound
            | EngineError::GrantNotFound
            | EngineError::ReservationNotFound => ErrorKind::NotFound,
            EngineError::ReservationsDisabled
            | EngineError::SlotOffGrid(_)
            | EngineError::SlotFullyBooked { .. }
            | EngineError::AllowanceExhausted { .. }
            | EngineError::WeekdayMismatch
            | EngineError::InvalidSchedule(_)
            | EngineError::PaidAmountExceedsPrice { .. }
            | EngineError::InvalidWindow
            | EngineError::DateOutOfRange
            | EngineError::NotCurrentGrant
            | EngineError::InvalidExtension { .. }
            | EngineError::LimitExceeded(_)
            | EngineError::DuplicateId => ErrorKind::BadRequest,
            EngineError::Storage(_) => ErrorKind::Internal,
        }
    }
}
