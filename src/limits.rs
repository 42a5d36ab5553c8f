//! Hard input limits. Anything above these is rejected with `LimitExceeded`.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 1024;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Upper bound for a single `extend_grant` call (ten years).
pub const MAX_EXTENSION_DAYS: u32 = 3650;
/// Upper bound for a plan's normalized duration (a hundred years).
pub const MAX_PLAN_DURATION_DAYS: u32 = 36_500;

pub const MAX_FACILITY_CAPACITY: u32 = 10_000;
