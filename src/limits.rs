use crate::model::{DAY_MS, MINUTE_MS, Ms};

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_SESSIONS_PER_TUTOR: usize = 20_000;
pub const MAX_STUDENTS_PER_SESSION: usize = 500;
pub const MAX_ALLOCATION_CHANGES: usize = 256;
pub const MAX_MERGE_SESSIONS: usize = 64;

/// Largest encoded journal record accepted on replay.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;

/// Reasons, descriptions and clarification texts must carry at least this many characters.
pub const MIN_TEXT_LEN: usize = 10;

/// 2000-01-01 .. 2100-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_SESSION_DURATION_MS: Ms = DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * DAY_MS;

/// A reschedule must start at least this far in the future.
pub const MIN_RESCHEDULE_LEAD_MS: Ms = MINUTE_MS;
