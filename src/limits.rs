use crate::model::Ms;

/// Shortest slot a user may create, in minutes.
pub const MIN_DURATION_MIN: i64 = 5;
/// Longest slot a user may create, in minutes (one day).
pub const MAX_DURATION_MIN: i64 = 24 * 60;

/// 0001-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = -62_135_596_800_000;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Widest free/busy or bucket window: 366 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
pub const MAX_BUCKETS: usize = 10_000;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 1_000;

pub const MAX_SLOTS_PER_CALENDAR: usize = 100_000;
pub const MAX_PARTICIPANTS: usize = 256;
pub const MAX_TITLE_LEN: usize = 500;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
