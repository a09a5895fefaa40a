use crate::model::Ms;

pub const MAX_BOOKS_PER_LIBRARY: usize = 1_000_000;
pub const MAX_COPIES_PER_BOOK: u32 = 10_000;
/// Active (WAITING + AVAILABLE) reservations queued on a single title.
pub const MAX_QUEUED_RESERVATIONS: usize = 10_000;

pub const MAX_ISBN_LEN: usize = 13;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_AUTHOR_LEN: usize = 100;
pub const MAX_PUBLISHER_LEN: usize = 100;

pub const MAX_LIBRARIES: usize = 1_000;
pub const MAX_LIBRARY_NAME_LEN: usize = 256;

/// Max bytes in a single wire request line.
pub const MAX_REQUEST_LINE_LEN: usize = 64 * 1024;

/// Longest loan period and hold window a deployment may configure.
pub const MAX_LOAN_PERIOD_DAYS: u64 = 365;
pub const MAX_HOLD_WINDOW_HOURS: u64 = 30 * 24;

pub const DAY_MS: Ms = 86_400_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Reject timestamps before 2000-01-01 and after 2100-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
