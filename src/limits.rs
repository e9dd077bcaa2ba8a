//! Hard caps on input sizes and counts.

use crate::model::Ms;

pub const MAX_SERVERS: usize = 10_000;
pub const MAX_ACCOUNTS: usize = 100_000;
/// Active reservations per server. Terminal rows do not count.
pub const MAX_RESERVATIONS_PER_SERVER: usize = 100_000;

pub const MAX_SERVER_NAME_LEN: usize = 255;
pub const MAX_USERNAME_LEN: usize = 63;
pub const MAX_PASSWORD_LEN: usize = 256;
pub const MAX_CONNECTION_FIELD_LEN: usize = 1024;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// One leap year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// How many times a write re-resolves a reservation that moved servers
/// between the index lookup and acquiring the row lock.
pub const MAX_LOCK_ATTEMPTS: usize = 8;
