//! Hard caps protecting the engine from unbounded input.

use std::time::Duration;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 50_000;

/// From the registration form rules: names are at most 50 characters.
pub const MAX_NAME_LEN: usize = 50;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_ROOM_NUMBER_LEN: usize = 16;

/// Longest bookable stay.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Widest window accepted by free-range queries.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 2 * 365;

/// A WAL append that takes longer than this aborts the operation and
/// surfaces a store timeout; no state is applied.
pub const WAL_APPEND_TIMEOUT: Duration = Duration::from_secs(5);
