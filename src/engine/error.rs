use ulid::Ulid;

use crate::model::BookingStatus;

/// Typed failures crossing the engine boundary. Callers never see raw store
/// errors; everything is wrapped into one of these.
#[derive(Debug)]
pub enum EngineError {
    /// Check-in not strictly before check-out, retroactive check-in, or a
    /// stay longer than the allowed maximum.
    InvalidDateRange,
    /// The booking's current status does not permit the requested action.
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    /// An active booking already occupies the room for part of the range.
    RoomUnavailable(Ulid),
    NotFound(Ulid),
    UnknownUser(Ulid),
    /// A unique field (email, phone, room number) is already taken.
    AlreadyExists(&'static str),
    /// The room or user still has active bookings and cannot be deleted.
    HasActiveBookings(Ulid),
    LimitExceeded(&'static str),
    /// Password hashing failed; registration is aborted.
    PasswordHash(String),
    /// The durable store rejected or lost the write. Nothing was applied.
    WalError(String),
    /// The durable store did not acknowledge within the timeout. Nothing
    /// was applied.
    StoreTimeout,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDateRange => {
                write!(f, "invalid date range: check-in must be today or later and before check-out")
            }
            EngineError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a booking in status {from:?}")
            }
            EngineError::RoomUnavailable(id) => {
                write!(f, "room {id} is not available for the requested dates")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownUser(id) => write!(f, "unknown user: {id}"),
            EngineError::AlreadyExists(field) => write!(f, "{field} already in use"),
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete {id}: active bookings reference it")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::PasswordHash(e) => write!(f, "password hashing failed: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::StoreTimeout => write!(f, "store did not acknowledge in time"),
        }
    }
}

impl std::error::Error for EngineError {}
