use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_DAYS;
use crate::model::*;
use crate::password;

use super::availability::{free_ranges, is_available};
use super::{Engine, EngineError};

impl Engine {
    /// Look up a booking by id across all rooms.
    pub async fn find_booking(&self, booking_id: Ulid) -> Option<Booking> {
        let room_id = self.room_for_booking(&booking_id)?;
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        guard.find_booking(booking_id).cloned()
    }

    /// Every booking in the system, ordered by check-in date (ties broken
    /// by booking id so the order is stable).
    pub async fn list_all_bookings(&self) -> Vec<Booking> {
        let mut out = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().cloned());
        }
        out.sort_by(|a, b| a.stay.check_in.cmp(&b.stay.check_in).then(a.id.cmp(&b.id)));
        out
    }

    /// A user's bookings, most recent check-in first.
    pub async fn list_bookings_by_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| b.user_id == user_id).cloned());
        }
        out.sort_by(|a, b| b.stay.check_in.cmp(&a.stay.check_in).then(b.id.cmp(&a.id)));
        out
    }

    /// Point-in-time availability check. Advisory only: the authoritative
    /// check happens again under the room lock when a booking is created.
    pub async fn is_room_available(&self, room_id: Ulid, stay: &StayRange) -> bool {
        let Some(rs) = self.get_room(&room_id) else {
            return false;
        };
        let guard = rs.read().await;
        is_available(&guard, stay, None)
    }

    /// Maximal free date ranges for a room within a bounded window.
    pub async fn free_ranges(
        &self,
        room_id: Ulid,
        window: &StayRange,
    ) -> Result<Vec<StayRange>, EngineError> {
        if window.check_in >= window.check_out {
            return Err(EngineError::InvalidDateRange);
        }
        if window.nights() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(free_ranges(&guard, window))
    }

    /// Room catalog sorted by room number.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut out = Vec::new();
        for rs in self.room_states() {
            out.push(rs.read().await.room.clone());
        }
        out.sort_by(|a, b| a.number.cmp(&b.number));
        out
    }

    pub fn get_user(&self, id: Ulid) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn get_user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(email)?.value();
        self.get_user(id)
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut out: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.email.cmp(&b.email));
        out
    }

    /// Verify credentials. Returns the user on success; an unknown email
    /// and a wrong password are indistinguishable to the caller.
    pub fn authenticate(&self, email: &str, password: &str) -> Option<User> {
        let user = self.get_user_by_email(email);
        match user {
            Some(u) if password::verify(password, &u.password_hash) => Some(u),
            _ => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                None
            }
        }
    }
}
