use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay `[check_in, check_out)` — the checkout day itself is not
/// occupied, so a departure and an arrival can share a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "check-in must be before check-out");
        Self { check_in, check_out }
    }

    /// Number of occupied nights. At least 1 for any valid range.
    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.check_in <= day && day < self.check_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Guest,
    Employee,
    Administrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomType {
    Single,
    Double,
    Suite,
    Deluxe,
}

/// Booking lifecycle states. Pending, Confirmed and CheckedIn occupy the
/// room; CheckedOut and Cancelled are terminal and kept as history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl BookingStatus {
    /// Whether this status still occupies the room.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::CheckedIn)
    }

    /// The state machine: which transitions are legal.
    pub fn allows(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Pending, Self::CheckedIn)
                | (Self::Confirmed, Self::CheckedIn)
                | (Self::CheckedIn, Self::CheckedOut)
                | (Self::Pending, Self::Cancelled)
                | (Self::Confirmed, Self::Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub birthday: NaiveDate,
    pub role: Role,
    /// Argon2id PHC string. Never the plaintext password.
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    /// Unique human-facing number, e.g. "101".
    pub number: String,
    pub room_type: RoomType,
    pub rate_per_night: Decimal,
    pub capacity: u32,
    pub floor: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub stay: StayRange,
    pub booked_on: NaiveDate,
    pub status: BookingStatus,
    pub total: Decimal,
}

/// A room plus its full booking ledger, sorted by check-in date.
/// Terminal bookings stay in the ledger as history.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by check-in date.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.check_in, |b| b.stay.check_in)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove a booking by id (only when a booking moves room or dates).
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn find_booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn find_booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose stay overlaps the query range (any status).
    /// Binary search skips bookings checking in at or after the query end.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.check_in < query.check_out);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.check_out > query.check_in)
    }
}

/// The WAL record format — flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        full_name: String,
        email: String,
        phone: String,
        birthday: NaiveDate,
        role: Role,
        password_hash: String,
    },
    UserUpdated {
        id: Ulid,
        full_name: String,
        phone: String,
        role: Role,
    },
    UserDeleted {
        id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        number: String,
        room_type: RoomType,
        rate_per_night: Decimal,
        capacity: u32,
        floor: i32,
    },
    RoomUpdated {
        id: Ulid,
        number: String,
        room_type: RoomType,
        rate_per_night: Decimal,
        capacity: u32,
        floor: i32,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        user_id: Ulid,
        room_id: Ulid,
        stay: StayRange,
        booked_on: NaiveDate,
        total: Decimal,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
    },
    /// Date change, room move, or both. `room_id` is the room the booking
    /// lives in after the amendment.
    BookingAmended {
        id: Ulid,
        room_id: Ulid,
        stay: StayRange,
        total: Decimal,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn booking_for(stay: StayRange, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: Ulid::new(),
            stay,
            booked_on: d(2024, 1, 1),
            status,
            total: Decimal::new(10000, 2),
        }
    }

    fn room() -> Room {
        Room {
            id: Ulid::new(),
            number: "101".into(),
            room_type: RoomType::Double,
            rate_per_night: Decimal::new(10000, 2),
            capacity: 2,
            floor: 1,
        }
    }

    #[test]
    fn stay_basics() {
        let s = StayRange::new(d(2024, 6, 1), d(2024, 6, 4));
        assert_eq!(s.nights(), 3);
        assert!(s.contains_day(d(2024, 6, 1)));
        assert!(s.contains_day(d(2024, 6, 3)));
        assert!(!s.contains_day(d(2024, 6, 4))); // half-open
    }

    #[test]
    fn stay_overlap() {
        let a = StayRange::new(d(2024, 6, 1), d(2024, 6, 3));
        let b = StayRange::new(d(2024, 6, 2), d(2024, 6, 4));
        let c = StayRange::new(d(2024, 6, 3), d(2024, 6, 5));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // same-day turnover, not overlapping
    }

    #[test]
    fn status_active_set() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(BookingStatus::CheckedIn.is_active());
        assert!(!BookingStatus::CheckedOut.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn status_machine() {
        use BookingStatus::*;
        assert!(Pending.allows(Confirmed));
        assert!(Pending.allows(CheckedIn));
        assert!(Pending.allows(Cancelled));
        assert!(Confirmed.allows(CheckedIn));
        assert!(Confirmed.allows(Cancelled));
        assert!(CheckedIn.allows(CheckedOut));
        // no escape from terminal states
        assert!(!Cancelled.allows(Pending));
        assert!(!Cancelled.allows(Cancelled));
        assert!(!CheckedOut.allows(CheckedIn));
        assert!(!CheckedIn.allows(Cancelled)); // guests in the room can't be cancelled
    }

    #[test]
    fn ledger_insert_keeps_order() {
        let mut rs = RoomState::new(room());
        rs.insert_booking(booking_for(
            StayRange::new(d(2024, 6, 10), d(2024, 6, 12)),
            BookingStatus::Pending,
        ));
        rs.insert_booking(booking_for(
            StayRange::new(d(2024, 6, 1), d(2024, 6, 3)),
            BookingStatus::Pending,
        ));
        rs.insert_booking(booking_for(
            StayRange::new(d(2024, 6, 5), d(2024, 6, 8)),
            BookingStatus::Pending,
        ));
        assert_eq!(rs.bookings[0].stay.check_in, d(2024, 6, 1));
        assert_eq!(rs.bookings[1].stay.check_in, d(2024, 6, 5));
        assert_eq!(rs.bookings[2].stay.check_in, d(2024, 6, 10));
    }

    #[test]
    fn ledger_overlapping_query() {
        let mut rs = RoomState::new(room());
        rs.insert_booking(booking_for(
            StayRange::new(d(2024, 6, 1), d(2024, 6, 3)),
            BookingStatus::Pending,
        ));
        rs.insert_booking(booking_for(
            StayRange::new(d(2024, 6, 10), d(2024, 6, 12)),
            BookingStatus::Pending,
        ));

        let query = StayRange::new(d(2024, 6, 2), d(2024, 6, 5));
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stay.check_in, d(2024, 6, 1));
    }

    #[test]
    fn ledger_overlapping_adjacent_excluded() {
        // A booking checking out exactly on the query check-in does not overlap.
        let mut rs = RoomState::new(room());
        rs.insert_booking(booking_for(
            StayRange::new(d(2024, 6, 1), d(2024, 6, 3)),
            BookingStatus::Confirmed,
        ));
        let query = StayRange::new(d(2024, 6, 3), d(2024, 6, 5));
        assert_eq!(rs.overlapping(&query).count(), 0);
    }

    #[test]
    fn ledger_remove_booking() {
        let mut rs = RoomState::new(room());
        let b = booking_for(
            StayRange::new(d(2024, 6, 1), d(2024, 6, 3)),
            BookingStatus::Pending,
        );
        let id = b.id;
        rs.insert_booking(b);
        assert!(rs.remove_booking(id).is_some());
        assert!(rs.bookings.is_empty());
        assert!(rs.remove_booking(id).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: Ulid::new(),
            stay: StayRange::new(d(2024, 6, 1), d(2024, 6, 4)),
            booked_on: d(2024, 5, 20),
            total: Decimal::new(15000, 2),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
