use chrono::{Local, NaiveDate};
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::password;
use crate::pricing;

use super::availability::is_available;
use super::{Engine, EngineError, apply_amend};

pub(super) fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Date-range policy for new and amended bookings: strictly positive length,
/// no retroactive check-in, bounded stay length.
pub(super) fn validate_stay(stay: &StayRange, as_of: NaiveDate) -> Result<(), EngineError> {
    if stay.check_in >= stay.check_out || stay.check_in < as_of {
        return Err(EngineError::InvalidDateRange);
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

impl Engine {
    // ── User directory ───────────────────────────────────────

    /// Register a new guest. Email and phone are unique across all users;
    /// the password is hashed before anything touches the store.
    pub async fn register_user(
        &self,
        full_name: String,
        email: String,
        phone: String,
        birthday: NaiveDate,
        password: &str,
    ) -> Result<User, EngineError> {
        let _commit = self.commit_gate.read().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if full_name.is_empty() || full_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("invalid name length"));
        }
        if email.is_empty() || email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("invalid email length"));
        }
        if phone.is_empty() || phone.len() > MAX_PHONE_LEN {
            return Err(EngineError::LimitExceeded("invalid phone length"));
        }

        let password_hash =
            password::hash(password).map_err(|e| EngineError::PasswordHash(e.to_string()))?;

        let id = Ulid::new();

        // Claim the unique keys first; unclaim on any later failure so a
        // failed registration leaves no trace.
        match self.emails.entry(email.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists("email")),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        match self.phones.entry(phone.clone()) {
            Entry::Occupied(_) => {
                self.emails.remove(&email);
                return Err(EngineError::AlreadyExists("phone"));
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let event = Event::UserRegistered {
            id,
            full_name: full_name.clone(),
            email: email.clone(),
            phone: phone.clone(),
            birthday,
            role: Role::Guest,
            password_hash: password_hash.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.emails.remove(&email);
            self.phones.remove(&phone);
            return Err(e);
        }

        let user = User {
            id,
            full_name,
            email,
            phone,
            birthday,
            role: Role::Guest,
            password_hash,
        };
        self.users.insert(id, user.clone());
        metrics::gauge!(crate::observability::USERS_ACTIVE).set(self.users.len() as f64);
        Ok(user)
    }

    /// Update a user's mutable profile fields. Email is the login identity
    /// and never changes.
    pub async fn update_user(
        &self,
        id: Ulid,
        full_name: String,
        phone: String,
        role: Role,
    ) -> Result<User, EngineError> {
        let _commit = self.commit_gate.read().await;
        if full_name.is_empty() || full_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("invalid name length"));
        }
        if phone.is_empty() || phone.len() > MAX_PHONE_LEN {
            return Err(EngineError::LimitExceeded("invalid phone length"));
        }
        let old_phone = match self.users.get(&id) {
            Some(u) => u.phone.clone(),
            None => return Err(EngineError::UnknownUser(id)),
        };

        let phone_changed = old_phone != phone;
        if phone_changed {
            match self.phones.entry(phone.clone()) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists("phone")),
                Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        let event = Event::UserUpdated {
            id,
            full_name: full_name.clone(),
            phone: phone.clone(),
            role,
        };
        if let Err(e) = self.wal_append(&event).await {
            if phone_changed {
                self.phones.remove(&phone);
            }
            return Err(e);
        }

        if phone_changed {
            self.phones.remove(&old_phone);
        }
        let mut user = self.users.get_mut(&id).ok_or(EngineError::UnknownUser(id))?;
        user.full_name = full_name;
        user.phone = phone;
        user.role = role;
        Ok(user.clone())
    }

    /// Delete a user. Refused while any active booking references them —
    /// history (cancelled/checked-out bookings) does not block deletion.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        // Exclusive gate: the active-booking scan walks the rooms one lock
        // at a time, so a concurrent create_booking could land on a room
        // already scanned. With the gate held no booking commit is in
        // flight, and none can start until the deletion is applied.
        let _quiesce = self.commit_gate.write().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::UnknownUser(id));
        }
        for rs in self.room_states() {
            let guard = rs.read().await;
            if guard
                .bookings
                .iter()
                .any(|b| b.user_id == id && b.status.is_active())
            {
                return Err(EngineError::HasActiveBookings(id));
            }
        }

        self.wal_append(&Event::UserDeleted { id }).await?;
        if let Some((_, user)) = self.users.remove(&id) {
            self.emails.remove(&user.email);
            self.phones.remove(&user.phone);
        }
        metrics::gauge!(crate::observability::USERS_ACTIVE).set(self.users.len() as f64);
        Ok(())
    }

    // ── Room catalog ─────────────────────────────────────────

    pub async fn create_room(
        &self,
        number: String,
        room_type: RoomType,
        rate_per_night: Decimal,
        capacity: u32,
        floor: i32,
    ) -> Result<Room, EngineError> {
        let _commit = self.commit_gate.read().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if number.is_empty() || number.len() > MAX_ROOM_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("invalid room number length"));
        }
        if rate_per_night.is_sign_negative() {
            return Err(EngineError::LimitExceeded("negative nightly rate"));
        }

        let id = Ulid::new();
        match self.room_numbers.entry(number.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists("room number")),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let event = Event::RoomCreated {
            id,
            number: number.clone(),
            room_type,
            rate_per_night,
            capacity,
            floor,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.room_numbers.remove(&number);
            return Err(e);
        }

        let room = Room {
            id,
            number,
            room_type,
            rate_per_night,
            capacity,
            floor,
        };
        self.rooms.insert(
            id,
            std::sync::Arc::new(tokio::sync::RwLock::new(RoomState::new(room.clone()))),
        );
        metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        self.notify.send(id, &event);
        Ok(room)
    }

    /// Update a room's number, type, rate, capacity or floor. The new rate
    /// applies to future bookings only; existing totals are not re-priced.
    pub async fn update_room(
        &self,
        id: Ulid,
        number: String,
        room_type: RoomType,
        rate_per_night: Decimal,
        capacity: u32,
        floor: i32,
    ) -> Result<Room, EngineError> {
        let _commit = self.commit_gate.read().await;
        if number.is_empty() || number.len() > MAX_ROOM_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("invalid room number length"));
        }
        if rate_per_night.is_sign_negative() {
            return Err(EngineError::LimitExceeded("negative nightly rate"));
        }
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        // The room can be deleted between the map lookup and the lock grant.
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let old_number = guard.room.number.clone();
        let number_changed = old_number != number;
        if number_changed {
            match self.room_numbers.entry(number.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::AlreadyExists("room number"));
                }
                Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        let event = Event::RoomUpdated {
            id,
            number: number.clone(),
            room_type,
            rate_per_night,
            capacity,
            floor,
        };
        if let Err(e) = self.persist_and_apply(id, &mut guard, &event).await {
            if number_changed {
                self.room_numbers.remove(&number);
            }
            return Err(e);
        }
        if number_changed {
            self.room_numbers.remove(&old_number);
        }
        Ok(guard.room.clone())
    }

    /// Delete a room. Refused while the room has active bookings; deleting
    /// a room drops its booking history with it.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.bookings.iter().any(|b| b.status.is_active()) {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.room_numbers.remove(&guard.room.number);
        for b in &guard.bookings {
            self.booking_to_room.remove(&b.id);
        }
        // Unmap while still holding the write lock: a create_booking that
        // already cloned this Arc re-checks the map after locking and must
        // see the room gone.
        self.rooms.remove(&id);
        drop(guard);
        metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// Book a room. The availability check and the insert run under the
    /// room's write lock — one atomic transaction — so two concurrent
    /// callers can never both see the room as free.
    pub async fn create_booking(
        &self,
        user_id: Ulid,
        room_id: Ulid,
        stay: StayRange,
    ) -> Result<Booking, EngineError> {
        self.create_booking_as_of(user_id, room_id, stay, today()).await
    }

    pub(super) async fn create_booking_as_of(
        &self,
        user_id: Ulid,
        room_id: Ulid,
        stay: StayRange,
        as_of: NaiveDate,
    ) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        validate_stay(&stay, as_of)?;
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::UnknownUser(user_id));
        }
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;
        // The room can be deleted between the map lookup and the lock grant.
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }

        // Re-checked inside the transaction: the lock was only just taken,
        // any earlier read may be stale.
        if !is_available(&guard, &stay, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::RoomUnavailable(room_id));
        }

        let id = Ulid::new();
        let total = pricing::total(guard.room.rate_per_night, &stay);
        let event = Event::BookingCreated {
            id,
            user_id,
            room_id,
            stay,
            booked_on: as_of,
            total,
        };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);

        Ok(guard
            .find_booking(id)
            .cloned()
            .expect("booking just inserted"))
    }

    async fn transition(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        action: &'static str,
    ) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (room_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let from = guard
            .find_booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .status;
        if !from.allows(to) {
            return Err(EngineError::InvalidTransition { from, action });
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            room_id,
            status: to,
        };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        Ok(guard
            .find_booking(booking_id)
            .cloned()
            .expect("booking present under lock"))
    }

    /// PENDING → CONFIRMED (e.g. after payment acceptance).
    pub async fn confirm_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, BookingStatus::Confirmed, "confirm").await
    }

    /// PENDING | CONFIRMED → CHECKED_IN.
    pub async fn check_in_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, BookingStatus::CheckedIn, "check in").await
    }

    /// CHECKED_IN → CHECKED_OUT (terminal).
    pub async fn check_out_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, BookingStatus::CheckedOut, "check out").await
    }

    /// PENDING | CONFIRMED → CANCELLED (terminal). Cancelling twice is an
    /// InvalidTransition, not a silent no-op.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .transition(booking_id, BookingStatus::Cancelled, "cancel")
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Change a booking's dates, room, or both. Only PENDING/CONFIRMED
    /// bookings can be amended. Availability is re-checked inside the
    /// transaction, excluding the booking's own current row, and the total
    /// is re-priced against the target room's rate.
    pub async fn update_booking(
        &self,
        booking_id: Ulid,
        new_room_id: Ulid,
        new_stay: StayRange,
    ) -> Result<Booking, EngineError> {
        self.update_booking_as_of(booking_id, new_room_id, new_stay, today())
            .await
    }

    pub(super) async fn update_booking_as_of(
        &self,
        booking_id: Ulid,
        new_room_id: Ulid,
        new_stay: StayRange,
        as_of: NaiveDate,
    ) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        validate_stay(&new_stay, as_of)?;
        let old_room_id = self
            .room_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;

        if old_room_id == new_room_id {
            let rs = self
                .get_room(&old_room_id)
                .ok_or(EngineError::NotFound(old_room_id))?;
            let mut guard = rs.write().await;
            if !self.rooms.contains_key(&old_room_id) {
                return Err(EngineError::NotFound(old_room_id));
            }
            self.check_amendable(&guard, booking_id)?;
            if !is_available(&guard, &new_stay, Some(booking_id)) {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::RoomUnavailable(new_room_id));
            }
            let total = pricing::total(guard.room.rate_per_night, &new_stay);
            let event = Event::BookingAmended {
                id: booking_id,
                room_id: new_room_id,
                stay: new_stay,
                total,
            };
            self.wal_append(&event).await?;
            apply_amend(
                &mut guard,
                None,
                booking_id,
                new_room_id,
                new_stay,
                total,
                &self.booking_to_room,
            );
            self.notify.send(old_room_id, &event);
            return Ok(guard
                .find_booking(booking_id)
                .cloned()
                .expect("booking present under lock"));
        }

        // Room move: lock both rooms in sorted id order to stay deadlock-free.
        let from_arc = self
            .get_room(&old_room_id)
            .ok_or(EngineError::NotFound(old_room_id))?;
        let to_arc = self
            .get_room(&new_room_id)
            .ok_or(EngineError::NotFound(new_room_id))?;
        let (mut from, mut to) = if old_room_id < new_room_id {
            let from = from_arc.write_owned().await;
            let to = to_arc.write_owned().await;
            (from, to)
        } else {
            let to = to_arc.write_owned().await;
            let from = from_arc.write_owned().await;
            (from, to)
        };

        // Either room can be deleted between the map lookups and the grants.
        if !self.rooms.contains_key(&old_room_id) {
            return Err(EngineError::NotFound(old_room_id));
        }
        if !self.rooms.contains_key(&new_room_id) {
            return Err(EngineError::NotFound(new_room_id));
        }
        self.check_amendable(&from, booking_id)?;
        if to.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if !is_available(&to, &new_stay, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::RoomUnavailable(new_room_id));
        }

        let total = pricing::total(to.room.rate_per_night, &new_stay);
        let event = Event::BookingAmended {
            id: booking_id,
            room_id: new_room_id,
            stay: new_stay,
            total,
        };
        self.wal_append(&event).await?;
        apply_amend(
            &mut from,
            Some(&mut to),
            booking_id,
            new_room_id,
            new_stay,
            total,
            &self.booking_to_room,
        );
        self.notify.send(old_room_id, &event);
        self.notify.send(new_room_id, &event);
        Ok(to
            .find_booking(booking_id)
            .cloned()
            .expect("booking present under lock"))
    }

    fn check_amendable(&self, rs: &RoomState, booking_id: Ulid) -> Result<(), EngineError> {
        let booking = rs
            .find_booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match booking.status {
            BookingStatus::Pending | BookingStatus::Confirmed => Ok(()),
            from => Err(EngineError::InvalidTransition { from, action: "amend" }),
        }
    }

    pub(super) fn room_states(&self) -> Vec<super::SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }
}
