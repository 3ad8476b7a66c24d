mod availability;
mod error;
mod mutations;
mod queries;

pub use availability::{free_ranges, is_available, merge_overlapping};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::WAL_APPEND_TIMEOUT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block on the first append, drain whatever else is already queued, then
/// fsync once for the whole batch and ack every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        // A non-append command in the queue cuts the batch: it must see the
        // batch's events on disk before it runs.
        let pending = loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => break Some(other),
                Err(_) => break None,
            }
        };

        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = pending {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine: the hotel's entire state, rebuilt from the WAL on
/// open. Each room is an independently lockable unit; a room's write lock is
/// the transaction boundary for every check-then-write on that room.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Unique-key indexes.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) phones: DashMap<String, Ulid>,
    pub(super) room_numbers: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation for the span of its append+apply;
    /// held exclusively by compaction and user deletion, which must observe
    /// a store with no commit in flight.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a room-scoped event to a RoomState (no locking — caller holds the lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            user_id,
            room_id,
            stay,
            booked_on,
            total,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                user_id: *user_id,
                room_id: *room_id,
                stay: *stay,
                booked_on: *booked_on,
                status: BookingStatus::Pending,
                total: *total,
            });
            booking_index.insert(*id, *room_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = rs.find_booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::RoomUpdated {
            id,
            number,
            room_type,
            rate_per_night,
            capacity,
            floor,
        } => {
            rs.room = Room {
                id: *id,
                number: number.clone(),
                room_type: *room_type,
                rate_per_night: *rate_per_night,
                capacity: *capacity,
                floor: *floor,
            };
        }
        // Everything else is handled at the engine map level.
        _ => {}
    }
}

/// Move/re-date a booking. `to` is None when the booking stays in its room.
fn apply_amend(
    from: &mut RoomState,
    to: Option<&mut RoomState>,
    id: Ulid,
    new_room_id: Ulid,
    stay: StayRange,
    total: rust_decimal::Decimal,
    booking_index: &DashMap<Ulid, Ulid>,
) {
    let Some(mut booking) = from.remove_booking(id) else {
        return;
    };
    booking.room_id = new_room_id;
    booking.stay = stay;
    booking.total = total;
    match to {
        Some(target) => target.insert_booking(booking),
        None => from.insert_booking(booking),
    }
    booking_index.insert(id, new_room_id);
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            phones: DashMap::new(),
            room_numbers: DashMap::new(),
            booking_to_room: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };

        // Replay — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use
        // blocking_read/blocking_write here because this may run inside an
        // async context.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                full_name,
                email,
                phone,
                birthday,
                role,
                password_hash,
            } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        full_name: full_name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                        birthday: *birthday,
                        role: *role,
                        password_hash: password_hash.clone(),
                    },
                );
                self.emails.insert(email.clone(), *id);
                self.phones.insert(phone.clone(), *id);
            }
            Event::UserUpdated {
                id,
                full_name,
                phone,
                role,
            } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    if user.phone != *phone {
                        self.phones.remove(&user.phone);
                        self.phones.insert(phone.clone(), *id);
                    }
                    user.full_name = full_name.clone();
                    user.phone = phone.clone();
                    user.role = *role;
                }
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.emails.remove(&user.email);
                    self.phones.remove(&user.phone);
                }
            }
            Event::RoomCreated {
                id,
                number,
                room_type,
                rate_per_night,
                capacity,
                floor,
            } => {
                let room = Room {
                    id: *id,
                    number: number.clone(),
                    room_type: *room_type,
                    rate_per_night: *rate_per_night,
                    capacity: *capacity,
                    floor: *floor,
                };
                self.room_numbers.insert(number.clone(), *id);
                self.rooms.insert(*id, Arc::new(RwLock::new(RoomState::new(room))));
            }
            Event::RoomUpdated { id, number, .. } => {
                if let Some(entry) = self.rooms.get(id) {
                    let rs_arc = entry.clone();
                    let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                    if guard.room.number != *number {
                        self.room_numbers.remove(&guard.room.number);
                        self.room_numbers.insert(number.clone(), *id);
                    }
                    apply_to_room(&mut guard, event, &self.booking_to_room);
                }
            }
            Event::RoomDeleted { id } => {
                if let Some((_, rs)) = self.rooms.remove(id) {
                    let guard = rs.try_read().expect("replay: uncontended read");
                    self.room_numbers.remove(&guard.room.number);
                    for b in &guard.bookings {
                        self.booking_to_room.remove(&b.id);
                    }
                }
            }
            Event::BookingCreated { room_id, .. } | Event::BookingStatusChanged { room_id, .. } => {
                if let Some(entry) = self.rooms.get(room_id) {
                    let rs_arc = entry.clone();
                    let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                    apply_to_room(&mut guard, event, &self.booking_to_room);
                }
            }
            Event::BookingAmended {
                id,
                room_id,
                stay,
                total,
            } => {
                let Some(old_room_id) = self.booking_to_room.get(id).map(|e| *e.value()) else {
                    return;
                };
                let Some(from_arc) = self.get_room(&old_room_id) else {
                    return;
                };
                let mut from = from_arc.try_write().expect("replay: uncontended write");
                if old_room_id == *room_id {
                    apply_amend(&mut from, None, *id, *room_id, *stay, *total, &self.booking_to_room);
                } else if let Some(to_arc) = self.get_room(room_id) {
                    let mut to = to_arc.try_write().expect("replay: uncontended write");
                    apply_amend(
                        &mut from,
                        Some(&mut to),
                        *id,
                        *room_id,
                        *stay,
                        *total,
                        &self.booking_to_room,
                    );
                }
            }
        }
    }

    /// Write an event to the WAL via the background group-commit writer.
    /// A write the store never acknowledges within the timeout surfaces as
    /// `StoreTimeout`; the caller applies nothing in that case.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        match tokio::time::timeout(WAL_APPEND_TIMEOUT, rx).await {
            Err(_) => Err(EngineError::StoreTimeout),
            Ok(Err(_)) => Err(EngineError::WalError("WAL writer dropped response".into())),
            Ok(Ok(result)) => result.map_err(|e| EngineError::WalError(e.to_string())),
        }
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_id_by_number(&self, number: &str) -> Option<Ulid> {
        self.room_numbers.get(number).map(|e| *e.value())
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call — the transactional commit
    /// for a room-scoped event. The caller holds the room's write lock, so
    /// a failure before or during the append leaves the room untouched.
    pub(super) async fn persist_and_apply(
        &self,
        room_id: Ulid,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room);
        self.notify.send(room_id, event);
        Ok(())
    }

    /// Lookup booking → room, get room, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        Ok((room_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: users, rooms, then each room's ledger.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: every acked append has been applied to the maps,
        // and no new append can enter until the rewrite command is queued.
        // An event flushed to the old file but absent from this snapshot
        // would otherwise be thrown away by the rewrite.
        let _quiesce = self.commit_gate.write().await;

        let mut events = Vec::new();

        for entry in self.users.iter() {
            let u = entry.value();
            events.push(Event::UserRegistered {
                id: u.id,
                full_name: u.full_name.clone(),
                email: u.email.clone(),
                phone: u.phone.clone(),
                birthday: u.birthday,
                role: u.role,
                password_hash: u.password_hash.clone(),
            });
        }

        for rs in self.room_states() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.room.id,
                number: guard.room.number.clone(),
                room_type: guard.room.room_type,
                rate_per_night: guard.room.rate_per_night,
                capacity: guard.room.capacity,
                floor: guard.room.floor,
            });
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    user_id: b.user_id,
                    room_id: b.room_id,
                    stay: b.stay,
                    booked_on: b.booked_on,
                    total: b.total,
                });
                if b.status != BookingStatus::Pending {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        room_id: b.room_id,
                        status: b.status,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
