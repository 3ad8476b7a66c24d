use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames larger than this are treated as tail corruption before any
/// allocation happens; real events are at most a few hundred bytes.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Append-only write-ahead log holding the hotel's full history as a
/// sequence of framed events.
///
/// Frame layout: `[u32 le: payload len][bincode(Event)][u32 le: crc32 of
/// payload]`. A crash mid-write leaves at most one damaged frame at the
/// tail; replay drops it and everything after it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn append_handle(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_frame(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` means a clean end of log: EOF at a frame
/// boundary, a truncated tail, or a CRC/decode failure (anything after a
/// damaged frame is unreachable history and ignored).
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    match reader.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    let mut crc = [0u8; 4];
    for buf in [payload.as_mut_slice(), &mut crc] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(append_handle(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Single append with immediate fsync. Test convenience; the engine
    /// always batches via `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered frames and fsync the file. One call per group commit.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Phase one of compaction: write the replacement log to a sibling temp
    /// file and fsync it. Slow I/O, runs before touching the live log.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp = path.with_extension("wal.tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        for event in events {
            write_frame(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Phase two: atomically rename the temp file over the live log and
    /// reopen for appending. Fast, safe to do while holding up appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        self.writer = BufWriter::new(append_handle(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases back to back. Test convenience.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, RoomType, StayRange};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn room_created(id: Ulid) -> Event {
        Event::RoomCreated {
            id,
            number: "101".into(),
            room_type: RoomType::Double,
            rate_per_night: Decimal::new(10000, 2),
            capacity: 2,
            floor: 1,
        }
    }

    fn booking_created(room_id: Ulid) -> Event {
        Event::BookingCreated {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id,
            stay: StayRange::new(d(2024, 6, 1), d(2024, 6, 3)),
            booked_on: d(2024, 5, 1),
            total: Decimal::new(20000, 2),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            room_created(Ulid::new()),
            Event::UserRegistered {
                id: Ulid::new(),
                full_name: "Ana Silva".into(),
                email: "ana@example.com".into(),
                phone: "+244900000001".into(),
                birthday: d(1990, 3, 15),
                role: Role::Guest,
                password_hash: "$argon2id$stub".into(),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncation.wal");
        let event = room_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // simulate a crash mid-write of a second frame
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7, 0, 0, 0, 42, 42]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_rejects_oversized_frame() {
        let path = tmp_path("oversized.wal");
        let event = room_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // a corrupt length prefix claiming a 1 GiB payload
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(1u32 << 30).to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let event = Event::RoomDeleted { id: Ulid::new() };

        let payload = bincode::serialize(&event).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        drop(f);

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_shrinks_the_log() {
        let path = tmp_path("compact_reduce.wal");
        let rid = Ulid::new();

        // churn: bookings created and cancelled over and over
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(rid)).unwrap();
            for _ in 0..10 {
                let created = booking_created(rid);
                let Event::BookingCreated { id, .. } = created else {
                    unreachable!()
                };
                wal.append(&created).unwrap();
                wal.append(&Event::BookingStatusChanged {
                    id,
                    room_id: rid,
                    status: crate::model::BookingStatus::Cancelled,
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&[room_created(rid)]).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();

        assert!(after < before, "compacted log should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn append_after_compaction() {
        let path = tmp_path("compact_append.wal");
        let rid = Ulid::new();
        let snapshot = room_created(rid);
        let fresh = booking_created(rid);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&snapshot).unwrap();
            wal.compact(std::slice::from_ref(&snapshot)).unwrap();
            wal.append(&fresh).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, fresh]);
    }

    #[test]
    fn buffered_appends_flush_as_one_batch() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| room_created(Ulid::new())).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
