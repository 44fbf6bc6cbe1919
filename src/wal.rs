use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Events per frame when writing a compacted snapshot.
const COMPACT_FRAME_EVENTS: usize = 1024;

/// Encode one batch to [len][bincode][crc32] format. The frame is built in
/// memory first so a failed serialization never leaves half a frame behind.
fn encode_batch(writer: &mut impl Write, batch: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(batch).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "batch too large for one frame"))?;
    let crc = crc32fast::hash(&payload);
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    writer.write_all(&frame)?;
    Ok(frame.len() as u64)
}

/// Append-only Write-Ahead Log.
///
/// Format per frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - One frame holds every event of one committed transaction.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt trailing frame is discarded on replay and truncated on
///   open, so a transaction is either fully on disk or absent.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    pending_len: u64,
    appends_since_compact: u64,
    /// Set when a rollback fails: the file may hold frames nobody committed,
    /// so every later write is refused until the WAL is reopened.
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the WAL at `path`, returning the committed batches
    /// found on disk. Anything after the last valid frame is cut off.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Vec<Event>>)> {
        let (batches, valid_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %path.display(),
                discarded = on_disk - valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: valid_len,
            pending_len: 0,
            appends_since_compact: 0,
            poisoned: false,
        };
        Ok((wal, batches))
    }

    /// Append one batch and fsync. Used by tests only; the journal writer
    /// uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, batch: &[Event]) -> io::Result<()> {
        self.append_buffered(batch)?;
        self.flush_sync()
    }

    /// Buffer one batch as a single frame without flushing or syncing.
    pub fn append_buffered(&mut self, batch: &[Event]) -> io::Result<()> {
        self.check_poisoned()?;
        self.pending_len += encode_batch(&mut self.writer, batch)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_len;
        self.pending_len = 0;
        Ok(())
    }

    /// Drop everything buffered or written since the last successful
    /// `flush_sync`, so a failed group commit can be retried without
    /// leaving duplicate or torn frames in the file. If the rollback itself
    /// fails the WAL is poisoned and refuses every later write.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_synced();
        self.poisoned |= result.is_err();
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unflushed buffer instead of writing it.
        let (_, _unwritten) = stale.into_parts();
        self.writer.get_ref().set_len(self.synced_len)?;
        self.writer.get_ref().sync_all()?;
        self.pending_len = 0;
        Ok(())
    }

    fn check_poisoned(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback; reopen to recover"));
        }
        Ok(())
    }

    /// Write a snapshot to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<u64> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        let mut len = 0;
        for chunk in events.chunks(COMPACT_FRAME_EVENTS) {
            len += encode_batch(&mut writer, chunk)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(len)
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self, compacted_len: u64) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.synced_len = compacted_len;
        self.pending_len = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a snapshot that recreates the current state.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        self.check_poisoned()?;
        let len = Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file(len)
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid batches in commit order.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        scan(path).map(|(batches, _)| batches)
    }
}

/// Read frames until EOF or the first torn/corrupt one. Returns the decoded
/// batches and the byte length they cover.
fn scan(path: &Path) -> io::Result<(Vec<Vec<Event>>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut batches = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if valid_len + 8 + len as u64 > file_len {
            break; // torn length or payload
        }

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }

        match bincode::deserialize::<Vec<Event>>(&payload) {
            Ok(batch) => batches.push(batch),
            Err(_) => break,
        }
        valid_len += len as u64 + 8;
    }

    Ok((batches, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorcal_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn policy_event(teacher_id: Ulid) -> Event {
        Event::PolicySet {
            teacher_id,
            policy: SchedulingPolicy::default(),
        }
    }

    fn credit_event(student_id: Ulid, delta: i64) -> Event {
        Event::CreditsAdjusted {
            student_id,
            entry: CreditEntry {
                at: NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(8, 0, 0)
                    .unwrap(),
                delta,
                reason: CreditReason::Grant,
                class_id: None,
                note: None,
            },
        }
    }

    #[test]
    fn append_and_replay_batches() {
        let path = tmp_path("append_and_replay.wal");
        let student = Ulid::new();
        let first = vec![policy_event(Ulid::new())];
        let second = vec![credit_event(student, 3), credit_event(student, -1)];

        {
            let (mut wal, existing) = Wal::open(&path).unwrap();
            assert!(existing.is_empty());
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated() {
        let path = tmp_path("truncation.wal");
        let batch = vec![policy_event(Ulid::new())];

        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&batch).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![batch.clone()]);

        // Reopening cuts the garbage so later frames stay reachable.
        let next = vec![credit_event(Ulid::new(), 2)];
        {
            let (mut wal, existing) = Wal::open(&path).unwrap();
            assert_eq!(existing, vec![batch.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            wal.append(&next).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![batch, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&vec![policy_event(Ulid::new())]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unsynced_frames() {
        let path = tmp_path("rollback.wal");
        let kept = vec![policy_event(Ulid::new())];
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&[credit_event(Ulid::new(), 1)]).unwrap();
            wal.rollback().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_rollback_refuses_retries() {
        let path = tmp_path("poisoned.wal");
        let moved = tmp_path("poisoned.wal.moved");
        let kept = vec![policy_event(Ulid::new())];
        let retried = vec![credit_event(Ulid::new(), -1)];

        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        // The frame reaches the file but is never synced or acknowledged.
        wal.append_buffered(&retried).unwrap();
        wal.writer.flush().unwrap();

        fs::rename(&path, &moved).unwrap();
        assert!(wal.rollback().is_err());
        fs::rename(&moved, &path).unwrap();

        // A retry of the same batch must not land a second copy.
        assert!(wal.append(&retried).is_err());
        assert!(wal.compact(&kept).is_err());
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone(), retried]);

        // Reopening clears the poison.
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let student = Ulid::new();
        let snapshot = vec![credit_event(student, 5)];
        let after = vec![credit_event(student, -1)];

        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&[credit_event(student, 1), credit_event(student, -1)]).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&after).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn large_snapshot_is_split_into_frames() {
        let path = tmp_path("compact_chunks.wal");
        let student = Ulid::new();
        let snapshot: Vec<Event> = (0..(COMPACT_FRAME_EVENTS + 10))
            .map(|_| credit_event(student, 1))
            .collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed.concat(), snapshot);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let batches: Vec<Vec<Event>> = (0..5).map(|_| vec![policy_event(Ulid::new())]).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for b in &batches {
                wal.append_buffered(b).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), batches);
        let _ = fs::remove_file(&path);
    }
}
