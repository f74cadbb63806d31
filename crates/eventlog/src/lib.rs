//! Append-only event log — the canonical history of every run.
//!
//! One active JSONL segment plus a dated archive directory. `seq` is
//! globally monotonic across rotations. The writer is exclusive; the
//! active segment is read under a shared lock, archived segments without
//! any lock (they are immutable once renamed).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use ab_domain::config::LogRotation;
use ab_domain::event::{Event, EventFilter};
use ab_domain::{Error, Result};

const ACTIVE_FILE: &str = "events.jsonl";
const ARCHIVE_DIR: &str = "archive";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ActiveSegment {
    file: File,
    bytes: u64,
    /// First seq written to this segment (names the archive on rotation).
    first_seq: u64,
}

pub struct EventLog {
    dir: PathBuf,
    rotation: LogRotation,
    /// Exclusive for append/rotate, shared for reading the active segment.
    active: RwLock<ActiveSegment>,
    next_seq: AtomicU64,
}

impl EventLog {
    /// Open (or create) the log in `dir`, resuming `seq` from whatever is
    /// already on disk.
    pub fn open(dir: &Path, rotation: LogRotation) -> Result<Self> {
        std::fs::create_dir_all(dir.join(ARCHIVE_DIR))?;

        let active_path = dir.join(ACTIVE_FILE);
        let resume_seq = last_seq_on_disk(dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let bytes = file.metadata()?.len();
        let first_seq = first_seq_in_file(&active_path)?.unwrap_or(resume_seq + 1);

        tracing::debug!(
            dir = %dir.display(),
            resume_seq,
            active_bytes = bytes,
            "event log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            rotation,
            active: RwLock::new(ActiveSegment {
                file,
                bytes,
                first_seq,
            }),
            next_seq: AtomicU64::new(resume_seq + 1),
        })
    }

    /// Append one event, assigning its `seq`. Returns the assigned seq
    /// once the record has been flushed to the OS. Rotation happens inside
    /// the same exclusive lock, so it never splits an append.
    pub fn append(&self, mut event: Event) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        event.seq = seq;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut active = self.active.write();
        if active.bytes == 0 {
            active.first_seq = seq;
        }
        active.file.write_all(line.as_bytes())?;
        active.file.flush()?;
        active.bytes += line.len() as u64;

        if active.bytes >= self.rotation.max_bytes {
            self.rotate_locked(&mut active)?;
        }
        Ok(seq)
    }

    /// Current size of the active segment in bytes.
    pub fn current_size(&self) -> u64 {
        self.active.read().bytes
    }

    /// The next seq that will be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Scan events with `seq >= from_seq` matching `filter`, oldest first.
    ///
    /// Archived segments are immutable and read without locking; the
    /// active segment is read under the shared lock.
    pub fn scan(&self, filter: &EventFilter, from_seq: u64) -> Result<Vec<Event>> {
        let mut out = Vec::new();

        for path in self.archive_paths()? {
            scan_file(&path, filter, from_seq, &mut out)?;
        }

        {
            let _guard = self.active.read();
            let active_path = self.dir.join(ACTIVE_FILE);
            if active_path.exists() {
                scan_file(&active_path, filter, from_seq, &mut out)?;
            }
        }

        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    /// Remove archived segments beyond `keep_max_files` or older than
    /// `keep_days`. Returns the number of files removed.
    pub fn prune_archives(&self) -> Result<usize> {
        let mut paths = self.archive_paths()?;
        let mut removed = 0;

        // Oldest first by construction (named by first seq).
        let excess = paths.len().saturating_sub(self.rotation.keep_max_files);
        for path in paths.drain(..excess) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }

        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(u64::from(self.rotation.keep_days) * 86_400);
        for path in paths {
            let modified = std::fs::metadata(&path)?.modified()?;
            if modified < cutoff {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "pruned archived event segments");
        }
        Ok(removed)
    }

    // ── internals ───────────────────────────────────────────────────

    /// Swap the active segment into the archive. Caller holds the write
    /// lock, so no append can interleave with the rename.
    fn rotate_locked(&self, active: &mut ActiveSegment) -> Result<()> {
        active.file.flush()?;

        let archive_name = format!("events-{:012}.jsonl", active.first_seq);
        let from = self.dir.join(ACTIVE_FILE);
        let to = self.dir.join(ARCHIVE_DIR).join(archive_name);
        std::fs::rename(&from, &to)?;

        let file = OpenOptions::new().create(true).append(true).open(&from)?;
        let next = self.next_seq.load(Ordering::SeqCst);
        tracing::info!(archived = %to.display(), "event log segment rotated");

        *active = ActiveSegment {
            file,
            bytes: 0,
            first_seq: next,
        };
        Ok(())
    }

    /// Archive paths sorted oldest first (names embed the first seq).
    fn archive_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(self.dir.join(ARCHIVE_DIR))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn scan_file(
    path: &Path,
    filter: &EventFilter,
    from_seq: u64,
    out: &mut Vec<Event>,
) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                if event.seq >= from_seq && filter.matches(&event) {
                    out.push(event);
                }
            }
            Err(e) => {
                // A torn tail line from an unclean shutdown is tolerated.
                tracing::warn!(path = %path.display(), error = %e, "skipping unparseable event line");
            }
        }
    }
    Ok(())
}

/// Highest seq present in the active segment or, failing that, the newest
/// archive. Zero for a fresh log.
fn last_seq_on_disk(dir: &Path) -> Result<u64> {
    if let Some(seq) = last_seq_in_file(&dir.join(ACTIVE_FILE))? {
        return Ok(seq);
    }
    let mut archives: Vec<PathBuf> = std::fs::read_dir(dir.join(ARCHIVE_DIR))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    archives.sort();
    if let Some(newest) = archives.last() {
        if let Some(seq) = last_seq_in_file(newest)? {
            return Ok(seq);
        }
    }
    Ok(0)
}

fn last_seq_in_file(path: &Path) -> Result<Option<u64>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    Ok(raw
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<Event>(line).ok())
        .map(|event| event.seq))
}

fn first_seq_in_file(path: &Path) -> Result<Option<u64>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    Ok(raw
        .lines()
        .find_map(|line| serde_json::from_str::<Event>(line).ok())
        .map(|event| event.seq))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use ab_domain::event::EventKind;
    use uuid::Uuid;

    fn token_event(run_id: Uuid, text: &str) -> Event {
        Event::new(run_id, None, EventKind::Token { text: text.into() })
    }

    fn small_rotation() -> LogRotation {
        LogRotation {
            max_bytes: 400,
            keep_days: 14,
            keep_max_files: 3,
        }
    }

    #[test]
    fn seq_is_monotonic_and_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
        let run_id = Uuid::new_v4();

        let mut prev = 0;
        for i in 0..10 {
            let seq = log.append(token_event(run_id, &format!("t{i}"))).unwrap();
            assert_eq!(seq, prev + 1, "seq must increase by exactly one");
            prev = seq;
        }
    }

    #[test]
    fn scan_filters_by_run() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        log.append(token_event(run_a, "a1")).unwrap();
        log.append(token_event(run_b, "b1")).unwrap();
        log.append(token_event(run_a, "a2")).unwrap();

        let events = log.scan(&EventFilter::for_run(run_a), 0).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.run_id == run_a));
    }

    #[test]
    fn scan_from_seq() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
        let run_id = Uuid::new_v4();

        for i in 0..5 {
            log.append(token_event(run_id, &format!("t{i}"))).unwrap();
        }
        let events = log.scan(&EventFilter::default(), 4).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 4);
        assert_eq!(events[1].seq, 5);
    }

    #[test]
    fn rotation_preserves_seq_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), small_rotation()).unwrap();
        let run_id = Uuid::new_v4();

        for i in 0..30 {
            log.append(token_event(run_id, &format!("token number {i}")))
                .unwrap();
        }

        // At least one rotation happened.
        let archives: Vec<_> = std::fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .collect();
        assert!(!archives.is_empty());

        // History is complete across segments.
        let events = log.scan(&EventFilter::default(), 0).unwrap();
        assert_eq!(events.len(), 30);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
    }

    #[test]
    fn seq_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();

        let last = {
            let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
            let mut last = 0;
            for i in 0..7 {
                last = log.append(token_event(run_id, &format!("t{i}"))).unwrap();
            }
            last
        };

        let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
        let seq = log.append(token_event(run_id, "after restart")).unwrap();
        assert_eq!(seq, last + 1);
    }

    #[test]
    fn seq_resumes_after_reopen_with_rotated_segments() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();

        {
            let log = EventLog::open(dir.path(), small_rotation()).unwrap();
            for i in 0..30 {
                log.append(token_event(run_id, &format!("token number {i}")))
                    .unwrap();
            }
        }

        let log = EventLog::open(dir.path(), small_rotation()).unwrap();
        let seq = log.append(token_event(run_id, "resumed")).unwrap();
        assert_eq!(seq, 31);
    }

    #[test]
    fn prune_keeps_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), small_rotation()).unwrap();
        let run_id = Uuid::new_v4();

        for i in 0..120 {
            log.append(token_event(run_id, &format!("token number {i}")))
                .unwrap();
        }

        let before = log.archive_paths().unwrap().len();
        assert!(before > 3);
        log.prune_archives().unwrap();
        assert_eq!(log.archive_paths().unwrap().len(), 3);
    }

    #[test]
    fn current_size_tracks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
        assert_eq!(log.current_size(), 0);
        log.append(token_event(Uuid::new_v4(), "x")).unwrap();
        assert!(log.current_size() > 0);
    }

    #[test]
    fn torn_tail_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        {
            let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
            log.append(token_event(run_id, "intact")).unwrap();
        }
        // Simulate a crash mid-write.
        let path = dir.path().join(ACTIVE_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":99,\"truncat").unwrap();

        let log = EventLog::open(dir.path(), LogRotation::default()).unwrap();
        let events = log.scan(&EventFilter::default(), 0).unwrap();
        assert_eq!(events.len(), 1);
        // The torn line does not advance seq.
        let seq = log.append(token_event(run_id, "next")).unwrap();
        assert_eq!(seq, 2);
    }
}
