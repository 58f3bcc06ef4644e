//! Binary snapshot of the whole policy, with crash-safe replacement.
//!
//! Layout (all integers little-endian u64 unless noted):
//!
//! ```text
//! file        := rule_count  rule_block*
//! rule_block  := rule_index  key_count  key_record{key_count}
//! key_record  := key_tag:u8  key_payload  deadline_count  deadline{deadline_count}
//! key_payload := length + bytes        (tag 0, string)
//!              | value:u64             (tags 1..=5 signed, 6..=10 unsigned)
//! ```
//!
//! The writer stages the full file at `<stem>.ratelimit_temp` and renames it
//! over `<stem>.ratelimit`, so a crash mid-write leaves the previous snapshot
//! intact. The loader validates structure against the configured rules and
//! rejects deadline runs that are out of order or reach past `now + window`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock;
use crate::error::SnapshotError;
use crate::key::Key;
use crate::rule::Rule;

const SNAPSHOT_SUFFIX: &str = ".ratelimit";
const STAGING_SUFFIX: &str = ".ratelimit_temp";

// Key tags as stored on disk. Platform-width integers from other producers
// (tags 1 and 6) are widened to their 64-bit variants on load.
const TAG_STR: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_I8: u8 = 2;
const TAG_I16: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_I64: u8 = 5;
const TAG_UINT: u8 = 6;
const TAG_U8: u8 = 7;
const TAG_U16: u8 = 8;
const TAG_U32: u8 = 9;
const TAG_U64: u8 = 10;

pub(crate) fn snapshot_path(stem: &Path) -> PathBuf {
    let mut p = stem.as_os_str().to_owned();
    p.push(SNAPSHOT_SUFFIX);
    PathBuf::from(p)
}

fn staging_path(stem: &Path) -> PathBuf {
    let mut p = stem.as_os_str().to_owned();
    p.push(STAGING_SUFFIX);
    PathBuf::from(p)
}

/// Write a snapshot of `rules` to `<stem>.ratelimit`.
pub(crate) fn save(rules: &[Arc<Rule>], stem: &Path) -> Result<(), SnapshotError> {
    let staging = staging_path(stem);
    let canonical = snapshot_path(stem);

    let mut w = BufWriter::new(File::create(&staging)?);
    w.write_all(&(rules.len() as u64).to_le_bytes())?;
    for (rule_index, rule) in rules.iter().enumerate() {
        let records = rule.snapshot_records();
        w.write_all(&(rule_index as u64).to_le_bytes())?;
        w.write_all(&(records.len() as u64).to_le_bytes())?;
        for (key, deadlines) in &records {
            let mut record = Vec::with_capacity(24 + deadlines.len() * 8);
            encode_key(&mut record, key);
            record.extend_from_slice(&(deadlines.len() as u64).to_le_bytes());
            for deadline in deadlines {
                record.extend_from_slice(&(*deadline as u64).to_le_bytes());
            }
            w.write_all(&record)?;
        }
    }
    w.flush()?;
    w.get_ref().sync_all()?;
    drop(w);

    fs::rename(&staging, &canonical)?;
    tracing::debug!(path = %canonical.display(), "snapshot written");
    Ok(())
}

/// Restore a snapshot from `<stem>.ratelimit` into `rules`.
///
/// A missing file is not an error: the call succeeds and no state changes.
/// Validation failures abort the restore where they are found; admissions
/// already re-inserted stay in place.
pub(crate) fn load(rules: &[Arc<Rule>], stem: &Path) -> Result<(), SnapshotError> {
    let path = snapshot_path(stem);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut r = Reader::new(&bytes);
    if r.read_u64()? as usize != rules.len() {
        return Err(SnapshotError::Inconsistent);
    }
    for (rule_index, rule) in rules.iter().enumerate() {
        // Nothing recorded may expire later than a fresh admission would.
        let horizon = clock::now_ns() + rule.window_ns;
        if r.read_u64()? as usize != rule_index {
            return Err(SnapshotError::Inconsistent);
        }
        let key_count = r.read_u64()?;
        for _ in 0..key_count {
            let key = decode_key(&mut r)?;
            let deadline_count = r.read_u64()?;
            let mut prev = 0i64;
            for _ in 0..deadline_count {
                let deadline = r.read_u64()? as i64;
                if deadline < prev || deadline > horizon {
                    return Err(SnapshotError::Tampered {
                        offset: r.pos() as u64,
                    });
                }
                if rule.add_from_backup(&key, deadline).is_err() {
                    // more deadlines than the rule's limit can hold
                    return Err(SnapshotError::Inconsistent);
                }
                prev = deadline;
            }
        }
    }
    tracing::debug!(path = %path.display(), "snapshot loaded");
    Ok(())
}

fn encode_key(buf: &mut Vec<u8>, key: &Key) {
    match key {
        Key::Str(v) => {
            buf.push(TAG_STR);
            buf.extend_from_slice(&(v.len() as u64).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        Key::I8(v) => push_int(buf, TAG_I8, *v as i64 as u64),
        Key::I16(v) => push_int(buf, TAG_I16, *v as i64 as u64),
        Key::I32(v) => push_int(buf, TAG_I32, *v as i64 as u64),
        Key::I64(v) => push_int(buf, TAG_I64, *v as u64),
        Key::U8(v) => push_int(buf, TAG_U8, *v as u64),
        Key::U16(v) => push_int(buf, TAG_U16, *v as u64),
        Key::U32(v) => push_int(buf, TAG_U32, *v as u64),
        Key::U64(v) => push_int(buf, TAG_U64, *v),
    }
}

fn push_int(buf: &mut Vec<u8>, tag: u8, value: u64) {
    buf.push(tag);
    buf.extend_from_slice(&value.to_le_bytes());
}

fn decode_key(r: &mut Reader<'_>) -> Result<Key, SnapshotError> {
    let tag = r.read_u8()?;
    Ok(match tag {
        TAG_STR => {
            let len = r.read_u64()? as usize;
            let bytes = r.read_bytes(len)?;
            let s = String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotError::Inconsistent)?;
            Key::Str(s)
        }
        TAG_INT | TAG_I64 => Key::I64(r.read_u64()? as i64),
        TAG_I8 => Key::I8(r.read_u64()? as i8),
        TAG_I16 => Key::I16(r.read_u64()? as i16),
        TAG_I32 => Key::I32(r.read_u64()? as i32),
        TAG_UINT | TAG_U64 => Key::U64(r.read_u64()?),
        TAG_U8 => Key::U8(r.read_u64()? as u8),
        TAG_U16 => Key::U16(r.read_u64()? as u16),
        TAG_U32 => Key::U32(r.read_u64()? as u32),
        _ => return Err(SnapshotError::Inconsistent),
    })
}

/// Position-tracking reader over the snapshot bytes; the position feeds the
/// offset reported for rejected deadlines.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.buf.len() - self.pos < n {
            return Err(SnapshotError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "snapshot truncated",
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}

/// Shared state of the periodic snapshot task.
pub(crate) struct AutosaveTask {
    pub(crate) rules: Vec<Arc<Rule>>,
    pub(crate) stem: PathBuf,
    pub(crate) save_lock: Arc<Mutex<()>>,
}

/// Write a snapshot every `interval`. A tick is skipped when the previous
/// write (periodic or manual) still holds the save lock. Holds the task state
/// weakly and exits once the owning limiter is dropped.
pub(crate) async fn run_autosave_loop(task: Weak<AutosaveTask>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick

    loop {
        ticker.tick().await;
        let Some(task) = task.upgrade() else {
            break;
        };
        let Some(_guard) = task.save_lock.try_lock() else {
            continue;
        };
        if let Err(e) = save(&task.rules, &task.stem) {
            tracing::warn!("periodic snapshot failed: {e}");
        }
    }
}
