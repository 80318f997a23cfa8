//! The append-mostly index file: one fixed 200-byte record per posted
//! item, reply, continuation, edit, or MOTD change (spec.md §3/§4.4),
//! grounded in `original_source/server/groggsd.c:indexentry`/`cmd_indx`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::{INDEXENTRY_LEN, ITEMID_LEN, SUBJECTININDEX_MAXLEN, USERID_MAXLEN};
use crate::error::SpoolError;
use crate::lock::{lock_range, LockKind};

pub const RECORD_LEN: usize = INDEXENTRY_LEN + 1;

const OFF_SEQUENCE: usize = 0;
const OFF_TIMESTAMP: usize = 9;
const OFF_ITEMID: usize = 18;
const OFF_USERID: usize = 27;
const OFF_KIND: usize = OFF_USERID + USERID_MAXLEN + 1;
const OFF_SUBJECT: usize = OFF_KIND + 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    Reply,
    Item,
    Continuation,
    FromContinuation,
    Edit,
    Motd,
}

impl EntryKind {
    fn to_char(self) -> u8 {
        match self {
            EntryKind::Reply => b'R',
            EntryKind::Item => b'I',
            EntryKind::Continuation => b'C',
            EntryKind::FromContinuation => b'F',
            EntryKind::Edit => b'E',
            EntryKind::Motd => b'M',
        }
    }

    fn from_char(c: u8) -> Option<Self> {
        match c {
            b'R' => Some(EntryKind::Reply),
            b'I' => Some(EntryKind::Item),
            b'C' => Some(EntryKind::Continuation),
            b'F' => Some(EntryKind::FromContinuation),
            b'E' => Some(EntryKind::Edit),
            b'M' => Some(EntryKind::Motd),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub sequence: u32,
    pub timestamp: u32,
    /// `None` for a MOTD record (8 spaces on disk).
    pub item_id: Option<String>,
    pub userid: String,
    pub kind: EntryKind,
    pub subject: String,
}

fn pad_left(s: &str, width: usize) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.truncate(width);
    v.resize(width, b' ');
    v
}

impl IndexEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![b' '; RECORD_LEN];
        buf[OFF_SEQUENCE..OFF_SEQUENCE + 8].copy_from_slice(format!("{:08X}", self.sequence).as_bytes());
        buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8].copy_from_slice(format!("{:08X}", self.timestamp).as_bytes());
        match &self.item_id {
            Some(id) => {
                debug_assert_eq!(id.len(), ITEMID_LEN);
                buf[OFF_ITEMID..OFF_ITEMID + ITEMID_LEN].copy_from_slice(id.as_bytes());
            }
            None => {
                for b in &mut buf[OFF_ITEMID..OFF_ITEMID + ITEMID_LEN] {
                    *b = b' ';
                }
            }
        }
        buf[OFF_USERID..OFF_USERID + USERID_MAXLEN].copy_from_slice(&pad_left(&self.userid, USERID_MAXLEN));
        buf[OFF_KIND] = self.kind.to_char();
        let subject = truncate_subject(&self.subject);
        let n = subject.len();
        buf[OFF_SUBJECT..OFF_SUBJECT + n].copy_from_slice(subject.as_bytes());
        buf[RECORD_LEN - 1] = b'\n';
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, SpoolError> {
        if buf.len() != RECORD_LEN || buf[RECORD_LEN - 1] != b'\n' {
            return Err(SpoolError::corrupt("index", "record is not 200 bytes ending in \\n"));
        }
        let sequence = parse_hex8(&buf[OFF_SEQUENCE..OFF_SEQUENCE + 8])?;
        let timestamp = parse_hex8(&buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8])?;
        let item_field = &buf[OFF_ITEMID..OFF_ITEMID + ITEMID_LEN];
        let item_id = if item_field.iter().all(|&b| b == b' ') {
            None
        } else {
            Some(String::from_utf8_lossy(item_field).to_string())
        };
        let userid = String::from_utf8_lossy(&buf[OFF_USERID..OFF_USERID + USERID_MAXLEN])
            .trim_end()
            .to_string();
        let kind = EntryKind::from_char(buf[OFF_KIND])
            .ok_or_else(|| SpoolError::corrupt("index", "unknown entry type character"))?;
        let subject = String::from_utf8_lossy(&buf[OFF_SUBJECT..RECORD_LEN - 1])
            .trim_end()
            .to_string();
        Ok(IndexEntry {
            sequence,
            timestamp,
            item_id,
            userid,
            kind,
            subject,
        })
    }
}

fn parse_hex8(bytes: &[u8]) -> Result<u32, SpoolError> {
    let s = std::str::from_utf8(bytes).map_err(|_| SpoolError::corrupt("index", "non-utf8 hex field"))?;
    u32::from_str_radix(s, 16).map_err(|_| SpoolError::corrupt("index", "malformed hex field"))
}

fn truncate_subject(subject: &str) -> String {
    if subject.chars().count() <= SUBJECTININDEX_MAXLEN {
        subject.to_string()
    } else {
        let mut truncated: String = subject.chars().take(SUBJECTININDEX_MAXLEN.saturating_sub(3)).collect();
        truncated.push_str("...");
        truncated
    }
}

fn open_for_read(path: &Path) -> Result<(File, usize), SpoolError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let len = file.metadata()?.len() as usize;
    if len % RECORD_LEN != 0 {
        return Err(SpoolError::corrupt("index", "length not a multiple of 200"));
    }
    Ok((file, len / RECORD_LEN))
}

fn read_record(file: &mut File, i: usize) -> Result<IndexEntry, SpoolError> {
    file.seek(SeekFrom::Start((i * RECORD_LEN) as u64))?;
    let mut buf = vec![0u8; RECORD_LEN];
    file.read_exact(&mut buf)?;
    IndexEntry::from_bytes(&buf)
}

/// Appends one record. Caller must already hold the index write lock for
/// the whole compound operation it participates in.
pub fn append(path: &Path, entry: &IndexEntry) -> Result<(), SpoolError> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&entry.to_bytes())?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SearchKey {
    Sequence,
    Timestamp,
}

/// Binary-searches for the lowest-index record whose key is `>= target`.
/// Returns `None` if every record's key is below `target` (i.e. the
/// caller should start from end-of-file).
pub fn lower_bound(path: &Path, key: SearchKey, target: u32) -> Result<Option<usize>, SpoolError> {
    let (mut file, n) = open_for_read(path)?;
    if n == 0 {
        return Ok(None);
    }
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let rec = read_record(&mut file, mid)?;
        let k = match key {
            SearchKey::Sequence => rec.sequence,
            SearchKey::Timestamp => rec.timestamp,
        };
        if k >= target {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    if lo == n {
        Ok(None)
    } else {
        Ok(Some(lo))
    }
}

pub fn read_range(path: &Path, start: usize, count: usize) -> Result<Vec<IndexEntry>, SpoolError> {
    let (mut file, n) = open_for_read(path)?;
    let end = (start + count).min(n);
    let mut out = Vec::with_capacity(end.saturating_sub(start));
    for i in start..end {
        out.push(read_record(&mut file, i)?);
    }
    Ok(out)
}

pub fn read_all(path: &Path) -> Result<Vec<IndexEntry>, SpoolError> {
    let (_, n) = open_for_read(path)?;
    read_range(path, 0, n)
}

/// Rewrites the whole index with `entries`, via a temp file renamed over
/// the original so a crash mid-write never leaves a half-length index.
/// Used by withdraw (drop every record whose Item-ID matches the target)
/// and by index-edit (splice a replacement tail in).
pub fn rewrite(path: &Path, entries: &[IndexEntry]) -> Result<(), SpoolError> {
    let tmp_path = path.with_extension("rewrite-tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for e in entries {
            tmp.write_all(&e.to_bytes())?;
        }
        tmp.flush()?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Drops every record referencing `item_id` (withdraw), preserving the
/// order of the rest. Caller holds the index write lock.
pub fn withdraw(path: &Path, item_id: &str) -> Result<usize, SpoolError> {
    let all = read_all(path)?;
    let before = all.len();
    let kept: Vec<IndexEntry> = all
        .into_iter()
        .filter(|e| e.item_id.as_deref() != Some(item_id))
        .collect();
    let removed = before - kept.len();
    rewrite(path, &kept)?;
    Ok(removed)
}

/// Replaces every record from `from_index` onward with `replacement`
/// (index-edit via EDCF: the submitted data becomes the new tail).
pub fn replace_tail(path: &Path, from_index: usize, replacement: &[IndexEntry]) -> Result<(), SpoolError> {
    let mut all = read_all(path)?;
    all.truncate(from_index);
    all.extend_from_slice(replacement);
    rewrite(path, &all)
}

/// Acquires the index write lock for the duration of `f`, guaranteeing
/// append + sequence-allocation happen as one atomic unit as spec.md §7
/// requires ("sequence numbers are allocated while holding the write
/// lock on the index").
pub fn with_write_lock<T>(path: &Path, f: impl FnOnce() -> Result<T, SpoolError>) -> Result<T, SpoolError> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    lock_range(&file, LockKind::Write, 0, 1)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(seq: u32, ts: u32, item: &str, kind: EntryKind, subject: &str) -> IndexEntry {
        IndexEntry {
            sequence: seq,
            timestamp: ts,
            item_id: Some(item.to_string()),
            userid: "alice".to_string(),
            kind,
            subject: subject.to_string(),
        }
    }

    #[test]
    fn roundtrip_through_bytes_is_exact() {
        let e = sample(1, 100, "A0010101", EntryKind::Item, "hello world");
        let bytes = e.to_bytes();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(bytes[RECORD_LEN - 1], b'\n');
        let back = IndexEntry::from_bytes(&bytes).unwrap();
        assert_eq!(back.sequence, 1);
        assert_eq!(back.timestamp, 100);
        assert_eq!(back.item_id.as_deref(), Some("A0010101"));
        assert_eq!(back.subject, "hello world");
        assert_eq!(back.kind, EntryKind::Item);
    }

    #[test]
    fn motd_record_has_blank_itemid() {
        let mut e = sample(1, 1, "A0010101", EntryKind::Motd, "motd");
        e.item_id = None;
        let bytes = e.to_bytes();
        let back = IndexEntry::from_bytes(&bytes).unwrap();
        assert_eq!(back.item_id, None);
    }

    #[test]
    fn subject_overflow_is_truncated_with_ellipsis() {
        let long = "x".repeat(200);
        let e = sample(1, 1, "A0010101", EntryKind::Item, &long);
        let bytes = e.to_bytes();
        let back = IndexEntry::from_bytes(&bytes).unwrap();
        assert!(back.subject.ends_with("..."));
        assert!(back.subject.len() <= SUBJECTININDEX_MAXLEN);
    }

    #[test]
    fn append_then_lower_bound_finds_exact_and_gap_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, []).unwrap();
        for (seq, ts) in [(0x10, 0x10), (0x20, 0x20), (0x30, 0x30), (0x40, 0x40), (0x50, 0x50)] {
            append(&path, &sample(seq, ts, "A0010101", EntryKind::Item, "s")).unwrap();
        }
        let idx = lower_bound(&path, SearchKey::Timestamp, 0x19).unwrap().unwrap();
        assert_eq!(idx, 1);
        let entries = read_range(&path, idx, 100).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].timestamp, 0x20);
    }

    #[test]
    fn lower_bound_past_end_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, []).unwrap();
        append(&path, &sample(1, 1, "A0010101", EntryKind::Item, "s")).unwrap();
        assert_eq!(lower_bound(&path, SearchKey::Sequence, 99).unwrap(), None);
    }

    #[test]
    fn withdraw_removes_all_matching_records_and_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, []).unwrap();
        append(&path, &sample(1, 1, "A0010101", EntryKind::Item, "first")).unwrap();
        append(&path, &sample(2, 2, "A0010101", EntryKind::Reply, "reply-to-first")).unwrap();
        append(&path, &sample(3, 3, "A0020202", EntryKind::Item, "other")).unwrap();
        let removed = withdraw(&path, "A0010101").unwrap();
        assert_eq!(removed, 2);
        let remaining = read_all(&path).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].item_id.as_deref(), Some("A0020202"));
    }

    #[test]
    fn corrupt_length_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, vec![0u8; RECORD_LEN + 1]).unwrap();
        assert!(read_all(&path).is_err());
    }
}
