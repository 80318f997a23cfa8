//! Fixed-record open-addressed user database (spec.md §3, §4.2), bit-exact
//! with `original_source/server/userdb.c`: the 99-byte record layout, the
//! `0x4AFB` rolling hash folded in reverse, and the create-mode probing
//! rules in `userdb_change`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::{AccessLevel, IdentLevel, SECRET_MAXBYTES, USERID_MAXLEN};
use crate::error::SpoolError;
use crate::lock::{lock_range, LockKind};

pub const RECORD_LEN: usize = USERID_MAXLEN + 1 + 1 + 1 + 1 + SECRET_MAXBYTES + 4;

#[derive(Clone, Debug)]
pub struct UserEntry {
    /// Left-justified, space-padded to `USERID_MAXLEN`; empty slot iff
    /// the first byte is `0`.
    pub userid: [u8; USERID_MAXLEN],
    pub access: i8,
    pub ident: i8,
    pub secretbytes: u8,
    pub disabled: u8,
    pub secret: [u8; SECRET_MAXBYTES],
    pub lastref: u32,
}

impl UserEntry {
    pub fn empty() -> Self {
        UserEntry {
            userid: [0; USERID_MAXLEN],
            access: 0,
            ident: 0,
            secretbytes: 0,
            disabled: 0,
            secret: [0; SECRET_MAXBYTES],
            lastref: 0,
        }
    }

    pub fn new(userid: &str, access: AccessLevel, ident: IdentLevel, secret: &[u8], lastref: u32) -> Self {
        let mut e = UserEntry::empty();
        let bytes = userid.as_bytes();
        let n = bytes.len().min(USERID_MAXLEN);
        e.userid[..n].copy_from_slice(&bytes[..n]);
        e.access = access as i8;
        e.ident = ident as i8;
        e.secretbytes = secret.len().min(SECRET_MAXBYTES) as u8;
        e.secret[..e.secretbytes as usize].copy_from_slice(&secret[..e.secretbytes as usize]);
        e.lastref = lastref;
        e
    }

    pub fn is_empty_slot(&self) -> bool {
        self.userid[0] == 0
    }

    /// The userid field with trailing NUL/space padding stripped.
    pub fn userid_str(&self) -> String {
        let end = self.userid.iter().position(|&b| b == 0).unwrap_or(USERID_MAXLEN);
        String::from_utf8_lossy(&self.userid[..end]).trim_end().to_string()
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        let mut off = 0;
        buf[off..off + USERID_MAXLEN].copy_from_slice(&self.userid);
        off += USERID_MAXLEN;
        buf[off] = self.access as u8;
        off += 1;
        buf[off] = self.ident as u8;
        off += 1;
        buf[off] = self.secretbytes;
        off += 1;
        buf[off] = self.disabled;
        off += 1;
        buf[off..off + SECRET_MAXBYTES].copy_from_slice(&self.secret);
        off += SECRET_MAXBYTES;
        buf[off..off + 4].copy_from_slice(&self.lastref.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_LEN]) -> Self {
        let mut userid = [0u8; USERID_MAXLEN];
        userid.copy_from_slice(&buf[0..USERID_MAXLEN]);
        let mut off = USERID_MAXLEN;
        let access = buf[off] as i8;
        off += 1;
        let ident = buf[off] as i8;
        off += 1;
        let secretbytes = buf[off];
        off += 1;
        let disabled = buf[off];
        off += 1;
        let mut secret = [0u8; SECRET_MAXBYTES];
        secret.copy_from_slice(&buf[off..off + SECRET_MAXBYTES]);
        off += SECRET_MAXBYTES;
        let lastref = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
        UserEntry {
            userid,
            access,
            ident,
            secretbytes,
            disabled,
            secret,
            lastref,
        }
    }
}

/// `userdb_hash`: seed `0x4AFB`, fold the NUL-terminated userid bytes in
/// reverse as `v = (v << 2) ^ byte`. Bit-exact reproduction required or
/// tidy scatters records (spec.md §9).
pub fn hash(userid: &[u8; USERID_MAXLEN]) -> u32 {
    let len = userid.iter().position(|&b| b == 0).unwrap_or(USERID_MAXLEN);
    let mut v: u32 = 0x4AFB;
    for &b in userid[..len].iter().rev() {
        v = (v << 2) ^ (b as u32);
    }
    v
}

/// `userdb_checkid`: canonicalizes a userid. Case before `@` is preserved;
/// only the portion after `@` is lower-cased. First character must be
/// alphanumeric; characters before `@` alphanumeric or `.`; characters
/// after `@` may be anything but whitespace.
pub fn check_userid(src: &str) -> Result<String, &'static str> {
    if src.len() > USERID_MAXLEN {
        return Err("too long");
    }
    let mut chars = src.chars();
    let first = chars.next().ok_or("empty")?;
    if !first.is_alphanumeric() {
        return Err("doesn't start with an alphanumeric");
    }
    let mut out = String::with_capacity(src.len());
    out.push(first);
    let mut seen_at = false;
    for c in chars {
        if !seen_at {
            if c == '@' {
                seen_at = true;
                out.push(c);
                continue;
            }
            if !(c.is_alphanumeric() || c == '.') {
                return Err("contains non-alphanums before any @");
            }
            out.push(c);
        } else {
            if c.is_whitespace() {
                return Err("contains spaces");
            }
            out.push(c.to_ascii_lowercase());
        }
    }
    Ok(out)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CreateMode {
    NeverCreate,
    CreateIfMissing,
    MustCreate,
    Delete,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChangeResult {
    Ok,
    PolicyRejected,
    Full,
}

fn open_locked(path: &Path, kind: LockKind, write: bool) -> Result<(File, usize), SpoolError> {
    let file = if write {
        OpenOptions::new().read(true).write(true).open(path)?
    } else {
        OpenOptions::new().read(true).open(path)?
    };
    lock_range(&file, kind, 0, 1)?;
    let len = file.metadata()?.len() as usize;
    if len % RECORD_LEN != 0 {
        return Err(SpoolError::corrupt("userdatabase", "length not a multiple of record size"));
    }
    let n = len / RECORD_LEN;
    if n == 0 {
        return Err(SpoolError::corrupt("userdatabase", "truncated (zero records)"));
    }
    Ok((file, n))
}

fn read_record(file: &mut File, slot: usize) -> Result<UserEntry, SpoolError> {
    file.seek(SeekFrom::Start((slot * RECORD_LEN) as u64))?;
    let mut buf = [0u8; RECORD_LEN];
    file.read_exact(&mut buf)?;
    Ok(UserEntry::from_bytes(&buf))
}

fn write_record(file: &mut File, slot: usize, entry: &UserEntry) -> Result<(), SpoolError> {
    file.seek(SeekFrom::Start((slot * RECORD_LEN) as u64))?;
    file.write_all(&entry.to_bytes())?;
    Ok(())
}

/// `find(userid, access)`: begins probing at `hash mod n`, wraps at the
/// table end, stops when an empty slot is reached or the full table has
/// been walked. `access < 0` (here: `None`) matches any access level.
pub fn find(path: &Path, userid: &[u8; USERID_MAXLEN], access: Option<i8>) -> Result<Option<UserEntry>, SpoolError> {
    let (mut file, n) = open_locked(path, LockKind::Read, false)?;
    let initial = (hash(userid) as usize) % n;
    let mut i = initial;
    loop {
        let entry = read_record(&mut file, i)?;
        if !entry.is_empty_slot()
            && &entry.userid == userid
            && access.map(|a| entry.access == a).unwrap_or(true)
        {
            return Ok(Some(entry));
        }
        if entry.is_empty_slot() {
            return Ok(None);
        }
        i = (i + 1) % n;
        if i == initial {
            return Ok(None);
        }
    }
}

/// `change(entry, mode)`.
pub fn change(path: &Path, entry: &UserEntry, mode: CreateMode) -> Result<ChangeResult, SpoolError> {
    let (mut file, n) = open_locked(path, LockKind::Write, true)?;
    let initial = (hash(&entry.userid) as usize) % n;
    let mut i = initial;
    let mut place: Option<usize> = None;
    let found_slot;
    loop {
        let existing = read_record(&mut file, i)?;
        if existing.is_empty_slot() {
            if place.is_none() {
                place = Some(i);
            }
        } else if existing.userid == entry.userid {
            if mode == CreateMode::MustCreate {
                return Ok(ChangeResult::PolicyRejected);
            }
            place = Some(i);
            found_slot = true;
            break;
        }
        i = (i + 1) % n;
        if i == initial {
            if mode == CreateMode::NeverCreate || mode == CreateMode::Delete {
                return Ok(ChangeResult::PolicyRejected);
            }
            match place {
                None => return Ok(ChangeResult::Full),
                Some(_) => {}
            }
            found_slot = false;
            break;
        }
    }
    let slot = place.expect("probe loop always sets place before breaking on success paths");
    let _ = found_slot;
    if mode == CreateMode::Delete {
        write_record(&mut file, slot, &UserEntry::empty())?;
    } else {
        write_record(&mut file, slot, entry)?;
    }
    Ok(ChangeResult::Ok)
}

/// Rehashes every non-empty record of `old_path` into a fresh table of
/// `new_capacity` slots, written to a temp file and renamed over the
/// original only once fully flushed — so a failed tidy never leaves the
/// on-disk table in a half-written state (spec.md §4.2/§7).
pub fn tidy(old_path: &Path, new_capacity: usize) -> Result<(), SpoolError> {
    let (mut old_file, n) = open_locked(old_path, LockKind::Write, true)?;
    let mut entries = Vec::new();
    for i in 0..n {
        let e = read_record(&mut old_file, i)?;
        if !e.is_empty_slot() {
            entries.push(e);
        }
    }
    if entries.len() > new_capacity {
        return Err(SpoolError::Full {
            what: "new user database capacity".into(),
        });
    }

    let mut table = vec![UserEntry::empty(); new_capacity];
    for e in entries {
        let mut i = (hash(&e.userid) as usize) % new_capacity;
        loop {
            if table[i].is_empty_slot() {
                table[i] = e;
                break;
            }
            i = (i + 1) % new_capacity;
        }
    }

    let tmp_path = old_path.with_extension("tidy-tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for e in &table {
            tmp.write_all(&e.to_bytes())?;
        }
        tmp.flush()?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, old_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn userid_bytes(s: &str) -> [u8; USERID_MAXLEN] {
        let mut out = [0u8; USERID_MAXLEN];
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    fn make_table(dir: &Path, n: usize) -> std::path::PathBuf {
        let path = dir.join("userdatabase");
        let buf = vec![0u8; n * RECORD_LEN];
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn hash_is_deterministic_and_matches_known_value() {
        let uid = userid_bytes("alice");
        assert_eq!(hash(&uid), hash(&uid));
    }

    #[test]
    fn check_userid_lowercases_only_after_at() {
        assert_eq!(check_userid("Alice@Cam.AC.UK").unwrap(), "Alice@cam.ac.uk");
    }

    #[test]
    fn check_userid_rejects_non_alnum_start() {
        assert!(check_userid("_alice").is_err());
    }

    #[test]
    fn check_userid_is_idempotent() {
        let once = check_userid("Bob@Example.COM").unwrap();
        let twice = check_userid(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn change_must_create_then_find_roundtrips() {
        let dir = tempdir().unwrap();
        let path = make_table(dir.path(), 8);
        let entry = UserEntry::new("alice", AccessLevel::Write, IdentLevel::Md5Initial, &[1, 2, 3, 4], 0);
        let rc = change(&path, &entry, CreateMode::MustCreate).unwrap();
        assert_eq!(rc, ChangeResult::Ok);
        let found = find(&path, &userid_bytes("alice"), None).unwrap().unwrap();
        assert_eq!(found.userid_str(), "alice");
        assert_eq!(found.secretbytes, 4);
    }

    #[test]
    fn change_must_create_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let path = make_table(dir.path(), 8);
        let entry = UserEntry::new("alice", AccessLevel::Write, IdentLevel::Md5Initial, &[1], 0);
        change(&path, &entry, CreateMode::MustCreate).unwrap();
        let rc = change(&path, &entry, CreateMode::MustCreate).unwrap();
        assert_eq!(rc, ChangeResult::PolicyRejected);
    }

    #[test]
    fn change_never_create_fails_when_absent() {
        let dir = tempdir().unwrap();
        let path = make_table(dir.path(), 8);
        let entry = UserEntry::new("alice", AccessLevel::Write, IdentLevel::Md5Initial, &[1], 0);
        let rc = change(&path, &entry, CreateMode::NeverCreate).unwrap();
        assert_eq!(rc, ChangeResult::PolicyRejected);
    }

    #[test]
    fn full_table_reports_full() {
        let dir = tempdir().unwrap();
        let path = make_table(dir.path(), 1);
        let a = UserEntry::new("alice", AccessLevel::Write, IdentLevel::Md5Initial, &[1], 0);
        let b = UserEntry::new("bob", AccessLevel::Write, IdentLevel::Md5Initial, &[1], 0);
        change(&path, &a, CreateMode::CreateIfMissing).unwrap();
        let rc = change(&path, &b, CreateMode::CreateIfMissing).unwrap();
        assert_eq!(rc, ChangeResult::Full);
    }

    #[test]
    fn tidy_preserves_record_content() {
        let dir = tempdir().unwrap();
        let path = make_table(dir.path(), 4);
        let entry = UserEntry::new("alice", AccessLevel::Write, IdentLevel::Md5, &[9, 9], 42);
        change(&path, &entry, CreateMode::MustCreate).unwrap();
        tidy(&path, 16).unwrap();
        let found = find(&path, &userid_bytes("alice"), None).unwrap().unwrap();
        assert_eq!(found.lastref, 42);
        assert_eq!(found.secret[..2], [9, 9]);
    }
}
