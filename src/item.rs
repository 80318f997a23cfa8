//! Item file format: status line, header composition, subject lookup,
//! and the open-for-reply/continue/edit-splice/withdraw operations
//! (spec.md §3/§4.5), grounded in `original_source/server/groggsd.c:
//! createitem,checknocont,getitemsubject,indexentry`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::{
    ITEMID_LEN, ITEM_MAXLEN, LONGGROGNAME_PFXSTRING, LONGUSERID_PFXSTRING, SUBJECT_PFXSTRING,
    TEXTLINE_MAXLEN,
};
use crate::error::SpoolError;

/// Status line length: `<continuing id or spaces>(8) <spaces>(9) <sequence>(8) <spaces>(9)\n`.
pub const STATUS_LINE_LEN: usize = ITEMID_LEN * 2 + 20;

/// Byte offset of the 8-hex-digit sequence field within the status line
/// (spec.md §4.5: `ITEMID_LEN*2+2 .. +10`).
const SEQ_FIELD_START: usize = ITEMID_LEN * 2 + 2;
const SEQ_FIELD_END: usize = SEQ_FIELD_START + 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenForReplyError {
    AlreadyContinued,
    TooFull,
}

/// Formats the fixed status line written at byte 0 of every item file.
/// `continuing` is either `None` (open) or `Some(id)` (already continued).
pub fn status_line(continuing: Option<&str>, sequence: u32) -> String {
    let cont = continuing.unwrap_or("");
    debug_assert!(cont.len() <= ITEMID_LEN);
    let line = format!("{:<8} {:9}{:08X}{:9}\n", cont, "", sequence, "");
    debug_assert_eq!(line.len(), STATUS_LINE_LEN);
    line
}

fn parse_status_line(buf: &str) -> Result<(Option<String>, u32), SpoolError> {
    if buf.len() != STATUS_LINE_LEN || !buf.ends_with('\n') {
        return Err(SpoolError::corrupt("item", "status line is not the fixed width"));
    }
    let cont_field = &buf[0..ITEMID_LEN];
    let continuing = if cont_field.chars().all(|c| c == ' ') {
        None
    } else {
        Some(cont_field.trim_end().to_string())
    };
    let seq_field = &buf[SEQ_FIELD_START..SEQ_FIELD_END];
    let sequence = u32::from_str_radix(seq_field, 16)
        .map_err(|_| SpoolError::corrupt("item", "status line sequence is not hex"))?;
    Ok((continuing, sequence))
}

/// Returns `Ok(())` when the item is still open (not continued), or the
/// 422 refusal when it already has a continuation. `noitem` (file
/// vanished/unreadable) is surfaced as a `SpoolError` to the caller, who
/// maps it to the "no such item" protocol response.
pub fn check_not_continued(item: &mut File) -> Result<(), SpoolError> {
    item.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; STATUS_LINE_LEN];
    item.read_exact(&mut buf)?;
    let text = String::from_utf8_lossy(&buf).to_string();
    let (continuing, _) = parse_status_line(&text)?;
    if continuing.is_some() {
        return Err(SpoolError::corrupt("item", "already continued"));
    }
    Ok(())
}

pub fn read_sequence_field(item: &mut File) -> Result<u32, SpoolError> {
    item.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; STATUS_LINE_LEN];
    item.read_exact(&mut buf)?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(parse_status_line(&text)?.1)
}

/// Overwrites just the most-recent-sequence field (used whenever a reply
/// or edit is appended) without touching any other byte of the status
/// line, matching the original's in-place field rewrite.
pub fn rewrite_sequence_field(item: &mut File, sequence: u32) -> Result<(), SpoolError> {
    item.seek(SeekFrom::Start(SEQ_FIELD_START as u64))?;
    write!(item, "{:08X}", sequence)?;
    Ok(())
}

/// Overwrites the first 8 bytes (continuation field) with a new Item-ID,
/// marking this item as continued.
pub fn rewrite_continuation_field(item: &mut File, new_id: &str) -> Result<(), SpoolError> {
    debug_assert_eq!(new_id.len(), ITEMID_LEN);
    item.seek(SeekFrom::Start(0))?;
    item.write_all(new_id.as_bytes())?;
    Ok(())
}

fn line1_too_long(line: &str) -> bool {
    line.find('\n').unwrap_or(line.len()) > TEXTLINE_MAXLEN
}

/// Composes the header block (`Item ...`/`Reply ...` line plus grogname
/// and/or userid overflow lines) via the same fallback ladder as
/// `createitem`: try the one-line form, then progressively break the
/// grogname and/or userid out onto their own `From `/`User ` lines until
/// the first line fits `TEXTLINE_MAXLEN`.
pub fn compose_header(
    start_pfx: &str,
    new_id: &str,
    grogname: &str,
    userid: &str,
    datestring: &str,
) -> String {
    if grogname.is_empty() {
        let simple = format!("{start_pfx}{new_id} from {userid} at {datestring}\n");
        if !line1_too_long(&simple) {
            return simple;
        }
        return format!(
            "{start_pfx}{new_id} submitted at {datestring} by\n{LONGUSERID_PFXSTRING}{userid}\n"
        );
    }

    let attempt1 = format!("{start_pfx}{new_id} from {grogname} ({userid}) at {datestring}\n");
    if !line1_too_long(&attempt1) {
        return attempt1;
    }
    let attempt2 = format!(
        "{start_pfx}{new_id} from {userid} at {datestring}\n{LONGGROGNAME_PFXSTRING}{grogname}\n"
    );
    if !line1_too_long(&attempt2) {
        return attempt2;
    }
    let attempt3 = format!(
        "{start_pfx}{new_id} from {grogname} at {datestring}\n{LONGUSERID_PFXSTRING}{userid}\n"
    );
    if !line1_too_long(&attempt3) {
        return attempt3;
    }
    format!(
        "{start_pfx}{new_id} submitted at {datestring}\n{LONGGROGNAME_PFXSTRING}{grogname}\n{LONGUSERID_PFXSTRING}{userid}\n"
    )
}

pub struct NewItem {
    pub path: std::path::PathBuf,
    pub id: String,
}

/// Creates a brand-new item file: fixed status line, section marker,
/// composed header, `Subject:` line, blank line, then body. `continuing`
/// should be `None` for a fresh NEWI/REPL target.
pub fn create(
    path: &Path,
    id: &str,
    sequence: u32,
    timestamp: u32,
    start_pfx: &str,
    grogname: &str,
    userid: &str,
    datestring: &str,
    subject: &str,
    body: &str,
) -> Result<(), SpoolError> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let header = compose_header(start_pfx, id, grogname, userid, datestring);
    file.write_all(status_line(None, sequence).as_bytes())?;
    write!(file, "^{:08X} {:08X}\n", sequence, timestamp)?;
    file.write_all(header.as_bytes())?;
    write!(file, "{SUBJECT_PFXSTRING}{subject}\n\n")?;
    file.write_all(body.as_bytes())?;
    Ok(())
}

/// Appends a reply/continuation body to an already-open item, updating
/// its most-recent-sequence field first.
pub fn append_contribution(
    item: &mut File,
    sequence: u32,
    timestamp: u32,
    header: &str,
    subject: Option<&str>,
    body: &str,
) -> Result<(), SpoolError> {
    rewrite_sequence_field(item, sequence)?;
    item.seek(SeekFrom::End(0))?;
    write!(item, "^{:08X} {:08X}\n", sequence, timestamp)?;
    item.write_all(header.as_bytes())?;
    if let Some(subject) = subject {
        write!(item, "{SUBJECT_PFXSTRING}{subject}\n")?;
    }
    item.write_all(b"\n")?;
    item.write_all(body.as_bytes())?;
    Ok(())
}

pub fn would_exceed_item_maxlen(current_len: u64, addition_len: u64) -> bool {
    current_len + addition_len > ITEM_MAXLEN
}

/// Finds the first `Subject: ` line within the first 4 lines after the
/// status/marker lines, matching `getitemsubject`'s bounded search.
pub fn subject(item: &mut File) -> Result<String, &'static str> {
    item.seek(SeekFrom::Start(STATUS_LINE_LEN as u64))
        .map_err(|_| "fseek for subject failed")?;
    let mut reader = std::io::BufReader::new(item);
    use std::io::BufRead;
    for _ in 0..4 {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(|_| "read error while searching for subject")?;
        if n == 0 {
            return Err("has no subject (searched until early EOF)");
        }
        if let Some(rest) = line.strip_prefix(SUBJECT_PFXSTRING) {
            let trimmed = rest.trim_end();
            if trimmed.is_empty() {
                return Err("has empty subject");
            }
            return Ok(trimmed.to_string());
        }
    }
    Err("has no subject (searched first 4 lines)")
}

/// Reads the whole item file verbatim (dot-stuffing is applied by the
/// transmission layer, not here).
pub fn read_whole(path: &Path) -> Result<Vec<u8>, SpoolError> {
    Ok(std::fs::read(path)?)
}

/// Splices a replacement tail into an item during EDCF: bytes
/// `[0, STATUS_LINE_LEN)` get a refreshed status line, bytes
/// `[STATUS_LINE_LEN, len_before_edit)` are replaced by `replacement`,
/// and any bytes beyond `len_before_edit` (later replies appended while
/// the editor worked) are preserved untouched.
pub fn splice_edit(
    path: &Path,
    new_sequence: u32,
    continuing: Option<&str>,
    len_before_edit: u64,
    replacement: &[u8],
) -> Result<(), SpoolError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let current_len = file.metadata()?.len();
    if current_len < len_before_edit {
        return Err(SpoolError::corrupt(
            "item",
            "file shrank between EDIT and EDCF",
        ));
    }
    let mut tail = Vec::new();
    if current_len > len_before_edit {
        file.seek(SeekFrom::Start(len_before_edit))?;
        file.read_to_end(&mut tail)?;
    }
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(status_line(continuing, new_sequence).as_bytes())?;
    file.write_all(replacement)?;
    file.write_all(&tail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn status_line_has_fixed_width() {
        let line = status_line(None, 0x19);
        assert_eq!(line.len(), STATUS_LINE_LEN);
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn status_line_roundtrips_through_parse() {
        let line = status_line(Some("A0010101"), 0x2A);
        let (continuing, seq) = parse_status_line(&line).unwrap();
        assert_eq!(continuing.as_deref(), Some("A0010101"));
        assert_eq!(seq, 0x2A);
    }

    #[test]
    fn compose_header_falls_back_when_grogname_present_and_long() {
        let header = compose_header(
            "Item ",
            "A0010101",
            &"x".repeat(200),
            "alice@example.com",
            "12.00 on Mon 01 Jan",
        );
        let first_line = header.lines().next().unwrap();
        assert!(first_line.len() <= TEXTLINE_MAXLEN || header.contains(LONGGROGNAME_PFXSTRING));
    }

    #[test]
    fn compose_header_without_grogname_uses_simple_form() {
        let header = compose_header("Item ", "A0010101", "", "alice", "12.00 on Mon 01 Jan");
        assert!(header.starts_with("Item A0010101 from alice at"));
    }

    #[test]
    fn create_then_subject_and_status_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A0010101");
        create(
            &path,
            "A0010101",
            1,
            0x61000000,
            "Item ",
            "",
            "alice",
            "12.00 on Mon 01 Jan",
            "hello",
            "body text\n",
        )
        .unwrap();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        check_not_continued(&mut file).unwrap();
        let subj = subject(&mut file).unwrap();
        assert_eq!(subj, "hello");
    }

    #[test]
    fn splice_edit_rejects_shrunk_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A0010101");
        std::fs::write(&path, vec![b'x'; 10]).unwrap();
        let result = splice_edit(&path, 1, None, 50, b"replacement");
        assert!(result.is_err());
    }

    #[test]
    fn splice_edit_preserves_bytes_appended_after_len_before_edit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A0010101");
        let mut initial = status_line(None, 1).into_bytes();
        initial.extend_from_slice(b"old body");
        let len_before_edit = initial.len() as u64;
        initial.extend_from_slice(b"LATER REPLY");
        std::fs::write(&path, &initial).unwrap();
        splice_edit(&path, 2, None, len_before_edit, b"new body").unwrap();
        let result = std::fs::read_to_string(&path).unwrap();
        assert!(result.contains("new body"));
        assert!(result.ends_with("LATER REPLY"));
    }
}
