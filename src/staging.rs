//! `DATA` command intake: per-line dot-(un)stuffing and the three
//! mode-dependent validation tables of spec.md §4.7, grounded in
//! `original_source/server/groggsd.c:cmd_data`.

use crate::config::{
    CONTRIB_MAXLEN, INDEXENTRY_LENINF, ITEM_MAXLEN, REPLY_MAXLEN, TEXTLINE_MAXLEN, USERID_MAXLEN,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// A new contribution (NEWI/REPL/CONT): first line is the grogname.
    Normal,
    /// EDIT was issued: first line is an ignored status line, the rest
    /// is item text (subject line required somewhere in it).
    EditItem,
    /// EDLK+EDIX: every line must itself be a fixed-width index record.
    EditIndex,
}

/// What the caller should do after feeding one line.
pub enum LineControl {
    /// Keep reading more lines.
    Continue,
    /// The terminating `.` line was seen; staging is complete.
    Done,
}

pub struct Staging {
    mode: Mode,
    first_line: bool,
    grogname: String,
    lines: Vec<String>,
    format_error: Option<String>,
}

impl Staging {
    pub fn new(mode: Mode) -> Self {
        Staging {
            mode,
            first_line: true,
            grogname: String::new(),
            lines: Vec::new(),
            format_error: None,
        }
    }

    /// Feeds one already-CRLF-stripped line. Performs dot-unstuffing
    /// (a line starting with `.` that isn't the bare terminator must be
    /// doubled; the leading one is stripped) and per-mode validation.
    /// Returns a protocol violation message (the caller should treat as
    /// fatal, matching `protocolviolation`) via `Err`.
    pub fn feed_line(&mut self, raw: &str) -> Result<LineControl, String> {
        if raw.len() > crate::config::INPUTLINE_MAXLEN {
            self.format_error.get_or_insert_with(|| "512 Line in transmitted data is far too long.".to_string());
            return Ok(LineControl::Continue);
        }
        let trimmed = raw.trim_end();
        if trimmed == "." {
            return Ok(LineControl::Done);
        }
        let content: &str = if let Some(stripped) = trimmed.strip_prefix('.') {
            if !stripped.starts_with('.') {
                return Err(
                    "582 Line starting with `.' wasn't dot-doubled or endmarker.".to_string(),
                );
            }
            stripped
        } else {
            trimmed
        };

        if self.format_error.is_none() {
            match self.mode {
                Mode::EditIndex => {
                    let mut padded = content.to_string();
                    if padded.len() < INDEXENTRY_LENINF - 1 {
                        padded.push_str(&" ".repeat(INDEXENTRY_LENINF - 1 - padded.len()));
                    }
                    if let Err(reason) = validate_index_line(&padded) {
                        self.format_error = Some(format!(
                            "423 Malformed index entry `{content}': {reason}."
                        ));
                    }
                }
                _ => {
                    if content.chars().count() > TEXTLINE_MAXLEN {
                        self.format_error = Some("423 Line too long for text of item.".to_string());
                    }
                }
            }
        }

        if self.first_line {
            self.first_line = false;
            if matches!(self.mode, Mode::Normal) {
                if content.len() + "From ".len() > TEXTLINE_MAXLEN {
                    self.format_error = Some("425 Grogname too long.".to_string());
                } else {
                    self.grogname = content.to_string();
                }
                return Ok(LineControl::Continue);
            }
            // EditItem/EditIndex: first line is an ignored status/placeholder.
            return Ok(LineControl::Continue);
        }

        if self.format_error.is_none() {
            if matches!(self.mode, Mode::Normal) && content.starts_with('^') {
                self.lines.push(format!("^{content}"));
            } else {
                self.lines.push(content.to_string());
            }
        }
        Ok(LineControl::Continue)
    }

    /// Finalizes intake, checking the size cap for the mode in use.
    pub fn finish(self) -> Result<StagedData, String> {
        if let Some(err) = self.format_error {
            return Err(err);
        }
        let body = self.lines.join("\n") + if self.lines.is_empty() { "" } else { "\n" };
        let cap = match self.mode {
            Mode::Normal => CONTRIB_MAXLEN,
            Mode::EditItem => ITEM_MAXLEN,
            Mode::EditIndex => u64::MAX,
        };
        if body.len() as u64 > cap {
            return Err("423 Data is too long for a Reply or Contribution.".to_string());
        }
        Ok(StagedData {
            grogname: self.grogname,
            body,
        })
    }
}

pub struct StagedData {
    pub grogname: String,
    pub body: String,
}

impl StagedData {
    pub fn fits_reply(&self) -> bool {
        self.body.len() as u64 <= REPLY_MAXLEN
    }
}

/// Extracts the first `Subject: ` line within the first 4 lines of a
/// freshly-staged edited item body, mirroring `item::subject`'s bounded
/// search but over an in-memory buffer rather than a status-prefixed
/// file (an `EDIT`/`EDCF` replacement text is spliced in right after a
/// freshly written status line, so there's no offset to skip here).
pub fn subject_from_text(body: &str) -> Option<String> {
    for line in body.lines().take(4) {
        if let Some(rest) = line.strip_prefix(crate::config::SUBJECT_PFXSTRING) {
            let trimmed = rest.trim_end();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Validates one line of a replacement index (spec.md §4.7's table):
/// 8-hex sequence, space, 8-hex time, space, 8-byte item-id-or-spaces,
/// space, 75-byte userid, space, RICFEM char, space, subject.
fn validate_index_line(line: &str) -> Result<(), &'static str> {
    let bytes = line.as_bytes();
    if bytes.len() < INDEXENTRY_LENINF - 1 {
        return Err("line too long");
    }
    let is_hex8 = |s: &[u8]| s.len() == 8 && s.iter().all(|b| b.is_ascii_hexdigit());
    if !is_hex8(&bytes[0..8]) {
        return Err("gsn format");
    }
    if bytes[8] != b' ' {
        return Err("space after gsn");
    }
    if !is_hex8(&bytes[9..17]) {
        return Err("date format");
    }
    if bytes[17] != b' ' {
        return Err("space after date");
    }
    let type_char = bytes[28 + USERID_MAXLEN];
    if !b"RICFEM".contains(&type_char) {
        return Err("RICFEM character");
    }
    if bytes[27 + USERID_MAXLEN] != b' ' {
        return Err("space after userid");
    }
    if bytes[29 + USERID_MAXLEN] != b' ' {
        return Err("space after RICFEM");
    }
    if type_char == b'M' {
        if !bytes[18..27].iter().all(|&b| b == b' ') {
            return Err("itemid blank in M");
        }
    } else {
        if !bytes[18].is_ascii_alphabetic() {
            return Err("itemid letter");
        }
        if !bytes[19..26].iter().all(|b| b.is_ascii_digit()) {
            return Err("itemid digits");
        }
        if bytes[26] != b' ' {
            return Err("space after itemid");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_mode_grogname_then_body_then_dot() {
        let mut s = Staging::new(Mode::Normal);
        s.feed_line("Some Grogname").unwrap();
        s.feed_line("first line of body").unwrap();
        s.feed_line("second line").unwrap();
        let control = s.feed_line(".").unwrap();
        assert!(matches!(control, LineControl::Done));
        let staged = s.finish().unwrap();
        assert_eq!(staged.grogname, "Some Grogname");
        assert!(staged.body.contains("first line of body"));
    }

    #[test]
    fn dot_doubled_line_is_unstuffed() {
        let mut s = Staging::new(Mode::Normal);
        s.feed_line("").unwrap();
        s.feed_line("..starts with a literal dot").unwrap();
        s.feed_line(".").unwrap();
        let staged = s.finish().unwrap();
        assert!(staged.body.contains(".starts with a literal dot"));
    }

    #[test]
    fn lone_undoubled_dot_prefix_is_a_protocol_violation() {
        let mut s = Staging::new(Mode::Normal);
        s.feed_line("").unwrap();
        let err = s.feed_line(".oops").unwrap_err();
        assert!(err.starts_with("582"));
    }

    #[test]
    fn over_long_text_line_is_a_format_error() {
        let mut s = Staging::new(Mode::Normal);
        s.feed_line("").unwrap();
        s.feed_line(&"x".repeat(200)).unwrap();
        s.feed_line(".").unwrap();
        let err = s.finish().unwrap_err();
        assert!(err.starts_with("423"));
    }

    #[test]
    fn edit_index_mode_validates_fixed_width_records() {
        let mut s = Staging::new(Mode::EditIndex);
        s.feed_line("ignored first line").unwrap();
        let mut record = format!("{:08X} {:08X} ", 1, 2);
        record.push_str(&" ".repeat(8));
        record.push(' ');
        record.push_str(&" ".repeat(USERID_MAXLEN));
        record.push_str(" M ");
        record.push_str("motd record");
        s.feed_line(&record).unwrap();
        s.feed_line(".").unwrap();
        assert!(s.finish().is_ok());
    }

    #[test]
    fn edit_index_mode_rejects_malformed_record() {
        let mut s = Staging::new(Mode::EditIndex);
        s.feed_line("ignored first line").unwrap();
        s.feed_line("not an index record at all").unwrap();
        s.feed_line(".").unwrap();
        let err = s.finish().unwrap_err();
        assert!(err.starts_with("423"));
    }
}
