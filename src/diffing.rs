//! In-process unified diff for EDCF/withdraw, replacing the teacher's
//! out-of-process `diff(1)` invocation (see DESIGN.md decision 1) while
//! keeping its line-diff idiom from `src/data/diff.rs`. Grounded in
//! `original_source/server/groggsd.c:run_diff`.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use crate::error::SpoolError;

/// Produces a unified-style line diff between `before` and `after`, one
/// `-`/`+` per changed line, unchanged lines omitted (matching the
/// original's terse edit-log format rather than a full context diff).
pub fn unified_diff(before: &str, after: &str) -> String {
    let mut out = String::new();
    for d in diff::lines(before, after) {
        match d {
            diff::Result::Left(line) => {
                let _ = writeln!(out, "-{line}");
            }
            diff::Result::Right(line) => {
                let _ = writeln!(out, "+{line}");
            }
            diff::Result::Both(_, _) => {}
        }
    }
    out
}

/// A full-removal diff, used by withdraw against an empty replacement.
pub fn removal_diff(before: &str) -> String {
    unified_diff(before, "")
}

/// Appends a diff (and its header line) to the edit log, matching the
/// append-only text log spec.md §3 describes for `editlog`.
pub fn append_edit_log(path: &Path, header: &str, diff_text: &str) -> Result<(), SpoolError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{header}")?;
    file.write_all(diff_text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unified_diff_reports_changed_lines_only() {
        let before = "line one\nline two\nline three\n";
        let after = "line one\nline TWO\nline three\n";
        let diff_text = unified_diff(before, after);
        assert!(diff_text.contains("-line two"));
        assert!(diff_text.contains("+line TWO"));
        assert!(!diff_text.contains("line one"));
    }

    #[test]
    fn removal_diff_removes_every_line() {
        let before = "a\nb\n";
        let diff_text = removal_diff(before);
        assert!(diff_text.contains("-a"));
        assert!(diff_text.contains("-b"));
        assert!(!diff_text.contains('+'));
    }

    #[test]
    fn append_edit_log_accumulates_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("editlog");
        append_edit_log(&path, "edit of A0010101 by alice", "-old\n+new\n").unwrap();
        append_edit_log(&path, "withdraw of A0010101 by alice", "-new\n").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("edit of A0010101"));
        assert!(contents.contains("withdraw of A0010101"));
    }
}
