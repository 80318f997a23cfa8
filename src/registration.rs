//! Registration flow (REGU/USER), secret-pool consumption, and the
//! external mail-sending collaborator (spec.md §4.9), grounded in
//! `original_source/server/groggsd.c:regster,getnewsecret`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::Command;

use crate::config::{RANDOMSTUFF_LOW, RANDOMSTUFF_WARN, SECRET_MAXBYTES};
use crate::error::SpoolError;
use crate::lock::{lock_range, LockKind};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SecretPoolOutcome {
    Ok,
    LowWater,
}

/// Consumes `bytes` from the tail of the secret-seed pool, truncating the
/// file. Returns the consumed bytes, or `LowWater` if doing so would
/// leave fewer than `RANDOMSTUFF_LOW` bytes behind.
pub fn take_secret(path: &Path, bytes: usize) -> Result<(Vec<u8>, SecretPoolOutcome), SpoolError> {
    debug_assert!(bytes <= SECRET_MAXBYTES);
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    lock_range(&file, LockKind::Write, 0, 1)?;
    let len = file.metadata()?.len() as i64;
    let trunc_to = len - bytes as i64;
    if trunc_to <= RANDOMSTUFF_LOW {
        return Ok((Vec::new(), SecretPoolOutcome::LowWater));
    }
    if trunc_to <= RANDOMSTUFF_WARN {
        log::error!("secret seed pool running low ({trunc_to} bytes left)");
    }
    file.seek(SeekFrom::Start(trunc_to as u64))?;
    let mut buf = vec![0u8; bytes];
    file.read_exact(&mut buf)?;
    file.set_len(trunc_to as u64)?;
    Ok((buf, SecretPoolOutcome::Ok))
}

/// Outcome of handing a freshly-minted account off to the mailer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MailOutcome {
    /// Mail sent, registration complete.
    Sent,
    /// Subprocess asked for a go-around (exit code 11): caller should
    /// let the user retry `USER` without the registration having stuck.
    Retry,
}

/// Sends the newly-registered user's secret by mail. Behind a trait so
/// the registration/session logic can be exercised in tests without a
/// real mailer binary on disk.
pub trait Mailer {
    fn send(&self, userid: &str, access: i8, client_ident: &str, secret_hex: &str) -> Result<MailOutcome, SpoolError>;
}

/// Default `Mailer`: spawns the configured mailer binary with
/// `userid access client_ident` as argv and the hex-encoded secret on
/// its stdin, mirroring the original's `REGUSER_PROGRAM` subprocess.
pub struct SubprocessMailer {
    pub path: std::path::PathBuf,
}

impl Mailer for SubprocessMailer {
    fn send(&self, userid: &str, access: i8, client_ident: &str, secret_hex: &str) -> Result<MailOutcome, SpoolError> {
        use std::process::Stdio;
        let mut child = Command::new(&self.path)
            .arg(userid)
            .arg(access.to_string())
            .arg(client_ident)
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(secret_hex.as_bytes())?;
        }
        let status = child.wait()?;
        match status.code() {
            Some(0) => Ok(MailOutcome::Sent),
            Some(11) => Ok(MailOutcome::Retry),
            other => Err(SpoolError::corrupt(
                "mailer",
                &format!("subprocess exited with unexpected status {other:?}"),
            )),
        }
    }
}

pub fn secret_hex(secret: &[u8]) -> String {
    crate::hexrec::encode_hex(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[test]
    fn take_secret_truncates_and_returns_tail_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secretseed");
        let mut pool = vec![0u8; 1000];
        pool[992..].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        std::fs::write(&path, &pool).unwrap();
        let (secret, outcome) = take_secret(&path, 8).unwrap();
        assert_eq!(outcome, SecretPoolOutcome::Ok);
        assert_eq!(secret, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 992);
    }

    #[test]
    fn take_secret_reports_low_water_without_consuming() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secretseed");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        let (secret, outcome) = take_secret(&path, 8).unwrap();
        assert_eq!(outcome, SecretPoolOutcome::LowWater);
        assert!(secret.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    struct FakeMailer {
        outcome: MailOutcome,
        calls: RefCell<Vec<(String, i8)>>,
    }

    impl Mailer for FakeMailer {
        fn send(&self, userid: &str, access: i8, _client_ident: &str, _secret_hex: &str) -> Result<MailOutcome, SpoolError> {
            self.calls.borrow_mut().push((userid.to_string(), access));
            Ok(self.outcome)
        }
    }

    #[test]
    fn fake_mailer_reports_retry_without_sending_real_mail() {
        let mailer = FakeMailer {
            outcome: MailOutcome::Retry,
            calls: RefCell::new(Vec::new()),
        };
        let outcome = mailer.send("alice", 1, "alice.example.com", "DEADBEEF").unwrap();
        assert_eq!(outcome, MailOutcome::Retry);
        assert_eq!(mailer.calls.borrow()[0], ("alice".to_string(), 1));
    }
}
