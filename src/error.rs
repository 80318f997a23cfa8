//! Error taxonomy for the spool layer and the session dispatcher.
//!
//! `SpoolError` covers the storage layer (fixed-width record files, locks,
//! subprocess plumbing) the way `io::Result` does in the lower layers of
//! the teacher's `data/write.rs`, but named so a command handler can tell
//! "this file is corrupt" apart from "the OS call failed". `Outcome` is
//! the session-visible taxonomy from the protocol's response-code classes.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors from the storage layer: locked spool files, fixed-width records,
/// and the subprocess-backed collaborators (mailer, udbm, ident).
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{file} is corrupt: {detail}")]
    Corrupt { file: String, detail: String },

    #[error("{what} is full")]
    Full { what: String },
}

impl SpoolError {
    pub fn corrupt(file: impl Into<String>, detail: impl Into<String>) -> Self {
        SpoolError::Corrupt {
            file: file.into(),
            detail: detail.into(),
        }
    }
}

/// What a command handler decided to do, mapped straight onto the
/// response-code classes in the wire protocol (spec.md §4.8/§7).
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A 1xx/2xx/3xx response: the client's request succeeded.
    Ok(String),
    /// A 5xx response: malformed command or wrong session state. The
    /// session stays open; supertrace is armed by the caller.
    Protocol(String),
    /// A 4xx response: well-formed command refused by policy or data
    /// state. The session stays open.
    Refusal(String),
    /// A 484 response: I/O failure or invariant violation. The session
    /// is closed after the response is sent; the process keeps running.
    Fatal(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok(s) | Outcome::Protocol(s) | Outcome::Refusal(s) | Outcome::Fatal(s) => {
                write!(f, "{s}")
            }
        }
    }
}

impl From<SpoolError> for Outcome {
    fn from(e: SpoolError) -> Self {
        Outcome::Fatal(format!("484 Server system error: {e}"))
    }
}

pub type HandlerResult = Result<Outcome, SpoolError>;
