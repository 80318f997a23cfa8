//! Compile-time protocol constants (mirroring `rgtp.h`/`config.h`) plus a
//! `serde`-deserializable `Config` for the handful of values the original
//! only ever changed by editing `config.h` and recompiling.

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const TCPPORT_RGTP: u16 = 1431;
pub const TCPPORT_IDENT: u16 = 113;

pub const TEXTLINE_MAXLEN: usize = 80;
pub const USERID_MAXLEN: usize = 75;
pub const INDEXENTRY_LEN: usize = 199;
pub const INDEXENTRY_LENINF: usize = INDEXENTRY_LEN + 1;
pub const TXRXLINE_MAXLEN: usize = 300;
pub const ITEMID_LEN: usize = 8;
pub const SUBJECTININDEX_MAXLEN: usize = 93;

pub const INPUTLINE_MAXLEN: usize = TXRXLINE_MAXLEN + 3;
pub const DATESTRING_FORMAT: &str = "%H.%M on %a %d %b";
pub const TCPIDENT_TIMEOUT_SECS: u64 = 20;
pub const REPLY_MAXLEN: u64 = 3000;
pub const CONTRIB_MAXLEN: u64 = 7000;
pub const ITEM_MAXLEN: u64 = 14000;
pub const STARTINGYEAR: i32 = 85;
pub const UDBM_MAXARGS: usize = 20;
pub const INACTIVITY_TIMEOUT_SECS: u64 = 3600;
pub const EDITORINACTIVITY_TIMEOUT_SECS: u64 = 1200;
pub const DATA_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SECRETBYTES: usize = 8;
pub const SECRET_MAXBYTES: usize = 16;
pub const RANDOMSTUFF_LOW: i64 = 128;
pub const RANDOMSTUFF_WARN: i64 = 256;

/// Slot count a freshly laid-out spool's `userdatabase` is pre-allocated
/// with. The hash table never grows on its own (spec.md §4.2's `tidy` is
/// the only resizing path), so an install needs enough headroom up front.
pub const USERDB_INITIAL_CAPACITY: usize = 512;

pub const SUBJECT_PFXSTRING: &str = "Subject: ";
pub const LONGGROGNAME_PFXSTRING: &str = "From ";
pub const LONGUSERID_PFXSTRING: &str = "User ";
pub const ITEMSTART_PFXSTRING: &str = "Item ";
pub const REPLYSTART_PFXSTRING: &str = "Reply ";
pub const EDITED_FILENAMESFX: &str = ".edited";

pub const REGUWARNING_STRING: &str = "250 Warning message follows\r\n\
 This procedure is the application for both posting access to the board\r\n\
 and membership of the society.\r\n\
The next USER command will record\r\n\
your claimed address and send your cryptographic key by email.\r\n\
 \r\n\
 Please give the userid you wish to use, including mail domain name.\r\n\
 Your calling identity is being recorded.  Do not give a false userid.\r\n\
If you do not wish to proceed with the registration issue a QUIT command.\r\n\
.\r\n";

/// Access levels, in the wire order they've always had: the value is sent
/// verbatim in `23x` responses so the ordinal must not move.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(i8)]
pub enum AccessLevel {
    None = 0,
    Read = 1,
    Write = 2,
    Edit = 3,
}

impl AccessLevel {
    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            0 => Some(AccessLevel::None),
            1 => Some(AccessLevel::Read),
            2 => Some(AccessLevel::Write),
            3 => Some(AccessLevel::Edit),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i8)]
pub enum IdentLevel {
    None = 0,
    Md5Initial = 1,
    Md5 = 2,
}

impl IdentLevel {
    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            0 => Some(IdentLevel::None),
            1 => Some(IdentLevel::Md5Initial),
            2 => Some(IdentLevel::Md5),
            _ => None,
        }
    }
}

/// Optional JSON overrides for values `config.h` hardcoded at compile
/// time. Unknown fields are a hard error rather than silently ignored,
/// so a typo in an operator's config file is caught at startup.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub spool_dir: PathBuf,
    pub mailer_path: PathBuf,
    pub udbm_path: PathBuf,
    pub default_secretbytes: usize,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            spool_dir: PathBuf::from("./spool"),
            mailer_path: PathBuf::from("/usr/local/libexec/boardd-mailer"),
            udbm_path: PathBuf::from("/usr/local/sbin/udbmanage"),
            default_secretbytes: DEFAULT_SECRETBYTES,
            port: TCPPORT_RGTP,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_original_compile_time_constants() {
        let c = Config::default();
        assert_eq!(c.default_secretbytes, 8);
        assert_eq!(c.port, 1431);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let json = r#"{"spool_dir": "/tmp/x", "bogus_field": 1}"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
