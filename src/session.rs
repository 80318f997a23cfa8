//! Per-connection session state machine and command dispatch (spec.md
//! §4.8), grounded in `original_source/server/groggsd.c:server()` and its
//! per-session `static` globals, which become fields of `Session` here
//! now that one OS thread serves one connection instead of one process.

use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};

use crate::auth::{self, NonceInputs};
use crate::config::{AccessLevel, Config, IdentLevel, ITEMID_LEN, TEXTLINE_MAXLEN, USERID_MAXLEN};
use crate::diffing;
use crate::hexrec;
use crate::ident;
use crate::index::{self, EntryKind, IndexEntry, SearchKey};
use crate::item;
use crate::lock::{try_lock_range, LockKind};
use crate::registration::{self, Mailer, MailOutcome};
use crate::spool::Spool;
use crate::staging::{self, Mode as StagingMode, Staging};
use crate::udbm::{self, UdbmBackend};
use crate::userdb::{self, ChangeResult, CreateMode, UserEntry};

/// Process-wide nonce serial, replacing the original's per-fork
/// `servseq`. Shared across every session thread.
pub static SERVSEQ: AtomicU32 = AtomicU32::new(0);

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as u32
}

fn datestring(timestamp: u32) -> String {
    let dt = Utc
        .timestamp_opt(timestamp as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());
    dt.format("%H.%M on %a %d %b").to_string()
}

pub struct PeerInfo {
    pub addr: IpAddr,
    pub port: u16,
    pub server_port: u16,
    pub pid: u32,
}

/// Mirrors the original's "editing" sub-state group (maycontinue,
/// saveditemid, edit, lenbeforeedit).
#[derive(Default)]
struct EditState {
    may_continue: bool,
    saved_item_id: Option<String>,
    holding_edit_lock: bool,
    len_before_edit: Option<u64>,
}

pub struct Session<W: Write> {
    spool: Spool,
    config: Config,
    out: W,
    peer: PeerInfo,

    alevel: AccessLevel,
    userid: String,
    registration: bool,
    identue: Option<UserEntry>,
    server_nonce: [u8; 16],

    edit: EditState,
    data: Option<StagingOutcome>,
    pending_staging: Option<Staging>,

    debug_level: u8,
    supertrace: bool,
    ident_done: bool,
}

enum StagingOutcome {
    Normal { grogname: String, body: String },
    EditedItem { status_ignored: String, body: String },
    EditedIndex { body: String },
}

impl<W: Write> Session<W> {
    pub fn new(spool: Spool, config: Config, out: W, peer: PeerInfo) -> Self {
        Session {
            spool,
            config,
            out,
            peer,
            alevel: AccessLevel::None,
            userid: String::new(),
            registration: false,
            identue: None,
            server_nonce: [0; 16],
            edit: EditState::default(),
            data: None,
            pending_staging: None,
            debug_level: 0,
            supertrace: false,
            ident_done: false,
        }
    }

    /// Forces edit-level access for `-debug` connections, mirroring the
    /// original's debug-mode bypass of the login dialogue.
    pub fn force_debug_level(&mut self, level: u8) {
        self.debug_level = level;
        self.alevel = AccessLevel::Edit;
        self.supertrace = true;
    }

    /// The read deadline that should apply to the *next* line, per
    /// spec.md §4.8/§5: `DATA_TIMEOUT` while a payload is being staged,
    /// `EDITORINACTIVITY_TIMEOUT` while the edit lock is held, otherwise
    /// the plain inactivity timeout.
    pub fn current_timeout(&self) -> Duration {
        if self.pending_staging.is_some() {
            Duration::from_secs(crate::config::DATA_TIMEOUT_SECS)
        } else if self.edit.holding_edit_lock {
            Duration::from_secs(crate::config::EDITORINACTIVITY_TIMEOUT_SECS)
        } else {
            Duration::from_secs(crate::config::INACTIVITY_TIMEOUT_SECS)
        }
    }

    /// Emits the `481` response for a timed-out read. The caller closes
    /// the connection immediately afterwards.
    pub fn respond_timeout(&mut self) -> std::io::Result<()> {
        self.respond("481 Timed out waiting for you to type something - goodbye.")
    }

    fn respond(&mut self, line: &str) -> std::io::Result<()> {
        write!(self.out, "{line}\r\n")
    }

    fn respond_multi(&mut self, lines: &[&str]) -> std::io::Result<()> {
        for line in lines {
            write!(self.out, "{line}\r\n")?;
        }
        Ok(())
    }

    fn set_status(&mut self, level: AccessLevel, msg: &str) -> std::io::Result<()> {
        self.alevel = level;
        const LEVEL_WORDS: [&str; 4] = ["no access yet", "no posting", "posting ok", "editor"];
        self.respond(&format!("23{} {} ({})", level as i8, msg, LEVEL_WORDS[level as usize]))
    }

    fn maybe_ident(&mut self) {
        if self.ident_done {
            return;
        }
        self.ident_done = true;
        let _ = ident::lookup(self.peer.addr, self.peer.port, self.peer.server_port);
    }

    fn editing(&self) -> bool {
        self.edit.len_before_edit.is_some()
    }

    fn no_edit_in_progress(&mut self) -> std::io::Result<bool> {
        if self.editing() {
            self.respond("532 Editing in progress - please finish or abort it first.")?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn data_done(&mut self) -> std::io::Result<bool> {
        if self.data.is_none() {
            self.respond("530 You haven't sent me any DATA yet.")?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn no_args(&mut self, args: &str) -> std::io::Result<bool> {
        if args.trim().is_empty() {
            Ok(true)
        } else {
            self.respond("511 This command does not accept arguments.")?;
            Ok(false)
        }
    }

    /// Dispatches one already-trimmed `VERB args...` line. Returns
    /// `false` when the connection should close.
    pub fn handle_line(&mut self, line: &str) -> std::io::Result<bool> {
        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v, r),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();
        let args = rest.trim_start();

        let Some(required) = Self::access_level_for(&verb) else {
            self.respond("500 Unrecognised command.")?;
            return Ok(true);
        };
        if self.alevel < required && !(self.debug_level > 0) {
            self.respond("530 That command needs a higher access level.")?;
            return Ok(true);
        }

        match verb.as_str() {
            "DBUG" => self.cmd_dbug(args)?,
            "HELP" => self.cmd_help(args)?,
            "MOTD" => self.cmd_motd(args)?,
            "NOOP" => {
                if self.no_args(args)? {
                    self.respond("200 NOOP command received.")?;
                }
            }
            "QUIT" => {
                if self.no_args(args)? {
                    self.respond("280 Goodbye.")?;
                }
                return Ok(false);
            }
            "REGU" => self.cmd_regu(args)?,
            "USER" => self.cmd_user(args)?,
            "AUTH" => self.cmd_auth(args)?,
            "ALVL" => self.cmd_alvl(args)?,
            "ELOG" => self.cmd_elog(args)?,
            "INDX" => self.cmd_indx(args)?,
            "ITEM" => self.cmd_item(args)?,
            "STAT" => self.cmd_stat(args)?,
            "DATA" => self.cmd_data(args)?,
            "NEWI" => self.cmd_newi(args)?,
            "REPL" => self.cmd_repl(args)?,
            "CONT" => self.cmd_cont(args)?,
            "DIFF" => self.cmd_diff(args)?,
            "EDLK" => self.cmd_edlk(args)?,
            "EDUL" => self.cmd_edul(args)?,
            "EDIT" => self.cmd_edit(args)?,
            "EDIX" => self.cmd_edix(args)?,
            "EDAB" => self.cmd_edab(args)?,
            "EDCF" => self.cmd_edcf(args)?,
            "KILL" | "KILR" => self.cmd_kill_kilr(&verb, args)?,
            "MOTS" => self.cmd_mots(args)?,
            "UDBM" => self.cmd_udbm(args)?,
            _ => self.respond("500 Unrecognised command.")?,
        }
        Ok(true)
    }

    fn access_level_for(verb: &str) -> Option<AccessLevel> {
        use AccessLevel::*;
        Some(match verb {
            "AUTH" | "ALVL" | "DBUG" | "HELP" | "MOTD" | "NOOP" | "QUIT" | "REGU" | "USER" => None,
            "ELOG" | "INDX" | "ITEM" | "STAT" => Read,
            "CONT" | "DATA" | "NEWI" | "REPL" => Write,
            "DIFF" | "EDLK" | "EDUL" | "EDIT" | "EDIX" | "EDAB" | "EDCF" | "KILL" | "KILR"
            | "MOTS" | "UDBM" => Edit,
            _ => return None,
        })
    }

    fn cmd_dbug(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        self.supertrace = true;
        self.respond("200 Debug mode enabled.")
    }

    fn cmd_help(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        self.supertrace = true;
        self.respond("250 Help information follows ...")?;
        const VERBS: &[&str] = &[
            "AUTH", "ALVL", "DBUG", "HELP", "MOTD", "NOOP", "QUIT", "REGU", "USER", "ELOG",
            "INDX", "ITEM", "STAT", "CONT", "DATA", "NEWI", "REPL", "DIFF", "EDLK", "EDUL",
            "EDIT", "EDIX", "EDAB", "EDCF", "KILL", "KILR", "MOTS", "UDBM",
        ];
        for chunk in VERBS.chunks(5) {
            self.respond(&format!("    {}", chunk.join("    ")))?;
        }
        self.respond(".")
    }

    fn cmd_motd(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        match std::fs::read_to_string(self.spool.motd()) {
            Ok(text) => {
                self.respond("250 Message of the Day follows")?;
                write!(self.out, "{text}")?;
                self.respond(".")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.respond("410 There is no message of the day.")
            }
            Err(e) => Err(e),
        }
    }

    fn cmd_regu(&mut self, args: &str) -> std::io::Result<()> {
        if !args.is_empty() {
            self.respond("511 REGU takes no arguments.")?;
            return Ok(());
        }
        self.maybe_ident();
        self.registration = true;
        write!(self.out, "{}", crate::config::REGUWARNING_STRING)?;
        Ok(())
    }

    fn cmd_user(&mut self, args: &str) -> std::io::Result<()> {
        let claimed = match userdb::check_userid(args) {
            Ok(id) => id,
            Err(reason) => {
                self.respond(&format!("511 Invalid userid: {reason}."))?;
                return Ok(());
            }
        };
        if self.registration {
            self.registration = false;
            return self.do_register(&claimed);
        }
        self.userid = claimed.clone();
        self.authorise(&claimed, None)
    }

    fn do_register(&mut self, userid: &str) -> std::io::Result<()> {
        self.maybe_ident();
        let bytes = self.config.default_secretbytes;
        let (secret, outcome) = match registration::take_secret(&self.spool.secretseed(), bytes) {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error while allocating a secret.")?;
                return Ok(());
            }
        };
        if outcome == registration::SecretPoolOutcome::LowWater {
            self.respond("484 I've run out of random numbers - please try tomorrow.")?;
            return Ok(());
        }
        let mut entry = UserEntry::new(userid, crate::config::AccessLevel::None, IdentLevel::Md5Initial, &secret, now_unix());
        entry.disabled = 0;
        let rc = match userdb::change(&self.spool.userdatabase(), &entry, CreateMode::MustCreate) {
            Ok(rc) => rc,
            Err(_) => {
                self.respond("484 Server system error updating the user database.")?;
                return Ok(());
            }
        };
        match rc {
            ChangeResult::PolicyRejected => {
                self.respond("482 Re-registration denied - contact the editors.")
            }
            ChangeResult::Full => self.respond("484 Sorry, user database is full.  Please try again later."),
            ChangeResult::Ok => {
                let mailer = registration::SubprocessMailer {
                    path: self.config.mailer_path.clone(),
                };
                let client_ident = format!("{},{}", self.peer.addr, self.peer.port);
                let hex = registration::secret_hex(&secret);
                match mailer.send(userid, entry.access, &client_ident, &hex) {
                    Ok(MailOutcome::Sent) => self.respond("280 Goodbye."),
                    Ok(MailOutcome::Retry) => self.respond("282 Please try registering again."),
                    Err(_) => self.respond("484 Server system error while sending your key."),
                }
            }
        }
    }

    fn authorise(&mut self, userid: &str, access: Option<i8>) -> std::io::Result<()> {
        if self.debug_level > 0 {
            return self.set_status(AccessLevel::Edit, "Login successful - debug mode");
        }
        let path = self.spool.userdatabase();
        let found = userdb::find(&path, &userid_bytes(userid), access).unwrap_or(None);
        let entry = match found {
            Some(e) => e,
            None => {
                if access.is_some() {
                    if let Ok(Some(any)) = userdb::find(&path, &userid_bytes(userid), None) {
                        if any.access > 0 {
                            self.maybe_ident();
                            return self.respond("432 You are denied that access level.");
                        }
                    }
                }
                self.maybe_ident();
                return self.respond("432 You are unknown to me - please ask the Editors for a userid.");
            }
        };
        let mut refreshed = entry.clone();
        refreshed.lastref = now_unix();
        let _ = userdb::change(&path, &refreshed, CreateMode::NeverCreate);
        if entry.disabled != 0 {
            self.maybe_ident();
            return self.respond("432 That userid is disabled; contact the Editors.");
        }
        match IdentLevel::from_i8(entry.ident) {
            Some(IdentLevel::None) => {
                let access_level = AccessLevel::from_i8(entry.access).unwrap_or(AccessLevel::None);
                self.set_status(access_level, "Unconfirmed login OK")
            }
            Some(IdentLevel::Md5Initial) | Some(IdentLevel::Md5) => {
                self.identue = Some(entry);
                self.respond("130 MD5  Please provide proof of identity.")?;
                self.send_challenge()
            }
            None => self.respond("484 Server system error: unknown ident level."),
        }
    }

    fn send_challenge(&mut self) -> std::io::Result<()> {
        SERVSEQ.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let inputs = NonceInputs {
            tv_sec: now.as_secs() as u32,
            tv_usec: now.subsec_micros(),
            servseq: SERVSEQ.load(Ordering::SeqCst),
            client_ip: ip_to_bytes(self.peer.addr),
            client_port: self.peer.port,
            pid: self.peer.pid,
        };
        self.server_nonce = auth::server_nonce(&inputs);
        self.respond(&format!("333 {}", hexrec::encode_hex(&self.server_nonce)))
    }

    fn cmd_auth(&mut self, args: &str) -> std::io::Result<()> {
        let Some(entry) = self.identue.clone() else {
            self.respond("500 AUTH not expected.")?;
            return Ok(());
        };
        let mut parts = args.split_whitespace();
        let (Some(hash_hex), Some(nonce_hex), None) = (parts.next(), parts.next(), parts.next()) else {
            self.respond("511 Hex stream contained non-hex-digit or finished too early.")?;
            return Ok(());
        };
        let (Some((client_hash, _)), Some((client_nonce, _))) = (
            hexrec::decode_hex_n(hash_hex, 16),
            hexrec::decode_hex_n(nonce_hex, 16),
        ) else {
            self.respond("511 Hex stream contained non-hex-digit or finished too early.")?;
            return Ok(());
        };
        let client_hash: [u8; 16] = client_hash.try_into().unwrap();
        let client_nonce: [u8; 16] = client_nonce.try_into().unwrap();
        let secret = &entry.secret[..entry.secretbytes as usize];
        match auth::verify(&client_hash, &client_nonce, &self.server_nonce, &entry.userid_str(), secret) {
            Err(_) => {
                self.maybe_ident();
                self.identue = None;
                self.auth_failure("Identity confirmation failed", 3)
            }
            Ok(proof) => {
                self.respond(&format!("133 {}", hexrec::encode_hex(&proof)))?;
                let mut updated = entry.clone();
                if IdentLevel::from_i8(entry.ident) == Some(IdentLevel::Md5Initial) {
                    updated.ident = IdentLevel::Md5 as i8;
                    let _ = userdb::change(&self.spool.userdatabase(), &updated, CreateMode::NeverCreate);
                    self.identue = None;
                    let access = AccessLevel::from_i8(updated.access).unwrap_or(AccessLevel::None);
                    self.set_status(access, "Registration complete")
                } else {
                    self.identue = None;
                    let access = AccessLevel::from_i8(entry.access).unwrap_or(AccessLevel::None);
                    self.set_status(access, "Identity confirmed")
                }
            }
        }
    }

    fn auth_failure(&mut self, msg: &str, code_tens: u8) -> std::io::Result<()> {
        if self.alevel != AccessLevel::None {
            self.respond(&format!("43{code_tens} {msg}."))
        } else {
            self.respond(&format!("48{code_tens} {msg}."))
        }
    }

    fn cmd_alvl(&mut self, args: &str) -> std::io::Result<()> {
        let wanted = args.trim();
        if self.userid.is_empty() {
            self.respond("500 Need to be logged in using USER to use ALVL.")?;
            return Ok(());
        }
        if self.identue.is_some() {
            self.respond("500 Authentication procedure in progress.")?;
            return Ok(());
        }
        let requested: i8 = match wanted.parse() {
            Ok(v) => v,
            Err(_) => {
                self.respond("511 Access level must be a number.")?;
                return Ok(());
            }
        };
        if requested < 0 {
            self.respond("432 Sorry, I don't do default levels.")
        } else if requested < self.alevel as i8 {
            let level = AccessLevel::from_i8(requested).unwrap_or(AccessLevel::None);
            self.set_status(level, "Access downgraded on request")
        } else if requested == self.alevel as i8 {
            self.respond(&format!("23{} Access level unchanged.", self.alevel as i8))
        } else {
            let userid = self.userid.clone();
            self.authorise(&userid, Some(requested))
        }
    }

    fn cmd_elog(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        match std::fs::read_to_string(self.spool.editlog()) {
            Ok(text) => {
                self.respond("250 Edit log follows")?;
                write!(self.out, "{text}")?;
                self.respond(".")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.respond("250 No edits stored")?;
                self.respond(".")
            }
            Err(e) => Err(e),
        }
    }

    fn cmd_indx(&mut self, args: &str) -> std::io::Result<()> {
        let (use_seq, rest) = match args.strip_prefix('#') {
            Some(r) => (true, r),
            None => (false, args),
        };
        let target: u32 = if rest.is_empty() {
            0
        } else {
            match u32::from_str_radix(rest, 16) {
                Ok(v) => v,
                Err(_) => {
                    self.respond("511 Date must be only a hex number.")?;
                    return Ok(());
                }
            }
        };
        let key = if use_seq { SearchKey::Sequence } else { SearchKey::Timestamp };
        let start = match index::lower_bound(&self.spool.index(), key, target) {
            Ok(v) => v.unwrap_or_else(|| 0),
            Err(_) => {
                self.respond("484 Server system error reading the index.")?;
                return Ok(());
            }
        };
        let entries = index::read_all(&self.spool.index()).unwrap_or_default();
        let start = start.min(entries.len());
        self.respond("250 Index follows")?;
        for entry in &entries[start..] {
            write!(self.out, "{}", String::from_utf8_lossy(&entry.to_bytes()))?;
        }
        self.respond(".")
    }

    fn cmd_item(&mut self, args: &str) -> std::io::Result<()> {
        let Some(id) = self.parse_item_id(args)? else { return Ok(()) };
        match item::read_whole(&self.spool.item(&id)) {
            Ok(bytes) => {
                self.respond("250 Item follows")?;
                self.out.write_all(&bytes)?;
                self.respond(".")
            }
            Err(_) => self.no_item(&id),
        }
    }

    fn cmd_stat(&mut self, args: &str) -> std::io::Result<()> {
        let Some(id) = self.parse_item_id(args)? else { return Ok(()) };
        self.edit.may_continue = false;
        let path = self.spool.item(&id);
        let mut file = match std::fs::OpenOptions::new().read(true).open(&path) {
            Ok(f) => f,
            Err(_) => return self.no_item(&id),
        };
        let seq = match item::read_sequence_field(&mut file) {
            Ok(v) => v,
            Err(_) => return self.no_item(&id),
        };
        let subject = item::subject(&mut file).unwrap_or_default();
        self.respond(&format!("211 {:08X} {subject}", seq))
    }

    fn parse_item_id(&mut self, args: &str) -> std::io::Result<Option<String>> {
        let trimmed = args.trim();
        if trimmed.len() != ITEMID_LEN
            || !trimmed.chars().next().unwrap_or(' ').is_ascii_alphabetic()
            || !trimmed[1..].chars().all(|c| c.is_ascii_digit())
        {
            self.respond("511 Item-ID must be a letter followed by 7 digits.")?;
            return Ok(None);
        }
        Ok(Some(trimmed.to_ascii_uppercase()))
    }

    fn no_item(&mut self, id: &str) -> std::io::Result<()> {
        self.respond(&format!("420 No such item `{id}'."))
    }

    fn cmd_data(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        // The caller feeds subsequent lines via `feed_data_line` until it
        // reports completion; this entry point just announces readiness.
        let mode = if self.editing() {
            match &self.edit.saved_item_id {
                Some(id) if !id.is_empty() => StagingMode::EditItem,
                _ => StagingMode::EditIndex,
            }
        } else {
            StagingMode::Normal
        };
        let prompt = match mode {
            StagingMode::Normal => "grogname and text",
            StagingMode::EditItem => "item status (ignored) and updated contents",
            StagingMode::EditIndex => "updated index",
        };
        self.respond(&format!("150 Send {prompt}; finish with `.'"))?;
        self.pending_staging = Some(Staging::new(mode));
        Ok(())
    }

    /// Called by the line-reading loop once per line while a DATA intake
    /// is in progress (`self.pending_staging.is_some()`).
    pub fn feed_data_line(&mut self, raw: &str) -> std::io::Result<()> {
        let Some(staging) = self.pending_staging.as_mut() else {
            return Ok(());
        };
        match staging.feed_line(raw) {
            Ok(staging::LineControl::Continue) => Ok(()),
            Ok(staging::LineControl::Done) => {
                let staging = self.pending_staging.take().unwrap();
                match staging.finish() {
                    Ok(staged) => {
                        let outcome = if self.editing() {
                            match &self.edit.saved_item_id {
                                Some(id) if !id.is_empty() => StagingOutcome::EditedItem {
                                    status_ignored: staged.grogname,
                                    body: staged.body,
                                },
                                _ => StagingOutcome::EditedIndex { body: staged.body },
                            }
                        } else {
                            StagingOutcome::Normal {
                                grogname: staged.grogname,
                                body: staged.body,
                            }
                        };
                        self.data = Some(outcome);
                        self.respond("350 Data received, thanks.  What shall I do with it?")
                    }
                    Err(msg) => self.respond(&msg),
                }
            }
            Err(msg) => self.respond(&msg),
        }
    }

    pub fn awaiting_data_line(&self) -> bool {
        self.pending_staging.is_some()
    }

    fn cmd_newi(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_edit_in_progress()? || !self.data_done()? {
            return Ok(());
        }
        if !subject_ok(args, &mut self.out)? {
            return Ok(());
        }
        let subject = args.trim().to_string();
        let Some(StagingOutcome::Normal { grogname, body }) = self.data.take() else {
            self.respond("500 No new-item data staged.")?;
            return Ok(());
        };
        self.edit.may_continue = false;
        let id = match crate::sequence::new_item_id(&self.spool) {
            Ok(id) => id,
            Err(_) => {
                self.respond("484 Server system error minting an item id.")?;
                return Ok(());
            }
        };
        let now = now_unix();
        let ds = datestring(now);
        let item_path = self.spool.item(&id);
        let index_path = self.spool.index();
        let userid = self.userid.clone();
        let sequence = match index::with_write_lock(&index_path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            item::create(
                &item_path,
                &id,
                sequence,
                now,
                crate::config::ITEMSTART_PFXSTRING,
                &grogname,
                &userid,
                &ds,
                &subject,
                &body,
            )?;
            let entry = IndexEntry {
                sequence,
                timestamp: now,
                item_id: Some(id.clone()),
                userid: userid.clone(),
                kind: EntryKind::Item,
                subject: subject.clone(),
            };
            index::append(&index_path, &entry)?;
            Ok(sequence)
        }) {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error creating the item.")?;
                return Ok(());
            }
        };
        self.respond(&format!("120 {id}"))?;
        self.respond(&format!("220 {:08X}  Item inserted and index updated.", sequence))
    }

    fn cmd_repl(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_edit_in_progress()? || !self.data_done()? {
            return Ok(());
        }
        let Some(id) = self.parse_item_id(args)? else { return Ok(()) };
        let Some(StagingOutcome::Normal { grogname, body }) = &self.data else {
            self.respond("500 No reply data staged.")?;
            return Ok(());
        };
        if body.len() as u64 > crate::config::REPLY_MAXLEN {
            self.respond("423 Data is too long for a Reply.")?;
            self.data = None;
            return Ok(());
        }
        let grogname = grogname.clone();
        let body = body.clone();
        self.data = None;
        self.edit.may_continue = false;
        let item_path = self.spool.item(&id);
        let mut file = match std::fs::OpenOptions::new().read(true).write(true).open(&item_path) {
            Ok(f) => f,
            Err(_) => return self.no_item(&id),
        };
        if item::check_not_continued(&mut file).is_err() {
            self.respond(&format!("422 Item {id} has already been continued."))?;
            return Ok(());
        }
        let current_len = file.metadata()?.len();
        if item::would_exceed_item_maxlen(current_len, body.len() as u64) {
            self.edit.saved_item_id = Some(id.clone());
            self.edit.may_continue = true;
            self.respond("421 Reply is too long to fit in the same item.")?;
            return Ok(());
        }
        let now = now_unix();
        let subject = item::subject(&mut file).unwrap_or_default();
        let ds = datestring(now);
        let header = item::compose_header(
            crate::config::REPLYSTART_PFXSTRING,
            "",
            &grogname,
            &self.userid,
            &ds,
        );
        let index_path = self.spool.index();
        let sequence = match index::with_write_lock(&index_path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            item::append_contribution(&mut file, sequence, now, &header, None, &body)?;
            let entry = IndexEntry {
                sequence,
                timestamp: now,
                item_id: Some(id.clone()),
                userid: self.userid.clone(),
                kind: EntryKind::Reply,
                subject: subject.clone(),
            };
            index::append(&index_path, &entry)?;
            Ok(sequence)
        }) {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error allocating a sequence number.")?;
                return Ok(());
            }
        };
        self.respond(&format!("220 {:08X}  Reply to {id} inserted and index updated.", sequence))
    }

    fn cmd_cont(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_edit_in_progress()? || !self.data_done()? || !subject_ok(args, &mut self.out)? {
            return Ok(());
        }
        if !self.edit.may_continue {
            self.respond("500 No item is awaiting a CONT.")?;
            return Ok(());
        }
        let Some(old_id) = self.edit.saved_item_id.clone() else {
            self.respond("500 No item is awaiting a CONT.")?;
            return Ok(());
        };
        let subject = args.trim().to_string();
        let Some(StagingOutcome::Normal { grogname, body }) = self.data.take() else {
            self.respond("500 No continuation data staged.")?;
            return Ok(());
        };
        let mut old_file = match std::fs::OpenOptions::new().read(true).write(true).open(self.spool.item(&old_id)) {
            Ok(f) => f,
            Err(_) => return self.no_item(&old_id),
        };
        if item::check_not_continued(&mut old_file).is_err() {
            self.respond(&format!("422 Item {old_id} has already been continued."))?;
            return Ok(());
        }
        let old_subject = item::subject(&mut old_file).unwrap_or_default();
        let new_id = match crate::sequence::new_item_id(&self.spool) {
            Ok(id) => id,
            Err(_) => {
                self.respond("484 Server system error minting an item id.")?;
                return Ok(());
            }
        };
        let now = now_unix();
        let ds = datestring(now);
        let index_path = self.spool.index();
        let result = index::with_write_lock(&index_path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            item::create(
                &self.spool.item(&new_id),
                &new_id,
                sequence,
                now,
                crate::config::ITEMSTART_PFXSTRING,
                &grogname,
                &self.userid,
                &ds,
                &subject,
                &body,
            )?;
            item::rewrite_continuation_field(&mut old_file, &new_id)?;
            let entry_c = IndexEntry {
                sequence,
                timestamp: now,
                item_id: Some(new_id.clone()),
                userid: self.userid.clone(),
                kind: EntryKind::Continuation,
                subject: subject.clone(),
            };
            let entry_f = IndexEntry {
                sequence,
                timestamp: now,
                item_id: Some(old_id.clone()),
                userid: self.userid.clone(),
                kind: EntryKind::FromContinuation,
                subject: old_subject.clone(),
            };
            index::append(&index_path, &entry_c)?;
            index::append(&index_path, &entry_f)?;
            Ok(sequence)
        });
        let sequence = match result {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error allocating a sequence number.")?;
                return Ok(());
            }
        };
        self.edit.may_continue = false;
        self.respond(&format!("120 {new_id}"))?;
        self.respond(&format!(
            "220 {:08X}  Item {old_id} continued as {new_id} and index updated.",
            sequence
        ))
    }

    fn cmd_diff(&mut self, args: &str) -> std::io::Result<()> {
        let (base_path, label) = if args.trim().is_empty() {
            (self.spool.index(), "index".to_string())
        } else {
            let Some(id) = self.parse_item_id(args)? else { return Ok(()) };
            (self.spool.item(&id), id)
        };
        let mut edited = base_path.into_os_string();
        edited.push(crate::config::EDITED_FILENAMESFX);
        match std::fs::read_to_string(&edited) {
            Ok(text) => {
                self.respond(&format!("250 Diffs for {label} follow"))?;
                write!(self.out, "{text}")?;
                self.respond(".")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.respond("410 There are no relevant diffs.")
            }
            Err(_) => self.respond("484 Server system error reading diffs."),
        }
    }

    fn cmd_edlk(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        if self.edit.holding_edit_lock {
            self.respond("500 EDLK already issued.")?;
            return Ok(());
        }
        let path = self.spool.editlock();
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
        match try_lock_range(&file, LockKind::Write, 0, USERID_MAXLEN as i64) {
            Ok(true) => {
                use std::io::{Seek, SeekFrom};
                let mut file = file;
                file.seek(SeekFrom::Start(0))?;
                let padded = format!("{:<width$}", self.userid, width = USERID_MAXLEN);
                file.write_all(padded.as_bytes())?;
                file.flush()?;
                self.edit.holding_edit_lock = true;
                self.respond("200 Message area is now locked for editing.")
            }
            Ok(false) => {
                let mut buf = vec![0u8; USERID_MAXLEN];
                use std::io::Read as _;
                let mut file = file;
                let _ = file.read_exact(&mut buf);
                let who = String::from_utf8_lossy(&buf).trim_end().to_string();
                self.respond(&format!("411 {who} has locked the message area for editing"))
            }
            Err(_) => self.respond("484 Server system error acquiring the edit lock."),
        }
    }

    fn cmd_edul(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? || !self.no_edit_in_progress()? {
            return Ok(());
        }
        if !self.edit.holding_edit_lock {
            self.respond("532 No lock held so can't unlock it.")?;
            return Ok(());
        }
        let path = self.spool.editlock();
        if let Ok(file) = std::fs::OpenOptions::new().read(true).write(true).open(&path) {
            let _ = crate::lock::unlock_range(&file, 0, USERID_MAXLEN as i64);
        }
        self.edit.holding_edit_lock = false;
        self.respond("200 Lock on edit area relinquished.")
    }

    fn start_edit(&mut self, id: Option<String>) -> std::io::Result<()> {
        if !self.no_edit_in_progress()? {
            return Ok(());
        }
        if !self.edit.holding_edit_lock {
            self.respond("532 EDLK required before EDIT/EDIX.")?;
            return Ok(());
        }
        self.edit.may_continue = false;
        let path = match &id {
            Some(item_id) => self.spool.item(item_id),
            None => self.spool.index(),
        };
        let contents = match std::fs::read(&path) {
            Ok(c) => c,
            Err(_) => return self.no_item(id.as_deref().unwrap_or("index")),
        };
        self.edit.len_before_edit = Some(contents.len() as u64);
        self.data = None;
        self.edit.saved_item_id = id;
        self.respond("250 Current contents follow")?;
        self.out.write_all(&contents)?;
        self.respond(".")
    }

    fn cmd_edit(&mut self, args: &str) -> std::io::Result<()> {
        let Some(id) = self.parse_item_id(args)? else { return Ok(()) };
        self.start_edit(Some(id))
    }

    fn cmd_edix(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        self.start_edit(None)
    }

    fn cmd_edab(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? || !self.editing() {
            if !self.editing() {
                self.respond("532 No edit in progress.")?;
            }
            return Ok(());
        }
        self.data = None;
        self.edit.len_before_edit = None;
        self.edit.saved_item_id = None;
        self.respond("200 Edit operation aborted.")
    }

    fn cmd_edcf(&mut self, args: &str) -> std::io::Result<()> {
        if args.trim().is_empty() {
            self.respond("511 A reason must be given for the edit.")?;
            return Ok(());
        }
        if !self.editing() {
            self.respond("532 No edit in progress.")?;
            return Ok(());
        }
        let reason = args.trim().to_string();
        let len_before_edit = self.edit.len_before_edit.unwrap();
        match self.edit.saved_item_id.clone() {
            Some(id) if !id.is_empty() => {
                if self.data.is_some() {
                    self.edcf_item(&id, &reason, len_before_edit)
                } else {
                    self.edcf_withdraw(&id, &reason)
                }
            }
            _ => {
                if self.data.is_none() {
                    self.respond("500 Cannot withdraw the index.")
                } else {
                    self.edcf_index(&reason, len_before_edit)
                }
            }
        }
    }

    fn edcf_item(&mut self, id: &str, reason: &str, len_before_edit: u64) -> std::io::Result<()> {
        let Some(StagingOutcome::EditedItem { body, .. }) = self.data.take() else {
            self.respond("500 No edited item staged.")?;
            return Ok(());
        };
        let subject = match staging::subject_from_text(&body) {
            Some(s) => s,
            None => {
                self.respond("423 Subject line missing from edited version.")?;
                return Ok(());
            }
        };
        let now = now_unix();
        let ds = datestring(now);
        let path = self.spool.item(id);
        let before = std::fs::read_to_string(&path).unwrap_or_default();
        let index_path = self.spool.index();
        let result = index::with_write_lock(&index_path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            item::splice_edit(&path, sequence, None, len_before_edit, body.as_bytes())?;
            let entry = IndexEntry {
                sequence,
                timestamp: now,
                item_id: Some(id.to_string()),
                userid: self.userid.clone(),
                kind: EntryKind::Edit,
                subject: subject.clone(),
            };
            index::append(&index_path, &entry)?;
            Ok(sequence)
        });
        let sequence = match result {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error splicing the edited item.")?;
                return Ok(());
            }
        };
        let after = std::fs::read_to_string(&path).unwrap_or_default();
        let diff_text = diffing::unified_diff(&before, &after);
        let mut edited_path = path.into_os_string();
        edited_path.push(crate::config::EDITED_FILENAMESFX);
        let _ = diffing::append_edit_log(
            &std::path::PathBuf::from(&edited_path),
            &format!("--label=Item {id} Before #{sequence:08X} {ds}"),
            &diff_text,
        );
        let header = format!("Item {id} edited by {} at {ds} (#{sequence:08X}):\n{reason}\n\n", self.userid);
        let _ = diffing::append_edit_log(&self.spool.editlog(), &header, "");
        self.edit.len_before_edit = None;
        self.edit.saved_item_id = None;
        self.respond(&format!("220 {:08X}  Edit complete.", sequence))
    }

    fn edcf_index(&mut self, reason: &str, len_before_edit: u64) -> std::io::Result<()> {
        let Some(StagingOutcome::EditedIndex { body }) = self.data.take() else {
            self.respond("500 No edited index staged.")?;
            return Ok(());
        };
        let now = now_unix();
        let ds = datestring(now);
        let path = self.spool.index();
        let before = std::fs::read_to_string(&path).unwrap_or_default();
        let replacement_entries: Vec<IndexEntry> = body
            .lines()
            .filter_map(|line| index::IndexEntry::from_bytes(format!("{line:<w$}\n", w = crate::config::INDEXENTRY_LEN).as_bytes()).ok())
            .collect();
        let result = index::with_write_lock(&path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            let entries = index::read_all(&path)?;
            let kept_count = (len_before_edit as usize) / index::RECORD_LEN;
            index::replace_tail(&path, kept_count.min(entries.len()), &replacement_entries)?;
            Ok(sequence)
        });
        let sequence = match result {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error splicing the edited index.")?;
                return Ok(());
            }
        };
        let after = std::fs::read_to_string(&path).unwrap_or_default();
        let diff_text = diffing::unified_diff(&before, &after);
        let mut edited_path = path.into_os_string();
        edited_path.push(crate::config::EDITED_FILENAMESFX);
        let _ = diffing::append_edit_log(
            &std::path::PathBuf::from(&edited_path),
            &format!("--label=index Before #{sequence:08X} {ds}"),
            &diff_text,
        );
        let header = format!("Index edited by {} at {ds} (#{sequence:08X}):\n{reason}\n\n", self.userid);
        let _ = diffing::append_edit_log(&self.spool.editlog(), &header, "");
        self.edit.len_before_edit = None;
        self.edit.saved_item_id = None;
        self.respond(&format!("220 {:08X}  Edit complete.", sequence))
    }

    fn edcf_withdraw(&mut self, id: &str, reason: &str) -> std::io::Result<()> {
        let now = now_unix();
        let ds = datestring(now);
        let path = self.spool.item(id);
        let before_item = std::fs::read_to_string(&path).unwrap_or_default();
        let index_path = self.spool.index();
        let before_index = index::read_all(&index_path).unwrap_or_default();
        let result = index::with_write_lock(&index_path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            index::withdraw(&index_path, id)?;
            Ok(sequence)
        });
        let sequence = match result {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error allocating a sequence number.")?;
                return Ok(());
            }
        };
        let item_diff = diffing::removal_diff(&before_item);
        let index_before_text = before_index
            .iter()
            .map(|e| String::from_utf8_lossy(&e.to_bytes()).to_string())
            .collect::<String>();
        let index_after_text = index::read_all(&self.spool.index())
            .unwrap_or_default()
            .iter()
            .map(|e| String::from_utf8_lossy(&e.to_bytes()).to_string())
            .collect::<String>();
        let index_diff = diffing::unified_diff(&index_before_text, &index_after_text);
        let mut edited_index_path = self.spool.index().into_os_string();
        edited_index_path.push(crate::config::EDITED_FILENAMESFX);
        let _ = diffing::append_edit_log(
            &std::path::PathBuf::from(edited_index_path),
            &format!("--label={id} Withdrawn at {ds}"),
            &index_diff,
        );
        let mut edited_item_path = path.clone().into_os_string();
        edited_item_path.push(crate::config::EDITED_FILENAMESFX);
        let _ = diffing::append_edit_log(
            &std::path::PathBuf::from(edited_item_path),
            &format!("--label={id} Withdrawn at {ds}"),
            &item_diff,
        );
        let header = format!("Item {id} withdrawn by {} at {ds} (#{sequence:08X}):\n{reason}\n\n", self.userid);
        let _ = diffing::append_edit_log(&self.spool.editlog(), &header, "");
        let _ = std::fs::remove_file(&path);
        self.edit.len_before_edit = None;
        self.edit.saved_item_id = None;
        self.respond(&format!("220 {:08X}  Item withdrawn.", sequence))
    }

    fn cmd_kill_kilr(&mut self, verb: &str, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? {
            return Ok(());
        }
        self.maybe_ident();
        if verb == "KILL" {
            crate::supervisor::request_shutdown();
            self.respond("200 Server shutdown requested.")
        } else {
            crate::supervisor::request_restart();
            self.respond("200 Server restart requested.")
        }
    }

    fn cmd_mots(&mut self, args: &str) -> std::io::Result<()> {
        if !self.no_args(args)? || !self.data_done()? {
            return Ok(());
        }
        let Some(StagingOutcome::Normal { body, .. }) = self.data.take() else {
            self.respond("500 No MOTD text staged.")?;
            return Ok(());
        };
        let now = now_unix();
        let index_path = self.spool.index();
        let result = index::with_write_lock(&index_path, || {
            let sequence = crate::sequence::next_sequence(&self.spool)?;
            let motd_text = format!("{now:08X} {sequence:08X}\n{body}");
            std::fs::write(self.spool.motd(), motd_text)?;
            let entry = IndexEntry {
                sequence,
                timestamp: now,
                item_id: None,
                userid: self.userid.clone(),
                kind: EntryKind::Motd,
                subject: String::new(),
            };
            index::append(&index_path, &entry)?;
            Ok(sequence)
        });
        let sequence = match result {
            Ok(v) => v,
            Err(_) => {
                self.respond("484 Server system error allocating a sequence number.")?;
                return Ok(());
            }
        };
        self.respond(&format!("220 {:08X}  Message of the Day updated.", sequence))
    }

    fn cmd_udbm(&mut self, args: &str) -> std::io::Result<()> {
        let parsed = match udbm::parse_args(args) {
            Ok(p) => p,
            Err(_) => {
                self.respond("250 Too many arguments to UDBM.")?;
                self.respond("Too many arguments to UDBM.")?;
                return self.respond(".");
            }
        };
        let backend = udbm::SubprocessUdbm {
            program: self.config.udbm_path.clone(),
            userdb_path: self.spool.userdatabase(),
        };
        self.respond("250 Response follows.")?;
        match backend.run(&parsed.args, parsed.stdin_line.as_deref()) {
            Ok((text, exit)) => {
                write!(self.out, "{text}")?;
                if let Some(notice) = udbm::format_exit_notice(&exit) {
                    write!(self.out, "{notice}")?;
                }
            }
            Err(_) => {
                write!(self.out, "(udbm subprocess could not be started)\r\n")?;
            }
        }
        self.respond(".")
    }
}

fn subject_ok(subject: &str, out: &mut impl Write) -> std::io::Result<bool> {
    if subject.trim().is_empty() {
        write!(out, "511 No Subject line specified for new item.\r\n")?;
        return Ok(false);
    }
    if subject.len() + crate::config::SUBJECT_PFXSTRING.len() > TEXTLINE_MAXLEN {
        write!(out, "424 Subject is too long.\r\n")?;
        return Ok(false);
    }
    Ok(true)
}

fn userid_bytes(s: &str) -> [u8; USERID_MAXLEN] {
    let mut out = [0u8; USERID_MAXLEN];
    let bytes = s.as_bytes();
    let n = bytes.len().min(USERID_MAXLEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn ip_to_bytes(ip: IpAddr) -> [u8; 4] {
    match ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => [0, 0, 0, 0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, Spool, Session<Vec<u8>>) {
        let dir = tempdir().unwrap();
        let spool = Spool::new(dir.path());
        spool.ensure_layout().unwrap();
        let peer = PeerInfo {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 4000,
            server_port: 1431,
            pid: 4242,
        };
        let session = Session::new(spool.clone(), Config::default(), Vec::new(), peer);
        (dir, spool, session)
    }

    fn lines_of(out: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(out)
            .split("\r\n")
            .map(|s| s.to_string())
            .collect()
    }

    fn feed(session: &mut Session<Vec<u8>>, line: &str) -> bool {
        if session.awaiting_data_line() {
            session.feed_data_line(line).unwrap();
            true
        } else {
            session.handle_line(line).unwrap()
        }
    }

    #[test]
    fn unrecognised_command_is_500() {
        let (_dir, _spool, mut session) = harness();
        session.handle_line("BOGUS").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("500"));
    }

    #[test]
    fn noop_and_quit() {
        let (_dir, _spool, mut session) = harness();
        assert!(session.handle_line("NOOP").unwrap());
        assert!(!session.handle_line("QUIT").unwrap());
        let out = lines_of(&session.out);
        assert!(out.iter().any(|l| l.starts_with("200")));
        assert!(out.iter().any(|l| l.starts_with("280")));
    }

    #[test]
    fn write_gated_command_refused_before_login() {
        let (_dir, _spool, mut session) = harness();
        session.handle_line("NEWI Some subject").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("530"));
    }

    #[test]
    fn user_unknown_is_refused() {
        let (_dir, _spool, mut session) = harness();
        session.handle_line("USER ghost@example.com").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("432"));
    }

    fn make_user(spool: &Spool, userid: &str, access: AccessLevel, ident: IdentLevel, secret: &[u8]) {
        let entry = UserEntry::new(userid, access, ident, secret, 0);
        let rc = userdb::change(&spool.userdatabase(), &entry, CreateMode::MustCreate).unwrap();
        assert_eq!(rc, ChangeResult::Ok);
    }

    #[test]
    fn passwordless_login_sets_access_level() {
        let (_dir, spool, mut session) = harness();
        make_user(&spool, "alice", AccessLevel::Write, IdentLevel::None, &[]);
        session.handle_line("USER alice").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("232"), "expected 232 got {:?}", out[0]);
        assert_eq!(session.alevel, AccessLevel::Write);
    }

    #[test]
    fn md5_handshake_round_trips_and_posts() {
        let (_dir, spool, mut session) = harness();
        let secret = b"sharedsecret".to_vec();
        make_user(&spool, "alice", AccessLevel::Write, IdentLevel::Md5, &secret);

        session.handle_line("USER alice").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("130"));
        let nonce_line = out.iter().find(|l| l.starts_with("333 ")).unwrap();
        let server_nonce_hex = nonce_line.trim_start_matches("333 ").trim();
        let (server_nonce_bytes, _) = hexrec::decode_hex_n(server_nonce_hex, 16).unwrap();
        let server_nonce: [u8; 16] = server_nonce_bytes.try_into().unwrap();

        let client_nonce = [0x42u8; 16];
        let client_hash = auth::expected_client_hash(&client_nonce, &server_nonce, "alice", &secret);
        session.out.clear();
        session
            .handle_line(&format!(
                "AUTH {} {}",
                hexrec::encode_hex(&client_hash),
                hexrec::encode_hex(&client_nonce)
            ))
            .unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("133"));
        assert!(out[1].starts_with("232"));
        assert_eq!(session.alevel, AccessLevel::Write);

        // Now post a new item end to end.
        session.out.clear();
        session.handle_line("DATA").unwrap();
        assert!(session.awaiting_data_line());
        feed(&mut session, "My Grogname");
        feed(&mut session, "Hello, board.");
        feed(&mut session, ".");
        assert!(!session.awaiting_data_line());
        let out = lines_of(&session.out);
        assert!(out.iter().any(|l| l.starts_with("350")));

        session.out.clear();
        session.handle_line("NEWI A fresh subject").unwrap();
        let out = lines_of(&session.out);
        assert!(out.iter().any(|l| l.starts_with("120")));
        assert!(out.iter().any(|l| l.starts_with("220")));

        let entries = index::read_all(&spool.index()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Item);
        assert_eq!(entries[0].userid, "alice");
    }

    #[test]
    fn wrong_auth_hash_is_refused_and_closes_unauthenticated_session() {
        let (_dir, spool, mut session) = harness();
        let secret = b"sharedsecret".to_vec();
        make_user(&spool, "alice", AccessLevel::Write, IdentLevel::Md5, &secret);
        session.handle_line("USER alice").unwrap();
        session.out.clear();
        let client_nonce = [0x11u8; 16];
        let bogus_hash = [0u8; 16];
        session
            .handle_line(&format!(
                "AUTH {} {}",
                hexrec::encode_hex(&bogus_hash),
                hexrec::encode_hex(&client_nonce)
            ))
            .unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("48"), "expected an unauthenticated 48x failure, got {:?}", out[0]);
        assert_eq!(session.alevel, AccessLevel::None);
    }

    #[test]
    fn edlk_then_repeat_is_rejected_and_edul_releases() {
        let (_dir, _spool, mut session) = harness();
        session.force_debug_level(1);
        session.userid = "alice".to_string();
        session.handle_line("EDLK").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("200"));

        session.out.clear();
        session.handle_line("EDLK").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("500"), "expected 500 on repeat EDLK, got {:?}", out[0]);

        session.out.clear();
        session.handle_line("EDUL").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("200"));
        assert!(!session.edit.holding_edit_lock);
    }

    #[test]
    fn item_not_found_is_420() {
        let (_dir, _spool, mut session) = harness();
        session.force_debug_level(1);
        session.handle_line("ITEM A0000001").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("420"));
    }

    #[test]
    fn registration_creates_user_even_when_mailer_is_unreachable() {
        // The default mailer path has no real binary in a test environment,
        // so the mail step fails and we get a 484 — but the user record
        // itself must already have been written before that subprocess runs.
        let (_dir, spool, mut session) = harness();
        std::fs::write(spool.secretseed(), vec![7u8; 1000]).unwrap();
        session.handle_line("REGU").unwrap();
        assert!(session.registration);
        session.out.clear();
        session.handle_line("USER newbie@example.com").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("484"), "expected 484 from the missing mailer, got {:?}", out[0]);
        let found = userdb::find(
            &spool.userdatabase(),
            &userid_bytes("newbie@example.com"),
            None,
        )
        .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().ident, IdentLevel::Md5Initial as i8);
    }

    #[test]
    fn reregistration_of_existing_user_is_denied() {
        let (_dir, spool, mut session) = harness();
        make_user(&spool, "alice", AccessLevel::Write, IdentLevel::Md5, b"x");
        std::fs::write(spool.secretseed(), vec![7u8; 1000]).unwrap();
        session.handle_line("REGU").unwrap();
        session.out.clear();
        session.handle_line("USER alice").unwrap();
        let out = lines_of(&session.out);
        assert!(out[0].starts_with("482"), "expected 482 re-registration denial, got {:?}", out[0]);
    }
}
