//! UDBM admin command: argv parsing (quoted-arg and `<stdin` forms) plus
//! a `UdbmBackend` trait wrapping the subprocess invocation, grounded in
//! `original_source/server/groggsd.c:cmd_udbm`.

use std::io::Write;
use std::process::{Command, Stdio};

use crate::config::UDBM_MAXARGS;
use crate::error::SpoolError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedUdbm {
    pub args: Vec<String>,
    pub stdin_line: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    TooManyArgs,
}

/// Tokenizes a UDBM command line: whitespace-separated tokens, `"..."`
/// quoted tokens with backslash-escaping, and an optional trailing
/// `< text to send on stdin`.
pub fn parse_args(cmd: &str) -> Result<ParsedUdbm, ParseError> {
    let mut args = Vec::new();
    let mut chars = cmd.trim_start().chars().peekable();
    let mut stdin_line = None;

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('<') => {
                chars.next();
                let rest: String = chars.collect();
                stdin_line = Some(rest.trim_start().to_string());
                break;
            }
            Some('"') => {
                chars.next();
                if args.len() == UDBM_MAXARGS {
                    return Err(ParseError::TooManyArgs);
                }
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '"' {
                        chars.next();
                        break;
                    }
                    if c == '\\' {
                        chars.next();
                        if let Some(&escaped) = chars.peek() {
                            token.push(escaped);
                            chars.next();
                            continue;
                        }
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                args.push(token);
            }
            Some(_) => {
                if args.len() == UDBM_MAXARGS {
                    return Err(ParseError::TooManyArgs);
                }
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                args.push(token);
            }
        }
    }
    Ok(ParsedUdbm { args, stdin_line })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UdbmExit {
    Exited(i32),
    Signaled(i32),
}

pub trait UdbmBackend {
    fn run(&self, extra_args: &[String], stdin_line: Option<&str>) -> Result<(String, UdbmExit), SpoolError>;
}

/// Default backend: `udbmanage --file <userdb> --restrict --noprompt
/// <extra args...>`, stdin fed the optional `<...` line, stdout+stderr
/// captured and returned verbatim for the caller to relay to the client.
pub struct SubprocessUdbm {
    pub program: std::path::PathBuf,
    pub userdb_path: std::path::PathBuf,
}

impl UdbmBackend for SubprocessUdbm {
    fn run(&self, extra_args: &[String], stdin_line: Option<&str>) -> Result<(String, UdbmExit), SpoolError> {
        let userdb_path_str = self.userdb_path.to_string_lossy().to_string();
        let mut command = Command::new(&self.program);
        command
            .arg("--file")
            .arg(&userdb_path_str)
            .arg("--restrict")
            .arg("--noprompt")
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;
        if let Some(line) = stdin_line {
            if let Some(stdin) = child.stdin.as_mut() {
                writeln!(stdin, "{line}")?;
            }
        }
        drop(child.stdin.take());
        let output = child.wait_with_output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let exit = match output.status.code() {
            Some(code) => UdbmExit::Exited(code),
            None => UdbmExit::Signaled(signal_from_status(&output.status)),
        };
        Ok((text, exit))
    }
}

#[cfg(unix)]
fn signal_from_status(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn signal_from_status(_status: &std::process::ExitStatus) -> i32 {
    0
}

pub fn format_exit_notice(exit: &UdbmExit) -> Option<String> {
    match exit {
        UdbmExit::Exited(0) => None,
        UdbmExit::Exited(code) => Some(format!("(udbm subprocess exited with status {code})\r\n")),
        UdbmExit::Signaled(sig) => Some(format!("(udbm subprocess died due to receiving signal {sig}!)\r\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_quoted_tokens() {
        let parsed = parse_args(r#"add "alice example" 1"#).unwrap();
        assert_eq!(parsed.args, vec!["add", "alice example", "1"]);
        assert_eq!(parsed.stdin_line, None);
    }

    #[test]
    fn parses_quoted_token_with_escaped_quote() {
        let parsed = parse_args(r#"set "bob \"the builder\"""#).unwrap();
        assert_eq!(parsed.args, vec!["set", "bob \"the builder\""]);
    }

    #[test]
    fn parses_trailing_stdin_redirect() {
        let parsed = parse_args("find alice < confirm yes").unwrap();
        assert_eq!(parsed.args, vec!["find", "alice"]);
        assert_eq!(parsed.stdin_line.as_deref(), Some("confirm yes"));
    }

    #[test]
    fn rejects_too_many_args() {
        let many = (0..UDBM_MAXARGS + 1)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(parse_args(&many), Err(ParseError::TooManyArgs));
    }

    #[test]
    fn format_exit_notice_is_silent_on_success() {
        assert_eq!(format_exit_notice(&UdbmExit::Exited(0)), None);
        assert!(format_exit_notice(&UdbmExit::Exited(1)).is_some());
        assert!(format_exit_notice(&UdbmExit::Signaled(9)).is_some());
    }
}
