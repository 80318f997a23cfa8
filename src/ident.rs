//! Best-effort RFC 1413 ident lookup, grounded in
//! `original_source/server/groggsd.c:tcpident`. Never blocks core session
//! logic beyond its own bounded timeout, and every failure path is
//! swallowed into `None` the way the original only ever logs and returns.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::config::{TCPIDENT_TIMEOUT_SECS, TCPPORT_IDENT};

/// Performs one ident query against `client_addr`, asking who owns
/// `client_port` as seen connecting to our `server_port`. Returns the
/// trimmed response line, or `None` on any connect/timeout/IO failure.
pub fn lookup(client_addr: std::net::IpAddr, client_port: u16, server_port: u16) -> Option<String> {
    let addr = SocketAddr::new(client_addr, TCPPORT_IDENT);
    let timeout = Duration::from_secs(TCPIDENT_TIMEOUT_SECS);
    let mut stream = TcpStream::connect_timeout(&addr, timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.set_write_timeout(Some(timeout)).ok()?;

    let request = format!("{client_port}, {server_port}\r\n");
    stream.write_all(request.as_bytes()).ok()?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf);
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_against_a_closed_port_returns_none() {
        let result = lookup("127.0.0.1".parse().unwrap(), 4000, 1431);
        assert!(result.is_none());
    }
}
