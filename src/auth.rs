//! MD5 challenge-response authentication (spec.md §4.6), grounded in
//! `original_source/server/groggsd.c:md5_sendchal,cmd_auth,authorise`.

use md5::{Digest, Md5};

use crate::config::SECRET_MAXBYTES;

pub const NONCE_LEN: usize = 16;

/// Inputs that vary per connection; `servseq` is the process-wide
/// monotonic counter the original incremented once per forked child and
/// this crate keeps as a shared `AtomicU64` across session threads.
pub struct NonceInputs {
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub servseq: u32,
    pub client_ip: [u8; 4],
    pub client_port: u16,
    pub pid: u32,
}

/// Builds the 16-byte server nonce: `tv_sec(4) | ((tv_usec<<12)+servseq)(4)
/// | client_ip(4) | client_port(2) | pid_low16(2)`, all host byte order.
pub fn server_nonce(inputs: &NonceInputs) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0..4].copy_from_slice(&inputs.tv_sec.to_ne_bytes());
    let second_word = (inputs.tv_usec.wrapping_shl(12)).wrapping_add(inputs.servseq);
    nonce[4..8].copy_from_slice(&second_word.to_ne_bytes());
    nonce[8..12].copy_from_slice(&inputs.client_ip);
    nonce[12..14].copy_from_slice(&inputs.client_port.to_ne_bytes());
    let pid_low16 = (inputs.pid & 0xFFFF) as u16;
    nonce[14..16].copy_from_slice(&pid_low16.to_ne_bytes());
    nonce
}

/// `md5_copyuserid`: zero-pads/truncates the userid into a 16-byte field.
pub fn userid16(userid: &str) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let bytes = userid.as_bytes();
    let n = bytes.len().min(16);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn invert(secret: &[u8]) -> Vec<u8> {
    secret.iter().map(|b| !b).collect()
}

/// Computes the client-side proof: `MD5(client_nonce | server_nonce |
/// userid16 | ~secret)`.
pub fn expected_client_hash(
    client_nonce: &[u8; NONCE_LEN],
    server_nonce: &[u8; NONCE_LEN],
    userid: &str,
    secret: &[u8],
) -> [u8; 16] {
    debug_assert!(secret.len() <= SECRET_MAXBYTES);
    let mut hasher = Md5::new();
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    hasher.update(userid16(userid));
    hasher.update(invert(secret));
    hasher.finalize().into()
}

/// Computes the server-side proof: `MD5(server_nonce | client_nonce |
/// userid16 | secret)` (not inverted).
pub fn server_proof(
    server_nonce: &[u8; NONCE_LEN],
    client_nonce: &[u8; NONCE_LEN],
    userid: &str,
    secret: &[u8],
) -> [u8; 16] {
    debug_assert!(secret.len() <= SECRET_MAXBYTES);
    let mut hasher = Md5::new();
    hasher.update(server_nonce);
    hasher.update(client_nonce);
    hasher.update(userid16(userid));
    hasher.update(secret);
    hasher.finalize().into()
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthOutcome {
    Accepted,
    ClientHashMismatch,
}

/// Full AUTH verification: returns the server proof on success. The
/// caller (session layer) is responsible for the ident-level promotion
/// from `md5initial` to `md5` on first successful login, and for the
/// failure-policy distinction (fatal vs soft-refusal) spec.md §4.6 §5
/// describes, since that depends on session authentication state this
/// module intentionally has no visibility into.
pub fn verify(
    client_hash: &[u8; 16],
    client_nonce: &[u8; NONCE_LEN],
    server_nonce: &[u8; NONCE_LEN],
    userid: &str,
    secret: &[u8],
) -> Result<[u8; 16], AuthOutcome> {
    let expected = expected_client_hash(client_nonce, server_nonce, userid, secret);
    if &expected != client_hash {
        return Err(AuthOutcome::ClientHashMismatch);
    }
    Ok(server_proof(server_nonce, client_nonce, userid, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> NonceInputs {
        NonceInputs {
            tv_sec: 0x61000000,
            tv_usec: 123456,
            servseq: 7,
            client_ip: [127, 0, 0, 1],
            client_port: 4000,
            pid: 99999,
        }
    }

    #[test]
    fn server_nonce_has_fixed_length_and_is_deterministic() {
        let a = server_nonce(&inputs());
        let b = server_nonce(&inputs());
        assert_eq!(a.len(), NONCE_LEN);
        assert_eq!(a, b);
    }

    #[test]
    fn userid16_pads_short_and_truncates_long() {
        let short = userid16("ab");
        assert_eq!(&short[..2], b"ab");
        assert_eq!(short[2], 0);
        let long = userid16(&"x".repeat(30));
        assert_eq!(long.len(), 16);
    }

    #[test]
    fn matching_secret_round_trips_full_handshake() {
        let server_n = server_nonce(&inputs());
        let client_n = [0x42u8; NONCE_LEN];
        let secret = b"sharedsecret";
        let client_hash = expected_client_hash(&client_n, &server_n, "alice", secret);
        let result = verify(&client_hash, &client_n, &server_n, "alice", secret);
        assert!(result.is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let server_n = server_nonce(&inputs());
        let client_n = [0x42u8; NONCE_LEN];
        let client_hash = expected_client_hash(&client_n, &server_n, "alice", b"correct");
        let result = verify(&client_hash, &client_n, &server_n, "alice", b"incorrect");
        assert_eq!(result, Err(AuthOutcome::ClientHashMismatch));
    }

    #[test]
    fn inverted_and_plain_secret_produce_different_hashes() {
        let server_n = server_nonce(&inputs());
        let client_n = [0x11u8; NONCE_LEN];
        let secret = b"sharedsecret";
        let client_side = expected_client_hash(&client_n, &server_n, "alice", secret);
        let server_side = server_proof(&server_n, &client_n, "alice", secret);
        assert_ne!(client_side, server_side);
    }
}
