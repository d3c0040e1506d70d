//! Handshake wire format.
//!
//! These types ARE the protocol. Fixed-size frames are `#[repr(C, packed)]`
//! with zerocopy derives for allocation-free parsing; variable-size payloads
//! (endpoint URLs, verdicts, channel messages) travel as length-prefixed
//! records. There is no unsafe code in this module.
//!
//! Sequence on a fresh stream:
//!
//!   initiator → `Protocol:intermaster-sim/1\n`        (plaintext)
//!   both      → KeyExchangeHello                     (plaintext, 36 bytes)
//!   both      → IdentityProof                        (record, 96 bytes)
//!   both      → endpoint URL                         (record, UTF-8)
//!   both      → verdict `OK` | `Unauthorized`        (record, UTF-8)
//!   both      → channel messages                     (records, JSON)

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::Role;

/// Protocol name announced in the preamble.
pub const PROTOCOL_NAME: &str = "intermaster-sim/1";

/// Preamble prefix, followed by the protocol name and `\n`.
pub const PREAMBLE_PREFIX: &str = "Protocol:";

/// Longest preamble line a listener will read before giving up.
pub const MAX_PREAMBLE_LEN: usize = 64;

/// Wire version carried in KeyExchangeHello.
pub const WIRE_VERSION: u8 = 0x01;

/// Largest record ciphertext accepted, tag included.
pub const MAX_RECORD_LEN: usize = 1 << 20;

/// Default upper bound for a whole handshake.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// ── Preamble ──────────────────────────────────────────────────────────────────

/// The line an initiator writes before anything else.
pub fn preamble() -> String {
    format!("{PREAMBLE_PREFIX}{PROTOCOL_NAME}\n")
}

/// Validate a preamble line (without its trailing `\n`).
pub fn check_preamble(line: &str) -> Result<(), WireError> {
    match line.strip_prefix(PREAMBLE_PREFIX) {
        Some(name) if name == PROTOCOL_NAME => Ok(()),
        Some(name) => Err(WireError::UnknownProtocol(name.to_string())),
        None => Err(WireError::MissingPreamble),
    }
}

// ── Key exchange ──────────────────────────────────────────────────────────────

/// First frame in each direction. Carries the sender's role explicitly and
/// its ephemeral X25519 public key.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct KeyExchangeHello {
    /// Must equal WIRE_VERSION.
    pub version: u8,
    /// 0x01 initiator, 0x02 responder.
    pub role: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    /// Ephemeral X25519 public key.
    pub ephemeral: [u8; 32],
}

assert_eq_size!(KeyExchangeHello, [u8; 36]);

impl KeyExchangeHello {
    pub fn new(role: Role, ephemeral: [u8; 32]) -> Self {
        Self {
            version: WIRE_VERSION,
            role: role.as_byte(),
            reserved: [0; 2],
            ephemeral,
        }
    }

    /// Parse and check a hello that is supposed to come from `expected`.
    pub fn parse(bytes: &[u8], expected: Role) -> Result<Self, WireError> {
        let hello = Self::read_from(bytes).ok_or(WireError::Size {
            frame: "KeyExchangeHello",
            expected: std::mem::size_of::<Self>(),
            actual: bytes.len(),
        })?;
        if hello.version != WIRE_VERSION {
            return Err(WireError::Version(hello.version));
        }
        match Role::from_byte(hello.role) {
            Some(role) if role == expected => Ok(hello),
            _ => Err(WireError::Role(hello.role)),
        }
    }
}

// ── Identity proof ────────────────────────────────────────────────────────────

/// Proof of possession of a long-term key: the claimed public key and its
/// signature over the session transcript.
///
/// Wire size: 96 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct IdentityProof {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

assert_eq_size!(IdentityProof, [u8; 96]);

impl IdentityProof {
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        Self::read_from(bytes).ok_or(WireError::Size {
            frame: "IdentityProof",
            expected: std::mem::size_of::<Self>(),
            actual: bytes.len(),
        })
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Encode a record length prefix (big-endian u32).
pub fn encode_record_len(len: usize) -> Result<[u8; 4], WireError> {
    if len > MAX_RECORD_LEN {
        return Err(WireError::RecordTooLarge(len));
    }
    Ok((len as u32).to_be_bytes())
}

/// Decode a record length prefix, enforcing MAX_RECORD_LEN.
pub fn decode_record_len(prefix: [u8; 4]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_RECORD_LEN {
        return Err(WireError::RecordTooLarge(len));
    }
    Ok(len)
}

// ── Verdict ───────────────────────────────────────────────────────────────────

/// Each side's approval decision about the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Unauthorized,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approved => "OK",
            Verdict::Unauthorized => "Unauthorized",
        }
    }

    /// Anything other than `OK` counts as a refusal.
    pub fn parse(s: &str) -> Self {
        if s == "OK" {
            Verdict::Approved
        } else {
            Verdict::Unauthorized
        }
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// Minimal shape check for an endpoint base address:
/// `scheme://[userinfo@]host[:port][...]`. The host must be non-empty and
/// the port, when present, numeric.
pub fn check_endpoint(url: &str) -> Result<(), WireError> {
    let bad = || WireError::Endpoint(url.to_string());
    let (scheme, rest) = url.split_once("://").ok_or_else(bad)?;
    let scheme_ok = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok {
        return Err(bad());
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (inner, after) = bracketed.split_once(']').ok_or_else(bad)?;
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':').ok_or_else(bad)?),
        };
        (inner, port)
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (host_port, None),
        }
    };

    let port_ok = port.map_or(true, |p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if host.is_empty() || !port_ok {
        return Err(bad());
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("stream did not start with a protocol preamble")]
    MissingPreamble,

    #[error("unsupported protocol {0:?}")]
    UnknownProtocol(String),

    #[error("{frame} is {actual} bytes, expected {expected}")]
    Size {
        frame: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported wire version {0:#04x}")]
    Version(u8),

    #[error("unexpected role byte {0:#04x}")]
    Role(u8),

    #[error("record of {0} bytes exceeds limit")]
    RecordTooLarge(usize),

    #[error("invalid endpoint address {0:?}")]
    Endpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_accepts_own_protocol_only() {
        let line = preamble();
        check_preamble(line.trim_end()).unwrap();
        assert!(matches!(
            check_preamble("Protocol:hudson.cli.CliProtocol2"),
            Err(WireError::UnknownProtocol(_))
        ));
        assert!(matches!(
            check_preamble("GET / HTTP/1.1"),
            Err(WireError::MissingPreamble)
        ));
    }

    #[test]
    fn preamble_fits_reader_limit() {
        assert!(preamble().len() <= MAX_PREAMBLE_LEN);
    }

    #[test]
    fn hello_parse_checks_role_and_version() {
        let hello = KeyExchangeHello::new(Role::Initiator, [7u8; 32]);
        let bytes = hello.as_bytes().to_vec();

        let parsed = KeyExchangeHello::parse(&bytes, Role::Initiator).unwrap();
        assert_eq!(parsed.ephemeral, [7u8; 32]);

        assert!(matches!(
            KeyExchangeHello::parse(&bytes, Role::Responder),
            Err(WireError::Role(1))
        ));

        let mut bad = bytes.clone();
        bad[0] = 0x09;
        assert!(matches!(
            KeyExchangeHello::parse(&bad, Role::Initiator),
            Err(WireError::Version(0x09))
        ));

        assert!(matches!(
            KeyExchangeHello::parse(&bytes[..10], Role::Initiator),
            Err(WireError::Size { .. })
        ));
    }

    #[test]
    fn record_len_limit() {
        assert_eq!(decode_record_len(encode_record_len(5).unwrap()).unwrap(), 5);
        assert!(encode_record_len(MAX_RECORD_LEN + 1).is_err());
        assert!(decode_record_len(u32::MAX.to_be_bytes()).is_err());
    }

    #[test]
    fn verdict_anything_but_ok_is_refusal() {
        assert_eq!(Verdict::parse("OK"), Verdict::Approved);
        assert_eq!(Verdict::parse("Unauthorized"), Verdict::Unauthorized);
        assert_eq!(Verdict::parse("ok"), Verdict::Unauthorized);
        assert_eq!(Verdict::parse(Verdict::Approved.as_str()), Verdict::Approved);
    }

    #[test]
    fn endpoint_shape() {
        check_endpoint("https://ci.example.com/").unwrap();
        check_endpoint("http://10.0.0.5:8080/jenkins").unwrap();
        assert!(check_endpoint("ci.example.com").is_err());
        assert!(check_endpoint("http:///path").is_err());
        assert!(check_endpoint("://host").is_err());
    }

    #[test]
    fn endpoint_needs_a_host_besides_the_port() {
        assert!(check_endpoint("http://:80").is_err());
        assert!(check_endpoint("http://user@:80/").is_err());
        assert!(check_endpoint("http://host:/").is_err());
        assert!(check_endpoint("http://host:http/").is_err());
        assert!(check_endpoint("http://[]:80/").is_err());
        check_endpoint("http://host:8080/x").unwrap();
        check_endpoint("http://[::1]:80/").unwrap();
        check_endpoint("http://[::1]/").unwrap();
        check_endpoint("https://ops@ci.example.com/").unwrap();
    }
}
