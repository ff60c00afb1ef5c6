//! Codec for the discovery messages.
//!
//! Parsing is deliberately forgiving about *content* and strict about
//! *shape*: usernames and hostnames are free text (minus `:`), but a HELLO
//! with the wrong field count or invalid UTF-8 is rejected with a typed
//! error so the caller can log and discard the datagram.
//!
//! The split uses `splitn(4, ':')`, mirroring how the reply is assembled:
//! the fourth field (the announced address) absorbs any remaining colons, so
//! a future IPv6 announced address does not break older parsers.

use crate::protocol::messages::{HelloMessage, ANNOUNCE, HELLO_PREFIX};
use thiserror::Error;

/// Errors produced while decoding a discovery datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload does not start with the HELLO prefix.
    #[error("not a HELLO payload")]
    NotHello,

    /// The payload had fewer than the four `:`-separated fields.
    #[error("incomplete HELLO: expected 4 fields, got {got}")]
    MissingFields { got: usize },

    /// The payload bytes are not valid UTF-8.
    #[error("undecodable HELLO payload: {0}")]
    InvalidUtf8(String),
}

/// Returns `true` when the datagram is exactly the ANNOUNCE probe token.
///
/// Anything else on the discovery port – including ANNOUNCE with trailing
/// garbage – is ignored by the listener.
pub fn is_announce(payload: &[u8]) -> bool {
    payload == ANNOUNCE
}

/// Encodes a [`HelloMessage`] into its wire form.
pub fn encode_hello(msg: &HelloMessage) -> Vec<u8> {
    format!(
        "{HELLO_PREFIX}{}:{}:{}",
        msg.username, msg.hostname, msg.announced_addr
    )
    .into_bytes()
}

/// Decodes a HELLO datagram.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidUtf8`] for undecodable bytes,
/// [`ProtocolError::NotHello`] when the prefix is absent, and
/// [`ProtocolError::MissingFields`] when fields are missing.
pub fn decode_hello(payload: &[u8]) -> Result<HelloMessage, ProtocolError> {
    let text =
        std::str::from_utf8(payload).map_err(|e| ProtocolError::InvalidUtf8(e.to_string()))?;

    if !text.starts_with(HELLO_PREFIX) {
        return Err(ProtocolError::NotHello);
    }

    // "HELLO" : username : hostname : announced_addr
    let parts: Vec<&str> = text.splitn(4, ':').collect();
    if parts.len() < 4 {
        return Err(ProtocolError::MissingFields { got: parts.len() });
    }

    Ok(HelloMessage {
        username: parts[1].to_string(),
        hostname: parts[2].to_string(),
        announced_addr: parts[3].to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
