//! The two discovery messages and their wire constants.
//!
//! Discovery uses exactly two UDP payloads:
//!
//! ```text
//! ANNOUNCE   "ClipMesh-Discovery"                          (broadcast probe)
//! HELLO      "HELLO:<username>:<hostname>:<announced-ip>"  (unicast reply)
//! ```
//!
//! Both are plain UTF-8 text. There is no header, no version byte, and no
//! length prefix – the datagram boundary is the message boundary. Keeping the
//! format this small means a packet capture is human-readable and any node
//! version can talk to any other.

use serde::{Deserialize, Serialize};

/// Broadcast probe payload. A node that hears this on the discovery port
/// replies with a [`HelloMessage`] addressed to the sender.
pub const ANNOUNCE: &[u8] = b"ClipMesh-Discovery";

/// Prefix of every HELLO reply.
pub const HELLO_PREFIX: &str = "HELLO:";

/// Identity reply sent unicast in response to an [`ANNOUNCE`].
///
/// `announced_addr` is the address the *sender* believes it is reachable at.
/// Receivers treat the datagram's source address as authoritative and use the
/// announced one only for logging – NAT and multi-homed hosts can make the
/// two disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Display name configured on the replying node.
    pub username: String,
    /// OS hostname of the replying node.
    pub hostname: String,
    /// The address the replying node determined for itself.
    pub announced_addr: String,
}

impl HelloMessage {
    /// Convenience constructor taking anything string-like.
    pub fn new(
        username: impl Into<String>,
        hostname: impl Into<String>,
        announced_addr: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.into(),
            announced_addr: announced_addr.into(),
        }
    }
}
