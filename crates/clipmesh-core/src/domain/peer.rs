//! Peer identity records and the specificity-preserving merge rule.
//!
//! A [`PeerRecord`] is what a node remembers about one address: the username
//! and hostname learned from HELLO replies, and when the peer was last heard
//! from. Records are keyed by address string in the registry map and are
//! never deleted automatically – a peer that goes quiet keeps its entry so
//! the UI can still show a friendly name next to its trust-list row.
//!
//! # The merge rule
//!
//! HELLO replies are not all equally informative. A peer that has not been
//! configured yet announces itself as `"Unknown"`; once its user picks a
//! name, later replies carry the real one. The merge rule guarantees that a
//! placeholder never overwrites a specific value:
//!
//! - specific new value  → replaces whatever was stored;
//! - generic new value   → only `last_seen` refreshes.
//!
//! "Generic" means empty, whitespace-only, or the `"Unknown"` placeholder
//! (compared case-insensitively).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder used when a peer has not announced a real name yet.
pub const UNKNOWN: &str = "Unknown";

/// Last-known identity of a single peer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Display name announced by the peer. `"Unknown"` until learned.
    pub username: String,
    /// OS hostname announced by the peer. `"Unknown"` until learned.
    pub hostname: String,
    /// When the last successful handshake with this peer happened.
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    /// Creates a fresh record from a handshake, normalising empty fields to
    /// the placeholder.
    pub fn new(username: &str, hostname: &str, now: DateTime<Utc>) -> Self {
        Self {
            username: normalise(username),
            hostname: normalise(hostname),
            last_seen: now,
        }
    }

    /// Applies a later handshake to this record under the merge rule.
    ///
    /// `last_seen` always refreshes; each display field is replaced only when
    /// the incoming value is specific.
    pub fn apply_update(&mut self, username: &str, hostname: &str, now: DateTime<Utc>) {
        if is_specific(username) {
            self.username = username.trim().to_string();
        }
        if is_specific(hostname) {
            self.hostname = hostname.trim().to_string();
        }
        self.last_seen = now;
    }
}

/// Returns `true` when `value` carries real information (non-empty after
/// trimming and not the `"Unknown"` placeholder).
pub fn is_specific(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(UNKNOWN)
}

/// Resolves the friendliest available name for an address.
///
/// Preference order: username, hostname, the raw address itself.
pub fn display_name(addr: &str, record: Option<&PeerRecord>) -> String {
    if let Some(rec) = record {
        if is_specific(&rec.username) {
            return rec.username.clone();
        }
        if is_specific(&rec.hostname) {
            return rec.hostname.clone();
        }
    }
    addr.to_string()
}

fn normalise(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
