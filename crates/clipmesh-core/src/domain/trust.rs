//! Trust and ban membership for peer addresses.
//!
//! [`TrustSets`] holds the two address lists that gate every send and every
//! auto-trust decision. The single invariant the whole mesh relies on:
//!
//! > An address is never in both sets at once.
//!
//! Every mutation below preserves it – moving an address into one set first
//! removes it from the other, and `auto_trust` refuses banned addresses
//! outright. All operations are idempotent so the UI can replay a button
//! press without corrupting state.
//!
//! This type does no I/O. The node's `PeerStore` wraps it and persists after
//! each mutation; keeping the logic here means the disjointness properties
//! are testable without touching a filesystem.

use std::collections::BTreeSet;

use tracing::debug;

/// Selects one of the two membership lists for removal operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Trusted,
    Banned,
}

/// The disjoint trusted/banned address sets.
///
/// `BTreeSet` keeps iteration (and therefore persistence) order stable,
/// which makes the save/load fixed-point property hold byte-for-byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustSets {
    trusted: BTreeSet<String>,
    banned: BTreeSet<String>,
}

impl TrustSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the sets from persisted lists, enforcing disjointness.
    ///
    /// If an address somehow appears in both persisted lists (e.g. the files
    /// were edited by hand), the ban wins – the safer interpretation.
    pub fn from_lists(
        trusted: impl IntoIterator<Item = String>,
        banned: impl IntoIterator<Item = String>,
    ) -> Self {
        let banned: BTreeSet<String> = banned.into_iter().collect();
        let trusted = trusted
            .into_iter()
            .filter(|addr| !banned.contains(addr))
            .collect();
        Self { trusted, banned }
    }

    pub fn is_trusted(&self, addr: &str) -> bool {
        self.trusted.contains(addr)
    }

    pub fn is_banned(&self, addr: &str) -> bool {
        self.banned.contains(addr)
    }

    /// Auto-trust-on-first-contact policy gate.
    ///
    /// No-op for banned addresses. Returns `true` when the set changed, so
    /// the caller knows whether it needs to persist.
    pub fn auto_trust(&mut self, addr: &str) -> bool {
        if self.banned.contains(addr) {
            debug!("auto-trust refused for banned address {addr}");
            return false;
        }
        let inserted = self.trusted.insert(addr.to_string());
        if inserted {
            debug!("address {addr} auto-trusted on first contact");
        }
        inserted
    }

    /// Moves `addr` into the trusted set, clearing any ban.
    ///
    /// Returns `true` when either set changed.
    pub fn move_to_trusted(&mut self, addr: &str) -> bool {
        let removed = self.banned.remove(addr);
        let inserted = self.trusted.insert(addr.to_string());
        removed || inserted
    }

    /// Moves `addr` into the banned set, revoking any trust.
    ///
    /// Returns `true` when either set changed.
    pub fn move_to_banned(&mut self, addr: &str) -> bool {
        let removed = self.trusted.remove(addr);
        let inserted = self.banned.insert(addr.to_string());
        removed || inserted
    }

    /// Removes `addr` from the chosen list. Idempotent.
    pub fn remove(&mut self, kind: ListKind, addr: &str) -> bool {
        match kind {
            ListKind::Trusted => self.trusted.remove(addr),
            ListKind::Banned => self.banned.remove(addr),
        }
    }

    /// Snapshot of the trusted addresses in stable order.
    pub fn trusted(&self) -> Vec<String> {
        self.trusted.iter().cloned().collect()
    }

    /// Snapshot of the banned addresses in stable order.
    pub fn banned(&self) -> Vec<String> {
        self.banned.iter().cloned().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
