//! ManagePeersUseCase: the peer-list facade consumed by the external UI.
//!
//! The UI never touches the store or the discovery sockets directly; it
//! talks to a [`PeerManager`] handed to it at startup. Everything here is a
//! thin, synchronous delegation – the UI triggers an action, gets a snapshot
//! back, and decides for itself what to render or notify.

use std::collections::BTreeSet;
use std::sync::Arc;

use clipmesh_core::ListKind;
use tracing::info;

use crate::infrastructure::network::discovery;
use crate::infrastructure::storage::peer_store::PeerStore;

/// Facade over discovery-on-demand and trust-list management.
pub struct PeerManager {
    store: Arc<PeerStore>,
    discovery_port: u16,
}

impl PeerManager {
    pub fn new(store: Arc<PeerStore>, discovery_port: u16) -> Self {
        Self {
            store,
            discovery_port,
        }
    }

    /// Runs one announce-and-collect discovery pass and returns the
    /// addresses found (banned peers excluded, self excluded).
    ///
    /// Blocking for roughly the discovery window (~7 s); UI threads call it
    /// from a worker, async callers wrap it in `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Fails only when no UDP socket could be created at all.
    pub fn discover_peers_once(&self) -> std::io::Result<BTreeSet<String>> {
        info!("UI-triggered peer discovery starting");
        discovery::discover_peers_once(self.discovery_port, &self.store)
    }

    /// Snapshot of the trusted addresses.
    pub fn trusted_addresses(&self) -> Vec<String> {
        self.store.trusted_addresses()
    }

    /// Snapshot of the banned addresses.
    pub fn banned_addresses(&self) -> Vec<String> {
        self.store.banned_addresses()
    }

    /// Friendliest known name for `addr` (username, hostname, or the
    /// address itself).
    pub fn display_name(&self, addr: &str) -> String {
        self.store.display_name(addr)
    }

    /// Trusts `addr`, clearing any ban.
    pub fn move_to_trusted(&self, addr: &str) {
        self.store.move_to_trusted(addr);
    }

    /// Bans `addr`, revoking any trust.
    pub fn move_to_banned(&self, addr: &str) {
        self.store.move_to_banned(addr);
    }

    /// Removes `addr` from the chosen list without adding it anywhere.
    pub fn remove_from_list(&self, kind: ListKind, addr: &str) {
        self.store.remove_from(kind, addr);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
