//! Persistence and lookup for peer identities and trust membership.
//!
//! The store owns three JSON files inside the app config directory:
//!
//! ```text
//! trusted_peers.json   {"users": ["10.0.0.5", ...]}
//! banned_peers.json    {"users": ["10.0.0.9", ...]}
//! known_peers.json     {"10.0.0.5": {"username": "...", "hostname": "...",
//!                                    "last_seen": "2026-08-06T12:00:00Z"}, ...}
//! ```
//!
//! Durability model: every mutation rewrites the affected file in full.
//! Concurrent writers race at whole-file granularity and the last writer
//! wins – acceptable for single-digit peer counts and low-frequency updates.
//! A write failure is logged and the in-memory state stays authoritative
//! until the next successful write; a corrupt file at load time is logged
//! and replaced by an empty in-memory default without touching the file.
//!
//! All reads hand out snapshots (owned clones), never references into the
//! locked state, so the UI can render lists without holding the store lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use clipmesh_core::{display_name, ListKind, PeerRecord, TrustSets};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const TRUSTED_FILE: &str = "trusted_peers.json";
const BANNED_FILE: &str = "banned_peers.json";
const KNOWN_PEERS_FILE: &str = "known_peers.json";

/// Error type for store construction. Runtime persistence failures are
/// logged rather than surfaced – see the module docs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state directory could not be created.
    #[error("could not create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk shape of the trusted/banned lists.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AddressList {
    users: Vec<String>,
}

/// In-memory state guarded by the store lock.
#[derive(Debug, Default)]
struct StoreState {
    trust: TrustSets,
    peers: BTreeMap<String, PeerRecord>,
}

/// The peer registry and trust lists, persisted on every mutation.
pub struct PeerStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl PeerStore {
    /// Opens (or initialises) the store in `dir`.
    ///
    /// Missing files are created with empty contents so a fresh install has
    /// a complete, editable state directory. Corrupt files are logged and
    /// treated as empty without being overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CreateDir`] when `dir` cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let trusted = load_address_list(&dir.join(TRUSTED_FILE));
        let banned = load_address_list(&dir.join(BANNED_FILE));
        let peers = load_known_peers(&dir.join(KNOWN_PEERS_FILE));

        info!(
            "peer store opened at {}: {} trusted, {} banned, {} known",
            dir.display(),
            trusted.len(),
            banned.len(),
            peers.len()
        );

        Ok(Self {
            dir,
            state: Mutex::new(StoreState {
                trust: TrustSets::from_lists(trusted, banned),
                peers,
            }),
        })
    }

    // ── Registry operations ───────────────────────────────────────────────────

    /// Records a handshake from `addr`, applying the specificity-preserving
    /// merge rule, and persists the registry.
    pub fn update_peer(&self, addr: &str, username: &str, hostname: &str) {
        let now = Utc::now();
        let mut state = self.lock();
        match state.peers.entry(addr.to_string()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().apply_update(username, hostname, now);
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(PeerRecord::new(username, hostname, now));
            }
        }
        debug!("registry updated for {addr} (username={username}, hostname={hostname})");
        self.persist_peers(&state);
    }

    /// Friendliest available name for `addr`: username, else hostname, else
    /// the address itself.
    pub fn display_name(&self, addr: &str) -> String {
        let state = self.lock();
        display_name(addr, state.peers.get(addr))
    }

    /// Snapshot of the record for `addr`, if one exists.
    pub fn record(&self, addr: &str) -> Option<PeerRecord> {
        self.lock().peers.get(addr).cloned()
    }

    /// Snapshot of the full registry.
    pub fn known_peers(&self) -> BTreeMap<String, PeerRecord> {
        self.lock().peers.clone()
    }

    // ── Trust gate operations ─────────────────────────────────────────────────

    pub fn is_banned(&self, addr: &str) -> bool {
        self.lock().trust.is_banned(addr)
    }

    pub fn is_trusted(&self, addr: &str) -> bool {
        self.lock().trust.is_trusted(addr)
    }

    /// Auto-trusts `addr` unless banned. Persists only when the set changed.
    pub fn auto_trust(&self, addr: &str) {
        let mut state = self.lock();
        if state.trust.auto_trust(addr) {
            self.persist_trusted(&state);
        }
    }

    /// Moves `addr` to the trusted list, clearing any ban.
    pub fn move_to_trusted(&self, addr: &str) {
        let mut state = self.lock();
        if state.trust.move_to_trusted(addr) {
            info!("{addr} moved to trusted list");
            self.persist_trusted(&state);
            self.persist_banned(&state);
        }
    }

    /// Moves `addr` to the banned list, revoking any trust.
    pub fn move_to_banned(&self, addr: &str) {
        let mut state = self.lock();
        if state.trust.move_to_banned(addr) {
            info!("{addr} moved to banned list");
            self.persist_trusted(&state);
            self.persist_banned(&state);
        }
    }

    /// Removes `addr` from the chosen list. Idempotent.
    pub fn remove_from(&self, kind: ListKind, addr: &str) {
        let mut state = self.lock();
        if state.trust.remove(kind, addr) {
            info!("{addr} removed from {kind:?} list");
            match kind {
                ListKind::Trusted => self.persist_trusted(&state),
                ListKind::Banned => self.persist_banned(&state),
            }
        }
    }

    /// Snapshot of the trusted addresses.
    pub fn trusted_addresses(&self) -> Vec<String> {
        self.lock().trust.trusted()
    }

    /// Snapshot of the banned addresses.
    pub fn banned_addresses(&self) -> Vec<String> {
        self.lock().trust.banned()
    }

    // ── Persistence internals ─────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the state itself is a plain map and remains usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_trusted(&self, state: &StoreState) {
        write_json(
            &self.dir.join(TRUSTED_FILE),
            &AddressList {
                users: state.trust.trusted(),
            },
        );
    }

    fn persist_banned(&self, state: &StoreState) {
        write_json(
            &self.dir.join(BANNED_FILE),
            &AddressList {
                users: state.trust.banned(),
            },
        );
    }

    fn persist_peers(&self, state: &StoreState) {
        write_json(&self.dir.join(KNOWN_PEERS_FILE), &state.peers);
    }
}

// ── File helpers ──────────────────────────────────────────────────────────────

/// Loads an address list, creating the file when missing and tolerating
/// corruption.
fn load_address_list(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AddressList>(&content) {
            Ok(list) => list.users,
            Err(e) => {
                error!("corrupt address list {}: {e}; using empty list", path.display());
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("{} not found; creating empty list", path.display());
            write_json(path, &AddressList::default());
            Vec::new()
        }
        Err(e) => {
            error!("could not read {}: {e}; using empty list", path.display());
            Vec::new()
        }
    }
}

/// Loads the known-peer registry, creating the file when missing and
/// tolerating corruption.
fn load_known_peers(path: &Path) -> BTreeMap<String, PeerRecord> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(peers) => peers,
            Err(e) => {
                error!("corrupt peer registry {}: {e}; using empty registry", path.display());
                BTreeMap::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("{} not found; creating empty registry", path.display());
            write_json(path, &BTreeMap::<String, PeerRecord>::new());
            BTreeMap::new()
        }
        Err(e) => {
            error!("could not read {}: {e}; using empty registry", path.display());
            BTreeMap::new()
        }
    }
}

/// Full-file rewrite. Failures are logged; the caller's in-memory state
/// stays authoritative until the next successful write.
fn write_json<T: Serialize>(path: &Path, value: &T) {
    let content = match serde_json::to_string_pretty(value) {
        Ok(c) => c,
        Err(e) => {
            error!("could not serialize state for {}: {e}", path.display());
            return;
        }
    };
    if let Err(e) = std::fs::write(path, content) {
        warn!("could not persist {}: {e}; keeping in-memory state", path.display());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
