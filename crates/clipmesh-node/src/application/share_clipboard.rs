//! ShareClipboardUseCase: watch the local clipboard and push changes to
//! trusted peers.
//!
//! The poller wakes once per second, reads the clipboard collaborator, and
//! fans any new content out through the connection manager. The
//! "last applied" cell is shared with the receive path: when a payload
//! arrives from a peer it is recorded there *before* it reaches the
//! clipboard, so the next poll sees it as already shared and the mesh does
//! not amplify its own traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::infrastructure::clipboard::Clipboard;
use crate::infrastructure::network::connection_manager::ConnectionManager;

/// Pause between clipboard polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The clipboard-sharing use case.
pub struct ClipboardSync {
    clipboard: Arc<dyn Clipboard>,
    connections: Arc<ConnectionManager>,
    last_applied: Arc<StdMutex<String>>,
}

impl ClipboardSync {
    /// Wires the use case to the collaborators. The echo-suppression cell is
    /// taken from the connection manager so both paths share it.
    pub fn new(clipboard: Arc<dyn Clipboard>, connections: Arc<ConnectionManager>) -> Self {
        let last_applied = connections.last_applied_cell();
        Self {
            clipboard,
            connections,
            last_applied,
        }
    }

    /// Spawns the change poller. It stops within one poll interval of the
    /// `active` flag being cleared.
    pub fn spawn_poller(self: &Arc<Self>, active: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            info!("clipboard poller started");
            while active.load(Ordering::Relaxed) {
                tokio::time::sleep(POLL_INTERVAL).await;
                if let Some(content) = sync.take_changed() {
                    info!("local clipboard changed ({} bytes); sharing", content.len());
                    sync.connections.send_to_trusted(&content).await;
                }
            }
            info!("clipboard poller stopped");
        })
    }

    /// UI-triggered send of `content` to every trusted peer.
    pub async fn share_now(&self, content: &str) {
        self.connections.send_to_trusted(content).await;
    }

    /// UI-triggered send of `content` to a single peer.
    pub async fn share_with(&self, addr: &str, content: &str) {
        if let Err(e) = self.connections.send_to(addr, content).await {
            warn!("share with {addr} failed: {e}");
        }
    }

    /// Reads the clipboard and reports new content, marking it as shared.
    ///
    /// Returns `None` when the clipboard still holds what was last applied –
    /// whether by a local copy we already shared or by a payload received
    /// from a peer.
    fn take_changed(&self) -> Option<String> {
        let current = self.clipboard.read_current();
        let mut last = self
            .last_applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == current {
            return None;
        }
        *last = current.clone();
        Some(current)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clipboard::InMemoryClipboard;
    use crate::infrastructure::storage::peer_store::PeerStore;
    use clipmesh_core::SingleRetry;
    use std::path::PathBuf;

    fn make_sync(tag: &str) -> (Arc<ClipboardSync>, Arc<InMemoryClipboard>, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "clipmesh_clipsync_{}_{}",
            tag,
            std::process::id()
        ));
        std::fs::remove_dir_all(&dir).ok();
        let store = Arc::new(PeerStore::open(&dir).expect("open store"));
        let clipboard = Arc::new(InMemoryClipboard::new());
        let connections = Arc::new(ConnectionManager::new(
            0,
            store,
            Arc::clone(&clipboard) as Arc<dyn Clipboard>,
            Arc::new(SingleRetry),
        ));
        let sync = Arc::new(ClipboardSync::new(
            Arc::clone(&clipboard) as Arc<dyn Clipboard>,
            connections,
        ));
        (sync, clipboard, dir)
    }

    #[test]
    fn test_take_changed_reports_nothing_initially() {
        let (sync, _clipboard, dir) = make_sync("initial");
        assert_eq!(sync.take_changed(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_take_changed_reports_new_content_once() {
        let (sync, clipboard, dir) = make_sync("once");

        clipboard.write_current("copied text");

        assert_eq!(sync.take_changed(), Some("copied text".to_string()));
        assert_eq!(sync.take_changed(), None, "second poll must see it as shared");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_received_payload_is_not_echoed() {
        // Arrange – a payload arrives from a peer: the receive path records
        // it in the shared cell and then writes the clipboard.
        let (sync, clipboard, dir) = make_sync("echo");
        *sync.last_applied.lock().unwrap() = "from peer".to_string();
        clipboard.write_current("from peer");

        // Act / Assert – the poller must not rebroadcast it.
        assert_eq!(sync.take_changed(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_local_edit_after_receive_is_shared() {
        let (sync, clipboard, dir) = make_sync("edit");
        *sync.last_applied.lock().unwrap() = "from peer".to_string();
        clipboard.write_current("from peer");
        assert_eq!(sync.take_changed(), None);

        clipboard.write_current("locally copied");

        assert_eq!(sync.take_changed(), Some("locally copied".to_string()));
        std::fs::remove_dir_all(&dir).ok();
    }
}
