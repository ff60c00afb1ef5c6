//! TCP connection manager: pooled point-to-point delivery of clipboard text
//! between trusted peers.
//!
//! Architecture:
//! - One listener task accepts inbound connections on the configured port.
//! - Every live connection (inbound or outbound) has exactly one pool entry,
//!   keyed by the peer's address string, holding the write half behind a
//!   per-connection async mutex.
//! - Every connection gets a receive task; inbound text that differs from
//!   the current clipboard value is forwarded to the clipboard collaborator.
//! - The pool itself sits behind a single synchronous mutex held only for
//!   the insert/remove/lookup instant – never across socket I/O.
//!
//! # Wire format
//!
//! There is none: the byte stream carries raw UTF-8 text and one `write` is
//! treated as one message on the receiving side. That bounds message size to
//! the 64 KiB receive buffer and assumes the payload arrives in a single
//! read, which TCP does not strictly guarantee under load. The behaviour is
//! kept for compatibility with existing peers; both halves of the assumption
//! live in this file (`recv_loop` / `send_to`), so introducing length-prefix
//! framing later is a local change.
//!
//! # Failure semantics
//!
//! All socket errors are isolated per connection. A failed send evicts the
//! broken entry and retries per the configured
//! [`DeliveryPolicy`] (default: reconnect once, resend once, give up). No
//! payload is queued; delivery is best-effort.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use clipmesh_core::DeliveryPolicy;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::infrastructure::clipboard::Clipboard;
use crate::infrastructure::storage::peer_store::PeerStore;

/// Upper bound on a single dial attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer size; also the effective maximum message size.
const RECV_BUFFER: usize = 64 * 1024;

/// Error type for connection manager operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The TCP listener could not be bound.
    #[error("failed to bind TCP listener on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// `listen` was called while the manager is already listening.
    #[error("connection manager is already listening")]
    AlreadyListening,

    /// The dial did not complete within [`CONNECT_TIMEOUT`].
    #[error("connection to {addr} timed out")]
    ConnectTimedOut { addr: String },

    /// The dial failed outright (refused, unreachable, ...).
    #[error("could not connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The payload could not be written after exhausting the retry policy.
    #[error("send to {addr} failed: {source}")]
    SendFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A pooled connection: the write half of one live TCP stream.
///
/// Cloning is cheap (Arc); the per-connection mutex serialises writers so a
/// fan-out and a retry can never interleave bytes on one stream.
#[derive(Clone)]
pub struct PeerConnection {
    writer: Arc<TokioMutex<OwnedWriteHalf>>,
}

impl PeerConnection {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Arc::new(TokioMutex::new(writer)),
        }
    }
}

/// The connection manager. Construct once, share via `Arc`.
pub struct ConnectionManager {
    port: u16,
    pool: StdMutex<HashMap<String, PeerConnection>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    store: Arc<PeerStore>,
    clipboard: Arc<dyn Clipboard>,
    policy: Arc<dyn DeliveryPolicy>,
    /// Last payload applied to the clipboard (inbound or observed locally).
    /// Shared with the clipboard-change poller so a received payload is not
    /// echoed straight back into the mesh.
    last_applied: Arc<StdMutex<String>>,
}

impl ConnectionManager {
    pub fn new(
        port: u16,
        store: Arc<PeerStore>,
        clipboard: Arc<dyn Clipboard>,
        policy: Arc<dyn DeliveryPolicy>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            port,
            pool: StdMutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown,
            store,
            clipboard,
            policy,
            last_applied: Arc::new(StdMutex::new(String::new())),
        }
    }

    /// The cell holding the last clipboard payload applied by the receive
    /// path. The change poller reads it to suppress echo.
    pub fn last_applied_cell(&self) -> Arc<StdMutex<String>> {
        Arc::clone(&self.last_applied)
    }

    /// Addresses with a live pooled connection, for diagnostics and tests.
    pub fn pooled_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.pool_lock().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    // ── Listener ──────────────────────────────────────────────────────────────

    /// Binds the data port and spawns the accept loop.
    ///
    /// Returns the actual bound port (useful when constructed with port 0).
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] when the port is unavailable and
    /// [`NetworkError::AlreadyListening`] on a double call; neither affects
    /// other subsystems.
    pub async fn listen(self: &Arc<Self>) -> Result<u16, NetworkError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(NetworkError::AlreadyListening);
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(l) => l,
            Err(source) => {
                self.running.store(false, Ordering::Relaxed);
                return Err(NetworkError::BindFailed {
                    port: self.port,
                    source,
                });
            }
        };
        let local_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.port);

        self.shutdown.send_replace(false);
        info!("listening for peers on TCP 0.0.0.0:{local_port}");

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.accept_loop(listener).await });

        Ok(local_port)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("inbound connection accepted from {}", addr.ip());
                        let manager = Arc::clone(&self);
                        tokio::spawn(async move { manager.handle_inbound(stream, addr).await });
                    }
                    Err(e) => {
                        // The listener socket itself failed; accept() cannot
                        // recover, so the loop exits. stop()/listen() rebinds.
                        if self.running.load(Ordering::Relaxed) {
                            error!("accept error: {e}");
                        }
                        break;
                    }
                }
            }
        }
        info!("TCP listener stopped");
    }

    /// Adopts an accepted connection into the pool and drives its receive
    /// loop until teardown.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let peer = addr.ip().to_string();
        let (reader, writer) = stream.into_split();

        // At most one pool entry per address: if a connection to this peer
        // already exists, keep the existing entry and hold the new write
        // half only to keep this socket open for its receive loop.
        let keepalive = {
            let mut pool = self.pool_lock();
            match pool.entry(peer.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(PeerConnection::new(writer));
                    None
                }
                Entry::Occupied(_) => {
                    debug!("pool already holds a connection for {peer}; keeping existing entry");
                    Some(writer)
                }
            }
        };

        self.recv_loop(reader, &peer, keepalive).await;
    }

    /// Receive loop shared by inbound and outbound connections.
    ///
    /// One `read` is one message (see the module docs on framing). Teardown
    /// – peer close, reset, any read error, or shutdown – removes the peer's
    /// pool entry; it is never fatal to the listener or to other peers.
    async fn recv_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        peer: &str,
        keepalive: Option<OwnedWriteHalf>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("shutdown: closing receive task for {peer}");
                        break;
                    }
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("connection closed by {peer}");
                        break;
                    }
                    Ok(n) => self.apply_inbound(peer, &buf[..n]),
                    Err(e) => {
                        warn!("read error from {peer}: {e}");
                        break;
                    }
                }
            }
        }

        drop(keepalive);
        self.evict(peer);
        info!("connection with {peer} closed and removed");
    }

    /// Applies one inbound message to the clipboard collaborator.
    fn apply_inbound(&self, peer: &str, bytes: &[u8]) {
        let text = match std::str::from_utf8(bytes) {
            Ok(t) => t,
            Err(e) => {
                warn!("undecodable payload from {peer}: {e}; discarding");
                return;
            }
        };
        debug!("received {} bytes from {peer}", bytes.len());

        if self.clipboard.read_current() == text {
            return;
        }

        // Record before writing so the change poller sees the new clipboard
        // value as already-shared and does not echo it back into the mesh.
        *self
            .last_applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = text.to_string();
        self.clipboard.write_current(text);
        info!("clipboard updated from {peer} ({} bytes)", bytes.len());
    }

    // ── Outbound path ─────────────────────────────────────────────────────────

    /// Returns the pooled connection for `addr`, dialing one if absent.
    ///
    /// The dial is bounded by [`CONNECT_TIMEOUT`]; a failure is logged and
    /// returned, never fatal to the manager.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ConnectTimedOut`] or
    /// [`NetworkError::ConnectFailed`].
    pub async fn connect_to(self: &Arc<Self>, addr: &str) -> Result<PeerConnection, NetworkError> {
        if let Some(conn) = self.pool_lock().get(addr).cloned() {
            debug!("reusing pooled connection to {addr}");
            return Ok(conn);
        }

        debug!("dialing {addr}:{}", self.port);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((addr, self.port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                warn!("could not connect to {addr}:{}: {source}", self.port);
                return Err(NetworkError::ConnectFailed {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                warn!("connection to {addr}:{} timed out", self.port);
                return Err(NetworkError::ConnectTimedOut {
                    addr: addr.to_string(),
                });
            }
        };
        info!("connected to {addr}:{}", self.port);

        let (reader, writer) = stream.into_split();
        let conn = PeerConnection::new(writer);
        {
            let mut pool = self.pool_lock();
            if let Some(existing) = pool.get(addr) {
                // An inbound connection from this peer won the race while we
                // were dialing; ours is redundant and closes on drop.
                debug!("inbound connection to {addr} appeared during dial; using it");
                return Ok(existing.clone());
            }
            pool.insert(addr.to_string(), conn.clone());
        }

        // Outbound connections receive too: the peer may answer clipboard
        // updates on the same stream instead of dialing back.
        let manager = Arc::clone(self);
        let peer = addr.to_string();
        tokio::spawn(async move { manager.recv_loop(reader, &peer, None).await });

        Ok(conn)
    }

    /// Sends `content` to `addr` as a single write.
    ///
    /// On a write error the broken entry is evicted and the send is retried
    /// per the [`DeliveryPolicy`] (reconnect, rewrite). Nothing is queued
    /// beyond that.
    ///
    /// # Errors
    ///
    /// Returns the final connect or send error once the policy is exhausted.
    pub async fn send_to(self: &Arc<Self>, addr: &str, content: &str) -> Result<(), NetworkError> {
        let mut attempts_left = self.policy.reconnect_attempts();
        let mut conn = self.connect_to(addr).await?;

        loop {
            match write_payload(&conn, content).await {
                Ok(()) => {
                    info!("content sent to {addr} ({} bytes)", content.len());
                    return Ok(());
                }
                Err(source) => {
                    warn!("send to {addr} failed: {source}; evicting connection");
                    self.evict(addr);
                    if attempts_left == 0 {
                        error!("giving up on {addr} after exhausting retries");
                        return Err(NetworkError::SendFailed {
                            addr: addr.to_string(),
                            source,
                        });
                    }
                    attempts_left -= 1;
                    info!("reconnecting to {addr} for retry");
                    conn = self.connect_to(addr).await?;
                }
            }
        }
    }

    /// Fans `content` out to every trusted address. Individual failures are
    /// logged and do not abort the fan-out.
    pub async fn send_to_trusted(self: &Arc<Self>, content: &str) {
        let trusted = self.store.trusted_addresses();
        if trusted.is_empty() {
            debug!("no trusted peers to send to");
            return;
        }

        info!("sending clipboard to {} trusted peer(s)", trusted.len());
        for addr in trusted {
            if let Err(e) = self.send_to(&addr, content).await {
                warn!("fan-out to {addr} failed: {e}");
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Stops the manager: closes the listener, then closes and removes every
    /// pooled connection. Idempotent; `listen` may be called again after.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            info!("stopping connection manager");
        } else {
            debug!("connection manager already stopped");
        }
        self.shutdown.send_replace(true);

        let drained: Vec<(String, PeerConnection)> = {
            let mut pool = self.pool_lock();
            pool.drain().collect()
        };
        for (addr, conn) in drained {
            let mut writer = conn.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("error closing connection to {addr}: {e}");
            } else {
                info!("connection with {addr} closed");
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn pool_lock(&self) -> MutexGuard<'_, HashMap<String, PeerConnection>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the pool entry for `addr`, if any. The dropped write half
    /// closes the underlying stream once its receive task finishes.
    fn evict(&self, addr: &str) {
        if self.pool_lock().remove(addr).is_some() {
            debug!("pool entry for {addr} removed");
        }
    }
}

/// Writes one payload on a pooled connection as a single write call.
async fn write_payload(conn: &PeerConnection, content: &str) -> std::io::Result<()> {
    let mut writer = conn.writer.lock().await;
    writer.write_all(content.as_bytes()).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clipboard::{InMemoryClipboard, MockClipboard};
    use clipmesh_core::SingleRetry;
    use std::path::PathBuf;

    fn temp_store(tag: &str) -> (Arc<PeerStore>, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "clipmesh_connmgr_{}_{}",
            tag,
            std::process::id()
        ));
        std::fs::remove_dir_all(&dir).ok();
        let store = Arc::new(PeerStore::open(&dir).expect("open store"));
        (store, dir)
    }

    fn make_manager(port: u16, clipboard: Arc<dyn Clipboard>, tag: &str) -> (Arc<ConnectionManager>, PathBuf) {
        let (store, dir) = temp_store(tag);
        let manager = Arc::new(ConnectionManager::new(
            port,
            store,
            clipboard,
            Arc::new(SingleRetry),
        ));
        (manager, dir)
    }

    #[test]
    fn test_new_manager_has_empty_pool() {
        let (manager, dir) = make_manager(0, Arc::new(InMemoryClipboard::new()), "empty");
        assert!(manager.pooled_addresses().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_evict_is_idempotent() {
        let (manager, dir) = make_manager(0, Arc::new(InMemoryClipboard::new()), "evict");
        manager.evict("10.0.0.5");
        manager.evict("10.0.0.5");
        assert!(manager.pooled_addresses().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_apply_inbound_updates_clipboard_and_echo_cell() {
        // Arrange
        let clipboard = Arc::new(InMemoryClipboard::new());
        let (manager, dir) = make_manager(0, Arc::clone(&clipboard) as Arc<dyn Clipboard>, "apply");

        // Act
        manager.apply_inbound("10.0.0.5", b"pasted text");

        // Assert
        assert_eq!(clipboard.read_current(), "pasted text");
        let cell = manager.last_applied_cell();
        assert_eq!(*cell.lock().unwrap(), "pasted text");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_apply_inbound_skips_write_when_content_unchanged() {
        // Arrange – the clipboard already holds the payload; write_current
        // must not be called at all.
        let mut mock = MockClipboard::new();
        mock.expect_read_current()
            .return_const("already here".to_string());
        mock.expect_write_current().never();
        let (manager, dir) = make_manager(0, Arc::new(mock), "unchanged");

        // Act
        manager.apply_inbound("10.0.0.5", b"already here");

        // Assert – mock verifies on drop
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_apply_inbound_discards_invalid_utf8() {
        let mut mock = MockClipboard::new();
        mock.expect_read_current().never();
        mock.expect_write_current().never();
        let (manager, dir) = make_manager(0, Arc::new(mock), "utf8");

        manager.apply_inbound("10.0.0.5", &[0xFF, 0xFE, 0xFD]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_connect_to_refused_port_returns_error() {
        // Find a port with nothing listening on it.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (manager, dir) = make_manager(port, Arc::new(InMemoryClipboard::new()), "refused");

        let result = manager.connect_to("127.0.0.1").await;

        assert!(matches!(result, Err(NetworkError::ConnectFailed { .. })));
        assert!(manager.pooled_addresses().is_empty(), "failed dial must not pool");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_listen_twice_reports_already_listening() {
        let (manager, dir) = make_manager(0, Arc::new(InMemoryClipboard::new()), "double");

        let port = manager.listen().await.expect("first listen");
        assert!(port > 0);
        let second = manager.listen().await;
        assert!(matches!(second, Err(NetworkError::AlreadyListening)));

        manager.stop().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (manager, dir) = make_manager(0, Arc::new(InMemoryClipboard::new()), "stop");
        manager.listen().await.expect("listen");

        manager.stop().await;
        manager.stop().await;

        assert!(manager.pooled_addresses().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
