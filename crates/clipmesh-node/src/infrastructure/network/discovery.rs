//! UDP broadcast-based peer discovery.
//!
//! Discovery needs no central directory: every node periodically broadcasts
//! the `ANNOUNCE` token to the subnet's broadcast address, and every node
//! listening on the discovery port answers announces with a unicast `HELLO`
//! carrying its identity.
//!
//! Three entry points:
//!
//! 1. [`start_listener`] – binds the discovery port and answers announces.
//! 2. [`start_broadcaster`] – sends periodic announces so quiet peers find us.
//! 3. [`discover_peers_once`] – a synchronous burst-and-collect used by the
//!    UI to populate its peer list on demand.
//!
//! The listener and broadcaster each run as a blocking loop on a dedicated
//! named thread, keeping synchronous socket I/O off the Tokio runtime. Both
//! are handed a shared `Arc<AtomicBool>` active flag at spawn time; they poll
//! it between blocking operations, and the listener socket carries a
//! 1-second read timeout so shutdown latency is bounded by one second.
//!
//! # How UDP discovery works (for beginners)
//!
//! UDP is connectionless: a datagram sent to the broadcast address (e.g.
//! `192.168.1.255`) is delivered to every host on the subnet that cares to
//! listen. No delivery guarantee exists – which is exactly right for a
//! probe that is resent every few seconds anyway:
//!
//! 1. Node A broadcasts `ANNOUNCE` on the discovery port.
//! 2. Node B, listening on that port, replies with
//!    `HELLO:<username>:<hostname>:<addr>` straight back to A's source
//!    address.
//! 3. A records B's identity in its registry and – unless B is banned –
//!    trusts it for clipboard exchange.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use clipmesh_core::{decode_hello, encode_hello, is_announce, HelloMessage, ANNOUNCE, UNKNOWN};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::infrastructure::storage::peer_store::PeerStore;

/// Consecutive unexpected receive errors tolerated before the listener
/// declares the socket unusable and stops the discovery subsystem.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// How long the one-shot discovery waits for HELLO replies.
const ONE_SHOT_WINDOW: Duration = Duration::from_secs(6);

/// Poll slice used while waiting for replies and while sleeping between
/// broadcasts, so a shutdown request is honoured promptly.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Settings shared by the listener and broadcaster loops.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port announces are sent to and listened on.
    pub port: u16,
    /// Display name sent in HELLO replies.
    pub username: String,
    /// Pause between periodic announces.
    pub broadcast_interval: Duration,
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Binds the discovery port and spawns the announce-answering thread.
///
/// A bind failure is fatal to the discovery subsystem only: the shared
/// `active` flag is cleared (stopping the broadcaster too, which would
/// otherwise announce a node that cannot reply) and the error is returned so
/// the caller can log it. Other subsystems keep running.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] if the socket cannot be bound.
pub fn start_listener(
    config: &DiscoveryConfig,
    active: Arc<AtomicBool>,
) -> Result<(), DiscoveryError> {
    let socket = match UdpSocket::bind(("0.0.0.0", config.port)) {
        Ok(s) => s,
        Err(source) => {
            active.store(false, Ordering::Relaxed);
            return Err(DiscoveryError::BindFailed {
                port: config.port,
                source,
            });
        }
    };
    socket.set_read_timeout(Some(Duration::from_secs(1))).ok();

    info!("discovery listener on UDP 0.0.0.0:{}", config.port);

    let username = config.username.clone();
    std::thread::Builder::new()
        .name("clipmesh-discovery-listener".to_string())
        .spawn(move || listener_loop(socket, username, active))
        .expect("failed to spawn discovery listener thread");

    Ok(())
}

/// The announce-answering loop executed on the listener thread.
fn listener_loop(socket: UdpSocket, username: String, active: Arc<AtomicBool>) {
    let hostname = local_hostname();
    let mut buf = [0u8; 1024];
    let mut consecutive_errors = 0u32;

    while active.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                // ICMP port-unreachable bounced back from an earlier send;
                // harmless on a datagram socket.
                debug!("discovery recv reset: {e}");
                continue;
            }
            Err(e) => {
                consecutive_errors += 1;
                error!("discovery recv error ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS}): {e}");
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("stopping discovery after repeated socket errors");
                    active.store(false, Ordering::Relaxed);
                    break;
                }
                continue;
            }
        };
        consecutive_errors = 0;

        if !is_announce(&buf[..len]) {
            debug!("ignoring non-announce datagram from {src}");
            continue;
        }

        debug!("announce received from {src}");

        let announced = outward_local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| {
                warn!("could not determine outward-facing address; announcing loopback");
                "127.0.0.1".to_string()
            });
        let hello = HelloMessage::new(username.clone(), hostname.clone(), announced);

        match socket.send_to(&encode_hello(&hello), src) {
            Ok(_) => info!("HELLO reply sent to {src}"),
            Err(e) => warn!("failed to send HELLO reply to {src}: {e}"),
        }
    }

    info!("discovery listener stopped");
}

// ── Broadcaster ───────────────────────────────────────────────────────────────

/// Spawns the periodic-announce thread.
///
/// The first announce is delayed by a randomized 0.5–2.5 s so that many
/// nodes starting together (e.g. after a power cut) do not broadcast in
/// lock-step.
pub fn start_broadcaster(config: &DiscoveryConfig, active: Arc<AtomicBool>) {
    let port = config.port;
    let interval = config.broadcast_interval;
    std::thread::Builder::new()
        .name("clipmesh-discovery-broadcaster".to_string())
        .spawn(move || broadcaster_loop(port, interval, active))
        .expect("failed to spawn discovery broadcaster thread");
}

/// The periodic-announce loop executed on the broadcaster thread.
fn broadcaster_loop(port: u16, interval: Duration, active: Arc<AtomicBool>) {
    info!("discovery broadcaster starting (interval {interval:?})");

    interruptible_sleep(Duration::from_millis(500 + jitter_ms(2000)), &active);

    while active.load(Ordering::Relaxed) {
        let broadcast_addr = resolve_broadcast_addr();
        match send_announce(broadcast_addr, port) {
            Ok(()) => {
                debug!("announce sent to {broadcast_addr}:{port}");
                interruptible_sleep(interval, &active);
            }
            Err(e) => {
                error!("announce to {broadcast_addr}:{port} failed: {e}");
                interruptible_sleep(interval.min(Duration::from_secs(30)), &active);
            }
        }
    }

    info!("discovery broadcaster stopped");
}

/// Sends one ANNOUNCE datagram from an ephemeral broadcast-capable socket.
fn send_announce(broadcast_addr: Ipv4Addr, port: u16) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_broadcast(true)?;
    socket.send_to(ANNOUNCE, (broadcast_addr, port))?;
    Ok(())
}

// ── One-shot discovery ────────────────────────────────────────────────────────

/// Broadcasts a burst of announces and collects HELLO replies for a fixed
/// window, updating the registry and trust list as replies arrive.
///
/// Returns the deduplicated set of discovered addresses. Replies from our
/// own addresses are discarded; banned peers are registered (their identity
/// is still worth remembering) but neither trusted nor reported.
///
/// Blocking: the call takes roughly the send burst plus the 6-second reply
/// window. Callers on an async runtime should wrap it in
/// `spawn_blocking`.
///
/// # Errors
///
/// Returns an error only when the ephemeral socket cannot be created;
/// send and receive problems during the window are logged and skipped.
pub fn discover_peers_once(
    port: u16,
    store: &PeerStore,
) -> std::io::Result<BTreeSet<String>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(POLL_SLICE))?;

    let broadcast_addr = resolve_broadcast_addr();
    info!("one-shot discovery: announcing to {broadcast_addr}:{port}");

    for attempt in 1..=3u32 {
        if let Err(e) = socket.send_to(ANNOUNCE, (broadcast_addr, port)) {
            error!("announce burst {attempt}/3 failed: {e}");
        } else {
            debug!("announce burst {attempt}/3 sent");
        }
        std::thread::sleep(Duration::from_millis(300 + jitter_ms(500)));
    }

    let own_ip = outward_local_ip();
    let mut discovered = BTreeSet::new();
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + ONE_SHOT_WINDOW;

    while Instant::now() < deadline {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!("ignoring connection-reset from a closed remote port");
                continue;
            }
            Err(e) => {
                error!("error receiving discovery reply: {e}");
                continue;
            }
        };

        let src_ip = src.ip();
        if src_ip.is_loopback() || Some(src_ip) == own_ip {
            debug!("ignoring reply from own address {src_ip}");
            continue;
        }

        process_reply(store, src_ip, &buf[..len], &mut discovered);
    }

    info!("one-shot discovery finished: {} peer(s) found", discovered.len());
    Ok(discovered)
}

/// Applies one HELLO reply to the registry and trust list.
///
/// The datagram's source address is authoritative; the announced address is
/// only logged. Malformed payloads are logged and dropped.
fn process_reply(
    store: &PeerStore,
    src_ip: IpAddr,
    payload: &[u8],
    discovered: &mut BTreeSet<String>,
) {
    let hello = match decode_hello(payload) {
        Ok(h) => h,
        Err(e) => {
            warn!("malformed HELLO from {src_ip}: {e}");
            return;
        }
    };

    let peer = src_ip.to_string();
    info!(
        "peer detected: {peer} (username={}, hostname={}, announced={})",
        hello.username, hello.hostname, hello.announced_addr
    );

    store.update_peer(&peer, &hello.username, &hello.hostname);

    if store.is_banned(&peer) {
        info!("peer {peer} is banned; not trusting");
        return;
    }

    store.auto_trust(&peer);
    discovered.insert(peer);
}

// ── Address resolution ────────────────────────────────────────────────────────

/// Determines the address this host would use to reach the wider network.
///
/// Works by "connecting" a throwaway UDP socket toward a public address and
/// reading back the chosen local endpoint – no datagram is actually sent, so
/// this succeeds even without Internet reachability as long as a route
/// exists.
fn outward_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Resolves the subnet broadcast address for announces.
///
/// 1. The default-route local address, when one exists.
/// 2. Otherwise the first non-loopback, non-link-local IPv4 found scanning
///    all interfaces.
/// 3. Otherwise the limited broadcast address `255.255.255.255`.
///
/// The interface listing exposes addresses without netmasks, so the subnet
/// broadcast is derived assuming a /24 prefix – the common home and office
/// LAN layout this tool targets.
fn resolve_broadcast_addr() -> Ipv4Addr {
    if let Ok(IpAddr::V4(ip)) = local_ip_address::local_ip() {
        if is_usable_v4(ip) {
            if let Some(broadcast) = subnet_broadcast(ip) {
                debug!("using broadcast {broadcast} from default-route address {ip}");
                return broadcast;
            }
        }
    }

    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            for (name, addr) in interfaces {
                if let IpAddr::V4(ip) = addr {
                    if is_usable_v4(ip) {
                        if let Some(broadcast) = subnet_broadcast(ip) {
                            info!("using broadcast {broadcast} from interface {name} (local {ip})");
                            return broadcast;
                        }
                    }
                }
            }
        }
        Err(e) => warn!("could not enumerate interfaces: {e}"),
    }

    warn!("no usable interface found; falling back to limited broadcast");
    Ipv4Addr::BROADCAST
}

fn is_usable_v4(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}

fn subnet_broadcast(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    ipnetwork::Ipv4Network::new(ip, 24)
        .ok()
        .map(|network| network.broadcast())
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| UNKNOWN.to_string())
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Sleeps for `total`, waking every second to honour a cleared active flag.
fn interruptible_sleep(total: Duration, active: &AtomicBool) {
    let deadline = Instant::now() + total;
    while active.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(Duration::from_secs(1)));
    }
}

/// Cheap time-derived jitter in `0..range_ms`. Not cryptographic – it only
/// needs to keep simultaneously started nodes from broadcasting in phase.
fn jitter_ms(range_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() % range_ms.max(1)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_store(tag: &str) -> (PeerStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "clipmesh_discovery_{}_{}",
            tag,
            std::process::id()
        ));
        std::fs::remove_dir_all(&dir).ok();
        let store = PeerStore::open(&dir).expect("open store");
        (store, dir)
    }

    #[test]
    fn test_is_timeout_error_recognises_timed_out() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(is_timeout_error(&e));
    }

    #[test]
    fn test_is_timeout_error_recognises_would_block() {
        let e = std::io::Error::new(std::io::ErrorKind::WouldBlock, "would block");
        assert!(is_timeout_error(&e));
    }

    #[test]
    fn test_is_timeout_error_returns_false_for_other_errors() {
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_timeout_error(&e));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..100 {
            assert!(jitter_ms(2000) < 2000);
        }
        assert_eq!(jitter_ms(1), 0);
    }

    #[test]
    fn test_subnet_broadcast_of_slash_24() {
        assert_eq!(
            subnet_broadcast(Ipv4Addr::new(192, 168, 1, 42)),
            Some(Ipv4Addr::new(192, 168, 1, 255))
        );
    }

    #[test]
    fn test_is_usable_v4_filters_special_addresses() {
        assert!(!is_usable_v4(Ipv4Addr::LOCALHOST));
        assert!(!is_usable_v4(Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!is_usable_v4(Ipv4Addr::UNSPECIFIED));
        assert!(is_usable_v4(Ipv4Addr::new(192, 168, 1, 42)));
    }

    #[test]
    fn test_interruptible_sleep_returns_early_when_inactive() {
        // Arrange
        let active = AtomicBool::new(false);

        // Act
        let started = Instant::now();
        interruptible_sleep(Duration::from_secs(30), &active);

        // Assert – must not have waited anywhere near the full duration
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_start_listener_binds_a_free_port() {
        // Find a free port by binding port 0 and reading back the assignment.
        let probe = UdpSocket::bind("0.0.0.0:0").expect("probe bind");
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let config = DiscoveryConfig {
            port,
            username: "test".to_string(),
            broadcast_interval: Duration::from_secs(30),
        };
        let active = Arc::new(AtomicBool::new(false)); // loop exits immediately

        assert!(start_listener(&config, active).is_ok());
    }

    #[test]
    fn test_start_listener_bind_failure_clears_active_flag() {
        // Occupy a port, then try to bind it again.
        let occupied = UdpSocket::bind("0.0.0.0:0").expect("bind");
        let port = occupied.local_addr().unwrap().port();

        let config = DiscoveryConfig {
            port,
            username: "test".to_string(),
            broadcast_interval: Duration::from_secs(30),
        };
        let active = Arc::new(AtomicBool::new(true));

        let result = start_listener(&config, Arc::clone(&active));

        assert!(matches!(result, Err(DiscoveryError::BindFailed { .. })));
        assert!(
            !active.load(Ordering::Relaxed),
            "bind failure must stop the whole discovery subsystem"
        );
    }

    // ── process_reply ─────────────────────────────────────────────────────────

    #[test]
    fn test_process_reply_registers_and_trusts_new_peer() {
        let (store, dir) = temp_store("trust");
        let mut discovered = BTreeSet::new();

        process_reply(
            &store,
            "10.0.0.5".parse().unwrap(),
            b"HELLO:Alice:Laptop:10.0.0.5",
            &mut discovered,
        );

        assert!(discovered.contains("10.0.0.5"));
        assert!(store.is_trusted("10.0.0.5"));
        assert_eq!(store.display_name("10.0.0.5"), "Alice");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_process_reply_skips_banned_peer() {
        // Arrange
        let (store, dir) = temp_store("banned");
        store.move_to_banned("10.0.0.9");
        let mut discovered = BTreeSet::new();

        // Act
        process_reply(
            &store,
            "10.0.0.9".parse().unwrap(),
            b"HELLO:Mallory:Box:10.0.0.9",
            &mut discovered,
        );

        // Assert – never reported, never trusted, but identity still recorded
        assert!(!discovered.contains("10.0.0.9"));
        assert!(!store.is_trusted("10.0.0.9"));
        assert_eq!(store.display_name("10.0.0.9"), "Mallory");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_process_reply_ignores_malformed_payload() {
        let (store, dir) = temp_store("malformed");
        let mut discovered = BTreeSet::new();

        process_reply(
            &store,
            "10.0.0.7".parse().unwrap(),
            b"HELLO:only-two-fields",
            &mut discovered,
        );

        assert!(discovered.is_empty());
        assert!(!store.is_trusted("10.0.0.7"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_process_reply_uses_source_address_not_announced_one() {
        let (store, dir) = temp_store("source");
        let mut discovered = BTreeSet::new();

        // The peer announces a different address than it sent from; the
        // source address wins.
        process_reply(
            &store,
            "10.0.0.5".parse().unwrap(),
            b"HELLO:Alice:Laptop:172.16.0.99",
            &mut discovered,
        );

        assert!(discovered.contains("10.0.0.5"));
        assert!(!discovered.contains("172.16.0.99"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
