//! # clipmesh-core
//!
//! Shared library for ClipMesh containing the discovery wire protocol and the
//! pure domain rules: peer identity records, trust/ban membership, and the
//! delivery policy seam.
//!
//! This crate is used by every ClipMesh node process. It has zero
//! dependencies on sockets, filesystems, async runtimes, or UI frameworks –
//! everything in here is deterministic and unit-testable in isolation.
//!
//! - **`protocol`** – How bytes travel over UDP during discovery: the
//!   `ANNOUNCE` probe token and the `HELLO` identity reply, with a codec that
//!   turns malformed packets into typed errors instead of panics.
//!
//! - **`domain`** – Pure business logic. `PeerRecord` carries the last-known
//!   identity of a peer and the merge rule that keeps a specific name from
//!   being clobbered by a placeholder. `TrustSets` holds the disjoint
//!   trusted/banned address sets. `DeliveryPolicy` is the retry seam used by
//!   the TCP send path.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `clipmesh_core::TrustSets` instead of `clipmesh_core::domain::trust::TrustSets`.
pub use domain::peer::{display_name, is_specific, PeerRecord, UNKNOWN};
pub use domain::policy::{DeliveryPolicy, NoRetry, SingleRetry};
pub use domain::trust::{ListKind, TrustSets};
pub use protocol::codec::{decode_hello, encode_hello, is_announce, ProtocolError};
pub use protocol::messages::{HelloMessage, ANNOUNCE};
