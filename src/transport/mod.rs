//! Transport backends behind the [`crate::connection::Connection`]
//! abstraction.
//!
//! Three kinds share one contract (`register` / `write` / `flush` /
//! `update_and_sync`):
//!
//! - [`fabric`]: RDMA-style network fabric. Writes are posted to a work
//!   queue and executed asynchronously by a completer thread; `flush`
//!   blocks until every posted write has completed locally.
//! - [`peer`]: direct peer-mapped memory. Stores land immediately in the
//!   peer's address space; `flush` is a cheap ordering point.
//! - [`multicast`]: one-to-many memory fabric with a bounded number of
//!   concurrently bound regions per group.
//!
//! Endpoint exchange is the bootstrap's job (out of scope here); a
//! [`FabricDomain`] hands out paired [`EndpointDescriptor`]s so two ranks
//! in one process can connect the way bootstrapped ranks would.

pub(crate) mod fabric;
pub(crate) mod multicast;
pub(crate) mod peer;

pub use multicast::MulticastHandle;

use crate::error::Result;
use crate::memory::{MemKind, MemoryHandle};
use crate::types::{Rank, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One point-to-point transport instance.
///
/// All methods may be called concurrently. `write` is asynchronous and
/// unordered with respect to other writes on the same transport unless the
/// caller serializes via `flush`.
pub(crate) trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Validate addressability and produce a registration.
    fn register(&self, ptr: u64, size: usize, kind: MemKind) -> Result<MemoryHandle>;

    /// Enqueue a copy of `size` bytes from `src + src_offset` into the
    /// remote region `dst + dst_offset`.
    fn write(
        &self,
        dst: &MemoryHandle,
        dst_offset: u64,
        src: &MemoryHandle,
        src_offset: u64,
        size: u64,
    ) -> Result<()>;

    /// Block until all previously issued writes have completed locally.
    fn flush(&self, timeout: Duration) -> Result<()>;
}

/// Registration tokens are process-unique so a stale handle can never alias
/// a live one.
pub(crate) fn next_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Opaque endpoint info for one side of a point-to-point link, as the
/// bootstrap would supply it.
pub struct EndpointDescriptor {
    pub(crate) remote_rank: Rank,
    pub(crate) kind: TransportKind,
    pub(crate) link: LinkState,
}

pub(crate) enum LinkState {
    Fabric,
    Peer,
    Multicast(Arc<multicast::McastGroup>),
}

/// In-process stand-in for the bootstrap's endpoint exchange.
///
/// Real deployments receive `(remote_rank, endpoint_info)` from rank
/// discovery; a `FabricDomain` produces equivalent descriptor pairs for
/// ranks living in one process.
pub struct FabricDomain {
    multicast_bind_capacity: usize,
}

impl FabricDomain {
    pub fn new(multicast_bind_capacity: usize) -> Self {
        Self {
            multicast_bind_capacity,
        }
    }

    /// Descriptors for the two ends of a link between `a` and `b`.
    pub fn endpoint_pair(
        &self,
        kind: TransportKind,
        a: Rank,
        b: Rank,
    ) -> (EndpointDescriptor, EndpointDescriptor) {
        let (link_a, link_b) = match kind {
            TransportKind::NetworkFabric => (LinkState::Fabric, LinkState::Fabric),
            TransportKind::PeerLink => (LinkState::Peer, LinkState::Peer),
            TransportKind::MulticastFabric => {
                let group = Arc::new(multicast::McastGroup::new(self.multicast_bind_capacity));
                (
                    LinkState::Multicast(Arc::clone(&group)),
                    LinkState::Multicast(group),
                )
            }
        };
        (
            EndpointDescriptor {
                remote_rank: b,
                kind,
                link: link_a,
            },
            EndpointDescriptor {
                remote_rank: a,
                kind,
                link: link_b,
            },
        )
    }
}

impl Default for FabricDomain {
    fn default() -> Self {
        Self::new(crate::config::ProximaConfig::default().multicast_bind_capacity)
    }
}
