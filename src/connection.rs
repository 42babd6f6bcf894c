//! Transport-agnostic point-to-point connection.
//!
//! A `Connection` is produced from an [`EndpointDescriptor`] handed over by
//! the bootstrap layer, and exposes the uniform register/write/flush
//! contract over whichever transport the endpoint selected. A connection
//! that reports an internal transport failure is poisoned: every later
//! operation fails with `ConnectionBroken` instead of retrying a dead link.

use crate::config::ProximaConfig;
use crate::error::{ProximaError, Result};
use crate::memory::{BufferRef, MemKind, MemoryHandle, MemorySpace};
use crate::transport::{
    fabric::FabricLink, multicast::McastLink, peer::PeerLink, EndpointDescriptor, LinkState,
    MulticastHandle, Transport,
};
use crate::types::{Rank, TransportKind};
use parking_lot::Mutex;
use std::time::Duration;

enum Backend {
    Fabric(FabricLink),
    Peer(PeerLink),
    Multicast(McastLink),
}

impl Backend {
    fn transport(&self) -> &dyn Transport {
        match self {
            Backend::Fabric(t) => t,
            Backend::Peer(t) => t,
            Backend::Multicast(t) => t,
        }
    }
}

/// A point-to-point channel to one remote rank over one transport.
pub struct Connection {
    kind: TransportKind,
    remote_rank: Rank,
    backend: Backend,
    flush_timeout: Duration,
    broken: Mutex<Option<String>>,
}

impl Connection {
    /// Establish a connection from bootstrap-supplied endpoint info, with
    /// default tuning.
    pub fn connect(descriptor: EndpointDescriptor) -> Result<Self> {
        Self::connect_with_config(descriptor, &ProximaConfig::default())
    }

    /// Establish a connection with explicit tuning parameters.
    pub fn connect_with_config(
        descriptor: EndpointDescriptor,
        config: &ProximaConfig,
    ) -> Result<Self> {
        let backend = match descriptor.link {
            LinkState::Fabric => Backend::Fabric(FabricLink::new()?),
            LinkState::Peer => Backend::Peer(PeerLink),
            LinkState::Multicast(group) => Backend::Multicast(McastLink::new(group)),
        };
        tracing::info!(
            remote_rank = descriptor.remote_rank,
            transport = %descriptor.kind,
            "connection established"
        );
        Ok(Self {
            kind: descriptor.kind,
            remote_rank: descriptor.remote_rank,
            backend,
            flush_timeout: config.flush_timeout,
            broken: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote_rank(&self) -> Rank {
        self.remote_rank
    }

    /// Register a typed buffer with this connection's transport.
    pub fn register<S: MemorySpace>(&self, buf: BufferRef<S>) -> Result<MemoryHandle> {
        self.register_raw(buf.as_u64(), buf.len_bytes(), S::KIND)
    }

    /// Register a raw pointer with an explicit memory-space discriminant.
    ///
    /// Fails with `InvalidUsage`/`UnaddressableMemory` when the transport
    /// cannot address memory in that space.
    pub fn register_raw(&self, ptr: u64, size: usize, kind: MemKind) -> Result<MemoryHandle> {
        self.check_usable()?;
        self.backend.transport().register(ptr, size, kind)
    }

    /// Asynchronously copy `size` bytes from `src + src_offset` into the
    /// remote region `dst + dst_offset`.
    ///
    /// Returns as soon as the operation is enqueued. Two writes on the same
    /// connection are unordered unless separated by [`Connection::flush`].
    pub fn write(
        &self,
        dst: &MemoryHandle,
        dst_offset: u64,
        src: &MemoryHandle,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_usable()?;
        self.check_handle(dst)?;
        self.check_handle(src)?;
        self.fallible(|t| t.write(dst, dst_offset, src, src_offset, size))
    }

    /// Block until all previously issued writes have completed locally.
    ///
    /// Local completion does not imply the remote side has observed the
    /// data; that takes a follow-up signal.
    pub fn flush(&self) -> Result<()> {
        self.flush_with_timeout(self.flush_timeout)
    }

    /// [`Connection::flush`] with an explicit bound.
    pub fn flush_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.check_usable()?;
        self.fallible(|t| t.flush(timeout))
    }

    /// Store `value` into the 8-byte `ack` region, write it into the remote
    /// `signal` region at `offset`, and block until locally flushed.
    ///
    /// This is "write data, then signal" as one ordered unit: because the
    /// transport completes writes in post order, the signal value cannot
    /// overtake data writes issued earlier on this connection.
    pub fn update_and_sync(
        &self,
        signal: &MemoryHandle,
        offset: u64,
        ack: &MemoryHandle,
        value: u64,
    ) -> Result<()> {
        self.check_usable()?;
        self.check_handle(signal)?;
        self.check_handle(ack)?;
        let ack_addr = ack.addr_of(0, 8)?;
        if ack_addr % 8 != 0 {
            return Err(ProximaError::invalid_usage(
                "ack region must be 8-byte aligned",
            ));
        }
        unsafe { &*(ack_addr as *const std::sync::atomic::AtomicU64) }
            .store(value, std::sync::atomic::Ordering::Release);
        self.fallible(|t| {
            t.write(signal, offset, ack, 0, 8)?;
            t.flush(self.flush_timeout)
        })
    }

    /// Bind a region into this connection's multicast group.
    ///
    /// `InvalidUsage` on non-multicast connections; `Capacity` once the
    /// group's binding limit is reached.
    pub fn bind_multicast<S: MemorySpace>(&self, buf: BufferRef<S>) -> Result<MulticastHandle> {
        self.check_usable()?;
        match &self.backend {
            Backend::Multicast(link) => link.bind(buf.as_u64(), buf.len_bytes(), S::KIND),
            _ => Err(ProximaError::invalid_usage(format!(
                "bind requires a multicast-fabric connection, this one is {}",
                self.kind
            ))),
        }
    }

    /// True once an internal failure has poisoned this connection.
    pub fn is_broken(&self) -> bool {
        self.broken.lock().is_some()
    }

    pub(crate) fn mark_broken(&self, reason: impl Into<String>) {
        let mut broken = self.broken.lock();
        if broken.is_none() {
            let reason = reason.into();
            tracing::warn!(
                remote_rank = self.remote_rank,
                transport = %self.kind,
                "connection poisoned: {reason}"
            );
            *broken = Some(reason);
        }
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(reason) = self.broken.lock().clone() {
            return Err(ProximaError::ConnectionBroken {
                id: self.remote_rank,
                reason,
            });
        }
        Ok(())
    }

    fn check_handle(&self, mem: &MemoryHandle) -> Result<()> {
        if mem.transport() != self.kind {
            return Err(ProximaError::invalid_usage(format!(
                "memory registered with {} used on a {} connection",
                mem.transport(),
                self.kind
            )));
        }
        Ok(())
    }

    /// Run a transport operation; an `Internal` failure poisons the
    /// connection before the error propagates.
    fn fallible(&self, op: impl FnOnce(&dyn Transport) -> Result<()>) -> Result<()> {
        let result = op(self.backend.transport());
        if let Err(e) = &result {
            if matches!(e, ProximaError::Internal { .. }) {
                self.mark_broken(e.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Device, Host};
    use crate::transport::FabricDomain;

    fn fabric_pair() -> (Connection, Connection) {
        let domain = FabricDomain::default();
        let (ea, eb) = domain.endpoint_pair(TransportKind::NetworkFabric, 0, 1);
        (
            Connection::connect(ea).unwrap(),
            Connection::connect(eb).unwrap(),
        )
    }

    #[test]
    fn test_connect_reports_kind_and_rank() {
        let (a, b) = fabric_pair();
        assert_eq!(a.kind(), TransportKind::NetworkFabric);
        assert_eq!(a.remote_rank(), 1);
        assert_eq!(b.remote_rank(), 0);
    }

    #[test]
    fn test_write_flush_roundtrip_sizes() {
        let (a, _b) = fabric_pair();
        for size in [1usize, 1024, 1024 * 1024] {
            let src: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let dst = vec![0u8; size];
            let src_mem = a
                .register(unsafe { BufferRef::<Host>::new(src.as_ptr() as u64, size) })
                .unwrap();
            let dst_mem = a
                .register(unsafe { BufferRef::<Host>::new(dst.as_ptr() as u64, size) })
                .unwrap();
            a.write(&dst_mem, 0, &src_mem, 0, size as u64).unwrap();
            a.flush().unwrap();
            assert_eq!(dst, src, "mismatch at size {size}");
        }
    }

    #[test]
    fn test_mismatched_transport_handle_rejected() {
        let domain = FabricDomain::default();
        let (ea, _eb) = domain.endpoint_pair(TransportKind::NetworkFabric, 0, 1);
        let (pa, _pb) = domain.endpoint_pair(TransportKind::PeerLink, 0, 1);
        let fabric = Connection::connect(ea).unwrap();
        let peer = Connection::connect(pa).unwrap();

        let buf = vec![0u8; 64];
        let peer_mem = peer
            .register(unsafe { BufferRef::<Device>::new(buf.as_ptr() as u64, 64) })
            .unwrap();
        let err = fabric.write(&peer_mem, 0, &peer_mem, 0, 64).unwrap_err();
        assert!(matches!(err, ProximaError::InvalidUsage { .. }));
    }

    #[test]
    fn test_bind_on_non_multicast_is_invalid_usage() {
        let (a, _b) = fabric_pair();
        let buf = vec![0u8; 64];
        let err = a
            .bind_multicast(unsafe { BufferRef::<Device>::new(buf.as_ptr() as u64, 64) })
            .unwrap_err();
        assert!(matches!(err, ProximaError::InvalidUsage { .. }));
    }

    #[test]
    fn test_update_and_sync_orders_after_data() {
        let (a, _b) = fabric_pair();
        let data_src = vec![9u8; 4096];
        let data_dst = vec![0u8; 4096];
        let signal = vec![0u8; 8];
        let ack = vec![0u8; 8];

        let reg = |v: &Vec<u8>| {
            a.register(unsafe { BufferRef::<Host>::new(v.as_ptr() as u64, v.len()) })
                .unwrap()
        };
        let (src_m, dst_m, sig_m, ack_m) = (reg(&data_src), reg(&data_dst), reg(&signal), reg(&ack));

        a.write(&dst_m, 0, &src_m, 0, 4096).unwrap();
        a.update_and_sync(&sig_m, 0, &ack_m, 42).unwrap();

        // update_and_sync returns only after the earlier data write has
        // locally completed.
        assert_eq!(data_dst, vec![9u8; 4096]);
        assert_eq!(u64::from_ne_bytes(signal[..8].try_into().unwrap()), 42);
    }

    #[test]
    fn test_broken_connection_rejects_operations() {
        let (a, _b) = fabric_pair();
        a.mark_broken("simulated nic failure");
        assert!(a.is_broken());
        let buf = vec![0u8; 8];
        let err = a
            .register(unsafe { BufferRef::<Host>::new(buf.as_ptr() as u64, 8) })
            .unwrap_err();
        assert!(matches!(err, ProximaError::ConnectionBroken { .. }));
        assert!(matches!(a.flush(), Err(ProximaError::ConnectionBroken { .. })));
    }
}
