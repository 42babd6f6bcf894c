//! Signaling primitives with three producer/consumer domain pairings:
//! host↔host, host→device, and device↔device.
//!
//! All variants share one counter scheme: the signaling side owns a
//! monotonically increasing *outbound* counter whose new value is written
//! into the waiting side's *inbound* counter; the waiter keeps a private
//! *expected* counter and polls `inbound >= expected` with wraparound-safe
//! arithmetic. "Signal" is therefore a raw remote memory store observed by
//! a poll loop, never a syscall — device code can run either end.
//!
//! Construction is two-phase, since the inbound region handle must be
//! exchanged with the peer out of band (the bootstrap's job): `prepare` a
//! semaphore on a connection, ship `inbound_handle()` to the peer, then
//! `complete` with the handle received from them.

use crate::connection::Connection;
use crate::error::{ProximaError, Result};
use crate::fifo::backoff;
use crate::memory::{MemKind, MemoryHandle};
use crate::types::TransportKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An 8-byte counter pinned on the heap and registered with a connection.
struct Counter {
    cell: Box<AtomicU64>,
    mem: MemoryHandle,
}

impl Counter {
    fn new(connection: &Connection, kind: MemKind) -> Result<Self> {
        let cell = Box::new(AtomicU64::new(0));
        let mem = connection.register_raw(cell.as_ref() as *const AtomicU64 as u64, 8, kind)?;
        Ok(Self { cell, mem })
    }

    fn value(&self) -> u64 {
        self.cell.load(Ordering::Acquire)
    }
}

/// `inbound >= expected` under bounded-width wraparound.
#[inline]
fn reached(inbound: u64, expected: u64) -> bool {
    (inbound.wrapping_sub(expected) as i64) >= 0
}

/// Poll `inbound` until it reaches `expected` or `timeout` elapses.
fn poll_counter(
    inbound: &AtomicU64,
    expected: u64,
    timeout: Duration,
    operation: &'static str,
) -> Result<()> {
    let start = Instant::now();
    let mut iter = 0u32;
    while !reached(inbound.load(Ordering::Acquire), expected) {
        if start.elapsed() > timeout {
            return Err(ProximaError::Timeout {
                operation,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        backoff(&mut iter);
    }
    Ok(())
}

// ── Host ↔ Host ──────────────────────────────────────────────────────

/// Host-to-host semaphore: both `signal` and `wait` run on host threads.
///
/// `wait` holds no lock while polling — unrelated host threads stay fully
/// runnable during a blocked wait.
pub struct Host2HostSemaphore {
    connection: Arc<Connection>,
    inbound: Counter,
    outbound: Counter,
    remote_inbound: MemoryHandle,
    expected: AtomicU64,
}

/// A host↔host semaphore awaiting the peer's inbound-region handle.
pub struct PreparedHost2Host {
    connection: Arc<Connection>,
    inbound: Counter,
    outbound: Counter,
}

impl Host2HostSemaphore {
    /// Phase 1: allocate counters and register the inbound region.
    ///
    /// `InvalidUsage` on peer-link connections: their counters live in
    /// device memory a host thread cannot poll.
    pub fn prepare(connection: Arc<Connection>) -> Result<PreparedHost2Host> {
        if connection.kind() == TransportKind::PeerLink {
            return Err(ProximaError::invalid_usage(
                "host-to-host semaphore cannot run over a peer-link connection",
            ));
        }
        let inbound = Counter::new(&connection, MemKind::Host)?;
        let outbound = Counter::new(&connection, MemKind::Host)?;
        Ok(PreparedHost2Host {
            connection,
            inbound,
            outbound,
        })
    }

    /// Convenience for two ranks living in one process: prepare both sides
    /// and exchange inbound handles directly.
    pub fn pair(a: Arc<Connection>, b: Arc<Connection>) -> Result<(Self, Self)> {
        let pa = Self::prepare(a)?;
        let pb = Self::prepare(b)?;
        let ha = pa.inbound_handle();
        let hb = pb.inbound_handle();
        Ok((pa.complete(hb), pb.complete(ha)))
    }

    /// Increment the outbound counter and write its new value into the
    /// peer's inbound counter, blocking until locally flushed.
    pub fn signal(&self) -> Result<()> {
        let next = self.outbound.value().wrapping_add(1);
        self.connection
            .update_and_sync(&self.remote_inbound, 0, &self.outbound.mem, next)
    }

    /// Block until the inbound counter reaches the next expected value.
    ///
    /// On `Timeout` the expectation is rolled back, so the call is
    /// retryable.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let expected = self.expected.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        match poll_counter(self.inbound.cell.as_ref(), expected, timeout, "semaphore wait") {
            Ok(()) => Ok(()),
            Err(e) => {
                self.expected.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}

impl PreparedHost2Host {
    /// Registration of the local inbound counter, to ship to the peer.
    pub fn inbound_handle(&self) -> MemoryHandle {
        Arc::clone(&self.inbound.mem)
    }

    /// Phase 2: install the peer's inbound-region handle.
    pub fn complete(self, remote_inbound: MemoryHandle) -> Host2HostSemaphore {
        Host2HostSemaphore {
            connection: self.connection,
            inbound: self.inbound,
            outbound: self.outbound,
            remote_inbound,
            expected: AtomicU64::new(0),
        }
    }
}

// ── Host → Device ────────────────────────────────────────────────────

/// Fixed-layout device handle for a host→device semaphore. Device code
/// embeds it by value and polls through the raw pointers; field order and
/// size are a binary contract.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Host2DeviceHandle {
    /// Pointer to the device-resident inbound counter.
    pub inbound: u64,
    /// Pointer to the device-resident expected counter.
    pub expected: u64,
}

/// Host-to-device semaphore: the host signals, device code waits.
///
/// There is no host-side `wait`; the device-side poll is a relaxed-acquire
/// busy loop over the handle from [`Host2DeviceSemaphore::device_handle`].
pub struct Host2DeviceSemaphore {
    connection: Arc<Connection>,
    inbound: Counter,
    expected: Counter,
    outbound: Counter,
    remote_inbound: MemoryHandle,
}

/// A host→device semaphore awaiting the peer's inbound-region handle.
pub struct PreparedHost2Device {
    connection: Arc<Connection>,
    inbound: Counter,
    expected: Counter,
    outbound: Counter,
}

impl Host2DeviceSemaphore {
    /// Phase 1: allocate the device-resident counters and register the
    /// inbound region.
    pub fn prepare(connection: Arc<Connection>) -> Result<PreparedHost2Device> {
        let inbound = Counter::new(&connection, MemKind::Device)?;
        let expected = Counter::new(&connection, MemKind::Device)?;
        let outbound = Counter::new(&connection, MemKind::Host)?;
        Ok(PreparedHost2Device {
            connection,
            inbound,
            expected,
            outbound,
        })
    }

    /// In-process pair: the waiting side's semaphore signals back over `b`.
    pub fn pair(a: Arc<Connection>, b: Arc<Connection>) -> Result<(Self, Self)> {
        let pa = Self::prepare(a)?;
        let pb = Self::prepare(b)?;
        let ha = pa.inbound_handle();
        let hb = pb.inbound_handle();
        Ok((pa.complete(hb), pb.complete(ha)))
    }

    /// Signal the device-side waiter.
    pub fn signal(&self) -> Result<()> {
        let next = self.outbound.value().wrapping_add(1);
        self.connection
            .update_and_sync(&self.remote_inbound, 0, &self.outbound.mem, next)
    }

    /// Handle for the device-side wait loop. Valid while `self` is alive.
    pub fn device_handle(&self) -> Host2DeviceHandle {
        Host2DeviceHandle {
            inbound: self.inbound.cell.as_ref() as *const AtomicU64 as u64,
            expected: self.expected.cell.as_ref() as *const AtomicU64 as u64,
        }
    }
}

impl PreparedHost2Device {
    pub fn inbound_handle(&self) -> MemoryHandle {
        Arc::clone(&self.inbound.mem)
    }

    pub fn complete(self, remote_inbound: MemoryHandle) -> Host2DeviceSemaphore {
        Host2DeviceSemaphore {
            connection: self.connection,
            inbound: self.inbound,
            expected: self.expected,
            outbound: self.outbound,
            remote_inbound,
        }
    }
}

// ── Device ↔ Device ──────────────────────────────────────────────────

/// Fixed-layout device handle for a device↔device semaphore. Field order
/// and size are a binary contract.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Device2DeviceHandle {
    /// Pointer to the peer's inbound counter through the peer mapping
    /// (0 when the transport signals through the proxy instead).
    pub remote_inbound: u64,
    /// Pointer to the local inbound counter.
    pub inbound: u64,
    /// Pointer to the local expected counter.
    pub expected: u64,
    /// Pointer to the local outbound counter.
    pub outbound: u64,
}

/// Device-to-device semaphore over a peer link: both `signal` and `wait`
/// execute in device code through [`Device2DeviceSemaphore::device_handle`].
pub struct Device2DeviceSemaphore {
    inbound: Counter,
    expected: Counter,
    outbound: Counter,
    /// Set when the transport maps the peer's counter for direct stores.
    remote_inbound: Option<MemoryHandle>,
}

/// A device↔device semaphore awaiting the peer's inbound-region handle.
pub struct PreparedDevice2Device {
    direct: bool,
    inbound: Counter,
    expected: Counter,
    outbound: Counter,
}

impl Device2DeviceSemaphore {
    /// Phase 1. Over a peer link the remote counter is mapped for direct
    /// stores; over the network fabric the signal travels through the
    /// proxy, so no remote mapping is installed.
    pub fn prepare(connection: Arc<Connection>) -> Result<PreparedDevice2Device> {
        let direct = connection.kind() == TransportKind::PeerLink;
        let inbound = Counter::new(&connection, MemKind::Device)?;
        let expected = Counter::new(&connection, MemKind::Device)?;
        let outbound = Counter::new(&connection, MemKind::Device)?;
        Ok(PreparedDevice2Device {
            direct,
            inbound,
            expected,
            outbound,
        })
    }

    /// In-process pair over a peer link.
    pub fn pair(a: Arc<Connection>, b: Arc<Connection>) -> Result<(Self, Self)> {
        let pa = Self::prepare(a)?;
        let pb = Self::prepare(b)?;
        let ha = pa.inbound_handle();
        let hb = pb.inbound_handle();
        Ok((pa.complete(Some(hb)), pb.complete(Some(ha))))
    }

    /// Handle for device-side signal/wait. Valid while `self` is alive.
    pub fn device_handle(&self) -> Device2DeviceHandle {
        Device2DeviceHandle {
            remote_inbound: self
                .remote_inbound
                .as_ref()
                .map_or(0, |mem| mem.ptr()),
            inbound: self.inbound.cell.as_ref() as *const AtomicU64 as u64,
            expected: self.expected.cell.as_ref() as *const AtomicU64 as u64,
            outbound: self.outbound.cell.as_ref() as *const AtomicU64 as u64,
        }
    }
}

impl PreparedDevice2Device {
    pub fn inbound_handle(&self) -> MemoryHandle {
        Arc::clone(&self.inbound.mem)
    }

    /// Phase 2. Pass `None` when the transport signals through the proxy.
    pub fn complete(self, remote_inbound: Option<MemoryHandle>) -> Device2DeviceSemaphore {
        Device2DeviceSemaphore {
            inbound: self.inbound,
            expected: self.expected,
            outbound: self.outbound,
            remote_inbound: if self.direct { remote_inbound } else { None },
        }
    }
}

// ── Device-side operations ───────────────────────────────────────────

/// The operations device code performs through semaphore handles,
/// expressed over the same memory the kernels would touch. Host tests use
/// these to stand in for kernel threads.
pub mod device_side {
    use super::*;

    /// Relaxed-acquire poll loop a device waiter runs over a
    /// [`Host2DeviceHandle`] or [`Device2DeviceHandle`] counter pair.
    ///
    /// # Safety
    /// `inbound` and `expected` must point to live 8-byte counters (a
    /// handle whose owning semaphore is still alive).
    pub unsafe fn wait(inbound: u64, expected: u64, timeout: Duration) -> Result<()> {
        let inbound = unsafe { &*(inbound as *const AtomicU64) };
        let expected = unsafe { &*(expected as *const AtomicU64) };
        let want = expected.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        match poll_counter(inbound, want, timeout, "device wait") {
            Ok(()) => Ok(()),
            Err(e) => {
                expected.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Device-side signal over a [`Device2DeviceHandle`]: bump the local
    /// outbound counter and store the new value through the peer mapping.
    ///
    /// # Safety
    /// The handle's owning semaphore (and its peer) must be alive, and
    /// `remote_inbound` must be non-zero (direct peer-link mapping).
    pub unsafe fn signal(handle: &Device2DeviceHandle) -> Result<()> {
        if handle.remote_inbound == 0 {
            return Err(ProximaError::invalid_usage(
                "device-side signal requires a direct peer mapping",
            ));
        }
        let outbound = unsafe { &*(handle.outbound as *const AtomicU64) };
        let remote = unsafe { &*(handle.remote_inbound as *const AtomicU64) };
        let next = outbound.load(Ordering::Acquire).wrapping_add(1);
        outbound.store(next, Ordering::Release);
        remote.store(next, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FabricDomain;
    use std::thread;

    fn fabric_pair() -> (Arc<Connection>, Arc<Connection>) {
        let domain = FabricDomain::default();
        let (ea, eb) = domain.endpoint_pair(TransportKind::NetworkFabric, 0, 1);
        (
            Arc::new(Connection::connect(ea).unwrap()),
            Arc::new(Connection::connect(eb).unwrap()),
        )
    }

    fn peer_pair() -> (Arc<Connection>, Arc<Connection>) {
        let domain = FabricDomain::default();
        let (ea, eb) = domain.endpoint_pair(TransportKind::PeerLink, 0, 1);
        (
            Arc::new(Connection::connect(ea).unwrap()),
            Arc::new(Connection::connect(eb).unwrap()),
        )
    }

    #[test]
    fn test_wraparound_comparison() {
        assert!(reached(5, 5));
        assert!(reached(6, 5));
        assert!(!reached(4, 5));
        // Counter wrapped past u64::MAX.
        assert!(reached(2, u64::MAX));
        assert!(!reached(u64::MAX, 2));
    }

    #[test]
    fn test_host2host_signal_then_wait() {
        let (a, b) = fabric_pair();
        let (sem_a, sem_b) = Host2HostSemaphore::pair(a, b).unwrap();
        sem_a.signal().unwrap();
        sem_b.wait(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_host2host_wait_blocks_until_signal() {
        let (a, b) = fabric_pair();
        let (sem_a, sem_b) = Host2HostSemaphore::pair(a, b).unwrap();

        let waiter = thread::spawn(move || sem_b.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        sem_a.signal().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_host2host_timeout_is_retryable() {
        let (a, b) = fabric_pair();
        let (sem_a, sem_b) = Host2HostSemaphore::pair(a, b).unwrap();

        let err = sem_b.wait(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, ProximaError::Timeout { .. }));

        // The rolled-back expectation means one signal satisfies the retry.
        sem_a.signal().unwrap();
        sem_b.wait(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_host2host_rejects_peer_link() {
        let (a, _b) = peer_pair();
        assert!(matches!(
            Host2HostSemaphore::prepare(a),
            Err(ProximaError::InvalidUsage { .. })
        ));
    }

    #[test]
    fn test_host2host_multiple_signals_accumulate() {
        let (a, b) = fabric_pair();
        let (sem_a, sem_b) = Host2HostSemaphore::pair(a, b).unwrap();
        for _ in 0..3 {
            sem_a.signal().unwrap();
        }
        for _ in 0..3 {
            sem_b.wait(Duration::from_secs(1)).unwrap();
        }
        // A fourth wait has nothing to consume.
        assert!(sem_b.wait(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_host2device_device_side_wait() {
        let (a, b) = fabric_pair();
        let (sem_a, sem_b) = Host2DeviceSemaphore::pair(a, b).unwrap();
        let handle = sem_b.device_handle();

        // Device-side waiter emulated by a host thread over the handle.
        let waiter = thread::spawn(move || unsafe {
            device_side::wait(handle.inbound, handle.expected, Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(10));
        sem_a.signal().unwrap();
        waiter.join().unwrap().unwrap();
        drop(sem_b);
    }

    #[test]
    fn test_device2device_signal_and_wait() {
        let (a, b) = peer_pair();
        let (sem_a, sem_b) = Device2DeviceSemaphore::pair(a, b).unwrap();
        let ha = sem_a.device_handle();
        let hb = sem_b.device_handle();
        assert_ne!(ha.remote_inbound, 0);

        unsafe { device_side::signal(&ha).unwrap() };
        unsafe { device_side::wait(hb.inbound, hb.expected, Duration::from_secs(1)).unwrap() };
    }

    #[test]
    fn test_device2device_without_mapping_rejects_signal() {
        let (a, b) = fabric_pair();
        let pa = Device2DeviceSemaphore::prepare(a).unwrap();
        let _pb = Device2DeviceSemaphore::prepare(b).unwrap();
        let sem = pa.complete(None);
        let handle = sem.device_handle();
        assert_eq!(handle.remote_inbound, 0);
        assert!(matches!(
            unsafe { device_side::signal(&handle) },
            Err(ProximaError::InvalidUsage { .. })
        ));
    }

    #[test]
    fn test_device_handle_layouts() {
        assert_eq!(std::mem::size_of::<Host2DeviceHandle>(), 16);
        assert_eq!(std::mem::size_of::<Device2DeviceHandle>(), 32);
        assert_eq!(std::mem::offset_of!(Device2DeviceHandle, remote_inbound), 0);
        assert_eq!(std::mem::offset_of!(Device2DeviceHandle, inbound), 8);
        assert_eq!(std::mem::offset_of!(Device2DeviceHandle, expected), 16);
        assert_eq!(std::mem::offset_of!(Device2DeviceHandle, outbound), 24);
    }

    #[test]
    fn test_blocked_wait_does_not_stall_other_threads() {
        let (a, b) = fabric_pair();
        let (_sem_a, sem_b) = Host2HostSemaphore::pair(a, b).unwrap();

        let timeout = Duration::from_millis(500);
        let waiter = thread::spawn(move || {
            let begun = Instant::now();
            (sem_b.wait(timeout), begun.elapsed())
        });

        // An unrelated thread must stay schedulable while the wait blocks.
        let start = Instant::now();
        let unrelated = thread::spawn(|| {
            let mut acc = 0u64;
            for i in 0..10_000u64 {
                acc = acc.wrapping_add(i);
            }
            acc
        });
        unrelated.join().unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "unrelated thread was starved for {:?}",
            start.elapsed()
        );

        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(ProximaError::Timeout { .. })));
        // The timeout must be honored, not overshot by the backoff tiers.
        assert!(elapsed >= timeout, "wait returned early after {elapsed:?}");
        assert!(
            elapsed < timeout + Duration::from_millis(300),
            "wait overshot its timeout: {elapsed:?}"
        );
    }
}
