//! One-to-many multicast memory fabric.
//!
//! A multicast group supports a small, fixed number of concurrently bound
//! regions. A write through the group replicates into every currently
//! bound region at the same offset. Binding beyond capacity fails with
//! `Capacity` until another binding is released; releasing is a handle
//! drop and is safe to race with a pending `bind` retry.

use super::{next_token, Transport};
use crate::error::{ProximaError, Result};
use crate::memory::{MemKind, MemoryHandle, RegisteredMemory};
use crate::types::TransportKind;
use parking_lot::Mutex;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct BoundRegion {
    token: u64,
    mem: MemoryHandle,
}

/// Shared state of one multicast group; all member links hold an `Arc`.
#[derive(Debug)]
pub(crate) struct McastGroup {
    capacity: usize,
    bound: Mutex<Vec<BoundRegion>>,
}

impl McastGroup {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bound: Mutex::new(Vec::new()),
        }
    }

    fn unbind(&self, token: u64) {
        let mut bound = self.bound.lock();
        bound.retain(|r| r.token != token);
    }
}

/// A region bound into a multicast group. Dropping the handle releases the
/// binding slot.
#[derive(Debug)]
pub struct MulticastHandle {
    token: u64,
    mem: MemoryHandle,
    group: Arc<McastGroup>,
}

impl MulticastHandle {
    /// The registration backing this binding, usable as a write target.
    pub fn memory(&self) -> &MemoryHandle {
        &self.mem
    }
}

impl Drop for MulticastHandle {
    fn drop(&mut self) {
        self.group.unbind(self.token);
    }
}

/// One member's attachment to a multicast group.
pub(crate) struct McastLink {
    group: Arc<McastGroup>,
}

impl McastLink {
    pub(crate) fn new(group: Arc<McastGroup>) -> Self {
        Self { group }
    }

    /// Bind a device region into the group.
    ///
    /// Fails with `Capacity` once the configured number of concurrent
    /// bindings is reached.
    pub(crate) fn bind(&self, ptr: u64, size: usize, kind: MemKind) -> Result<MulticastHandle> {
        if kind != MemKind::Device {
            return Err(ProximaError::UnaddressableMemory {
                transport: TransportKind::MulticastFabric,
                space: kind.name(),
                ptr,
            });
        }
        if size == 0 {
            return Err(ProximaError::invalid_usage("cannot bind empty region"));
        }
        let token = next_token();
        let mem = unsafe {
            RegisteredMemory::new(ptr, size, kind, TransportKind::MulticastFabric, token)
        };
        let mut bound = self.group.bound.lock();
        if bound.len() >= self.group.capacity {
            return Err(ProximaError::Capacity {
                resource: "multicast bind",
                used: bound.len(),
                limit: self.group.capacity,
            });
        }
        bound.push(BoundRegion {
            token,
            mem: Arc::clone(&mem),
        });
        drop(bound);
        tracing::debug!(token, size, "multicast region bound");
        Ok(MulticastHandle {
            token,
            mem,
            group: Arc::clone(&self.group),
        })
    }

    /// Regions currently bound to the group.
    pub(crate) fn bound_count(&self) -> usize {
        self.group.bound.lock().len()
    }
}

impl Transport for McastLink {
    fn kind(&self) -> TransportKind {
        TransportKind::MulticastFabric
    }

    fn register(&self, ptr: u64, size: usize, kind: MemKind) -> Result<MemoryHandle> {
        if size == 0 {
            return Err(ProximaError::invalid_usage("cannot register empty region"));
        }
        if kind != MemKind::Device {
            return Err(ProximaError::UnaddressableMemory {
                transport: self.kind(),
                space: kind.name(),
                ptr,
            });
        }
        Ok(unsafe { RegisteredMemory::new(ptr, size, kind, self.kind(), next_token()) })
    }

    /// Replicate `size` bytes from `src` into every bound region at
    /// `dst_offset`. `dst` selects the group write window; a region the
    /// range does not fit in is skipped only if it is the source's own
    /// binding, otherwise the write is rejected up front.
    fn write(
        &self,
        dst: &MemoryHandle,
        dst_offset: u64,
        src: &MemoryHandle,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let src_addr = src.addr_of(src_offset, size)?;
        dst.addr_of(dst_offset, size)?;
        let bound = self.group.bound.lock();
        for region in bound.iter() {
            // Self-replication would alias the source range.
            if region.mem.token() == src.token() {
                continue;
            }
            let dst_addr = region.mem.addr_of(dst_offset, size)?;
            unsafe {
                super::fabric::copy_region(src_addr, dst_addr, size);
            }
        }
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        fence(Ordering::Release);
        Ok(())
    }
}
