//! Intra-node peer-link transport: direct GPU-to-GPU memory mapping.
//!
//! Writes are plain stores into the peer's mapped address space, so they
//! land immediately and `flush` is only an ordering point. Only
//! device-resident memory can be mapped over a peer link; offering host
//! memory is `InvalidUsage`.

use super::{next_token, Transport};
use crate::error::{ProximaError, Result};
use crate::memory::{MemKind, MemoryHandle, RegisteredMemory};
use crate::types::TransportKind;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

pub(crate) struct PeerLink;

impl Transport for PeerLink {
    fn kind(&self) -> TransportKind {
        TransportKind::PeerLink
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

    fn write(
        &self,
        dst: &MemoryHandle,
        dst_offset: u64,
        src: &MemoryHandle,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let src_addr = src.addr_of(src_offset, size)?;
        let dst_addr = dst.addr_of(dst_offset, size)?;
        unsafe {
            super::fabric::copy_region(src_addr, dst_addr, size);
        }
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        // Stores over the peer mapping are already locally complete; a
        // release fence orders them before any subsequent signal.
        fence(Ordering::Release);
        Ok(())
    }
}
