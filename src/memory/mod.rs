//! Registered memory regions and typed buffer references.
//!
//! A region must be registered with a [`crate::connection::Connection`]
//! before any remote operation can reference it. Registration yields a
//! [`MemoryHandle`]: a cheaply cloneable, refcounted descriptor. Every
//! in-flight transport operation holds a clone, so a region can never be
//! torn down while an operation still references it.

mod buffer;

pub use buffer::{BufferRef, Device, Host, MemKind, MemorySpace};

use crate::error::{ProximaError, Result};
use crate::types::TransportKind;
use std::sync::Arc;

/// Refcounted handle to a registered memory region.
///
/// Dropping the last handle releases the registration.
pub type MemoryHandle = Arc<RegisteredMemory>;

/// A memory region registered with a specific connection's transport.
#[derive(Debug)]
pub struct RegisteredMemory {
    ptr: u64,
    size: usize,
    kind: MemKind,
    transport: TransportKind,
    token: u64,
}

impl RegisteredMemory {
    /// Called by transports after they have validated addressability.
    ///
    /// # Safety
    /// `ptr` must point to at least `size` bytes of memory in space `kind`,
    /// valid for the lifetime of the returned handle.
    pub(crate) unsafe fn new(
        ptr: u64,
        size: usize,
        kind: MemKind,
        transport: TransportKind,
        token: u64,
    ) -> MemoryHandle {
        Arc::new(Self {
            ptr,
            size,
            kind,
            transport,
            token,
        })
    }

    /// Base pointer of the region.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Memory space the region lives in.
    pub fn kind(&self) -> MemKind {
        self.kind
    }

    /// Transport the region is registered with.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Transport-specific access token (rkey analogue).
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Bounds-check `offset..offset + len` and return the absolute address.
    pub(crate) fn addr_of(&self, offset: u64, len: u64) -> Result<u64> {
        let end = offset.checked_add(len).ok_or_else(|| {
            ProximaError::invalid_usage(format!("offset {offset} + len {len} overflows"))
        })?;
        if end > self.size as u64 {
            return Err(ProximaError::invalid_usage(format!(
                "range {offset}..{end} out of bounds for region of {} bytes",
                self.size
            )));
        }
        Ok(self.ptr + offset)
    }

}

/// True while a transport operation still holds a clone of `handle`.
///
/// Callers must not reuse or free the underlying allocation while this
/// returns true.
pub fn in_flight(handle: &MemoryHandle) -> bool {
    Arc::strong_count(handle) > 1
}
