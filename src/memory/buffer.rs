//! Typed buffer wrappers that encode memory space in the type system.
//!
//! These are zero-cost wrappers around raw `u64` pointers. The type parameter
//! prevents accidentally passing a host pointer where a device pointer is
//! expected (and vice versa). Transports additionally check the runtime
//! [`MemKind`] when a region is registered, since triggers and device handles
//! carry untyped pointers.

use std::marker::PhantomData;

// ── Sealed trait pattern ─────────────────────────────────────────────

mod private {
    pub trait Sealed {}
}

/// Marker trait for memory spaces (host vs device).
pub trait MemorySpace: private::Sealed {
    /// Runtime discriminant for this space.
    const KIND: MemKind;
}

/// Host (CPU) memory.
pub enum Host {}
impl private::Sealed for Host {}
impl MemorySpace for Host {
    const KIND: MemKind = MemKind::Host;
}

/// Device (GPU) memory.
pub enum Device {}
impl private::Sealed for Device {}
impl MemorySpace for Device {
    const KIND: MemKind = MemKind::Device;
}

/// Runtime discriminant of a memory space, carried by registrations so a
/// transport can reject memory it cannot address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemKind {
    Host = 0,
    Device = 1,
}

impl MemKind {
    pub const fn name(self) -> &'static str {
        match self {
            MemKind::Host => "host",
            MemKind::Device => "device",
        }
    }
}

// ── BufferRef ────────────────────────────────────────────────────────

/// A typed, sized buffer reference in a specific memory space.
///
/// Zero-cost wrapper around a raw `u64` pointer plus a byte length. The
/// type parameter `S` prevents accidentally passing a host buffer where a
/// device buffer is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef<S: MemorySpace> {
    ptr: u64,
    len_bytes: usize,
    _space: PhantomData<S>,
}

impl<S: MemorySpace> BufferRef<S> {
    /// Create a new buffer reference.
    ///
    /// # Safety
    /// `ptr` must point to at least `len_bytes` of valid memory in space `S`.
    pub unsafe fn new(ptr: u64, len_bytes: usize) -> Self {
        Self {
            ptr,
            len_bytes,
            _space: PhantomData,
        }
    }

    /// Get the raw `u64` pointer.
    pub fn as_u64(&self) -> u64 {
        self.ptr
    }

    /// Size of the buffer in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    /// Returns true if the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    /// Runtime discriminant of the buffer's memory space.
    pub fn kind(&self) -> MemKind {
        S::KIND
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferRef({}, 0x{:x}, {}B)",
            self.kind().name(),
            self.ptr,
            self.len_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_ref_host() {
        let data: Vec<u8> = vec![0; 1024];
        let buf = unsafe { BufferRef::<Host>::new(data.as_ptr() as u64, 1024) };
        assert_eq!(buf.len_bytes(), 1024);
        assert_eq!(buf.kind(), MemKind::Host);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_buffer_ref_empty() {
        let buf = unsafe { BufferRef::<Host>::new(0, 0) };
        assert!(buf.is_empty());
    }

    #[test]
    fn test_display() {
        let buf = unsafe { BufferRef::<Device>::new(0xFF, 256) };
        let s = buf.to_string();
        assert!(s.contains("device"));
        assert!(s.contains("0xff"));
        assert!(s.contains("256B"));
    }

    #[test]
    fn test_type_safety_compiles() {
        // Host and Device are distinct types: a function accepting
        // BufferRef<Host> won't accept BufferRef<Device>.
        fn _takes_host(_buf: &BufferRef<Host>) {}
        fn _takes_device(_buf: &BufferRef<Device>) {}

        let host_buf = unsafe { BufferRef::<Host>::new(0x1000, 64) };
        let device_buf = unsafe { BufferRef::<Device>::new(0x2000, 64) };
        _takes_host(&host_buf);
        _takes_device(&device_buf);
    }
}
