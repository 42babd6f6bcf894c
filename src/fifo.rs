//! Lock-free single-producer/single-consumer trigger queue shared across
//! the device/host boundary.
//!
//! The fifo is the sole synchronization bridge between the two compute
//! domains, so it uses explicit acquire/release atomics and never a lock:
//! the producer may be a GPU kernel thread that cannot block on host
//! syscalls, and a mutex across the boundary would serialize kernel
//! progress against host scheduling jitter.
//!
//! Publication protocol: the producer writes every trigger field except
//! `opcode`, then stores `opcode` with release ordering. The consumer reads
//! `opcode` first with acquire ordering, so it observes either a complete
//! trigger or a free slot, never a torn record. A slot is freed by storing
//! `opcode = EMPTY` (release) *before* advancing `tail`; the producer's
//! full-check therefore never hands out a slot whose previous occupant is
//! still visible.

use crate::error::{ProximaError, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trigger opcodes. `EMPTY` is the reserved free-slot pattern.
pub const OP_EMPTY: u32 = 0;
/// Resolve src/dst memory ids and issue `Connection::write`.
pub const OP_WRITE: u32 = 1;
/// Issue `Connection::flush` on the referenced connection.
pub const OP_FLUSH: u32 = 2;
/// Signal the referenced host-side semaphore.
pub const OP_SIGNAL: u32 = 3;
/// Block the proxy loop until the referenced semaphore fires.
pub const OP_WAIT: u32 = 4;

/// A fixed-size record describing one requested operation, queued
/// device-to-host.
///
/// `#[repr(C)]` because device code embeds and writes this layout by value;
/// field order and size are part of the binary contract. `opcode` is last:
/// it doubles as the publication word and must be written after every other
/// field.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
    pub src_memory_id: u32,
    pub dst_memory_id: u32,
    pub connection_id: u32,
    pub semaphore_id: u32,
    pub flags: u32,
    pub opcode: u32,
}

impl Trigger {
    /// A `WRITE` trigger.
    pub fn write(
        connection_id: u32,
        src_memory_id: u32,
        src_offset: u64,
        dst_memory_id: u32,
        dst_offset: u64,
        size: u64,
    ) -> Self {
        Self {
            src_offset,
            dst_offset,
            size,
            src_memory_id,
            dst_memory_id,
            connection_id,
            semaphore_id: 0,
            flags: 0,
            opcode: OP_WRITE,
        }
    }

    /// A `FLUSH` trigger for one connection.
    pub fn flush(connection_id: u32) -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size: 0,
            src_memory_id: 0,
            dst_memory_id: 0,
            connection_id,
            semaphore_id: 0,
            flags: 0,
            opcode: OP_FLUSH,
        }
    }

    /// A `SIGNAL` trigger for one semaphore.
    pub fn signal(semaphore_id: u32) -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size: 0,
            src_memory_id: 0,
            dst_memory_id: 0,
            connection_id: 0,
            semaphore_id,
            flags: 0,
            opcode: OP_SIGNAL,
        }
    }

    /// A `WAIT` trigger for one semaphore.
    pub fn wait(semaphore_id: u32) -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size: 0,
            src_memory_id: 0,
            dst_memory_id: 0,
            connection_id: 0,
            semaphore_id,
            flags: 0,
            opcode: OP_WAIT,
        }
    }
}

/// One fifo slot: untyped trigger body plus the atomic publication word.
///
/// `opcode` mirrors `Trigger::opcode`; the body's own opcode field is only
/// meaningful on the consumer's copy.
#[repr(C)]
struct Slot {
    body: UnsafeCell<Trigger>,
    opcode: AtomicU32,
}

struct FifoInner {
    slots: Box<[Slot]>,
    mask: u64,
    /// Producer-owned write index, monotonically increasing.
    head: AtomicU64,
    /// Consumer-owned read index, monotonically increasing.
    tail: AtomicU64,
}

// Slots are handed between exactly one producer and one consumer under the
// opcode publication protocol.
unsafe impl Send for FifoInner {}
unsafe impl Sync for FifoInner {}

/// Fixed-layout device handle for a fifo, embeddable by value in kernel
/// arguments. Field order and size are a binary contract.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FifoDeviceHandle {
    /// Pointer to the slot array (`capacity` entries of `Trigger` layout
    /// followed by a 4-byte publication word each).
    pub slots: u64,
    /// Pointer to the producer index word.
    pub head: u64,
    /// Pointer to the consumer index word.
    pub tail: u64,
    /// Slot count, power of two.
    pub capacity: u64,
}

/// Single-producer/single-consumer circular queue of [`Trigger`]s.
///
/// Clones share the same queue; exactly one clone may push and exactly one
/// may poll/pop at any time. Concurrent producers are undefined behavior at
/// the contract level and are not checked.
#[derive(Clone)]
pub struct Fifo {
    inner: Arc<FifoInner>,
}

impl Fifo {
    /// Create a fifo with `capacity` slots (rounded up to a power of two).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|_| Slot {
                body: UnsafeCell::new(Trigger {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 0,
                    src_memory_id: 0,
                    dst_memory_id: 0,
                    connection_id: 0,
                    semaphore_id: 0,
                    flags: 0,
                    opcode: OP_EMPTY,
                }),
                opcode: AtomicU32::new(OP_EMPTY),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(FifoInner {
                slots,
                mask: capacity as u64 - 1,
                head: AtomicU64::new(0),
                tail: AtomicU64::new(0),
            }),
        }
    }

    /// Create a fifo sized by `config.fifo_capacity`.
    pub fn with_config(config: &crate::config::ProximaConfig) -> Self {
        Self::new(config.fifo_capacity)
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Triggers currently queued.
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: publish a trigger, returning its monotonic slot index.
    ///
    /// Fails with `FifoFull` when `head - tail == capacity`; the producer
    /// must back off and retry, never overwrite.
    pub fn push(&self, trigger: Trigger) -> Result<u64> {
        if trigger.opcode == OP_EMPTY {
            return Err(ProximaError::invalid_usage(
                "cannot push a trigger with the reserved EMPTY opcode",
            ));
        }
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= inner.slots.len() as u64 {
            return Err(ProximaError::FifoFull {
                capacity: inner.slots.len(),
            });
        }

        let slot = &inner.slots[(head & inner.mask) as usize];
        // Body first, publication word last. The release store makes every
        // body field visible before the consumer can observe the opcode.
        unsafe {
            let body = &mut *slot.body.get();
            *body = trigger;
            body.opcode = OP_EMPTY;
        }
        slot.opcode.store(trigger.opcode, Ordering::Release);
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(head)
    }

    /// Producer side: push with backoff until space frees or `timeout`
    /// elapses.
    pub fn push_timeout(&self, trigger: Trigger, timeout: Duration) -> Result<u64> {
        let start = Instant::now();
        let mut iter = 0u32;
        loop {
            match self.push(trigger) {
                Err(ProximaError::FifoFull { .. }) => {}
                other => return other,
            }
            if start.elapsed() > timeout {
                return Err(ProximaError::Timeout {
                    operation: "fifo push",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            backoff(&mut iter);
        }
    }

    /// Consumer side: inspect the trigger at `tail` without consuming it.
    ///
    /// Returns `None` when the fifo is empty. The slot stays occupied until
    /// [`Fifo::pop`].
    pub fn poll(&self) -> Option<Trigger> {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let slot = &inner.slots[(tail & inner.mask) as usize];
        let opcode = slot.opcode.load(Ordering::Acquire);
        if opcode == OP_EMPTY {
            return None;
        }
        // The acquire load above orders this read after the producer's body
        // writes.
        let mut trigger = unsafe { *slot.body.get() };
        trigger.opcode = opcode;
        Some(trigger)
    }

    /// Consumer side: free the slot at `tail` and advance.
    ///
    /// The slot-free signal (opcode back to `EMPTY`) is released before the
    /// tail advance, so a producer that observes the new tail may reuse the
    /// slot immediately. Popping an empty fifo is a no-op: advancing `tail`
    /// past `head` would leave the queue permanently full.
    pub fn pop(&self) {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let slot = &inner.slots[(tail & inner.mask) as usize];
        if slot.opcode.load(Ordering::Acquire) == OP_EMPTY {
            return;
        }
        slot.opcode.store(OP_EMPTY, Ordering::Release);
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Fixed-layout handle for device code. Valid while any clone of this
    /// fifo is alive.
    pub fn device_handle(&self) -> FifoDeviceHandle {
        let inner = &self.inner;
        FifoDeviceHandle {
            slots: inner.slots.as_ptr() as u64,
            head: &inner.head as *const AtomicU64 as u64,
            tail: &inner.tail as *const AtomicU64 as u64,
            capacity: inner.slots.len() as u64,
        }
    }
}

/// Tiered backoff for host-side busy loops: spin, then yield in
/// growing sleeps.
pub(crate) fn backoff(iter: &mut u32) {
    if *iter < 1000 {
        std::hint::spin_loop();
    } else if *iter < 5000 {
        std::thread::sleep(Duration::from_micros(10));
    } else {
        std::thread::sleep(Duration::from_micros(100));
    }
    *iter = iter.saturating_add(1);
}
