//! RDMA-style network fabric transport.
//!
//! Writes are posted as work requests to a bounded send queue; a completer
//! thread (the NIC analogue) drains the queue in order and performs the
//! copies. `flush` blocks until the completed counter catches up with the
//! posted counter, giving the "locally complete, not remotely observed"
//! contract. A failed work request poisons the whole link: every later
//! operation reports `Internal`.

use super::{next_token, Transport};
use crate::error::{ProximaError, Result};
use crate::memory::{MemKind, MemoryHandle, RegisteredMemory};
use crate::types::TransportKind;
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Outstanding work requests one link can hold before `write` reports
/// capacity exhaustion.
const SEND_QUEUE_DEPTH: usize = 4096;

struct WorkRequest {
    dst: MemoryHandle,
    dst_offset: u64,
    src: MemoryHandle,
    src_offset: u64,
    size: u64,
}

struct SendQueue {
    queue: ArrayQueue<WorkRequest>,
    posted: AtomicU64,
    completed: AtomicU64,
    shutdown: AtomicBool,
    /// First work-request failure; poisons the link.
    failure: Mutex<Option<String>>,
    /// Wakes the completer when work arrives or shutdown is requested.
    work_mutex: Mutex<()>,
    work_cv: Condvar,
    /// Wakes flushers when the completed counter advances.
    done_mutex: Mutex<()>,
    done_cv: Condvar,
}

impl SendQueue {
    fn failed(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// One side of a network-fabric link, owning its completer thread.
pub(crate) struct FabricLink {
    sq: Arc<SendQueue>,
    completer: Option<JoinHandle<()>>,
}

impl FabricLink {
    pub(crate) fn new() -> Result<Self> {
        let sq = Arc::new(SendQueue {
            queue: ArrayQueue::new(SEND_QUEUE_DEPTH),
            posted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
            work_mutex: Mutex::new(()),
            work_cv: Condvar::new(),
            done_mutex: Mutex::new(()),
            done_cv: Condvar::new(),
        });
        let worker_sq = Arc::clone(&sq);
        let completer = std::thread::Builder::new()
            .name("proxima-fabric".into())
            .spawn(move || completer_loop(worker_sq))
            .map_err(|e| ProximaError::internal_with_source("failed to spawn fabric completer", e))?;
        Ok(Self {
            sq,
            completer: Some(completer),
        })
    }
}

fn completer_loop(sq: Arc<SendQueue>) {
    loop {
        match sq.queue.pop() {
            Some(wr) => {
                if let Err(e) = execute(&wr) {
                    let mut failure = sq.failure.lock();
                    if failure.is_none() {
                        tracing::warn!("fabric work request failed: {e}");
                        *failure = Some(e.to_string());
                    }
                }
                // The request's handle clones must be released before a
                // flusher can observe the completion, or a caller could see
                // its region still in flight after flush() returned.
                drop(wr);
                // Completion counts even on failure; flushers check the
                // failure slot separately.
                sq.completed.fetch_add(1, Ordering::Release);
                let _guard = sq.done_mutex.lock();
                sq.done_cv.notify_all();
            }
            None => {
                if sq.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let mut guard = sq.work_mutex.lock();
                if sq.queue.is_empty() && !sq.shutdown.load(Ordering::Acquire) {
                    sq.work_cv.wait_for(&mut guard, Duration::from_millis(1));
                }
            }
        }
    }
}

fn execute(wr: &WorkRequest) -> Result<()> {
    let src_addr = wr.src.addr_of(wr.src_offset, wr.size)?;
    let dst_addr = wr.dst.addr_of(wr.dst_offset, wr.size)?;
    unsafe {
        copy_region(src_addr, dst_addr, wr.size);
    }
    Ok(())
}

/// Copy with NIC-like single-word semantics: an aligned 8-byte write lands
/// atomically, so semaphore counters can be polled while being written.
///
/// # Safety
/// Both address ranges must be valid for `size` bytes.
pub(crate) unsafe fn copy_region(src_addr: u64, dst_addr: u64, size: u64) {
    if size == 8 && src_addr % 8 == 0 && dst_addr % 8 == 0 {
        let value = unsafe { &*(src_addr as *const AtomicU64) }.load(Ordering::Acquire);
        unsafe { &*(dst_addr as *const AtomicU64) }.store(value, Ordering::Release);
    } else {
        unsafe {
            std::ptr::copy(src_addr as *const u8, dst_addr as *mut u8, size as usize);
        }
    }
}

impl Transport for FabricLink {
    fn kind(&self) -> TransportKind {
        TransportKind::NetworkFabric
    }

    fn register(&self, ptr: u64, size: usize, kind: MemKind) -> Result<MemoryHandle> {
        // The fabric addresses pinned host memory and device memory alike
        // (GPUDirect analogue), so both spaces register.
        if size == 0 {
            return Err(ProximaError::invalid_usage("cannot register empty region"));
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
        if let Some(reason) = self.sq.failed() {
            return Err(ProximaError::internal(reason));
        }
        // Bounds are validated at post time so misuse surfaces as
        // InvalidUsage to the caller instead of poisoning the link.
        dst.addr_of(dst_offset, size)?;
        src.addr_of(src_offset, size)?;

        let wr = WorkRequest {
            dst: Arc::clone(dst),
            dst_offset,
            src: Arc::clone(src),
            src_offset,
            size,
        };
        if self.sq.queue.push(wr).is_err() {
            return Err(ProximaError::Capacity {
                resource: "fabric send queue",
                used: SEND_QUEUE_DEPTH,
                limit: SEND_QUEUE_DEPTH,
            });
        }
        self.sq.posted.fetch_add(1, Ordering::Release);
        let _guard = self.sq.work_mutex.lock();
        self.sq.work_cv.notify_one();
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        let target = self.sq.posted.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = self.sq.failed() {
                return Err(ProximaError::internal(reason));
            }
            if self.sq.completed.load(Ordering::Acquire) >= target {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProximaError::Timeout {
                    operation: "flush",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let mut guard = self.sq.done_mutex.lock();
            if self.sq.completed.load(Ordering::Acquire) < target {
                self.sq
                    .done_cv
                    .wait_for(&mut guard, remaining.min(Duration::from_millis(5)));
            }
        }
    }
}

impl Drop for FabricLink {
    fn drop(&mut self) {
        self.sq.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.sq.work_mutex.lock();
            self.sq.work_cv.notify_all();
        }
        if let Some(h) = self.completer.take() {
            let _ = h.join();
        }
    }
}
