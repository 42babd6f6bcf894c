//! Host-resident proxy turning queued triggers into transport operations.
//!
//! A `ProxyService` owns one worker thread that busy-polls its bound
//! [`Fifo`], resolves each trigger's small-integer ids against frozen
//! connection/semaphore/memory tables, and issues the matching
//! [`Connection`] or semaphore operation (`WRITE`, `FLUSH`, `SIGNAL`,
//! `WAIT`). The slot is popped once the operation is
//! *issued*, not completed — completion is the requester's business, via a
//! later flush or semaphore wait — so the poll loop stays fast regardless
//! of per-operation latency.
//!
//! Tables are mutated only while `Stopped`; device code caches handle
//! layouts, so registration during `Running` is rejected outright rather
//! than synchronized.

use crate::config::ProximaConfig;
use crate::connection::Connection;
use crate::error::{ProximaError, Result};
use crate::fifo::{Fifo, Trigger, OP_FLUSH, OP_SIGNAL, OP_WAIT, OP_WRITE};
use crate::memory::MemoryHandle;
use crate::semaphore::Host2HostSemaphore;
use crate::types::{ConnectionId, MemoryId, SemaphoreId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle state of a [`ProxyService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Running,
}

/// Optional observer attached to the worker loop; called with each
/// dequeued trigger and its dequeue timestamp.
pub type TriggerObserver = Box<dyn Fn(&Trigger, Instant) + Send + Sync>;

struct Tables {
    connections: Vec<Arc<Connection>>,
    semaphores: Vec<Arc<Host2HostSemaphore>>,
    memories: Vec<MemoryHandle>,
}

struct Shared {
    fifo: Fifo,
    tables: Tables,
    observer: Option<TriggerObserver>,
    running: AtomicBool,
    dispatched: AtomicU64,
    failed: AtomicU64,
    spin_iters: u32,
    wait_timeout: Duration,
}

/// Host worker that services one trigger fifo.
pub struct ProxyService {
    fifo: Fifo,
    tables: Option<Tables>,
    observer: Option<TriggerObserver>,
    config: ProximaConfig,
    worker: Option<(JoinHandle<()>, Arc<Shared>)>,
}

impl ProxyService {
    pub fn new(fifo: Fifo, config: ProximaConfig) -> Self {
        Self {
            fifo,
            tables: Some(Tables {
                connections: Vec::new(),
                semaphores: Vec::new(),
                memories: Vec::new(),
            }),
            observer: None,
            config,
            worker: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        if self.worker.is_some() {
            ProxyState::Running
        } else {
            ProxyState::Stopped
        }
    }

    /// Register a connection; the returned id is what triggers embed.
    pub fn add_connection(&mut self, connection: Arc<Connection>) -> Result<ConnectionId> {
        let tables = self.tables_mut()?;
        tables.connections.push(connection);
        Ok(tables.connections.len() as ConnectionId - 1)
    }

    /// Register a semaphore the proxy can signal on behalf of the device.
    pub fn add_semaphore(&mut self, semaphore: Arc<Host2HostSemaphore>) -> Result<SemaphoreId> {
        let tables = self.tables_mut()?;
        tables.semaphores.push(semaphore);
        Ok(tables.semaphores.len() as SemaphoreId - 1)
    }

    /// Register a memory handle triggers can reference by id.
    pub fn add_memory(&mut self, memory: MemoryHandle) -> Result<MemoryId> {
        let tables = self.tables_mut()?;
        tables.memories.push(memory);
        Ok(tables.memories.len() as MemoryId - 1)
    }

    /// Attach a per-trigger observer (tracing/dump boundary). Must be set
    /// before `start()`.
    pub fn set_observer(&mut self, observer: TriggerObserver) -> Result<()> {
        self.ensure_stopped("observer must attach before start")?;
        self.observer = Some(observer);
        Ok(())
    }

    /// Transition `Stopped → Running`: spawn the worker thread. Calling
    /// `start()` on a running proxy is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let shared = Arc::new(Shared {
            fifo: self.fifo.clone(),
            tables: self
                .tables
                .take()
                .expect("tables present while stopped"),
            observer: self.observer.take(),
            running: AtomicBool::new(true),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            spin_iters: self.config.proxy_spin_iters,
            wait_timeout: self.config.wait_timeout,
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("proxima-proxy".into())
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| ProximaError::internal_with_source("failed to spawn proxy worker", e))?;
        tracing::info!("proxy started");
        self.worker = Some((handle, shared));
        Ok(())
    }

    /// Transition `Running → Stopped`: drain queued triggers, then join the
    /// worker. No new pushes are accepted by contract once `stop()` is
    /// called; undelivered triggers are dispatched, never dropped.
    ///
    /// Calling `stop()` on a stopped proxy is a no-op. Safe to call from a
    /// thread that also pushes: the worker drains independently.
    pub fn stop(&mut self) -> Result<()> {
        let Some((handle, shared)) = self.worker.take() else {
            return Ok(());
        };
        shared.running.store(false, Ordering::Release);
        handle
            .join()
            .map_err(|_| ProximaError::internal("proxy worker panicked"))?;
        let shared = Arc::try_unwrap(shared)
            .map_err(|_| ProximaError::internal("proxy worker leaked shared state"))?;
        self.tables = Some(shared.tables);
        self.observer = shared.observer;
        tracing::info!(
            dispatched = shared.dispatched.load(Ordering::Relaxed),
            failed = shared.failed.load(Ordering::Relaxed),
            "proxy stopped"
        );
        Ok(())
    }

    /// Triggers dispatched since the last `start()`.
    pub fn dispatched(&self) -> u64 {
        match &self.worker {
            Some((_, shared)) => shared.dispatched.load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Triggers that failed dispatch since the last `start()`.
    pub fn failed(&self) -> u64 {
        match &self.worker {
            Some((_, shared)) => shared.failed.load(Ordering::Relaxed),
            None => 0,
        }
    }

    fn tables_mut(&mut self) -> Result<&mut Tables> {
        self.ensure_stopped("tables are frozen while running")?;
        Ok(self.tables.as_mut().expect("tables present while stopped"))
    }

    fn ensure_stopped(&self, reason: &'static str) -> Result<()> {
        if self.worker.is_some() {
            return Err(ProximaError::ProxyState {
                state: "running",
                reason,
            });
        }
        Ok(())
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut iter = 0u32;
    loop {
        match shared.fifo.poll() {
            Some(trigger) => {
                iter = 0;
                if let Some(observer) = &shared.observer {
                    observer(&trigger, Instant::now());
                }
                match dispatch(&shared.tables, &trigger, shared.wait_timeout) {
                    Ok(()) => {
                        shared.dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        shared.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            opcode = trigger.opcode,
                            connection_id = trigger.connection_id,
                            "trigger dispatch failed: {e}"
                        );
                    }
                }
                // Free the slot only after the operation is issued; the
                // requester observes completion via flush or wait.
                shared.fifo.pop();
            }
            None => {
                if !shared.running.load(Ordering::Acquire) {
                    // Drained: running was cleared and the fifo is empty.
                    return;
                }
                if iter < shared.spin_iters {
                    std::hint::spin_loop();
                    iter += 1;
                } else {
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }
}

fn dispatch(tables: &Tables, trigger: &Trigger, wait_timeout: Duration) -> Result<()> {
    match trigger.opcode {
        OP_WRITE => {
            let connection = lookup(&tables.connections, trigger.connection_id, "connection")?;
            let src = lookup(&tables.memories, trigger.src_memory_id, "memory")?;
            let dst = lookup(&tables.memories, trigger.dst_memory_id, "memory")?;
            connection.write(dst, trigger.dst_offset, src, trigger.src_offset, trigger.size)
        }
        OP_FLUSH => {
            let connection = lookup(&tables.connections, trigger.connection_id, "connection")?;
            connection.flush()
        }
        OP_SIGNAL => {
            let semaphore = lookup(&tables.semaphores, trigger.semaphore_id, "semaphore")?;
            semaphore.signal()
        }
        OP_WAIT => {
            let semaphore = lookup(&tables.semaphores, trigger.semaphore_id, "semaphore")?;
            semaphore.wait(wait_timeout)
        }
        opcode => Err(ProximaError::invalid_usage(format!(
            "unknown trigger opcode {opcode}"
        ))),
    }
}

fn lookup<'t, T>(table: &'t [T], id: u32, name: &'static str) -> Result<&'t T> {
    table.get(id as usize).ok_or(ProximaError::UnknownId {
        table: name,
        id,
    })
}
