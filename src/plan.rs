//! Execution-plan interpreter.
//!
//! Replays an ordered list of communication steps against the core
//! primitives: `send` becomes a fifo trigger the proxy turns into a
//! connection write, `signal`/`wait`/`recv` map onto semaphores, and
//! `reduce` is a local element-wise combine. The interpreter is a consumer
//! of the core's public contract — plan-file parsing and step generation
//! live outside this crate.

use crate::error::{ProximaError, Result};
use crate::fifo::{Fifo, Trigger};
use crate::reduce::reduce_slice;
use crate::semaphore::Host2HostSemaphore;
use crate::types::{ConnectionId, DataType, MemoryId, Rank, ReduceOp, SemaphoreId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One step of an execution plan.
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Write `size` bytes from the local send buffer at `src_offset` into
    /// the peer's receive buffer at `dst_offset`.
    Send {
        peer: Rank,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    /// Block until the peer's matching signal arrives.
    Recv { peer: Rank },
    /// Local combine: `send[dst_offset..] = op(send[dst_offset..],
    /// recv[src_offset..])` over `count` elements.
    Reduce {
        src_offset: u64,
        dst_offset: u64,
        count: usize,
        op: ReduceOp,
    },
    /// Flush outstanding writes to the peer, then signal its semaphore.
    Signal { peer: Rank },
    /// Block until the peer's semaphore fires.
    Wait { peer: Rank },
}

/// An ordered list of communication steps for one rank.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,
    pub steps: Vec<PlanStep>,
}

/// Everything the interpreter needs to reach one peer: the proxy-table ids
/// triggers embed, and the semaphore the local rank waits on.
pub struct PeerBinding {
    pub connection_id: ConnectionId,
    pub semaphore_id: SemaphoreId,
    pub semaphore: Arc<Host2HostSemaphore>,
    /// Proxy-table id of the local send buffer registration.
    pub send_memory_id: MemoryId,
    /// Proxy-table id of the peer's receive buffer registration.
    pub remote_recv_memory_id: MemoryId,
}

/// Replays [`ExecutionPlan`]s for one local rank.
pub struct PlanExecutor {
    fifo: Fifo,
    peers: HashMap<Rank, PeerBinding>,
    wait_timeout: Duration,
}

impl PlanExecutor {
    pub fn new(fifo: Fifo, wait_timeout: Duration) -> Self {
        Self {
            fifo,
            peers: HashMap::new(),
            wait_timeout,
        }
    }

    /// Bind a peer rank to its proxy-table ids. Bindings are fixed before
    /// any `execute` call, mirroring the frozen proxy tables.
    pub fn bind_peer(&mut self, peer: Rank, binding: PeerBinding) {
        self.peers.insert(peer, binding);
    }

    /// Replay `plan` for `rank`. Returns after every step has been issued
    /// and every blocking step has completed.
    ///
    /// `send_ptr`/`recv_ptr` are the local buffers the plan's offsets index
    /// into; they must match the registrations behind the bound memory ids.
    /// `stream` is carried for device-side replay and unused on the host
    /// path.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        rank: Rank,
        send_ptr: u64,
        recv_ptr: u64,
        send_bytes: usize,
        recv_bytes: usize,
        dtype: DataType,
        plan: &ExecutionPlan,
        _stream: u64,
    ) -> Result<()> {
        tracing::debug!(rank, plan = %plan.name, steps = plan.steps.len(), "plan replay started");
        for (index, step) in plan.steps.iter().enumerate() {
            self.execute_step(step, send_ptr, recv_ptr, send_bytes, recv_bytes, dtype)
                .map_err(|e| {
                    tracing::warn!(rank, plan = %plan.name, index, "plan step failed: {e}");
                    e
                })?;
        }
        tracing::debug!(rank, plan = %plan.name, "plan replay finished");
        Ok(())
    }

    fn execute_step(
        &self,
        step: &PlanStep,
        send_ptr: u64,
        recv_ptr: u64,
        send_bytes: usize,
        recv_bytes: usize,
        dtype: DataType,
    ) -> Result<()> {
        match step {
            PlanStep::Send {
                peer,
                src_offset,
                dst_offset,
                size,
            } => {
                check_range(*src_offset, *size, send_bytes, "send buffer")?;
                let binding = self.peer(*peer)?;
                self.fifo.push_timeout(
                    Trigger::write(
                        binding.connection_id,
                        binding.send_memory_id,
                        *src_offset,
                        binding.remote_recv_memory_id,
                        *dst_offset,
                        *size,
                    ),
                    self.wait_timeout,
                )?;
                Ok(())
            }
            PlanStep::Recv { peer } | PlanStep::Wait { peer } => {
                self.peer(*peer)?.semaphore.wait(self.wait_timeout)
            }
            PlanStep::Signal { peer } => {
                let binding = self.peer(*peer)?;
                self.fifo
                    .push_timeout(Trigger::flush(binding.connection_id), self.wait_timeout)?;
                self.fifo
                    .push_timeout(Trigger::signal(binding.semaphore_id), self.wait_timeout)?;
                Ok(())
            }
            PlanStep::Reduce {
                src_offset,
                dst_offset,
                count,
                op,
            } => {
                let bytes = count * dtype.size_in_bytes();
                check_range(*src_offset, bytes as u64, recv_bytes, "recv buffer")?;
                check_range(*dst_offset, bytes as u64, send_bytes, "send buffer")?;
                let (dst, src) = unsafe {
                    (
                        std::slice::from_raw_parts_mut(
                            (send_ptr + dst_offset) as *mut u8,
                            bytes,
                        ),
                        std::slice::from_raw_parts((recv_ptr + src_offset) as *const u8, bytes),
                    )
                };
                reduce_slice(dst, src, *count, dtype, *op)
            }
        }
    }

    fn peer(&self, rank: Rank) -> Result<&PeerBinding> {
        self.peers.get(&rank).ok_or(ProximaError::UnknownId {
            table: "peer",
            id: rank,
        })
    }
}

fn check_range(offset: u64, size: u64, buffer_bytes: usize, what: &str) -> Result<()> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| ProximaError::invalid_usage(format!("{what} range overflows")))?;
    if end > buffer_bytes as u64 {
        return Err(ProximaError::invalid_usage(format!(
            "{what} range {offset}..{end} exceeds {buffer_bytes} bytes"
        )));
    }
    Ok(())
}
