//! GPU-initiated point-to-point communication over heterogeneous
//! transports, synchronized by signaling primitives callable from device
//! code.
//!
//! A kernel requests a transfer by writing a [`fifo::Trigger`] into a
//! shared [`fifo::Fifo`]; the host-side [`proxy::ProxyService`] dequeues
//! it, resolves the operands against registered memory, issues the
//! operation on a [`connection::Connection`], and acknowledges completion
//! through a [`semaphore`] — the kernel never stalls on host involvement.

pub mod config;
pub mod connection;
pub mod error;
pub mod fifo;
pub mod memory;
pub mod plan;
pub mod proxy;
mod reduce;
pub mod semaphore;
pub mod transport;
pub mod types;

pub use config::ProximaConfig;
pub use connection::Connection;
pub use error::{ProximaError, Result};
pub use fifo::{Fifo, FifoDeviceHandle, Trigger};
pub use memory::{BufferRef, Device, Host, MemKind, MemoryHandle, MemorySpace, RegisteredMemory};
pub use plan::{ExecutionPlan, PeerBinding, PlanExecutor, PlanStep};
pub use proxy::{ProxyService, ProxyState, TriggerObserver};
pub use semaphore::{
    Device2DeviceHandle, Device2DeviceSemaphore, Host2DeviceHandle, Host2DeviceSemaphore,
    Host2HostSemaphore,
};
pub use transport::{EndpointDescriptor, FabricDomain, MulticastHandle};
pub use types::{ConnectionId, DataType, MemoryId, Rank, ReduceOp, SemaphoreId, TransportKind};
