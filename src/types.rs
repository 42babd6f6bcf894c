/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Small integer id of a connection in a proxy's connection table.
///
/// Embedded in [`crate::fifo::Trigger`] records so device code can name a
/// connection without pointer chasing.
pub type ConnectionId = u32;

/// Small integer id of a semaphore in a proxy's semaphore table.
pub type SemaphoreId = u32;

/// Small integer id of a registered memory region.
pub type MemoryId = u32;

/// The transport a [`crate::connection::Connection`] runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    /// RDMA-style network fabric: verb-like posted writes, explicit
    /// completion flushes.
    NetworkFabric = 0,
    /// Direct GPU-to-GPU memory mapping within a node. Stores land
    /// immediately in the peer's address space.
    PeerLink = 1,
    /// One-to-many memory fabric with a bounded number of concurrently
    /// bound regions per group.
    MulticastFabric = 2,
}

impl TransportKind {
    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            TransportKind::NetworkFabric => "network-fabric",
            TransportKind::PeerLink => "peer-link",
            TransportKind::MulticastFabric => "multicast-fabric",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Data types understood by the execution-plan interpreter.
///
/// proxima defines its own type enum so it remains a standalone library
/// usable by any Rust project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for `reduce` plan steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Prod,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_sizes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert_eq!(DataType::F16.size_in_bytes(), 2);
        assert_eq!(DataType::BF16.size_in_bytes(), 2);
        assert_eq!(DataType::I8.size_in_bytes(), 1);
        assert_eq!(DataType::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_datatype_display() {
        assert_eq!(DataType::F32.to_string(), "f32");
        assert_eq!(DataType::BF16.to_string(), "bf16");
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::NetworkFabric.to_string(), "network-fabric");
        assert_eq!(TransportKind::PeerLink.to_string(), "peer-link");
        assert_eq!(
            TransportKind::MulticastFabric.to_string(),
            "multicast-fabric"
        );
    }

    #[test]
    fn test_transport_kind_repr() {
        assert_eq!(TransportKind::NetworkFabric as u8, 0);
        assert_eq!(TransportKind::PeerLink as u8, 1);
        assert_eq!(TransportKind::MulticastFabric as u8, 2);
    }

    #[test]
    fn test_reduce_op_display() {
        assert_eq!(ReduceOp::Sum.to_string(), "sum");
        assert_eq!(ReduceOp::Max.to_string(), "max");
    }
}
