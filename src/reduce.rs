//! Element-wise reduction used when replaying `reduce` plan steps.

use crate::error::{ProximaError, Result};
use crate::types::{DataType, ReduceOp};

/// Trait for types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Element-wise reduce on byte slices interpreted as `dtype` elements:
/// `dst[i] = op(dst[i], src[i])`.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()`
/// bytes.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        _ => Err(ProximaError::UnsupportedDType {
            dtype,
            op: "reduce",
        }),
    }
}

fn reduce_slice_typed<T: Reducible>(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    op: ReduceOp,
) -> Result<()> {
    let elem = std::mem::size_of::<T>();
    if dst.len() != count * elem || src.len() != count * elem {
        return Err(ProximaError::invalid_usage(format!(
            "reduce buffers must hold exactly {count} elements of {elem} bytes"
        )));
    }
    // Unaligned reads/writes: the offsets come from plan files and need
    // not be element-aligned.
    unsafe {
        let dst_ptr = dst.as_mut_ptr() as *mut T;
        let src_ptr = src.as_ptr() as *const T;
        for i in 0..count {
            let a = dst_ptr.add(i).read_unaligned();
            let b = src_ptr.add(i).read_unaligned();
            dst_ptr.add(i).write_unaligned(T::reduce(a, b, op));
        }
    }
    Ok(())
}
