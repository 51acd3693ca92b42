//! Host reference implementations backing the software platform's kernels.

use crate::geometry::WorkItem;
use crate::kernel::{PackedIndex, ENTRY_POINT, GRID_DIM};
use crate::status::Status;
use std::collections::HashMap;
use std::fmt;

/// Memory visible to one launch, one slot per kernel argument.
///
/// Buffer arguments are the buffers themselves. By-value arguments are
/// private copies of the bound bytes, so stores to them are lost.
#[derive(Debug)]
pub struct KernelMemory<'a> {
    args: &'a mut [Vec<u8>],
}

impl<'a> KernelMemory<'a> {
    pub(crate) fn new(args: &'a mut [Vec<u8>]) -> Self {
        Self { args }
    }

    fn cell(&self, arg: usize, index: usize) -> Result<&[u8], Status> {
        let slot = self.args.get(arg).ok_or(Status::CL_INVALID_ARG_INDEX)?;
        let start = index.checked_mul(4).ok_or(Status::CL_OUT_OF_RESOURCES)?;
        slot.get(start..start + 4).ok_or(Status::CL_OUT_OF_RESOURCES)
    }

    fn cell_mut(&mut self, arg: usize, index: usize) -> Result<&mut [u8], Status> {
        let slot = self.args.get_mut(arg).ok_or(Status::CL_INVALID_ARG_INDEX)?;
        let start = index.checked_mul(4).ok_or(Status::CL_OUT_OF_RESOURCES)?;
        slot.get_mut(start..start + 4).ok_or(Status::CL_OUT_OF_RESOURCES)
    }

    /// Store a 32-bit int at element `index` of argument `arg`.
    ///
    /// Out-of-range stores fail the launch instead of corrupting memory.
    pub fn store_i32(&mut self, arg: usize, index: usize, value: i32) -> Result<(), Status> {
        self.cell_mut(arg, index)?.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    pub fn load_i32(&self, arg: usize, index: usize) -> Result<i32, Status> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.cell(arg, index)?);
        Ok(i32::from_ne_bytes(bytes))
    }

    pub fn store_f32(&mut self, arg: usize, index: usize, value: f32) -> Result<(), Status> {
        self.cell_mut(arg, index)?.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    pub fn load_f32(&self, arg: usize, index: usize) -> Result<f32, Status> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.cell(arg, index)?);
        Ok(f32::from_ne_bytes(bytes))
    }
}

/// Body run once per work item.
pub type KernelFn = fn(&WorkItem, &mut KernelMemory<'_>) -> Result<(), Status>;

/// A host implementation standing in for a compiled entry point.
#[derive(Clone, Copy)]
pub struct ReferenceKernel {
    /// Arguments the entry point takes.
    pub arity: usize,
    pub body: KernelFn,
}

impl fmt::Debug for ReferenceKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceKernel")
            .field("arity", &self.arity)
            .finish()
    }
}

/// `C[i + 8 * j] = (i << 8 | j)`.
pub fn packed_index(item: &WorkItem, mem: &mut KernelMemory<'_>) -> Result<(), Status> {
    let i = item.global_id(0);
    let j = item.global_id(1);
    mem.store_i32(0, i + GRID_DIM * j, PackedIndex::encode(i, j) as i32)
}

/// [`packed_index`] plus `out[0] = c.r + c.g + c.b` from work item `(0, 0)`.
///
/// Arguments: `C` buffer, `struct color` by value, `out` buffer.
pub fn packed_index_color_sum(item: &WorkItem, mem: &mut KernelMemory<'_>) -> Result<(), Status> {
    packed_index(item, mem)?;
    if item.global_id(0) == 0 && item.global_id(1) == 0 {
        let sum = mem.load_f32(1, 0)? + mem.load_f32(1, 1)? + mem.load_f32(1, 2)?;
        mem.store_f32(2, 0, sum)?;
    }
    Ok(())
}

/// Entry points the software platform knows how to run, keyed by name and
/// arity.
#[derive(Debug, Clone)]
pub struct Registry {
    kernels: HashMap<(String, usize), ReferenceKernel>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, arity: usize, body: KernelFn) {
        self.kernels
            .insert((name.into(), arity), ReferenceKernel { arity, body });
    }

    pub fn get(&self, name: &str, arity: usize) -> Option<ReferenceKernel> {
        self.kernels.get(&(name.to_string(), arity)).copied()
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(ENTRY_POINT, 1, packed_index);
        registry.register(ENTRY_POINT, 3, packed_index_color_sum);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::for_each_work_item;

    #[test]
    fn test_packed_index_fills_grid() {
        let mut slots = vec![vec![0u8; 64 * 4]];
        let kernel = Registry::default().get(ENTRY_POINT, 1).unwrap();
        {
            let mut mem = KernelMemory::new(&mut slots);
            for_each_work_item(&[8, 8], &[2, 2], |item| (kernel.body)(item, &mut mem)).unwrap();
        }

        let mem = KernelMemory::new(&mut slots);
        assert_eq!(mem.load_i32(0, 0).unwrap(), 0x0000);
        assert_eq!(mem.load_i32(0, 9).unwrap(), 0x0101);
        assert_eq!(mem.load_i32(0, 63).unwrap(), 0x0707);
        assert_eq!(mem.load_i32(0, 3 + 8 * 5).unwrap(), 0x0305);
    }

    #[test]
    fn test_out_of_range_store_fails() {
        let mut slots = vec![vec![0u8; 8]];
        let mut mem = KernelMemory::new(&mut slots);
        assert_eq!(mem.store_i32(0, 2, 1), Err(Status::CL_OUT_OF_RESOURCES));
        assert_eq!(mem.store_i32(1, 0, 1), Err(Status::CL_INVALID_ARG_INDEX));
        assert!(mem.store_i32(0, 1, 1).is_ok());
    }

    #[test]
    fn test_color_sum_reads_by_value_slot() {
        let color: Vec<u8> = [0.5f32, 1.0, 2.0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let mut slots = vec![vec![0u8; 64 * 4], color, vec![0u8; 4]];
        let kernel = Registry::default().get(ENTRY_POINT, 3).unwrap();
        {
            let mut mem = KernelMemory::new(&mut slots);
            for_each_work_item(&[8, 8], &[2, 2], |item| (kernel.body)(item, &mut mem)).unwrap();
        }

        let mem = KernelMemory::new(&mut slots);
        assert_eq!(mem.load_f32(2, 0).unwrap(), 3.5);
        assert_eq!(mem.load_i32(0, 63).unwrap(), 0x0707);
        assert!(Registry::default().get(ENTRY_POINT, 2).is_none());
    }
}
