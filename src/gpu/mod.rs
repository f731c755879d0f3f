// src/gpu/mod.rs
//! wgpu rendition of the pyramid build and the splitter passes.
//!
//! Every stage is its own compute pass, so pass boundaries act as the global
//! barriers between classify, scan and scatter.

pub mod hzb;
pub mod splitter;

pub use hzb::GpuDepthPyramid;
pub use splitter::{GpuSplitter, IndirectDraws, SplitterUniform};

use bytemuck::Pod;
use futures::{channel::oneshot, executor::block_on};

use crate::error::{Error, Result};

/// Largest workgroup count the API accepts per dispatch dimension.
pub const MAX_DISPATCH_DIM: u32 = 65_535;

/// Fold a linear workgroup count into an `(x, y)` grid. Shaders recover the
/// linear index as `wid.y * num_workgroups.x + wid.x` and discard the tail.
pub fn dispatch_grid(groups: u32) -> (u32, u32) {
    if groups <= MAX_DISPATCH_DIM {
        (groups, 1)
    } else {
        (MAX_DISPATCH_DIM, groups.div_ceil(MAX_DISPATCH_DIM))
    }
}

/// Workgroups needed to cover `count` items.
#[inline]
pub fn group_count(count: u32, workgroup_size: u32) -> u32 {
    count.div_ceil(workgroup_size.max(1))
}

/// Blocking read of a `MAP_READ` buffer. The buffer is unmapped afterwards.
pub(crate) fn map_read<T: Pod>(device: &wgpu::Device, buffer: &wgpu::Buffer) -> Result<Vec<T>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        sender.send(res).ok();
    });

    device.poll(wgpu::Maintain::Wait);
    block_on(receiver)
        .map_err(|_| Error::Gpu("readback map callback dropped".into()))?
        .map_err(|e| Error::Gpu(format!("mapping readback buffer: {e}")))?;

    let data = {
        let mapped = slice.get_mapped_range();
        bytemuck::cast_slice::<u8, T>(&mapped).to_vec()
    };
    buffer.unmap();
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_dispatches_stay_one_dimensional() {
        assert_eq!(dispatch_grid(1), (1, 1));
        assert_eq!(dispatch_grid(MAX_DISPATCH_DIM), (MAX_DISPATCH_DIM, 1));
    }

    #[test]
    fn large_dispatches_fold_into_rows() {
        let (x, y) = dispatch_grid(MAX_DISPATCH_DIM + 1);
        assert_eq!((x, y), (MAX_DISPATCH_DIM, 2));
        assert!(x as u64 * y as u64 >= MAX_DISPATCH_DIM as u64 + 1);
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(group_count(0, 128), 0);
        assert_eq!(group_count(1, 128), 1);
        assert_eq!(group_count(128, 128), 1);
        assert_eq!(group_count(129, 128), 2);
    }
}
