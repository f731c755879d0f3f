// src/depth_pyramid.rs
//! Hierarchical Z-buffer over an occluder depth buffer.
//!
//! Every level stores, per texel, the farthest device depth of the block it
//! covers in the level below.
//!
//! Level sizes follow `max(1, floor(previous / 2))`. When a source dimension
//! is odd, the last texel of the destination also covers the orphaned
//! row/column so that no source texel is dropped from the reduction.

use log::warn;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// One level of device depth values, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DepthImage {
    /// Wrap raw depth values. Fails when `data` does not hold `width * height` texels.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::Resource(format!(
                "depth buffer holds {} texels, expected {}x{} = {}",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Depth image cleared to `depth` (1.0 is the far plane).
    pub fn filled(width: u32, height: u32, depth: f32) -> Self {
        Self {
            width,
            height,
            data: vec![depth; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| y as usize * self.width as usize + x as usize)
    }

    /// Depth at `(x, y)`, `None` outside the image.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        self.index(x, y).map(|i| self.data[i])
    }

    /// Writes outside the image are ignored.
    #[inline]
    pub fn set(&mut self, x: u32, y: u32, depth: f32) {
        if let Some(i) = self.index(x, y) {
            self.data[i] = depth;
        }
    }

    /// Texel fetch with coordinates clamped to the image. `None` only for an
    /// empty image.
    #[inline]
    pub fn fetch_clamped(&self, x: i64, y: i64) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let x = x.clamp(0, self.width as i64 - 1) as u32;
        let y = y.clamp(0, self.height as i64 - 1) as u32;
        self.get(x, y)
    }
}

/// Size of the level below `size`.
#[inline]
pub fn next_level_size(size: u32) -> u32 {
    (size / 2).max(1)
}

/// Number of levels a full chain over `width x height` holds (0 for an empty image).
pub fn level_count_for(width: u32, height: u32) -> u32 {
    if width == 0 || height == 0 {
        return 0;
    }
    32 - width.max(height).leading_zeros()
}

/// Source texel span `[start, end)` reduced into destination texel `dst`.
#[inline]
fn footprint(dst: u32, dst_size: u32, src_size: u32) -> (u32, u32) {
    let start = (dst * 2).min(src_size - 1);
    let end = if dst + 1 == dst_size { src_size } else { (dst * 2 + 2).min(src_size) };
    (start, end.max(start + 1))
}

/// Mip chain of conservative (max) depth.
#[derive(Clone, Debug, Default)]
pub struct DepthPyramid {
    levels: Vec<DepthImage>,
}

impl DepthPyramid {
    /// Build the full chain from an occluder depth buffer.
    ///
    /// A zero-sized source yields an empty pyramid; the occluder then treats
    /// every test as visible.
    pub fn build(base: DepthImage) -> Self {
        if base.is_empty() {
            warn!(
                "occluder depth buffer is {}x{}, occlusion culling disabled this frame",
                base.width, base.height
            );
            return Self::default();
        }

        let count = level_count_for(base.width, base.height) as usize;
        let mut levels = Vec::with_capacity(count);
        levels.push(base);

        while levels.len() < count {
            let next = reduce_max(&levels[levels.len() - 1]);
            levels.push(next);
        }

        Self { levels }
    }

    /// Empty pyramid, used when the occluder pass did not produce a usable target.
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, level: usize) -> Option<&DepthImage> {
        self.levels.get(level)
    }

    pub fn levels(&self) -> &[DepthImage] {
        &self.levels
    }

    /// Size of level 0.
    pub fn base_size(&self) -> (u32, u32) {
        self.levels
            .first()
            .map(|l| (l.width, l.height))
            .unwrap_or((0, 0))
    }
}

/// One max-reduction step. Rows of the destination are independent.
fn reduce_max(src: &DepthImage) -> DepthImage {
    let width = next_level_size(src.width);
    let height = next_level_size(src.height);
    let mut data = vec![0.0f32; width as usize * height as usize];

    data.par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let (y0, y1) = footprint(y as u32, height, src.height);
            for (x, out) in row.iter_mut().enumerate() {
                let (x0, x1) = footprint(x as u32, width, src.width);
                let mut max_depth = f32::MIN;
                for sy in y0..y1 {
                    let src_row = &src.data[sy as usize * src.width as usize..][..src.width as usize];
                    for &depth in &src_row[x0 as usize..x1 as usize] {
                        max_depth = max_depth.max(depth);
                    }
                }
                *out = max_depth;
            }
        });

    DepthImage { width, height, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sizes_halve_down_to_one() {
        let pyramid = DepthPyramid::build(DepthImage::filled(13, 5, 1.0));
        let sizes: Vec<_> = pyramid.levels().iter().map(|l| (l.width(), l.height())).collect();
        assert_eq!(sizes, vec![(13, 5), (6, 2), (3, 1), (1, 1)]);
        assert_eq!(level_count_for(1, 1), 1);
        assert_eq!(level_count_for(1024, 768), 11);
    }

    #[test]
    fn level_one_keeps_farthest_of_block() {
        // one near texel, three far texels in the top-left 2x2 block
        let mut base = DepthImage::filled(4, 4, 0.5);
        base.set(0, 0, 0.1);
        base.set(1, 0, 0.9);
        base.set(0, 1, 0.8);
        base.set(1, 1, 0.7);

        let pyramid = DepthPyramid::build(base);
        let level1 = pyramid.level(1).unwrap();
        assert_eq!((level1.width(), level1.height()), (2, 2));
        assert_eq!(level1.get(0, 0), Some(0.9));
        assert_eq!(level1.get(1, 0), Some(0.5));
        assert_eq!(pyramid.level(2).unwrap().get(0, 0), Some(0.9));
    }

    #[test]
    fn odd_edges_are_not_dropped() {
        let mut base = DepthImage::filled(5, 3, 0.2);
        base.set(4, 2, 0.95);
        let pyramid = DepthPyramid::build(base);
        let level1 = pyramid.level(1).unwrap();
        assert_eq!((level1.width(), level1.height()), (2, 1));
        assert_eq!(level1.get(1, 0), Some(0.95));
        assert_eq!(level1.get(0, 0), Some(0.2));
    }

    #[test]
    fn zero_sized_source_builds_nothing() {
        let pyramid = DepthPyramid::build(DepthImage::filled(0, 16, 1.0));
        assert!(pyramid.is_empty());
        assert_eq!(pyramid.base_size(), (0, 0));
    }

    #[test]
    fn mismatched_data_is_rejected() {
        let err = DepthImage::new(4, 4, vec![1.0; 15]).unwrap_err();
        assert!(err.is_resource());
    }

    #[test]
    fn clamped_fetch_stays_inside() {
        let mut image = DepthImage::filled(2, 2, 0.0);
        image.set(1, 1, 0.75);
        assert_eq!(image.fetch_clamped(7, 9), Some(0.75));
        assert_eq!(image.fetch_clamped(-3, -1), Some(0.0));
    }

    #[test]
    fn empty_image_access_is_checked() {
        let mut empty = DepthImage::filled(0, 4, 1.0);
        assert_eq!(empty.fetch_clamped(0, 0), None);
        assert_eq!(empty.get(0, 0), None);
        empty.set(0, 0, 0.5);

        let mut image = DepthImage::filled(3, 2, 0.25);
        assert_eq!(image.get(3, 0), None);
        assert_eq!(image.get(0, 2), None);
        image.set(5, 5, 0.5);
        assert!(image.data().iter().all(|&d| d == 0.25));
    }
}
