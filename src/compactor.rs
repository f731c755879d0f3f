// src/compactor.rs
//! Stable stream compaction of the tag buffer.
//!
//! Three phases, each a parallel pass over the elements:
//!
//! * **mark**: one `[u32; 4]` indicator per element, plus the indicator of the
//!   last element kept aside, since the exclusive scan drops its contribution;
//! * **scan**: exclusive prefix sum per tag over workgroup-sized chunks, then a
//!   second-level scan over the chunk totals. Collecting every chunk total is
//!   the barrier between the two levels;
//! * **scatter**: element `i` with tag `T` lands at `base(T) + prefix[i][T]`.
//!
//! Ranges are laid out in [`Tag`] order, `Discarded` last, so that together
//! they cover `0..N` exactly once.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::classifier::Tag;
use crate::error::{Error, Result};

type Lanes = [u32; Tag::COUNT];

/// Count and first slot of one tag's range in the compacted index buffer
/// (same layout as the GPU counters buffer).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Counter {
    pub count: u32,
    pub offset: u32,
}

impl Counter {
    #[inline]
    pub fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.count as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub counters: [Counter; Tag::COUNT],
    /// Original element indices, grouped by tag.
    pub indices: Vec<u32>,
}

impl CompactionResult {
    #[inline]
    pub fn counter(&self, tag: Tag) -> Counter {
        self.counters[tag.index()]
    }

    #[inline]
    pub fn count(&self, tag: Tag) -> u32 {
        self.counters[tag.index()].count
    }

    #[inline]
    pub fn range(&self, tag: Tag) -> Range<usize> {
        self.counter(tag).range()
    }

    /// Original indices of every element tagged `tag`, in element order.
    pub fn indices(&self, tag: Tag) -> &[u32] {
        &self.indices[self.range(tag)]
    }

    pub fn rendered_count(&self) -> u32 {
        Tag::ALL
            .iter()
            .filter(|t| t.is_rendered())
            .map(|&t| self.count(t))
            .sum()
    }

    /// Check that the ranges are contiguous and together hold every index of
    /// `0..n` exactly once.
    pub fn validate(&self, n: usize) -> Result<()> {
        if self.indices.len() != n {
            return Err(Error::invariant(format!(
                "compacted buffer holds {} indices for {} elements",
                self.indices.len(),
                n
            )));
        }

        let mut expected_offset = 0u64;
        for tag in Tag::ALL {
            let c = self.counter(tag);
            if c.offset as u64 != expected_offset {
                return Err(Error::invariant(format!(
                    "{} range starts at {}, expected {}",
                    tag.name(),
                    c.offset,
                    expected_offset
                )));
            }
            expected_offset += c.count as u64;
        }
        if expected_offset != n as u64 {
            return Err(Error::invariant(format!(
                "tag counts sum to {expected_offset}, expected {n}"
            )));
        }

        let mut seen = vec![false; n];
        for &index in &self.indices {
            match seen.get_mut(index as usize) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => return Err(Error::invariant(format!("index {index} appears twice"))),
                None => return Err(Error::invariant(format!("index {index} out of range"))),
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate), plus: each range holds exactly the
    /// elements carrying that tag, in their original order.
    pub fn validate_against(&self, tags: &[Tag]) -> Result<()> {
        self.validate(tags.len())?;
        for tag in Tag::ALL {
            let range = self.indices(tag);
            if let Some(bad) = range.iter().find(|&&i| tags[i as usize] != tag) {
                return Err(Error::invariant(format!(
                    "element {bad} tagged {} sits in the {} range",
                    tags[*bad as usize].name(),
                    tag.name()
                )));
            }
            if range.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::invariant(format!("{} range is not in element order", tag.name())));
            }
        }
        Ok(())
    }
}

#[inline]
fn indicator(tag: Tag) -> Lanes {
    let mut lanes = [0; Tag::COUNT];
    lanes[tag.index()] = 1;
    lanes
}

#[inline]
fn add_lanes(a: Lanes, b: Lanes) -> Lanes {
    std::array::from_fn(|t| a[t] + b[t])
}

/// In-place exclusive scan; returns the chunk total.
fn exclusive_scan(chunk: &mut [Lanes]) -> Lanes {
    let mut running = [0; Tag::COUNT];
    for slot in chunk.iter_mut() {
        let value = *slot;
        *slot = running;
        running = add_lanes(running, value);
    }
    running
}

/// Parallel stream compactor. `workgroup_size` is the scan chunk length.
#[derive(Clone, Copy, Debug)]
pub struct Compactor {
    workgroup_size: usize,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(128)
    }
}

impl Compactor {
    pub fn new(workgroup_size: u32) -> Self {
        Self {
            workgroup_size: workgroup_size.max(1) as usize,
        }
    }

    pub fn workgroup_size(&self) -> usize {
        self.workgroup_size
    }

    pub fn compact(&self, tags: &[Tag]) -> CompactionResult {
        let n = tags.len();
        if n == 0 {
            return CompactionResult::default();
        }
        debug_assert!(n <= u32::MAX as usize, "element count {n} exceeds u32");

        // Phase A
        let mut prefix: Vec<Lanes> = tags.par_iter().map(|&t| indicator(t)).collect();
        let last = prefix[n - 1];

        // Phase B, first level
        let chunk_totals: Vec<Lanes> = prefix
            .par_chunks_mut(self.workgroup_size)
            .map(exclusive_scan)
            .collect();

        // Phase B, second level
        let mut chunk_offsets = chunk_totals;
        exclusive_scan(&mut chunk_offsets);
        prefix
            .par_chunks_mut(self.workgroup_size)
            .zip(chunk_offsets.par_iter())
            .for_each(|(chunk, offset)| {
                for slot in chunk {
                    *slot = add_lanes(*slot, *offset);
                }
            });

        let counts = add_lanes(prefix[n - 1], last);
        let bases: Lanes = {
            let mut running = 0;
            std::array::from_fn(|t| {
                let base = running;
                running += counts[t];
                base
            })
        };
        debug_assert_eq!(counts.iter().map(|&c| c as usize).sum::<usize>(), n);

        // Phase C
        let destinations: Vec<u32> = tags
            .par_iter()
            .zip(prefix.par_iter())
            .map(|(&tag, p)| bases[tag.index()] + p[tag.index()])
            .collect();

        let mut indices = vec![u32::MAX; n];
        for (i, &dst) in destinations.iter().enumerate() {
            debug_assert_eq!(indices[dst as usize], u32::MAX, "slot {dst} written twice");
            indices[dst as usize] = i as u32;
        }

        CompactionResult {
            counters: std::array::from_fn(|t| Counter {
                count: counts[t],
                offset: bases[t],
            }),
            indices,
        }
    }
}

/// Compact with the default workgroup size.
pub fn compact(tags: &[Tag]) -> CompactionResult {
    Compactor::default().compact(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_tags(n: usize, seed: u64) -> Vec<Tag> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| Tag::ALL[rng.gen_range(0..Tag::COUNT)]).collect()
    }

    #[test]
    fn ranges_partition_all_indices() {
        for (seed, n) in [0usize, 1, 17, 4096].into_iter().enumerate() {
            let tags = random_tags(n, seed as u64);
            let result = compact(&tags);
            result.validate(n).unwrap();
            let mut all = result.indices.clone();
            all.sort_unstable();
            assert!(all.iter().copied().eq(0..n as u32), "n = {n}");
        }
    }

    #[test]
    fn ranges_are_stable() {
        let tags = random_tags(4096, 7);
        let result = compact(&tags);
        for tag in Tag::ALL {
            let expected: Vec<u32> = tags
                .iter()
                .enumerate()
                .filter(|(_, t)| **t == tag)
                .map(|(i, _)| i as u32)
                .collect();
            assert_eq!(result.indices(tag), expected.as_slice(), "{tag:?}");
        }
        result.validate_against(&tags).unwrap();
    }

    #[test]
    fn last_element_is_counted() {
        let mut tags = vec![Tag::Discarded; 8];
        tags[7] = Tag::Impostor;
        let result = compact(&tags);
        assert_eq!(result.count(Tag::Impostor), 1);
        assert_eq!(result.counter(Tag::Impostor).offset, 0);
        assert_eq!(result.indices(Tag::Impostor), &[7]);
        assert_eq!(result.count(Tag::Instanced), 0);
        assert_eq!(result.count(Tag::Discarded), 7);
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        for n in [127, 128, 129, 256, 300] {
            let tags = random_tags(n, n as u64);
            let reference = Compactor::new(1).compact(&tags);
            for wg in [2, 4, 32, 128, 1024] {
                let result = Compactor::new(wg).compact(&tags);
                assert_eq!(result, reference, "n = {n}, workgroup = {wg}");
            }
            reference.validate_against(&tags).unwrap();
        }
    }

    #[test]
    fn single_tag_fills_its_range() {
        let tags = vec![Tag::Point; 500];
        let result = Compactor::new(64).compact(&tags);
        assert_eq!(result.range(Tag::Point), 0..500);
        assert_eq!(result.rendered_count(), 500);
    }

    #[test]
    fn everything_discarded() {
        let tags = vec![Tag::Discarded; 33];
        let result = compact(&tags);
        assert_eq!(result.rendered_count(), 0);
        assert_eq!(result.range(Tag::Discarded), 0..33);
        result.validate(33).unwrap();
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let result = compact(&[]);
        assert!(result.indices.is_empty());
        assert!(result.counters.iter().all(|c| c.count == 0 && c.offset == 0));
        result.validate(0).unwrap();
    }

    #[test]
    fn validate_catches_broken_results() {
        let tags = random_tags(40, 3);
        let good = compact(&tags);

        let mut duplicated = good.clone();
        duplicated.indices[1] = duplicated.indices[0];
        assert!(duplicated.validate(40).unwrap_err().is_invariant());

        let mut shifted = good.clone();
        shifted.counters[Tag::Point.index()].offset += 1;
        assert!(shifted.validate(40).is_err());

        let mut reordered = good;
        let range = reordered.range(Tag::Instanced);
        if range.len() >= 2 {
            reordered.indices.swap(range.start, range.start + 1);
            assert!(reordered.validate_against(&tags).is_err());
        }
    }

    #[test]
    fn counter_layout() {
        assert_eq!(std::mem::size_of::<Counter>(), 8);
    }
}
