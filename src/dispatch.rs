// src/dispatch.rs
//! Draw parameters for the non-empty tag ranges.

use bytemuck::{Pod, Zeroable};

use crate::classifier::Tag;
use crate::compactor::{CompactionResult, Counter};

/// One draw over a tag's slice of the compacted index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub tag: Tag,
    pub first_index: u32,
    pub count: u32,
}

/// `wgpu::RenderPass::draw_indirect` layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirectArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// `wgpu::RenderPass::draw_indexed_indirect` layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl Dispatch {
    /// One instance per grain of a `vertices_per_grain`-vertex primitive
    /// (a quad for impostors, a single vertex for points). `first_instance`
    /// indexes the compacted buffer.
    pub fn draw_args(&self, vertices_per_grain: u32) -> DrawIndirectArgs {
        DrawIndirectArgs {
            vertex_count: vertices_per_grain,
            instance_count: self.count,
            first_vertex: 0,
            first_instance: self.first_index,
        }
    }

    /// Instanced mesh draw: the grain mesh is drawn `count` times.
    pub fn draw_indexed_args(&self, mesh_index_count: u32) -> DrawIndexedIndirectArgs {
        DrawIndexedIndirectArgs {
            index_count: mesh_index_count,
            instance_count: self.count,
            first_index: 0,
            base_vertex: 0,
            first_instance: self.first_index,
        }
    }
}

/// Turns compaction counters into draws. Zero-count ranges and the
/// `Discarded` range never produce a draw.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchBuilder;

impl DispatchBuilder {
    pub fn build(&self, compaction: &CompactionResult) -> Vec<Dispatch> {
        self.from_counters(&compaction.counters)
    }

    /// Same as [`build`](Self::build) for counters read back from the GPU.
    pub fn from_counters(&self, counters: &[Counter; Tag::COUNT]) -> Vec<Dispatch> {
        Tag::ALL
            .into_iter()
            .filter(|t| t.is_rendered())
            .filter_map(|tag| {
                let counter = counters[tag.index()];
                (counter.count > 0).then_some(Dispatch {
                    tag,
                    first_index: counter.offset,
                    count: counter.count,
                })
            })
            .collect()
    }
}

pub fn build_dispatches(compaction: &CompactionResult) -> Vec<Dispatch> {
    DispatchBuilder.build(compaction)
}
