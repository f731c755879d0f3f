// src/lib.rs
//! GPU-driven grain classification, stream compaction and HZB occlusion culling.
//!
//! Each frame every grain is tagged `Instanced`, `Impostor`, `Point` or
//! `Discarded`, the tag buffer is compacted into one contiguous index range
//! per tag, and one draw is emitted per non-empty range. The CPU pipeline in
//! [`pipeline`] and the wgpu passes in [`gpu`] implement the same rules.

pub mod camera;
pub mod classifier;
pub mod compactor;
pub mod config;
pub mod depth_pyramid;
pub mod dispatch;
pub mod error;
pub mod gpu;
pub mod occluder;
pub mod pipeline;
pub mod stats;

pub use camera::{Camera, CameraUniform, ScreenCircle};
pub use classifier::{classify, select_representation, Classifier, Element, GpuElement, Tag};
pub use compactor::{compact, CompactionResult, Compactor, Counter};
pub use config::SplitterConfig;
pub use depth_pyramid::{DepthImage, DepthPyramid};
pub use dispatch::{build_dispatches, Dispatch, DispatchBuilder, DrawIndexedIndirectArgs, DrawIndirectArgs};
pub use error::{Context, Error, Result};
pub use occluder::{Occluder, Occlusion};
pub use pipeline::{FrameOutput, FramePipeline};
pub use stats::{FrameStats, StatsWriter};
