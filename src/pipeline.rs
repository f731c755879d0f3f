// src/pipeline.rs
//! Per-frame CPU pipeline: classify, compact, build dispatches.
//!
//! Occlusion is temporal. The pyramid built from the depth submitted with
//! [`FramePipeline::submit_occluder_depth`] is consumed by the next
//! [`FramePipeline::run_frame`]; until one exists the frame runs without
//! occlusion culling.

use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::camera::Camera;
use crate::classifier::{Classifier, Element, Tag};
use crate::compactor::{CompactionResult, Compactor};
use crate::config::SplitterConfig;
use crate::depth_pyramid::{DepthImage, DepthPyramid};
use crate::dispatch::{Dispatch, DispatchBuilder};
use crate::error::{Error, Result};
use crate::stats::{FrameStats, StageTimer};

/// Everything a renderer needs from one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameOutput {
    pub tags: Vec<Tag>,
    pub compaction: CompactionResult,
    pub dispatches: Vec<Dispatch>,
    pub stats: FrameStats,
}

impl FrameOutput {
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }
}

pub struct FramePipeline {
    config: SplitterConfig,
    compactor: Compactor,
    pyramid: Option<DepthPyramid>,
    frame_index: u64,
    missing_pyramid_warned: bool,
    stats: Mutex<FrameStats>,
    timer: Mutex<StageTimer>,
}

impl FramePipeline {
    pub fn new(config: SplitterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            compactor: Compactor::new(config.workgroup_size),
            config,
            pyramid: None,
            frame_index: 0,
            missing_pyramid_warned: false,
            stats: Mutex::new(FrameStats::default()),
            timer: Mutex::new(StageTimer::default()),
        })
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Replace the configuration. An invalid one is rejected and the old one kept.
    pub fn set_config(&mut self, config: SplitterConfig) -> Result<()> {
        config.validate()?;
        self.compactor = Compactor::new(config.workgroup_size);
        self.config = config;
        Ok(())
    }

    /// Build the occluder pyramid for the next frame from this frame's
    /// occluder depth. A zero-sized buffer leaves no pyramid.
    pub fn submit_occluder_depth(&mut self, depth: DepthImage) {
        let pyramid = DepthPyramid::build(depth);
        if pyramid.is_empty() {
            self.pyramid = None;
            return;
        }
        debug!(
            "occluder pyramid {:?}, {} levels",
            pyramid.base_size(),
            pyramid.level_count()
        );
        self.pyramid = Some(pyramid);
        self.missing_pyramid_warned = false;
    }

    pub fn clear_occluder(&mut self) {
        self.pyramid = None;
    }

    pub fn pyramid(&self) -> Option<&DepthPyramid> {
        self.pyramid.as_ref()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Stats of the last completed frame.
    pub fn stats(&self) -> FrameStats {
        *self.stats.lock()
    }

    /// Rolling average of classify + compact time.
    pub fn average_frame_ms(&self) -> f32 {
        self.timer.lock().average_ms()
    }

    pub fn run_frame(&mut self, elements: &[Element], camera: &Camera) -> Result<FrameOutput> {
        let frame = self.frame_index;
        self.frame_index += 1;

        if elements.is_empty() {
            let stats = FrameStats {
                frame,
                ..Default::default()
            };
            *self.stats.lock() = stats;
            return Ok(FrameOutput {
                stats,
                ..Default::default()
            });
        }

        if elements.len() > u32::MAX as usize {
            return Err(Error::config(format!(
                "{} elements do not fit 32-bit indices",
                elements.len()
            )));
        }

        if self.config.enable_occlusion_culling && self.pyramid.is_none() && !self.missing_pyramid_warned {
            warn!("occlusion culling enabled but no occluder depth submitted yet, running without it");
            self.missing_pyramid_warned = true;
        }

        let start = Instant::now();
        let classifier = Classifier::new(camera, self.pyramid.as_ref(), &self.config);
        let occlusion_active = classifier.occlusion_active();
        let tags = classifier.classify_all(elements);
        let classify_ms = start.elapsed().as_secs_f32() * 1000.0;

        let start = Instant::now();
        let compaction = self.compactor.compact(&tags);
        let compact_ms = start.elapsed().as_secs_f32() * 1000.0;
        debug_assert!(compaction.validate(elements.len()).is_ok());

        let dispatches = DispatchBuilder.build(&compaction);

        let stats = FrameStats {
            classify_ms,
            compact_ms,
            occlusion_active,
            ..FrameStats::from_compaction(frame, &compaction)
        };
        debug!(
            "frame {}: {} grains -> {} instanced, {} impostor, {} point, {} discarded ({:.2} ms)",
            frame,
            stats.element_count,
            stats.count(Tag::Instanced),
            stats.count(Tag::Impostor),
            stats.count(Tag::Point),
            stats.count(Tag::Discarded),
            stats.total_ms()
        );

        *self.stats.lock() = stats;
        self.timer.lock().record(stats.total_ms());

        Ok(FrameOutput {
            tags,
            compaction,
            dispatches,
            stats,
        })
    }
}
