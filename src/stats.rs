// src/stats.rs
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::classifier::Tag;
use crate::compactor::CompactionResult;
use crate::error::{Context, Result};

/// Counts and stage timings of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frame: u64,
    pub element_count: u32,
    /// Per-tag counts, indexed by [`Tag::index`].
    pub counts: [u32; Tag::COUNT],
    pub classify_ms: f32,
    pub compact_ms: f32,
    /// Whether the occlusion test ran this frame.
    pub occlusion_active: bool,
}

impl FrameStats {
    pub fn from_compaction(frame: u64, compaction: &CompactionResult) -> Self {
        Self {
            frame,
            element_count: compaction.indices.len() as u32,
            counts: compaction.counters.map(|c| c.count),
            ..Default::default()
        }
    }

    #[inline]
    pub fn count(&self, tag: Tag) -> u32 {
        self.counts[tag.index()]
    }

    pub fn total_ms(&self) -> f32 {
        self.classify_ms + self.compact_ms
    }
}

/// Rolling average of stage timings over the last 128 frames.
pub struct StageTimer {
    frame_times: [f32; 128],
    index: usize,
    frames: usize,
}

impl Default for StageTimer {
    fn default() -> Self {
        Self {
            frame_times: [0.0; 128],
            index: 0,
            frames: 0,
        }
    }
}

impl StageTimer {
    pub fn record(&mut self, ms: f32) {
        self.frame_times[self.index] = ms;
        self.index = (self.index + 1) % self.frame_times.len();
        self.frames += 1;
    }

    /// Mean over the recorded window, 0 before the first frame.
    pub fn average_ms(&self) -> f32 {
        let filled = self.frames.min(self.frame_times.len());
        if filled == 0 {
            return 0.0;
        }
        self.frame_times[..filled].iter().sum::<f32>() / filled as f32
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Semicolon-separated per-frame tag counts.
pub struct StatsWriter<W: Write> {
    out: W,
}

pub const STATS_HEADER: &str = "frame;instanceCount;impostorCount;pointCount;noneCount";

impl StatsWriter<BufWriter<File>> {
    /// Create (or truncate) the CSV file at `path`, creating parent directories.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .context(format!("creating stats directory {}", parent.display()))?;
        }
        let file = File::create(path).context(format!("creating stats file {}", path.display()))?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> StatsWriter<W> {
    /// Wrap `out` and write the header line.
    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "{STATS_HEADER}")?;
        Ok(Self { out })
    }

    pub fn write(&mut self, stats: &FrameStats) -> Result<()> {
        writeln!(
            self.out,
            "{};{};{};{};{}",
            stats.frame,
            stats.count(Tag::Instanced),
            stats.count(Tag::Impostor),
            stats.count(Tag::Point),
            stats.count(Tag::Discarded)
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compactor::compact;

    #[test]
    fn csv_lines_follow_header() {
        let tags = [Tag::Instanced, Tag::Point, Tag::Point, Tag::Discarded];
        let stats = FrameStats::from_compaction(3, &compact(&tags));

        let mut writer = StatsWriter::new(Vec::new()).unwrap();
        writer.write(&stats).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text, format!("{STATS_HEADER}\n3;1;0;2;1\n"));
    }

    #[test]
    fn timer_averages_recorded_frames_only() {
        let mut timer = StageTimer::default();
        assert_eq!(timer.average_ms(), 0.0);
        timer.record(2.0);
        timer.record(4.0);
        assert_eq!(timer.average_ms(), 3.0);

        for _ in 0..200 {
            timer.record(1.0);
        }
        assert_eq!(timer.average_ms(), 1.0);
        assert_eq!(timer.frames(), 202);
    }

    #[test]
    fn create_makes_parent_directories() {
        let dir = std::env::temp_dir().join(format!("grain_cull_stats_{}", std::process::id()));
        let path = dir.join("nested").join("stats.csv");
        let mut writer = StatsWriter::create(&path).unwrap();
        writer.write(&FrameStats::default()).unwrap();
        writer.flush().unwrap();
        drop(writer);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(STATS_HEADER));
        fs::remove_dir_all(dir).ok();
    }
}
