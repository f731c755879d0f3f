// src/config.rs
//! Splitter configuration.
//!
//! Loaded from the same camelCase JSON objects scenes use for the splitter
//! properties, e.g. `{"instanceLimit": 1.05, "enableOcclusionCulling": false}`.
//! Missing keys keep their defaults.

use glam::Vec3;
use serde::Deserialize;

use crate::error::{Context, Error, Result};

/// Largest workgroup the scan shaders are written for.
pub const MAX_WORKGROUP_SIZE: u32 = 1024;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SplitterConfig {
    /// Distance below which grains are drawn as full mesh instances.
    pub instance_limit: f32,
    /// Distance below which grains are drawn as impostors (beyond it: points).
    pub impostor_limit: f32,
    pub enable_instances: bool,
    pub enable_impostors: bool,
    pub enable_occlusion_culling: bool,
    pub enable_frustum_culling: bool,
    /// Discard every grain outside `[bbox_min, bbox_max]`.
    pub use_bbox: bool,
    pub bbox_min: [f32; 3],
    pub bbox_max: [f32; 3],
    /// Bounding radius for grains that do not carry their own.
    pub grain_radius: f32,
    /// Elements per scan chunk, power of two.
    pub workgroup_size: u32,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            instance_limit: 1.05,
            impostor_limit: f32::INFINITY,
            enable_instances: true,
            enable_impostors: true,
            enable_occlusion_culling: true,
            enable_frustum_culling: true,
            use_bbox: false,
            bbox_min: [-1.0; 3],
            bbox_max: [1.0; 3],
            grain_radius: 0.007,
            workgroup_size: 128,
        }
    }
}

impl SplitterConfig {
    /// Every visible grain is a mesh instance.
    pub fn only_instances() -> Self {
        Self {
            instance_limit: f32::INFINITY,
            ..Self::default()
        }
    }

    /// Every visible grain is an impostor.
    pub fn only_impostors() -> Self {
        Self {
            instance_limit: 0.0,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing splitter config")?;
        config.validate()?;
        Ok(config)
    }

    #[inline]
    pub fn bbox(&self) -> Option<(Vec3, Vec3)> {
        self.use_bbox
            .then(|| (Vec3::from_array(self.bbox_min), Vec3::from_array(self.bbox_max)))
    }

    /// Reject configurations the frame must not run with.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("instanceLimit", self.instance_limit),
            ("impostorLimit", self.impostor_limit),
        ] {
            if value.is_nan() {
                return Err(Error::config(format!("{name} is NaN")));
            }
            if value < 0.0 {
                return Err(Error::config(format!("{name} is negative ({value})")));
            }
        }

        if self.instance_limit > self.impostor_limit {
            return Err(Error::config(format!(
                "instanceLimit ({}) exceeds impostorLimit ({})",
                self.instance_limit, self.impostor_limit
            )));
        }

        if !(self.grain_radius > 0.0) || !self.grain_radius.is_finite() {
            return Err(Error::config(format!(
                "grainRadius must be positive and finite, got {}",
                self.grain_radius
            )));
        }

        if self.use_bbox {
            let inverted = self
                .bbox_min
                .iter()
                .zip(self.bbox_max.iter())
                .any(|(lo, hi)| !(lo <= hi));
            if inverted {
                return Err(Error::config(format!(
                    "bounding box is inverted: min {:?}, max {:?}",
                    self.bbox_min, self.bbox_max
                )));
            }
        }

        if self.workgroup_size == 0
            || !self.workgroup_size.is_power_of_two()
            || self.workgroup_size > MAX_WORKGROUP_SIZE
        {
            return Err(Error::config(format!(
                "workgroupSize must be a power of two in 1..={MAX_WORKGROUP_SIZE}, got {}",
                self.workgroup_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SplitterConfig::default().validate().unwrap();
        SplitterConfig::only_instances().validate().unwrap();
        SplitterConfig::only_impostors().validate().unwrap();
    }

    #[test]
    fn json_keys_are_camel_case_and_optional() {
        let config = SplitterConfig::from_json(
            r#"{"instanceLimit": 2.5, "impostorLimit": 12.0, "enableOcclusionCulling": false}"#,
        )
        .unwrap();
        assert_eq!(config.instance_limit, 2.5);
        assert_eq!(config.impostor_limit, 12.0);
        assert!(!config.enable_occlusion_culling);
        assert!(config.enable_frustum_culling);
        assert_eq!(config.workgroup_size, 128);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config = SplitterConfig {
            instance_limit: 5.0,
            impostor_limit: 2.0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn nan_and_negative_thresholds_are_rejected() {
        let nan = SplitterConfig {
            instance_limit: f32::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());
        let negative = SplitterConfig {
            instance_limit: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn workgroup_size_must_be_power_of_two() {
        for size in [0, 96, 2048] {
            let config = SplitterConfig {
                workgroup_size: size,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{size}");
        }
    }

    #[test]
    fn inverted_bbox_only_matters_when_used() {
        let mut config = SplitterConfig {
            bbox_min: [1.0, 0.0, 0.0],
            bbox_max: [0.0, 1.0, 1.0],
            ..Default::default()
        };
        config.validate().unwrap();
        config.use_bbox = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = SplitterConfig::from_json("{\"instanceLimit\": \"far\"}").unwrap_err();
        assert!(matches!(err.root(), Error::Json(_)));
    }
}
