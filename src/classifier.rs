// src/classifier.rs
//! Per-grain choice of render representation.
//!
//! Each tag depends only on the grain itself, the camera and the config, so
//! the whole pass is a flat parallel map.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use rayon::prelude::*;

use crate::camera::{sphere_in_frustum, Camera};
use crate::config::SplitterConfig;
use crate::depth_pyramid::DepthPyramid;
use crate::occluder::Occluder;

/// Render representation of a grain. The discriminant is the position of the
/// tag's range in the compacted index buffer.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    /// Full mesh instance.
    Instanced = 0,
    /// Billboard impostor.
    Impostor = 1,
    /// Raw point.
    Point = 2,
    /// Not rendered this frame.
    Discarded = 3,
}

impl Tag {
    pub const COUNT: usize = 4;
    pub const ALL: [Tag; Tag::COUNT] = [Tag::Instanced, Tag::Impostor, Tag::Point, Tag::Discarded];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_index(index: usize) -> Option<Tag> {
        Tag::ALL.get(index).copied()
    }

    #[inline]
    pub fn is_rendered(self) -> bool {
        self != Tag::Discarded
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Instanced => "instance",
            Tag::Impostor => "impostor",
            Tag::Point => "point",
            Tag::Discarded => "none",
        }
    }
}

/// One grain of the point buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Element {
    pub position: Vec3,
    /// Bounding radius; `None` uses the configured grain radius.
    pub radius: Option<f32>,
}

impl Element {
    #[inline]
    pub fn new(position: Vec3) -> Self {
        Self { position, radius: None }
    }

    #[inline]
    pub fn with_radius(position: Vec3, radius: f32) -> Self {
        Self {
            position,
            radius: Some(radius),
        }
    }

    #[inline]
    pub fn radius_or(&self, default: f32) -> f32 {
        self.radius.unwrap_or(default)
    }
}

/// GPU layout of an [`Element`] (matches the WGSL `Grain` struct).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuElement {
    pub position: [f32; 3],
    pub radius: f32,
}

impl GpuElement {
    pub fn from_element(element: &Element, default_radius: f32) -> Self {
        Self {
            position: element.position.to_array(),
            radius: element.radius_or(default_radius),
        }
    }
}

/// Monotonic distance rule shared by every configuration, degenerate ones included.
#[inline]
pub fn select_representation(distance: f32, config: &SplitterConfig) -> Tag {
    if config.enable_instances && distance < config.instance_limit {
        Tag::Instanced
    } else if config.enable_impostors && distance < config.impostor_limit {
        Tag::Impostor
    } else {
        Tag::Point
    }
}

/// Frame-constant inputs of the classification pass.
pub struct Classifier<'a> {
    camera: &'a Camera,
    config: &'a SplitterConfig,
    occluder: Option<Occluder<'a>>,
    frustum: Option<[Vec4; 6]>,
    bbox: Option<(Vec3, Vec3)>,
}

impl<'a> Classifier<'a> {
    /// `pyramid` is the previous frame's occluder pyramid; `None` disables occlusion culling.
    pub fn new(camera: &'a Camera, pyramid: Option<&'a DepthPyramid>, config: &'a SplitterConfig) -> Self {
        let occluder = pyramid
            .filter(|_| config.enable_occlusion_culling)
            .map(|p| Occluder::new(camera, p))
            .filter(Occluder::is_ready);
        Self {
            camera,
            config,
            occluder,
            frustum: config.enable_frustum_culling.then(|| camera.frustum_planes()),
            bbox: config.bbox(),
        }
    }

    /// `true` when an occlusion test will actually run.
    pub fn occlusion_active(&self) -> bool {
        self.occluder.is_some()
    }

    /// Tag of a single grain. Culling is evaluated first, in a fixed order:
    /// bounding box, frustum, occlusion.
    pub fn classify(&self, element: &Element) -> Tag {
        let center = element.position;
        let radius = element.radius_or(self.config.grain_radius);

        if let Some((lo, hi)) = self.bbox {
            if center.cmplt(lo).any() || center.cmpgt(hi).any() {
                return Tag::Discarded;
            }
        }

        if let Some(planes) = &self.frustum {
            if !sphere_in_frustum(center, radius, planes) {
                return Tag::Discarded;
            }
        }

        if let Some(occluder) = &self.occluder {
            if occluder.test(center, radius).is_culled() {
                return Tag::Discarded;
            }
        }

        select_representation(self.camera.distance_to(center), self.config)
    }

    /// Tags for every grain, in element order.
    pub fn classify_all(&self, elements: &[Element]) -> Vec<Tag> {
        elements.par_iter().map(|e| self.classify(e)).collect()
    }
}

/// One-shot form of [`Classifier::classify_all`].
pub fn classify(
    elements: &[Element],
    camera: &Camera,
    pyramid: Option<&DepthPyramid>,
    config: &SplitterConfig,
) -> Vec<Tag> {
    Classifier::new(camera, pyramid, config).classify_all(elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth_pyramid::DepthImage;
    use std::f32::consts::FRAC_PI_2;

    fn camera() -> Camera {
        Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, FRAC_PI_2, (64, 64), 0.1, 100.0)
    }

    fn row_of_grains() -> Vec<Element> {
        (1..=20)
            .map(|i| Element::with_radius(Vec3::new(0.0, 0.0, -(i as f32)), 0.05))
            .collect()
    }

    #[test]
    fn distance_rule_is_monotonic() {
        let config = SplitterConfig {
            instance_limit: 2.0,
            impostor_limit: 10.0,
            ..Default::default()
        };
        assert_eq!(select_representation(1.0, &config), Tag::Instanced);
        assert_eq!(select_representation(2.0, &config), Tag::Impostor);
        assert_eq!(select_representation(9.9, &config), Tag::Impostor);
        assert_eq!(select_representation(10.0, &config), Tag::Point);
    }

    #[test]
    fn disabled_representations_fall_through() {
        let no_instances = SplitterConfig {
            enable_instances: false,
            instance_limit: 5.0,
            ..Default::default()
        };
        assert_eq!(select_representation(1.0, &no_instances), Tag::Impostor);

        let nothing_but_points = SplitterConfig {
            enable_instances: false,
            enable_impostors: false,
            ..Default::default()
        };
        assert_eq!(select_representation(0.5, &nothing_but_points), Tag::Point);

        let no_impostors = SplitterConfig {
            enable_impostors: false,
            instance_limit: 5.0,
            ..Default::default()
        };
        assert_eq!(select_representation(7.0, &no_impostors), Tag::Point);
        assert_eq!(select_representation(3.0, &no_impostors), Tag::Instanced);
    }

    #[test]
    fn infinite_instance_limit_tags_everything_instanced() {
        let config = SplitterConfig::only_instances();
        let tags = classify(&row_of_grains(), &camera(), None, &config);
        assert!(tags.iter().all(|&t| t == Tag::Instanced));
    }

    #[test]
    fn zero_instance_limit_tags_everything_impostor() {
        let config = SplitterConfig::only_impostors();
        let tags = classify(&row_of_grains(), &camera(), None, &config);
        assert!(tags.iter().all(|&t| t == Tag::Impostor));
    }

    #[test]
    fn occluded_grains_are_discarded_first() {
        let cam = camera();
        let pyramid = DepthPyramid::build(DepthImage::filled(64, 64, cam.device_depth(5.5)));
        let config = SplitterConfig::only_instances();
        let tags = classify(&row_of_grains(), &cam, Some(&pyramid), &config);
        for (i, tag) in tags.iter().enumerate() {
            let dist = (i + 1) as f32;
            if dist - 0.05 > 5.5 {
                assert_eq!(*tag, Tag::Discarded, "grain at {dist}");
            } else {
                assert_eq!(*tag, Tag::Instanced, "grain at {dist}");
            }
        }
    }

    #[test]
    fn occlusion_can_be_disabled() {
        let cam = camera();
        let pyramid = DepthPyramid::build(DepthImage::filled(64, 64, 0.0));
        let config = SplitterConfig {
            enable_occlusion_culling: false,
            ..SplitterConfig::only_impostors()
        };
        let classifier = Classifier::new(&cam, Some(&pyramid), &config);
        assert!(!classifier.occlusion_active());
        assert!(classifier
            .classify_all(&row_of_grains())
            .iter()
            .all(|&t| t == Tag::Impostor));
    }

    #[test]
    fn frustum_and_bbox_discard() {
        let cam = camera();
        let config = SplitterConfig {
            use_bbox: true,
            bbox_min: [-1.0, -1.0, -10.0],
            bbox_max: [1.0, 1.0, 0.0],
            ..SplitterConfig::only_instances()
        };
        let grains = [
            Element::new(Vec3::new(0.0, 0.0, -5.0)),
            Element::new(Vec3::new(0.0, 0.0, -50.0)),
            Element::new(Vec3::new(0.0, 0.0, 5.0)),
        ];
        let tags = classify(&grains, &cam, None, &config);
        assert_eq!(tags, vec![Tag::Instanced, Tag::Discarded, Tag::Discarded]);

        let frustum_only = SplitterConfig::only_instances();
        let tags = classify(&grains, &cam, None, &frustum_only);
        assert_eq!(tags, vec![Tag::Instanced, Tag::Instanced, Tag::Discarded]);
    }

    #[test]
    fn gpu_element_layout() {
        assert_eq!(std::mem::size_of::<GpuElement>(), 16);
        let gpu = GpuElement::from_element(&Element::new(Vec3::ONE), 0.25);
        assert_eq!(gpu.radius, 0.25);
    }
}
