// src/occluder.rs
//! Bounding-sphere occlusion test against a [`DepthPyramid`].
//!
//! The sphere is projected to a screen-space circle, a pyramid level is picked
//! from the circle radius with `clamp(ceil(log2(r) + 1), 0, L - 2)`, and the
//! four texels straddling the circle center are fetched at that level. The
//! sphere is culled only when all four linearised depths are strictly closer
//! than the nearest point the sphere could have.
//!
//! Every uncertain case answers [`Occlusion::Visible`].

use glam::{Vec2, Vec3};

use crate::camera::Camera;
use crate::depth_pyramid::{DepthImage, DepthPyramid};

/// Verdict of a single occlusion test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Occlusion {
    Visible,
    Culled,
}

impl Occlusion {
    #[inline]
    pub fn is_culled(self) -> bool {
        self == Occlusion::Culled
    }
}

/// Pyramid level for a projected circle of `radius_px` pixels (level 0 pixels).
///
/// `level_count` levels are available; the result is clamped to `L - 2`
/// (or 0 for pyramids with fewer than two levels).
pub fn select_level(radius_px: f32, level_count: usize) -> usize {
    let max_level = level_count.saturating_sub(2) as f32;
    let level = (radius_px.log2() + 1.0).ceil();
    if level.is_nan() {
        return 0;
    }
    level.clamp(0.0, max_level) as usize
}

/// The 2x2 texels straddling `center_uv` on `level`, clamped to the image.
pub fn probe_texels(center_uv: Vec2, level: &DepthImage) -> [(i64, i64); 4] {
    let size = Vec2::new(level.width() as f32, level.height() as f32);
    // Anything past one texel outside clamps to the same border texels.
    let p = (center_uv * size - 0.5).floor().clamp(Vec2::splat(-1.0), size);
    let (x0, y0) = (p.x as i64, p.y as i64);
    let clamp = |x: i64, y: i64| {
        (
            x.clamp(0, (level.width() as i64 - 1).max(0)),
            y.clamp(0, (level.height() as i64 - 1).max(0)),
        )
    };
    let (x1, y1) = (x0.saturating_add(1), y0.saturating_add(1));
    [clamp(x0, y0), clamp(x1, y0), clamp(x0, y1), clamp(x1, y1)]
}

/// Final decision from four linear occluder depths and the nearest possible
/// distance of the sphere. Strict comparison: an equal depth stays visible.
#[inline]
pub fn verdict(linear_samples: [f32; 4], min_dist_to_sphere: f32) -> Occlusion {
    if linear_samples.iter().all(|&d| d < min_dist_to_sphere) {
        Occlusion::Culled
    } else {
        Occlusion::Visible
    }
}

/// Occlusion tester for one camera/pyramid pair.
#[derive(Clone, Copy, Debug)]
pub struct Occluder<'a> {
    camera: &'a Camera,
    pyramid: &'a DepthPyramid,
    /// Level-0 texels per camera pixel (vertical).
    texel_scale: f32,
}

impl<'a> Occluder<'a> {
    pub fn new(camera: &'a Camera, pyramid: &'a DepthPyramid) -> Self {
        let (_, base_h) = pyramid.base_size();
        let texel_scale = if camera.resolution.0 > 0 && camera.resolution.1 > 0 {
            base_h as f32 / camera.resolution.1 as f32
        } else {
            0.0
        };
        Self {
            camera,
            pyramid,
            texel_scale,
        }
    }

    /// `false` when the pyramid cannot prove anything (empty, or a camera without viewport).
    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.pyramid.is_empty() && self.texel_scale > 0.0
    }

    pub fn test(&self, center: Vec3, radius: f32) -> Occlusion {
        if !self.is_ready() {
            return Occlusion::Visible;
        }

        let circle = self.camera.project_sphere(center, radius);
        if !(circle.radius > 0.0) {
            return Occlusion::Visible;
        }

        let level_index = select_level(circle.radius * self.texel_scale, self.pyramid.level_count());
        let Some(level) = self.pyramid.level(level_index) else {
            return Occlusion::Visible;
        };

        let (w, h) = self.camera.resolution;
        let center_uv = circle.center / Vec2::new(w as f32, h as f32);
        // Off-screen centers have no occluder data under them.
        if !(center_uv.cmpge(Vec2::ZERO).all() && center_uv.cmple(Vec2::ONE).all()) {
            return Occlusion::Visible;
        }
        let mut samples = [0.0; 4];
        for (sample, (x, y)) in samples.iter_mut().zip(probe_texels(center_uv, level)) {
            let Some(depth) = level.fetch_clamped(x, y) else {
                return Occlusion::Visible;
            };
            *sample = self.camera.linear_depth(depth);
        }

        let min_dist = self.camera.view_space(center).length() - radius;
        verdict(samples, min_dist)
    }
}

/// One-shot form of [`Occluder::test`].
pub fn test(center: Vec3, radius: f32, camera: &Camera, pyramid: &DepthPyramid) -> Occlusion {
    Occluder::new(camera, pyramid).test(center, radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn camera() -> Camera {
        Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, FRAC_PI_2, (64, 64), 0.1, 100.0)
    }

    /// Occluder depth buffer with everything at linear distance `dist`.
    fn wall_at(cam: &Camera, dist: f32) -> DepthPyramid {
        DepthPyramid::build(DepthImage::filled(64, 64, cam.device_depth(dist)))
    }

    #[test]
    fn level_selection_formula() {
        assert_eq!(select_level(0.25, 7), 0);
        assert_eq!(select_level(1.0, 7), 1);
        assert_eq!(select_level(3.0, 7), 3);
        assert_eq!(select_level(4.0, 7), 3);
        assert_eq!(select_level(5.0, 7), 4);
        assert_eq!(select_level(1000.0, 7), 5);
        assert_eq!(select_level(1000.0, 1), 0);
        assert_eq!(select_level(0.0, 7), 0);
    }

    #[test]
    fn equal_depth_is_visible() {
        assert_eq!(verdict([2.0; 4], 2.0), Occlusion::Visible);
        assert_eq!(verdict([1.999; 4], 2.0), Occlusion::Culled);
    }

    #[test]
    fn one_far_probe_keeps_sphere_visible() {
        assert_eq!(verdict([1.0, 1.0, 1.0, 5.0], 2.0), Occlusion::Visible);
        assert_eq!(verdict([5.0, 1.0, 1.0, 1.0], 2.0), Occlusion::Visible);
    }

    #[test]
    fn sphere_behind_wall_is_culled() {
        let cam = camera();
        let pyramid = wall_at(&cam, 5.0);
        assert_eq!(test(Vec3::new(0.0, 0.0, -20.0), 1.0, &cam, &pyramid), Occlusion::Culled);
    }

    #[test]
    fn sphere_in_front_of_wall_is_visible() {
        let cam = camera();
        let pyramid = wall_at(&cam, 30.0);
        assert_eq!(test(Vec3::new(0.0, 0.0, -20.0), 1.0, &cam, &pyramid), Occlusion::Visible);
    }

    #[test]
    fn sphere_reaching_through_wall_is_visible() {
        let cam = camera();
        let pyramid = wall_at(&cam, 10.0);
        // nearest point at distance 9, wall at 10
        assert_eq!(test(Vec3::new(0.0, 0.0, -12.0), 3.0, &cam, &pyramid), Occlusion::Visible);
    }

    #[test]
    fn hole_under_one_probe_prevents_culling() {
        let cam = camera();
        let mut base = DepthImage::filled(64, 64, cam.device_depth(5.0));
        // far background showing through at the center texel only
        base.set(31, 31, 1.0);
        let pyramid = DepthPyramid::build(base);
        // tiny sphere stays at level 0 where the probes straddle (31..32, 31..32)
        assert_eq!(test(Vec3::new(0.0, 0.0, -50.0), 0.01, &cam, &pyramid), Occlusion::Visible);
    }

    #[test]
    fn fails_open_without_pyramid() {
        let cam = camera();
        let empty = DepthPyramid::empty();
        let occluder = Occluder::new(&cam, &empty);
        assert!(!occluder.is_ready());
        assert_eq!(occluder.test(Vec3::new(0.0, 0.0, -20.0), 1.0), Occlusion::Visible);
    }

    #[test]
    fn probes_clamp_far_outside_coordinates() {
        let level = DepthImage::filled(8, 4, 1.0);
        let corner = probe_texels(Vec2::new(f32::INFINITY, 1e30), &level);
        assert!(corner.iter().all(|&p| p == (7, 3)));
        let origin = probe_texels(Vec2::new(-1e30, f32::NEG_INFINITY), &level);
        assert!(origin.iter().all(|&p| p == (0, 0)));
        let empty = probe_texels(Vec2::splat(0.5), &DepthImage::filled(0, 0, 1.0));
        assert!(empty.iter().all(|&p| p == (0, 0)));
    }

    #[test]
    fn zero_width_viewport_fails_open() {
        let cam = Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, FRAC_PI_2, (0, 64), 0.1, 100.0);
        let pyramid = wall_at(&camera(), 5.0);
        assert!(!Occluder::new(&cam, &pyramid).is_ready());
        assert_eq!(test(Vec3::new(0.5, 0.0, -10.0), 0.5, &cam, &pyramid), Occlusion::Visible);
    }

    #[test]
    fn far_off_screen_grain_does_not_overflow() {
        let cam = camera();
        let pyramid = wall_at(&cam, 30.0);
        assert_eq!(test(Vec3::new(1e19, 0.0, -1.0), 0.007, &cam, &pyramid), Occlusion::Visible);
    }

    /// Wall over the left half of a `size x size` buffer, far plane elsewhere.
    fn left_wall(cam: &Camera, size: u32) -> DepthPyramid {
        let mut base = DepthImage::filled(size, size, 1.0);
        for y in 0..size {
            for x in 0..size / 2 {
                base.set(x, y, cam.device_depth(5.0));
            }
        }
        DepthPyramid::build(base)
    }

    #[test]
    fn half_resolution_pyramid_agrees_with_full() {
        let cam = camera();
        let full = left_wall(&cam, 64);
        let half = left_wall(&cam, 32);
        assert_eq!(Occluder::new(&cam, &half).texel_scale, 0.5);

        let behind_wall = (Vec3::new(-10.0, 0.0, -20.0), 1.0);
        let open_side = (Vec3::new(10.0, 0.0, -20.0), 1.0);
        let before_wall = (Vec3::new(-2.0, 0.0, -4.0), 0.5);
        for (center, radius) in [behind_wall, open_side, before_wall] {
            assert_eq!(
                test(center, radius, &cam, &half),
                test(center, radius, &cam, &full),
                "sphere at {center} r={radius}"
            );
        }
        assert_eq!(test(behind_wall.0, behind_wall.1, &cam, &half), Occlusion::Culled);
        assert_eq!(test(open_side.0, open_side.1, &cam, &half), Occlusion::Visible);
        assert_eq!(test(before_wall.0, before_wall.1, &cam, &half), Occlusion::Visible);
    }

    #[test]
    fn degenerate_spheres_are_visible() {
        let cam = camera();
        let pyramid = wall_at(&cam, 1.0);
        // behind the camera
        assert_eq!(test(Vec3::new(0.0, 0.0, 20.0), 1.0, &cam, &pyramid), Occlusion::Visible);
        // zero radius
        assert_eq!(test(Vec3::new(0.0, 0.0, -20.0), 0.0, &cam, &pyramid), Occlusion::Visible);
    }
}
