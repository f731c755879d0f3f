// src/camera.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Perspective camera as seen by the culling stages.
///
/// Depth follows the wgpu convention: device depth 0 at the near plane, 1 at
/// the far plane (`Mat4::perspective_rh`).
#[derive(Clone, Debug)]
pub struct Camera {
    pub position: Vec3,
    pub view: Mat4,
    pub proj: Mat4,
    /// Vertical field-of-view (radians).
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
    /// Viewport size in pixels.
    pub resolution: (u32, u32),
}

/// Screen-space circle circumscribing a projected sphere, in pixels.
/// Origin is the top-left corner of the viewport, y grows downwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenCircle {
    pub center: Vec2,
    pub radius: f32,
}

impl ScreenCircle {
    pub const EMPTY: ScreenCircle = ScreenCircle {
        center: Vec2::ZERO,
        radius: 0.0,
    };
}

impl Camera {
    /// Camera at `position` looking at `target` (right-handed, Y up).
    pub fn look_at(
        position: Vec3,
        target: Vec3,
        fov_y: f32,
        resolution: (u32, u32),
        near: f32,
        far: f32,
    ) -> Self {
        let aspect = resolution.0.max(1) as f32 / resolution.1.max(1) as f32;
        Self {
            position,
            view: Mat4::look_at_rh(position, target, Vec3::Y),
            proj: Mat4::perspective_rh(fov_y, aspect, near, far),
            fov_y,
            near,
            far,
            resolution,
        }
    }

    /// Camera from position + yaw/pitch (radians), same convention as a free-fly controller.
    pub fn from_yaw_pitch(
        position: Vec3,
        yaw: f32,
        pitch: f32,
        fov_y: f32,
        resolution: (u32, u32),
        near: f32,
        far: f32,
    ) -> Self {
        let (sin_yaw, cos_yaw) = yaw.sin_cos();
        let (sin_pitch, cos_pitch) = pitch.sin_cos();
        let forward = Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw).normalize_or_zero();
        Self::look_at(position, position + forward, fov_y, resolution, near, far)
    }

    /// Combined view-projection matrix.
    #[inline]
    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }

    /// Ratio between a view-space extent at unit distance and the viewport height.
    #[inline]
    pub fn focal_length(&self) -> f32 {
        1.0 / (2.0 * (self.fov_y * 0.5).tan())
    }

    #[inline]
    pub fn view_space(&self, world: Vec3) -> Vec3 {
        self.view.transform_point3(world)
    }

    #[inline]
    pub fn distance_to(&self, world: Vec3) -> f32 {
        self.position.distance(world)
    }

    /// Convert a device depth value in `[0, 1]` to a linear view distance.
    #[inline]
    pub fn linear_depth(&self, device_depth: f32) -> f32 {
        (self.near * self.far) / (self.far - device_depth * (self.far - self.near))
    }

    /// Inverse of [`Camera::linear_depth`].
    #[inline]
    pub fn device_depth(&self, linear_depth: f32) -> f32 {
        (self.far * (linear_depth - self.near)) / (linear_depth * (self.far - self.near))
    }

    /// Project a world-space sphere to the circle that circumscribes its
    /// silhouette on screen.
    ///
    /// Returns [`ScreenCircle::EMPTY`] when the sphere is behind the camera or
    /// the camera is inside it; callers treat a zero radius as "cannot test".
    pub fn project_sphere(&self, center: Vec3, radius: f32) -> ScreenCircle {
        let o = self.view_space(center);
        let r2 = radius * radius;
        let oz2 = o.z * o.z;

        // Camera looks down -Z in view space.
        if o.z >= 0.0 || oz2 - r2 <= 0.0 || radius <= 0.0 {
            return ScreenCircle::EMPTY;
        }

        let fl = self.focal_length();
        let fp = fl * fl * r2 * (o.length_squared() - r2) / (oz2 - r2);
        let outer_radius = (fp / (r2 - oz2)).abs().sqrt();
        let circle_center = Vec2::new(o.x, o.y) * o.z * fl / (oz2 - r2);

        let (w, h) = (self.resolution.0 as f32, self.resolution.1 as f32);
        ScreenCircle {
            center: circle_center * h * Vec2::new(-1.0, 1.0) + Vec2::new(w, h) * 0.5,
            radius: outer_radius * h,
        }
    }

    /// Six normalised frustum planes `(normal, distance)`: left, right, bottom, top, near, far.
    pub fn frustum_planes(&self) -> [Vec4; 6] {
        extract_frustum_planes(&self.view_proj())
    }
}

/// Extract planes from a view-projection matrix (Gribb-Hartmann, depth in `[0, 1]`).
pub fn extract_frustum_planes(vp: &Mat4) -> [Vec4; 6] {
    let r0 = vp.row(0);
    let r1 = vp.row(1);
    let r2 = vp.row(2);
    let r3 = vp.row(3);

    fn normalize(p: Vec4) -> Vec4 {
        let len = p.truncate().length().max(1e-6);
        p / len
    }

    [
        normalize(r3 + r0),
        normalize(r3 - r0),
        normalize(r3 + r1),
        normalize(r3 - r1),
        normalize(r2),
        normalize(r3 - r2),
    ]
}

/// Conservative sphere-in-frustum test: `false` only when the sphere is fully
/// outside one of the planes.
pub fn sphere_in_frustum(center: Vec3, radius: f32, planes: &[Vec4; 6]) -> bool {
    planes
        .iter()
        .all(|p| p.truncate().dot(center) + p.w >= -radius)
}

/// GPU camera uniform (matches the WGSL `Camera` struct).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CameraUniform {
    /// Column-major matrices.
    pub view: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub frustum_planes: [[f32; 4]; 6],
    pub position: [f32; 3],
    pub focal_length: f32,
    pub resolution: [f32; 2],
    pub near: f32,
    pub far: f32,
}

impl CameraUniform {
    pub fn from_camera(camera: &Camera) -> Self {
        let planes = camera.frustum_planes();
        Self {
            view: camera.view.to_cols_array_2d(),
            view_proj: camera.view_proj().to_cols_array_2d(),
            frustum_planes: planes.map(|p| p.to_array()),
            position: camera.position.to_array(),
            focal_length: camera.focal_length(),
            resolution: [camera.resolution.0 as f32, camera.resolution.1 as f32],
            near: camera.near,
            far: camera.far,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn test_camera() -> Camera {
        Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, FRAC_PI_2, (800, 600), 0.1, 100.0)
    }

    #[test]
    fn sphere_straight_ahead_projects_to_viewport_center() {
        let cam = test_camera();
        let circle = cam.project_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0);
        assert!((circle.center - Vec2::new(400.0, 300.0)).length() < 1e-3);
        // r / z * focal * height = 0.1 * 0.5 * 600, slightly more for the circumscribing circle
        assert!(circle.radius > 30.0 && circle.radius < 31.0, "{}", circle.radius);
    }

    #[test]
    fn projection_orientation_matches_texture_space() {
        let cam = test_camera();
        let right = cam.project_sphere(Vec3::new(5.0, 0.0, -10.0), 0.5);
        let up = cam.project_sphere(Vec3::new(0.0, 5.0, -10.0), 0.5);
        assert!(right.center.x > 400.0);
        assert!(up.center.y < 300.0);
    }

    #[test]
    fn spheres_behind_or_around_camera_have_no_circle() {
        let cam = test_camera();
        assert_eq!(cam.project_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0).radius, 0.0);
        assert_eq!(cam.project_sphere(Vec3::new(0.0, 0.0, -0.5), 1.0).radius, 0.0);
        assert_eq!(cam.project_sphere(Vec3::new(0.0, 0.0, -5.0), 0.0).radius, 0.0);
    }

    #[test]
    fn linear_depth_inverts_projection() {
        let cam = test_camera();
        assert!((cam.linear_depth(0.0) - 0.1).abs() < 1e-5);
        assert!((cam.linear_depth(1.0) - 100.0).abs() < 1e-2);

        let clip = cam.proj * Vec4::new(0.0, 0.0, -7.0, 1.0);
        let ndc_z = clip.z / clip.w;
        assert!((cam.linear_depth(ndc_z) - 7.0).abs() < 1e-3);
        assert!((cam.device_depth(7.0) - ndc_z).abs() < 1e-5);
    }

    #[test]
    fn frustum_rejects_only_outside_spheres() {
        let cam = test_camera();
        let planes = cam.frustum_planes();
        assert!(sphere_in_frustum(Vec3::new(0.0, 0.0, -10.0), 1.0, &planes));
        assert!(!sphere_in_frustum(Vec3::new(0.0, 0.0, 10.0), 1.0, &planes));
        assert!(!sphere_in_frustum(Vec3::new(0.0, 0.0, -200.0), 1.0, &planes));
        // straddling the left plane stays in
        assert!(sphere_in_frustum(Vec3::new(-13.8, 0.0, -10.0), 1.0, &planes));
        assert!(!sphere_in_frustum(Vec3::new(-30.0, 0.0, -10.0), 1.0, &planes));
    }

    #[test]
    fn camera_uniform_layout() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 64 + 64 + 96 + 16 + 16);
        assert_eq!(std::mem::size_of::<CameraUniform>() % 16, 0);
    }
}
