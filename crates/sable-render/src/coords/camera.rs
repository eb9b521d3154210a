use glam::{Mat4, Vec3};

use super::{Vec2, Viewport};

/// 2D camera: the world point at the screen center, plus a uniform zoom.
///
/// `zoom` is screen pixels per world unit; it must be non-zero for the
/// world/screen mappings to be invertible.
///
/// The camera also owns the clip-space conversion. Depth direction is
/// backend-specific (see `RenderBackend::flip_z`), so
/// [`Camera::view_projection`] builds a different orthographic projection per
/// convention while the XY mapping stays identical.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Camera {
    pub center: Vec2,
    pub zoom: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self { center: Vec2::zero(), zoom: 1.0 }
    }
}

impl Camera {
    #[inline]
    pub const fn new(center: Vec2, zoom: f32) -> Self {
        Self { center, zoom }
    }

    /// Camera under which world coordinates equal screen pixels
    /// (top-left origin) for the given viewport.
    #[inline]
    pub fn screen_space(viewport: Viewport) -> Self {
        Self::new(Vec2::new(viewport.width * 0.5, viewport.height * 0.5), 1.0)
    }

    #[inline]
    pub fn world_to_screen(&self, p: Vec2, viewport: Viewport) -> Vec2 {
        let half = Vec2::new(viewport.width * 0.5, viewport.height * 0.5);
        (p - self.center) * self.zoom + half
    }

    #[inline]
    pub fn screen_to_world(&self, s: Vec2, viewport: Viewport) -> Vec2 {
        let half = Vec2::new(viewport.width * 0.5, viewport.height * 0.5);
        (s - half) / self.zoom + self.center
    }

    /// View matrix: world → screen pixels, leaving z untouched.
    pub fn view(&self, viewport: Viewport) -> Mat4 {
        let half = Vec2::new(viewport.width * 0.5, viewport.height * 0.5);
        Mat4::from_translation(Vec3::new(half.x, half.y, 0.0))
            * Mat4::from_scale(Vec3::new(self.zoom, self.zoom, 1.0))
            * Mat4::from_translation(Vec3::new(-self.center.x, -self.center.y, 0.0))
    }

    /// Projection × view for the backend's depth convention.
    ///
    /// - `flip_z == false` (D3D11): the batcher emits ascending z in [0, 1);
    ///   depth-buffer values ascend with it (GREATER_EQUAL test, clear 0.0).
    /// - `flip_z == true` (GL): the batcher emits descending z in (-1, 0];
    ///   the projection maps that range so depth-buffer values descend
    ///   (LEQUAL test, clear 1.0).
    ///
    /// Both conventions make later-submitted primitives win the depth test.
    pub fn view_projection(&self, viewport: Viewport, flip_z: bool) -> Mat4 {
        let w = viewport.width.max(1.0);
        let h = viewport.height.max(1.0);
        let proj = if flip_z {
            Mat4::orthographic_rh_gl(0.0, w, h, 0.0, 1.0, 0.0)
        } else {
            Mat4::orthographic_lh(0.0, w, h, 0.0, 0.0, 1.0)
        };
        proj * self.view(viewport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VP: Viewport = Viewport::new(800.0, 600.0);

    #[test]
    fn screen_space_camera_is_identity() {
        let cam = Camera::screen_space(VP);
        let p = Vec2::new(123.0, 456.0);
        assert_eq!(cam.world_to_screen(p, VP), p);
        assert_eq!(cam.screen_to_world(p, VP), p);
    }

    #[test]
    fn world_screen_round_trip() {
        let cam = Camera::new(Vec2::new(-40.0, 25.0), 2.5);
        let p = Vec2::new(17.0, -3.0);
        let back = cam.screen_to_world(cam.world_to_screen(p, VP), VP);
        assert!((back.x - p.x).abs() < 1e-4);
        assert!((back.y - p.y).abs() < 1e-4);
    }

    #[test]
    fn screen_round_trip_through_world() {
        let cam = Camera::new(Vec2::new(10.0, 10.0), 0.5);
        let s = Vec2::new(400.0, 300.0);
        let back = cam.world_to_screen(cam.screen_to_world(s, VP), VP);
        assert!((back.x - s.x).abs() < 1e-4);
        assert!((back.y - s.y).abs() < 1e-4);
    }

    #[test]
    fn view_projection_maps_screen_corners_to_clip_corners() {
        let cam = Camera::screen_space(VP);
        for flip_z in [false, true] {
            let vp = cam.view_projection(VP, flip_z);
            let tl = vp.project_point3(Vec3::new(0.0, 0.0, 0.0));
            let br = vp.project_point3(Vec3::new(VP.width, VP.height, 0.0));
            assert!((tl.x + 1.0).abs() < 1e-5 && (tl.y - 1.0).abs() < 1e-5);
            assert!((br.x - 1.0).abs() < 1e-5 && (br.y + 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn depth_direction_matches_convention() {
        let cam = Camera::screen_space(VP);

        // D3D11: ascending world z → ascending NDC z in [0, 1].
        let vp = cam.view_projection(VP, false);
        let a = vp.project_point3(Vec3::new(0.0, 0.0, 0.25)).z;
        let b = vp.project_point3(Vec3::new(0.0, 0.0, 0.50)).z;
        assert!(b > a);

        // GL: descending negative world z → descending NDC z.
        let vp = cam.view_projection(VP, true);
        let a = vp.project_point3(Vec3::new(0.0, 0.0, -0.25)).z;
        let b = vp.project_point3(Vec3::new(0.0, 0.0, -0.50)).z;
        assert!(b < a);
    }
}
