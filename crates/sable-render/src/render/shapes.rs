//! CPU-side shape tessellation.
//!
//! Every emitter produces a triangle-list vertex run for one primitive.
//! Quads wind clockwise in top-left-origin screen space; the camera's Y
//! flip keeps that the front-facing order on both backends.

use crate::batch::BatchVertex;
use crate::coords::{ColorRgba, Rect, Vec2};

#[inline]
fn v(pos: Vec2, uv: Vec2, color: ColorRgba) -> BatchVertex {
    BatchVertex { pos, uv, color }
}

/// Axis-aligned quad with the given UV rect: two triangles, six vertices.
pub(crate) fn quad(out: &mut Vec<BatchVertex>, rect: Rect, uv: Rect, color: ColorRgba) {
    let r = rect.normalized();
    if r.is_empty() {
        return;
    }
    let (p0, p1) = (r.min(), r.max());
    let (t0, t1) = (uv.min(), uv.max());

    let tl = v(p0, t0, color);
    let tr = v(Vec2::new(p1.x, p0.y), Vec2::new(t1.x, t0.y), color);
    let br = v(p1, t1, color);
    let bl = v(Vec2::new(p0.x, p1.y), Vec2::new(t0.x, t1.y), color);

    out.extend_from_slice(&[tl, tr, br, tl, br, bl]);
}

/// Line segment extruded to `thickness` along its normal.
/// Zero-length or zero-thickness lines emit nothing.
pub(crate) fn line(
    out: &mut Vec<BatchVertex>,
    a: Vec2,
    b: Vec2,
    thickness: f32,
    color: ColorRgba,
) {
    if thickness <= 0.0 {
        return;
    }
    let dir = (b - a).normalized_or_zero();
    if dir == Vec2::zero() {
        return;
    }
    let n = dir.perp() * (thickness * 0.5);

    let tl = v(a - n, Vec2::new(0.0, 0.0), color);
    let tr = v(b - n, Vec2::new(1.0, 0.0), color);
    let br = v(b + n, Vec2::new(1.0, 1.0), color);
    let bl = v(a + n, Vec2::new(0.0, 1.0), color);

    out.extend_from_slice(&[tl, tr, br, tl, br, bl]);
}

/// Circle as a triangle fan flattened to a list: three vertices per
/// segment. UVs map the bounding square so textured shaders stay usable.
pub(crate) fn circle(
    out: &mut Vec<BatchVertex>,
    center: Vec2,
    radius: f32,
    color: ColorRgba,
    segments: u32,
) {
    if radius <= 0.0 || segments < 3 {
        return;
    }
    let center_v = v(center, Vec2::new(0.5, 0.5), color);
    let point = |i: u32| {
        let angle = (i % segments) as f32 / segments as f32 * std::f32::consts::TAU;
        let (sin, cos) = angle.sin_cos();
        v(
            Vec2::new(center.x + radius * cos, center.y + radius * sin),
            Vec2::new(0.5 + 0.5 * cos, 0.5 + 0.5 * sin),
            color,
        )
    };
    for i in 0..segments {
        out.push(center_v);
        out.push(point(i));
        out.push(point(i + 1));
    }
}

/// Segment count for a circle of `radius`, clamped to a sane range.
#[inline]
pub(crate) fn circle_segments(radius: f32) -> u32 {
    ((radius.abs().sqrt() * 6.0) as u32).clamp(12, 128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_emits_two_triangles() {
        let mut out = Vec::new();
        quad(
            &mut out,
            Rect::new(10.0, 20.0, 30.0, 40.0),
            Rect::unit(),
            ColorRgba::white(),
        );
        assert_eq!(out.len(), 6);
        assert_eq!(out[0].pos, Vec2::new(10.0, 20.0));
        assert_eq!(out[2].pos, Vec2::new(40.0, 60.0));
        assert_eq!(out[0].uv, Vec2::new(0.0, 0.0));
        assert_eq!(out[2].uv, Vec2::new(1.0, 1.0));
    }

    #[test]
    fn empty_quad_emits_nothing() {
        let mut out = Vec::new();
        quad(&mut out, Rect::new(0.0, 0.0, 0.0, 10.0), Rect::unit(), ColorRgba::white());
        assert!(out.is_empty());
    }

    #[test]
    fn line_extrudes_perpendicular() {
        let mut out = Vec::new();
        line(&mut out, Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.0), 4.0, ColorRgba::white());
        assert_eq!(out.len(), 6);
        // Horizontal line: extrusion is vertical, half-thickness each way.
        assert_eq!(out[0].pos, Vec2::new(0.0, -2.0));
        assert_eq!(out[5].pos, Vec2::new(0.0, 2.0));
    }

    #[test]
    fn degenerate_line_emits_nothing() {
        let mut out = Vec::new();
        line(&mut out, Vec2::new(5.0, 5.0), Vec2::new(5.0, 5.0), 4.0, ColorRgba::white());
        assert!(out.is_empty());
        line(&mut out, Vec2::zero(), Vec2::new(1.0, 0.0), 0.0, ColorRgba::white());
        assert!(out.is_empty());
    }

    #[test]
    fn circle_emits_three_vertices_per_segment() {
        let mut out = Vec::new();
        circle(&mut out, Vec2::new(50.0, 50.0), 25.0, ColorRgba::white(), 16);
        assert_eq!(out.len(), 48);
    }

    #[test]
    fn circle_closes_exactly() {
        let mut out = Vec::new();
        circle(&mut out, Vec2::zero(), 10.0, ColorRgba::white(), 8);
        // The last triangle's trailing edge returns to the first perimeter
        // point bit-for-bit, so the fan has no seam.
        assert_eq!(out[1].pos, out[out.len() - 1].pos);
    }

    #[test]
    fn circle_segment_count_is_clamped() {
        assert_eq!(circle_segments(0.5), 12);
        assert_eq!(circle_segments(1.0e6), 128);
    }
}
