//! Vertex batching engine.
//!
//! Primitives accumulate into one fixed-capacity CPU buffer for as long as
//! they share GPU state; a flush (one backend draw call) happens only when
//! the shader, texture, camera or scissor changes, when the next primitive
//! would overflow the buffer, or at `present()`. The buffer allocation
//! persists across frames — it is frame-scoped scratch, reset (not freed)
//! once per present.
//!
//! Vertex construction: every vertex is zero-filled across the active
//! shader's full stride, builtin fields (position + depth, uv, color) are
//! written, then per-input override bytes are copied in. An override that
//! aliases a builtin's byte range is caller error; only that order is
//! promised.
//!
//! Depth: each primitive gets a monotonically advancing depth so later
//! submissions render on top within a frame. The sign of start and step
//! follows the backend's `flip_z`, which keeps painter's order
//! backend-invariant.

use slotmap::SlotMap;

use crate::backend::RenderBackend;
use crate::coords::{Camera, ColorRgba, Rect, Vec2, Viewport};
use crate::handle::{ShaderHandle, TextureHandle};
use crate::shader::{BuiltinSlot, Shader};

/// Default capacity of the shared CPU vertex buffer in bytes.
pub const DEFAULT_BATCH_CAPACITY: usize = 256 * 1024;

/// Depth assigned to the first primitive of a frame.
pub const DEPTH_START: f32 = 1.0 / 65536.0;

/// Depth distance between consecutive primitives. Frames with more than
/// ~65k primitives exhaust the [0, 1) range and are out of contract.
pub const DEPTH_STEP: f32 = 1.0 / 65536.0;

/// Depth of primitive `index` (0-based) within a frame.
#[inline]
pub(crate) fn primitive_depth(index: u32, flip_z: bool) -> f32 {
    let d = DEPTH_START + index as f32 * DEPTH_STEP;
    if flip_z { -d } else { d }
}

/// One corner of a primitive, before expansion to the shader's stride.
#[derive(Debug, Copy, Clone)]
pub struct BatchVertex {
    pub pos: Vec2,
    pub uv: Vec2,
    pub color: ColorRgba,
}

/// Accumulates vertices for the active shader/texture/camera/scissor
/// combination and decides when to flush.
pub struct Batcher {
    buf: Vec<u8>,
    capacity: usize,

    shader: ShaderHandle,
    texture: TextureHandle,
    camera: Camera,
    scissor: Option<Rect>,
    viewport: Viewport,

    flip_z: bool,
    primitives: u32,
}

impl Batcher {
    pub fn new(capacity: usize, flip_z: bool, viewport: Viewport) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            shader: ShaderHandle::default(),
            texture: TextureHandle::default(),
            camera: Camera::screen_space(viewport),
            scissor: None,
            viewport,
            flip_z,
            primitives: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn camera(&self) -> Camera {
        self.camera
    }

    #[inline]
    pub fn scissor(&self) -> Option<Rect> {
        self.scissor
    }

    #[inline]
    pub fn active_shader(&self) -> ShaderHandle {
        self.shader
    }

    #[inline]
    pub fn active_texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    // ── state changes (each may force a flush) ────────────────────────────

    pub fn set_shader(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &mut SlotMap<ShaderHandle, Shader>,
        shader: ShaderHandle,
    ) {
        if shader != self.shader {
            self.flush(backend, shaders);
            self.shader = shader;
        }
    }

    pub fn set_texture(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &mut SlotMap<ShaderHandle, Shader>,
        texture: TextureHandle,
    ) {
        if texture != self.texture {
            self.flush(backend, shaders);
            self.texture = texture;
        }
    }

    pub fn set_camera(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &mut SlotMap<ShaderHandle, Shader>,
        camera: Camera,
    ) {
        if camera != self.camera {
            self.flush(backend, shaders);
            self.camera = camera;
        }
    }

    pub fn set_scissor(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &mut SlotMap<ShaderHandle, Shader>,
        scissor: Option<Rect>,
    ) {
        if scissor != self.scissor {
            self.flush(backend, shaders);
            self.scissor = scissor;
        }
    }

    // ── appending ─────────────────────────────────────────────────────────

    /// Appends one primitive (a triangle-list vertex run sharing one depth
    /// value). Flushes first if the vertices would overflow the buffer;
    /// exactly filling it does not flush until the next primitive arrives.
    pub fn push_primitive(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &mut SlotMap<ShaderHandle, Shader>,
        vertices: &[BatchVertex],
    ) {
        let Some(shader) = shaders.get(self.shader) else {
            log::error!("push_primitive: no active shader, dropping primitive");
            return;
        };
        let stride = shader.stride();
        if stride == 0 {
            return;
        }
        let bytes = vertices.len() * stride;
        if bytes > self.capacity {
            log::error!(
                "push_primitive: primitive needs {bytes} bytes, buffer holds {}; dropping",
                self.capacity
            );
            return;
        }
        if self.buf.len() + bytes > self.capacity {
            self.flush(backend, shaders);
        }

        // Re-borrow after the flush; the handle cannot have gone away since
        // the check above.
        let Some(shader) = shaders.get(self.shader) else { return };
        let depth = primitive_depth(self.primitives, self.flip_z);
        self.primitives += 1;

        let start = self.buf.len();
        self.buf.resize(start + bytes, 0);
        for (i, v) in vertices.iter().enumerate() {
            let base = start + i * stride;
            if let Some(off) = shader.builtin_offset(BuiltinSlot::Position) {
                write_f32s(&mut self.buf, base + off, &[v.pos.x, v.pos.y, depth]);
            }
            if let Some(off) = shader.builtin_offset(BuiltinSlot::Uv) {
                write_f32s(&mut self.buf, base + off, &[v.uv.x, v.uv.y]);
            }
            if let Some(off) = shader.builtin_offset(BuiltinSlot::Color) {
                write_f32s(&mut self.buf, base + off, &v.color.to_array());
            }
            for index in 0..shader.inputs().len() {
                if let Some(value) = shader.override_bytes(index) {
                    let off = base + shader.input_offset(index);
                    self.buf[off..off + value.len()].copy_from_slice(value);
                }
            }
        }
    }

    // ── flushing ──────────────────────────────────────────────────────────

    /// Submits the pending batch to the backend and resets the buffer.
    /// No-op when nothing is pending.
    pub fn flush(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &mut SlotMap<ShaderHandle, Shader>,
    ) {
        if self.buf.is_empty() {
            return;
        }
        let Some(shader) = shaders.get_mut(self.shader) else {
            log::error!("flush: active shader vanished, dropping batch");
            self.buf.clear();
            return;
        };
        if shader.has_mvp() {
            shader.write_mvp(self.camera.view_projection(self.viewport, self.flip_z));
        }
        backend.draw(shader, self.texture, self.scissor, &self.buf);
        self.buf.clear();
    }

    /// Frame boundary: depth restarts from [`DEPTH_START`]. The buffer
    /// allocation is retained.
    pub fn reset_frame(&mut self) {
        self.primitives = 0;
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

#[inline]
fn write_f32s(buf: &mut [u8], offset: usize, values: &[f32]) {
    for (i, v) in values.iter().enumerate() {
        let o = offset + i * 4;
        buf[o..o + 4].copy_from_slice(&v.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use crate::format::PixelFormat;
    use crate::shader::{InputKind, Shader, ShaderInput};

    const VP: Viewport = Viewport::new(800.0, 600.0);
    const STRIDE: usize = 24;

    struct Rig {
        backend: RecordingBackend,
        shaders: SlotMap<ShaderHandle, Shader>,
        batcher: Batcher,
    }

    fn rig_with(capacity: usize, flip_z: bool) -> Rig {
        let mut backend = RecordingBackend::new(800, 600).with_flip_z(flip_z);
        let mut shaders = SlotMap::with_key();
        let (gpu, desc) = backend.load_shader("", "", None).unwrap();
        let handle = shaders.insert(Shader::from_desc(gpu, desc));
        let mut batcher = Batcher::new(capacity, flip_z, VP);
        batcher.set_shader(&mut backend, &mut shaders, handle);
        Rig { backend, shaders, batcher }
    }

    fn rig() -> Rig {
        rig_with(DEFAULT_BATCH_CAPACITY, false)
    }

    fn quad() -> Vec<BatchVertex> {
        let v = |x: f32, y: f32| BatchVertex {
            pos: Vec2::new(x, y),
            uv: Vec2::zero(),
            color: ColorRgba::white(),
        };
        vec![
            v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0),
            v(0.0, 0.0), v(1.0, 1.0), v(0.0, 1.0),
        ]
    }

    fn texture(rig: &mut Rig) -> TextureHandle {
        rig.backend.create_texture(1, 1, PixelFormat::Rgba8Norm).unwrap()
    }

    fn vertex_depth(buf: &[u8], vertex: usize) -> f32 {
        // Position builtin sits at offset 0; depth is its third float.
        let o = vertex * STRIDE + 8;
        f32::from_ne_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]])
    }

    // ── capacity ──────────────────────────────────────────────────────────

    #[test]
    fn exactly_filling_the_buffer_does_not_flush() {
        let mut r = rig_with(STRIDE * 6, false);
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        assert_eq!(r.backend.draws.len(), 0);
        assert_eq!(r.batcher.used_bytes(), STRIDE * 6);
    }

    #[test]
    fn overflowing_primitive_triggers_exactly_one_flush() {
        let mut r = rig_with(STRIDE * 6, false);
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        // One flush carrying the whole first quad; the second sits whole in
        // the buffer — no partial vertex anywhere.
        assert_eq!(r.backend.draws.len(), 1);
        assert_eq!(r.backend.draws[0].vertex_bytes, STRIDE * 6);
        assert_eq!(r.batcher.used_bytes(), STRIDE * 6);
    }

    #[test]
    fn oversized_primitive_is_dropped() {
        let mut r = rig_with(STRIDE * 3, false);
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        assert_eq!(r.backend.draws.len(), 0);
        assert_eq!(r.batcher.used_bytes(), 0);
    }

    // ── state-change flushes ──────────────────────────────────────────────

    #[test]
    fn texture_changes_flush_at_each_transition() {
        let mut r = rig();
        let a = texture(&mut r);
        let b = texture(&mut r);

        for tex in [a, a, b, a] {
            r.batcher.set_texture(&mut r.backend, &mut r.shaders, tex);
            r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        }
        r.batcher.flush(&mut r.backend, &mut r.shaders);

        let textures: Vec<_> = r.backend.draws.iter().map(|d| d.texture).collect();
        assert_eq!(textures, vec![a, b, a]);
        // A, A coalesced into the first batch.
        assert_eq!(r.backend.draws[0].vertex_count, 12);
        assert_eq!(r.backend.draws[1].vertex_count, 6);
        assert_eq!(r.backend.draws[2].vertex_count, 6);
    }

    #[test]
    fn camera_change_flushes() {
        let mut r = rig();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        let mut cam = r.batcher.camera();
        cam.zoom = 2.0;
        r.batcher.set_camera(&mut r.backend, &mut r.shaders, cam);
        assert_eq!(r.backend.draws.len(), 1);
    }

    #[test]
    fn scissor_change_flushes() {
        let mut r = rig();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        let clip = Some(Rect::new(0.0, 0.0, 10.0, 10.0));
        r.batcher.set_scissor(&mut r.backend, &mut r.shaders, clip);
        assert_eq!(r.backend.draws.len(), 1);
        // The pending batch flushed with the *old* scissor; the new one
        // belongs to the next batch.
        assert_eq!(r.backend.draws[0].scissor, None);
        assert_eq!(r.batcher.scissor(), clip);
    }

    #[test]
    fn redundant_state_does_not_flush() {
        let mut r = rig();
        let a = texture(&mut r);
        r.batcher.set_texture(&mut r.backend, &mut r.shaders, a);
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        r.batcher.set_texture(&mut r.backend, &mut r.shaders, a);
        r.batcher.set_camera(&mut r.backend, &mut r.shaders, r.batcher.camera());
        r.batcher.set_scissor(&mut r.backend, &mut r.shaders, None);
        assert_eq!(r.backend.draws.len(), 0);
    }

    // ── depth ─────────────────────────────────────────────────────────────

    #[test]
    fn consecutive_primitives_step_depth_by_exactly_one_increment() {
        let mut r = rig();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        let buf = r.batcher.buffer();
        let d0 = vertex_depth(buf, 0);
        let d1 = vertex_depth(buf, 6);
        assert_eq!(d0, DEPTH_START);
        assert_eq!(d1 - d0, DEPTH_STEP);
    }

    #[test]
    fn flip_z_negates_depth_start_and_step() {
        let mut r = rig_with(DEFAULT_BATCH_CAPACITY, true);
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        let buf = r.batcher.buffer();
        assert_eq!(vertex_depth(buf, 0), -DEPTH_START);
        assert_eq!(vertex_depth(buf, 6) - vertex_depth(buf, 0), -DEPTH_STEP);
    }

    #[test]
    fn depth_resets_at_frame_boundary() {
        let mut r = rig();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        r.batcher.flush(&mut r.backend, &mut r.shaders);
        r.batcher.reset_frame();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        assert_eq!(vertex_depth(r.batcher.buffer(), 0), DEPTH_START);
    }

    // ── vertex construction ───────────────────────────────────────────────

    #[test]
    fn undeclared_bytes_default_to_zero_and_overrides_apply() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut desc = RecordingBackend::default_desc();
        desc.inputs.push(ShaderInput {
            name: "glow".to_string(),
            register: 3,
            kind: InputKind::Scalar,
            format: PixelFormat::R32Float,
        });
        backend.next_desc = Some(desc);

        let mut shaders = SlotMap::with_key();
        let (gpu, desc) = backend.load_shader("", "", None).unwrap();
        let handle = shaders.insert(Shader::from_desc(gpu, desc));
        let mut batcher = Batcher::new(DEFAULT_BATCH_CAPACITY, false, VP);
        batcher.set_shader(&mut backend, &mut shaders, handle);

        let stride = 28;
        batcher.push_primitive(&mut backend, &mut shaders, &quad());
        // No override set: the extra input's bytes stay zero.
        assert_eq!(&batcher.buffer()[24..28], &[0u8; 4]);

        shaders[handle].set_input_override("glow", &2.5f32.to_ne_bytes());
        batcher.push_primitive(&mut backend, &mut shaders, &quad());
        let second = &batcher.buffer()[6 * stride..];
        assert_eq!(&second[24..28], &2.5f32.to_ne_bytes());
    }

    #[test]
    fn mvp_is_written_before_flush() {
        let mut r = rig();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        r.batcher.flush(&mut r.backend, &mut r.shaders);

        let handle = r.batcher.active_shader();
        let expected = r
            .batcher
            .camera()
            .view_projection(VP, false)
            .to_cols_array();
        let shadow = r.shaders[handle].block_shadow(0);
        let expected_bytes: &[u8] = bytemuck::cast_slice(&expected);
        assert_eq!(shadow, expected_bytes);
    }

    // ── flush edge cases ──────────────────────────────────────────────────

    #[test]
    fn empty_flush_is_a_no_op() {
        let mut r = rig();
        r.batcher.flush(&mut r.backend, &mut r.shaders);
        assert_eq!(r.backend.draws.len(), 0);
    }

    #[test]
    fn missing_shader_drops_batch_without_panicking() {
        let mut r = rig();
        r.batcher.push_primitive(&mut r.backend, &mut r.shaders, &quad());
        let handle = r.batcher.active_shader();
        r.shaders.remove(handle);
        r.batcher.flush(&mut r.backend, &mut r.shaders);
        assert_eq!(r.backend.draws.len(), 0);
        assert_eq!(r.batcher.used_bytes(), 0);
    }
}
