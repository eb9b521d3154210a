//! The drawing surface.
//!
//! [`Renderer`] is the explicitly passed context object: it owns the boxed
//! backend, the CPU shader table, the batching engine, the white shapes
//! texture and the text system. One thread, one owner — concurrent use is
//! prevented by ownership, not locks.
//!
//! Drawing primitives append vertices to the batcher; state setters
//! (shader, camera, scissor) and texture switches decide batch boundaries.
//! `present()` flushes whatever is pending, so nothing queued is ever
//! dropped at frame end.

mod shapes;

use anyhow::{Context as _, Result};
use slotmap::SlotMap;

use crate::backend::RenderBackend;
#[cfg(windows)]
use crate::backend::d3d11::D3d11Backend;
use crate::backend::gl::GlBackend;
use crate::batch::{BatchVertex, Batcher, DEFAULT_BATCH_CAPACITY};
use crate::coords::{Camera, ColorRgba, Rect, Vec2, Viewport};
use crate::format::PixelFormat;
use crate::handle::{ShaderHandle, TextureHandle};
use crate::shader::Shader;
use crate::text::{FontId, FontLoadError, TextSystem};

/// Construction parameters beyond the window size.
#[derive(Debug, Clone)]
pub struct RendererInit {
    /// Capacity of the shared CPU/GPU vertex buffer in bytes.
    pub batch_capacity: usize,
    /// Edge length of the square glyph atlas texture.
    pub atlas_size: u32,
}

impl Default for RendererInit {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            atlas_size: 1024,
        }
    }
}

/// A texture as the application sees it: dimensions plus the backend
/// handle. Plain value, cheap to copy; the GPU memory lives in the backend.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Texture {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// The 2D drawing surface over a [`RenderBackend`].
pub struct Renderer {
    backend: Box<dyn RenderBackend>,
    shaders: SlotMap<ShaderHandle, Shader>,
    batcher: Batcher,
    text: TextSystem,

    default_shader: ShaderHandle,
    /// Opaque white texture; shapes draw through it so shape and textured
    /// quad rendering share one code path (and one batch, state permitting).
    white: Texture,

    /// Reusable tessellation scratch, overwritten per primitive.
    scratch: Vec<BatchVertex>,
}

impl Renderer {
    /// Renderer over an OpenGL context reachable through `loader`
    /// (the windowing collaborator owns context creation and buffer swaps).
    pub fn new_gl(
        loader: impl FnMut(&str) -> *const std::ffi::c_void,
        width: u32,
        height: u32,
        init: RendererInit,
    ) -> Result<Self> {
        let backend = GlBackend::new(loader, width, height, init.batch_capacity)?;
        Self::with_backend(Box::new(backend), init)
    }

    /// Renderer over a Direct3D11 swapchain bound to `window`.
    #[cfg(windows)]
    pub fn new_d3d11(
        window: &impl raw_window_handle::HasWindowHandle,
        width: u32,
        height: u32,
        init: RendererInit,
    ) -> Result<Self> {
        let backend = D3d11Backend::new(window, width, height, init.batch_capacity)?;
        Self::with_backend(Box::new(backend), init)
    }

    pub(crate) fn with_backend(
        mut backend: Box<dyn RenderBackend>,
        init: RendererInit,
    ) -> Result<Self> {
        let (vs, fs) = backend.default_shader_sources();
        let (gpu, desc) = backend
            .load_shader(vs, fs, None)
            .context("compile default shader")?;
        let mut shaders = SlotMap::with_key();
        let default_shader = shaders.insert(Shader::from_desc(gpu, desc));

        let white_handle = backend
            .load_texture(2, 2, PixelFormat::Rgba8Norm, &[0xFF; 16])
            .context("create white shapes texture")?;
        let white = Texture {
            handle: white_handle,
            width: 2,
            height: 2,
            format: PixelFormat::Rgba8Norm,
        };

        let text = TextSystem::new(backend.as_mut(), init.atlas_size)
            .context("create glyph atlas")?;

        let viewport = Viewport::new(
            backend.swapchain_width() as f32,
            backend.swapchain_height() as f32,
        );
        let mut batcher = Batcher::new(init.batch_capacity, backend.flip_z(), viewport);
        batcher.set_shader(backend.as_mut(), &mut shaders, default_shader);
        batcher.set_texture(backend.as_mut(), &mut shaders, white.handle);

        Ok(Self {
            backend,
            shaders,
            batcher,
            text,
            default_shader,
            white,
            scratch: Vec::new(),
        })
    }

    // ── frame control ─────────────────────────────────────────────────────

    /// Flushes any pending batch (so submission order is preserved), then
    /// clears the framebuffer color and depth.
    pub fn clear(&mut self, color: ColorRgba) {
        self.batcher.flush(self.backend.as_mut(), &mut self.shaders);
        self.backend.clear(color);
    }

    /// Flushes the pending batch and presents the frame. Frame-scoped
    /// state (depth counter) resets here; buffer allocations persist.
    pub fn present(&mut self) {
        self.batcher.flush(self.backend.as_mut(), &mut self.shaders);
        self.backend.present();
        self.batcher.reset_frame();
    }

    /// Reacts to a window resize reported by the collaborator.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.batcher.flush(self.backend.as_mut(), &mut self.shaders);
        self.backend.resize_swapchain(width, height);
        self.batcher.set_viewport(Viewport::new(
            self.backend.swapchain_width() as f32,
            self.backend.swapchain_height() as f32,
        ));
    }

    pub fn surface_width(&self) -> u32 {
        self.backend.swapchain_width()
    }

    pub fn surface_height(&self) -> u32 {
        self.backend.swapchain_height()
    }

    // ── render state ──────────────────────────────────────────────────────

    /// Makes `shader` active for subsequent draws; flushes the pending
    /// batch when this is a change.
    pub fn set_shader(&mut self, shader: ShaderHandle) {
        if !self.shaders.contains_key(shader) {
            log::warn!("set_shader: unknown shader handle, keeping current");
            return;
        }
        self.batcher
            .set_shader(self.backend.as_mut(), &mut self.shaders, shader);
    }

    /// Resets to the built-in default shader.
    pub fn set_default_shader(&mut self) {
        self.batcher
            .set_shader(self.backend.as_mut(), &mut self.shaders, self.default_shader);
    }

    pub fn default_shader(&self) -> ShaderHandle {
        self.default_shader
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.batcher
            .set_camera(self.backend.as_mut(), &mut self.shaders, camera);
    }

    pub fn camera(&self) -> Camera {
        self.batcher.camera()
    }

    /// Restricts rendering to `clip` (logical pixels); `None` disables
    /// clipping. A change flushes the pending batch.
    pub fn set_scissor(&mut self, clip: Option<Rect>) {
        self.batcher
            .set_scissor(self.backend.as_mut(), &mut self.shaders, clip);
    }

    pub fn scissor(&self) -> Option<Rect> {
        self.batcher.scissor()
    }

    // ── shaders ───────────────────────────────────────────────────────────

    /// Compiles and reflects a shader from backend-appropriate source.
    /// Compile errors are logged with the compiler diagnostic and returned
    /// as `Err` — non-fatal, check the result.
    pub fn load_shader(
        &mut self,
        vertex_src: &str,
        fragment_src: &str,
        layout_override: Option<&[PixelFormat]>,
    ) -> Result<ShaderHandle> {
        let (gpu, desc) = self
            .backend
            .load_shader(vertex_src, fragment_src, layout_override)?;
        Ok(self.shaders.insert(Shader::from_desc(gpu, desc)))
    }

    /// Destroys a shader. A stale handle logs an error and no-ops; the
    /// table's subsequent allocations are unaffected. Destroying the
    /// active shader flushes the pending batch and falls back to the
    /// default shader.
    pub fn destroy_shader(&mut self, shader: ShaderHandle) {
        if !self.shaders.contains_key(shader) {
            log::error!("destroy_shader: unknown or already-destroyed handle");
            return;
        }
        if shader == self.batcher.active_shader() {
            self.batcher.flush(self.backend.as_mut(), &mut self.shaders);
            self.batcher
                .set_shader(self.backend.as_mut(), &mut self.shaders, self.default_shader);
        }
        if let Some(cpu) = self.shaders.remove(shader) {
            self.backend.destroy_shader(cpu.gpu_handle());
        }
    }

    /// Writes a named constant's bytes into the shader's shadow buffer;
    /// they upload at the next flush that uses the shader. Does not force
    /// a flush — constants are not batch state.
    pub fn set_constant(&mut self, shader: ShaderHandle, name: &str, bytes: &[u8]) -> bool {
        match self.shaders.get_mut(shader) {
            Some(s) => s.set_constant(name, bytes),
            None => {
                log::warn!("set_constant: unknown shader handle");
                false
            }
        }
    }

    /// Forces a constant value for a named vertex input on every vertex of
    /// subsequent draws with this shader. See
    /// [`Shader::set_input_override`] for the aliasing contract.
    pub fn set_input_override(
        &mut self,
        shader: ShaderHandle,
        name: &str,
        bytes: &[u8],
    ) -> bool {
        match self.shaders.get_mut(shader) {
            Some(s) => s.set_input_override(name, bytes),
            None => {
                log::warn!("set_input_override: unknown shader handle");
                false
            }
        }
    }

    pub fn clear_input_override(&mut self, shader: ShaderHandle, name: &str) -> bool {
        match self.shaders.get_mut(shader) {
            Some(s) => s.clear_input_override(name),
            None => false,
        }
    }

    // ── textures ──────────────────────────────────────────────────────────

    /// GPU storage with undefined contents, for dynamically updated data.
    pub fn create_texture(&mut self, width: u32, height: u32, format: PixelFormat)
    -> Result<Texture> {
        let handle = self.backend.create_texture(width, height, format)?;
        Ok(Texture { handle, width, height, format })
    }

    /// Uploads `pixels` (tight rows, `format.size() * width * height`
    /// bytes) into a new texture.
    pub fn load_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
    ) -> Result<Texture> {
        let handle = self.backend.load_texture(width, height, format, pixels)?;
        Ok(Texture { handle, width, height, format })
    }

    /// Replaces a sub-rectangle of `texture`. Stale handles log and
    /// return false.
    pub fn update_texture(
        &mut self,
        texture: Texture,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> bool {
        self.backend
            .update_texture(texture.handle, x, y, width, height, pixels)
    }

    /// Destroys a texture. Stale handles log and return false.
    pub fn destroy_texture(&mut self, texture: Texture) -> bool {
        if texture.handle == self.batcher.active_texture() {
            self.batcher.flush(self.backend.as_mut(), &mut self.shaders);
            self.batcher
                .set_texture(self.backend.as_mut(), &mut self.shaders, self.white.handle);
        }
        self.backend.destroy_texture(texture.handle)
    }

    /// The opaque white texture shapes are drawn with.
    pub fn shapes_texture(&self) -> Texture {
        self.white
    }

    // ── fonts ─────────────────────────────────────────────────────────────

    pub fn load_font(&mut self, bytes: &[u8]) -> Result<FontId, FontLoadError> {
        self.text.fonts.load_font(bytes)
    }

    pub fn measure_text(
        &self,
        text: &str,
        font: FontId,
        size: f32,
        max_width: Option<f32>,
    ) -> Vec2 {
        self.text.fonts.measure_text(text, font, size, max_width)
    }

    // ── drawing primitives ────────────────────────────────────────────────

    /// Filled axis-aligned rectangle.
    pub fn draw_rect(&mut self, rect: Rect, color: ColorRgba) {
        self.scratch.clear();
        shapes::quad(&mut self.scratch, rect, Rect::unit(), color);
        self.push_with_texture(self.white.handle);
    }

    /// Line segment with `thickness` in logical pixels.
    pub fn draw_line(&mut self, a: Vec2, b: Vec2, thickness: f32, color: ColorRgba) {
        self.scratch.clear();
        shapes::line(&mut self.scratch, a, b, thickness, color);
        self.push_with_texture(self.white.handle);
    }

    /// Filled circle; segment count scales with the radius.
    pub fn draw_circle(&mut self, center: Vec2, radius: f32, color: ColorRgba) {
        self.scratch.clear();
        shapes::circle(
            &mut self.scratch,
            center,
            radius,
            color,
            shapes::circle_segments(radius),
        );
        self.push_with_texture(self.white.handle);
    }

    /// Textured quad over the texture's full UV range, tinted by `tint`.
    pub fn draw_texture(&mut self, texture: Texture, rect: Rect, tint: ColorRgba) {
        self.draw_texture_region(texture, rect, Rect::unit(), tint);
    }

    /// Textured quad sampling `uv` (normalized coordinates).
    pub fn draw_texture_region(
        &mut self,
        texture: Texture,
        rect: Rect,
        uv: Rect,
        tint: ColorRgba,
    ) {
        self.scratch.clear();
        shapes::quad(&mut self.scratch, rect, uv, tint);
        self.push_with_texture(texture.handle);
    }

    /// Text at `origin` (top-left of the layout box), one textured quad
    /// per glyph against the glyph atlas.
    pub fn draw_text(
        &mut self,
        font: FontId,
        text: &str,
        origin: Vec2,
        px_size: f32,
        color: ColorRgba,
    ) {
        let atlas = self.text.atlas_texture();
        self.batcher
            .set_texture(self.backend.as_mut(), &mut self.shaders, atlas);

        let quads =
            self.text
                .layout_glyphs(self.backend.as_mut(), font, text, origin, px_size, None);
        for q in quads {
            let glyph = [
                BatchVertex { pos: q.min, uv: q.uv_min, color },
                BatchVertex {
                    pos: Vec2::new(q.max.x, q.min.y),
                    uv: Vec2::new(q.uv_max.x, q.uv_min.y),
                    color,
                },
                BatchVertex { pos: q.max, uv: q.uv_max, color },
                BatchVertex { pos: q.min, uv: q.uv_min, color },
                BatchVertex { pos: q.max, uv: q.uv_max, color },
                BatchVertex {
                    pos: Vec2::new(q.min.x, q.max.y),
                    uv: Vec2::new(q.uv_min.x, q.uv_max.y),
                    color,
                },
            ];
            self.batcher
                .push_primitive(self.backend.as_mut(), &mut self.shaders, &glyph);
        }
    }

    fn push_with_texture(&mut self, texture: TextureHandle) {
        if self.scratch.is_empty() {
            return;
        }
        self.batcher
            .set_texture(self.backend.as_mut(), &mut self.shaders, texture);
        self.batcher
            .push_primitive(self.backend.as_mut(), &mut self.shaders, &self.scratch);
    }

    #[cfg(test)]
    pub(crate) fn recording(&mut self) -> &mut crate::backend::testing::RecordingBackend {
        self.backend
            .as_recording()
            .expect("test renderer is not backed by RecordingBackend")
    }
}
