//! Render backend abstraction.
//!
//! [`RenderBackend`] is the contract every GPU backend implements: texture
//! lifecycle, shader compile + reflect, draw submission, swapchain
//! present/resize. The renderer talks to a `Box<dyn RenderBackend>` chosen
//! at construction time; nothing above this trait knows which API is
//! underneath.
//!
//! Lifecycle is linear and enforced by ownership: a backend that exists is
//! ready (constructors fail instead of producing a half-initialized value),
//! and dropping it releases every GPU resource in reverse-dependency order —
//! including the clean case where nothing was ever created.
//!
//! Conventions shared by all backends:
//! - vertex data is a raw byte stream whose stride comes from the active
//!   [`Shader`]; primitives are triangle lists;
//! - draws referencing an unknown/stale handle log and no-op so the rest of
//!   the frame survives;
//! - the depth direction differs per API; [`RenderBackend::flip_z`] tells
//!   the batcher which sign to count in so painter's order holds everywhere.

use anyhow::Result;

use crate::coords::{ColorRgba, Rect};
use crate::format::PixelFormat;
use crate::handle::{BackendShaderHandle, TextureHandle};
use crate::shader::{Shader, ShaderDesc};

pub mod gl;
#[cfg(windows)]
pub mod d3d11;

pub use gl::GlBackend;
#[cfg(windows)]
pub use d3d11::D3d11Backend;

/// Contract every GPU backend satisfies.
pub trait RenderBackend {
    /// Current swapchain width in pixels.
    fn swapchain_width(&self) -> u32;

    /// Current swapchain height in pixels.
    fn swapchain_height(&self) -> u32;

    /// Whether this backend's depth convention runs opposite to the
    /// default. The batcher negates its depth start/step when true, so
    /// "later draws appear on top" is backend-invariant.
    fn flip_z(&self) -> bool;

    /// Clears the current framebuffer color and depth. The depth clear
    /// value is backend-specific and pairs with `flip_z`.
    fn clear(&mut self, color: ColorRgba);

    /// Presents the frame. D3D11 flips the swapchain synchronized to at
    /// least one vertical blank; GL flushes and leaves the buffer swap to
    /// the windowing collaborator that owns the context.
    fn present(&mut self);

    /// Rebuilds size-dependent swapchain state at the new dimensions.
    fn resize_swapchain(&mut self, width: u32, height: u32);

    /// Submits one batch: uploads `vertices` into the shared GPU vertex
    /// buffer, uploads every constant block's shadow bytes, binds scissor
    /// (full framebuffer when `None`) and texture (unknown handles sample
    /// default/undefined data), and draws
    /// `vertices.len() / shader.stride()` vertices as a triangle list.
    ///
    /// Empty `vertices` is a no-op. An unknown shader handle logs and
    /// no-ops; subsequent batches continue. `vertices` never exceeds the
    /// capacity configured at construction — the batcher guarantees it.
    fn draw(
        &mut self,
        shader: &Shader,
        texture: TextureHandle,
        scissor: Option<Rect>,
        vertices: &[u8],
    );

    /// Allocates GPU storage with undefined contents (dynamically updated
    /// atlases and similar).
    fn create_texture(&mut self, width: u32, height: u32, format: PixelFormat)
    -> Result<TextureHandle>;

    /// Allocates and uploads initial pixel data. `pixels` is tight-row,
    /// `format.size() * width * height` bytes.
    fn load_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
    ) -> Result<TextureHandle>;

    /// Replaces a sub-rectangle. Returns false (logged) on an unknown
    /// handle or out-of-bounds rectangle.
    fn update_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> bool;

    /// Releases the texture. Unknown handle logs and returns false.
    fn destroy_texture(&mut self, handle: TextureHandle) -> bool;

    /// Compiles both stages from backend-appropriate source text, reflects
    /// the result into a [`ShaderDesc`], and builds the GPU-side layout and
    /// constant buffers. `layout_override`, when given, must match the
    /// reflected input count and replaces the auto-inferred per-input
    /// formats. A failed compile of either stage logs the compiler
    /// diagnostic and returns `Err` — non-fatal, the caller must check.
    fn load_shader(
        &mut self,
        vertex_src: &str,
        fragment_src: &str,
        layout_override: Option<&[PixelFormat]>,
    ) -> Result<(BackendShaderHandle, ShaderDesc)>;

    /// Releases the shader's GPU objects. Unknown handle logs and no-ops.
    fn destroy_shader(&mut self, handle: BackendShaderHandle);

    /// This backend's built-in default vertex/fragment source pair.
    fn default_shader_sources(&self) -> (&'static str, &'static str);

    #[cfg(test)]
    fn as_recording(&mut self) -> Option<&mut testing::RecordingBackend> {
        None
    }
}

/// Converts a logical clip rect to physical scissor arguments
/// (top-left origin), clamped to the framebuffer.
///
/// `None` clip means "no scissor" and returns the full framebuffer rect.
/// Returns `None` when the resolved rect is zero-area — callers skip the
/// draw call entirely.
pub(crate) fn scissor_to_px(
    clip: Option<Rect>,
    fb_width: u32,
    fb_height: u32,
) -> Option<(u32, u32, u32, u32)> {
    let (x, y, w, h) = match clip {
        None => (0, 0, fb_width, fb_height),
        Some(r) => {
            let r = r.normalized();
            let x = (r.origin.x.max(0.0) as u32).min(fb_width);
            let y = (r.origin.y.max(0.0) as u32).min(fb_height);
            let x2 = (r.max().x.max(0.0) as u32).min(fb_width);
            let y2 = (r.max().y.max(0.0) as u32).min(fb_height);
            (x, y, x2.saturating_sub(x), y2.saturating_sub(y))
        }
    };

    if w == 0 || h == 0 { None } else { Some((x, y, w, h)) }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A backend double that records draw submissions, for exercising the
    //! batching and renderer layers without a GPU.

    use slotmap::SlotMap;

    use super::*;
    use crate::shader::{ConstantBlockDesc, InputKind, ShaderConstantDesc, ShaderInput};

    /// One recorded `draw` call.
    #[derive(Debug, Clone)]
    pub struct DrawRecord {
        pub shader: BackendShaderHandle,
        pub texture: TextureHandle,
        pub scissor: Option<Rect>,
        pub vertex_bytes: usize,
        pub vertex_count: usize,
    }

    pub struct RecordingBackend {
        width: u32,
        height: u32,
        flip_z: bool,
        textures: SlotMap<TextureHandle, ()>,
        shaders: SlotMap<BackendShaderHandle, ()>,
        pub draws: Vec<DrawRecord>,
        pub presents: usize,
        pub clears: usize,
        pub texture_updates: Vec<(TextureHandle, u32, u32, u32, u32)>,
        /// Reflection result handed out by the next `load_shader`.
        pub next_desc: Option<ShaderDesc>,
    }

    impl RecordingBackend {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                flip_z: false,
                textures: SlotMap::with_key(),
                shaders: SlotMap::with_key(),
                draws: Vec::new(),
                presents: 0,
                clears: 0,
                texture_updates: Vec::new(),
                next_desc: None,
            }
        }

        pub fn with_flip_z(mut self, flip_z: bool) -> Self {
            self.flip_z = flip_z;
            self
        }

        /// The reflection a real backend produces for the default shader.
        pub fn default_desc() -> ShaderDesc {
            let input = |name: &str, register: u32, kind: InputKind| ShaderInput {
                name: name.to_string(),
                register,
                kind,
                format: PixelFormat::float_vector(kind.components()),
            };
            ShaderDesc {
                inputs: vec![
                    input("position", 0, InputKind::Vec3),
                    input("texcoord", 1, InputKind::Vec2),
                    input("color", 2, InputKind::Vec4),
                ],
                blocks: vec![ConstantBlockDesc {
                    name: "mvp".to_string(),
                    size: 64,
                    constants: vec![ShaderConstantDesc {
                        name: "mvp".to_string(),
                        size: 64,
                        offset: 0,
                    }],
                }],
            }
        }
    }

    impl RenderBackend for RecordingBackend {
        fn swapchain_width(&self) -> u32 {
            self.width
        }

        fn swapchain_height(&self) -> u32 {
            self.height
        }

        fn flip_z(&self) -> bool {
            self.flip_z
        }

        fn clear(&mut self, _color: ColorRgba) {
            self.clears += 1;
        }

        fn present(&mut self) {
            self.presents += 1;
        }

        fn resize_swapchain(&mut self, width: u32, height: u32) {
            self.width = width;
            self.height = height;
        }

        fn draw(
            &mut self,
            shader: &Shader,
            texture: TextureHandle,
            scissor: Option<Rect>,
            vertices: &[u8],
        ) {
            if vertices.is_empty() {
                return;
            }
            if !self.shaders.contains_key(shader.gpu_handle()) {
                return;
            }
            let stride = shader.stride().max(1);
            self.draws.push(DrawRecord {
                shader: shader.gpu_handle(),
                texture,
                scissor,
                vertex_bytes: vertices.len(),
                vertex_count: vertices.len() / stride,
            });
        }

        fn create_texture(
            &mut self,
            _width: u32,
            _height: u32,
            _format: PixelFormat,
        ) -> Result<TextureHandle> {
            Ok(self.textures.insert(()))
        }

        fn load_texture(
            &mut self,
            width: u32,
            height: u32,
            format: PixelFormat,
            _pixels: &[u8],
        ) -> Result<TextureHandle> {
            self.create_texture(width, height, format)
        }

        fn update_texture(
            &mut self,
            handle: TextureHandle,
            x: u32,
            y: u32,
            width: u32,
            height: u32,
            _pixels: &[u8],
        ) -> bool {
            if !self.textures.contains_key(handle) {
                return false;
            }
            self.texture_updates.push((handle, x, y, width, height));
            true
        }

        fn destroy_texture(&mut self, handle: TextureHandle) -> bool {
            self.textures.remove(handle).is_some()
        }

        fn load_shader(
            &mut self,
            _vertex_src: &str,
            _fragment_src: &str,
            layout_override: Option<&[PixelFormat]>,
        ) -> Result<(BackendShaderHandle, ShaderDesc)> {
            let mut desc = self.next_desc.take().unwrap_or_else(Self::default_desc);
            if let Some(formats) = layout_override {
                anyhow::ensure!(formats.len() == desc.inputs.len(), "layout override length");
                for (input, &fmt) in desc.inputs.iter_mut().zip(formats) {
                    input.format = fmt;
                }
            }
            Ok((self.shaders.insert(()), desc))
        }

        fn destroy_shader(&mut self, handle: BackendShaderHandle) {
            self.shaders.remove(handle);
        }

        fn default_shader_sources(&self) -> (&'static str, &'static str) {
            ("", "")
        }

        fn as_recording(&mut self) -> Option<&mut RecordingBackend> {
            Some(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scissor_none_is_full_framebuffer() {
        assert_eq!(scissor_to_px(None, 800, 600), Some((0, 0, 800, 600)));
    }

    #[test]
    fn scissor_clamps_to_framebuffer() {
        let clip = Rect::new(-10.0, 550.0, 100.0, 100.0);
        assert_eq!(scissor_to_px(Some(clip), 800, 600), Some((0, 550, 90, 50)));
    }

    #[test]
    fn scissor_zero_area_returns_none() {
        assert_eq!(scissor_to_px(Some(Rect::new(0.0, 0.0, 0.0, 10.0)), 800, 600), None);
        assert_eq!(scissor_to_px(Some(Rect::new(900.0, 0.0, 10.0, 10.0)), 800, 600), None);
    }
}
