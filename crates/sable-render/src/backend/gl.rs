//! OpenGL backend over `glow`.
//!
//! The backend wraps a GL context created by the windowing collaborator (it
//! receives the symbol loader, never creates a context itself). Reflection
//! uses GL program introspection: active attributes become the vertex
//! inputs, and each active non-sampler uniform becomes a single-member
//! constant block — the loose-uniform equivalent of a cbuffer.
//!
//! Depth convention: clear 1.0 with `LEQUAL`, so the batcher counts depth
//! *down* (`flip_z() == true`) and later primitives win the test.

use anyhow::{Context as _, Result, anyhow, bail, ensure};
use glow::HasContext;
use slotmap::SlotMap;

use crate::coords::{ColorRgba, Rect};
use crate::format::PixelFormat;
use crate::handle::{BackendShaderHandle, TextureHandle};
use crate::shader::{
    ConstantBlockDesc, InputKind, Shader, ShaderConstantDesc, ShaderDesc, ShaderInput,
};

use super::{RenderBackend, scissor_to_px};

pub const DEFAULT_VERTEX_SRC: &str = include_str!("shaders/default.vert.glsl");
pub const DEFAULT_FRAGMENT_SRC: &str = include_str!("shaders/default.frag.glsl");

struct GlTexture {
    tex: glow::Texture,
    width: u32,
    height: u32,
    format: PixelFormat,
}

struct GlConstant {
    location: glow::UniformLocation,
    utype: u32,
    size: usize,
}

struct GlShader {
    program: glow::Program,
    vao: glow::VertexArray,
    /// One entry per constant block, in [`ShaderDesc`] block order.
    constants: Vec<GlConstant>,
}

/// OpenGL 3.3+ implementation of [`RenderBackend`].
pub struct GlBackend {
    gl: glow::Context,
    width: u32,
    height: u32,
    vbo: glow::Buffer,
    vbo_capacity: usize,
    textures: SlotMap<TextureHandle, GlTexture>,
    shaders: SlotMap<BackendShaderHandle, GlShader>,
}

impl GlBackend {
    /// Wraps the GL context reachable through `loader` and installs the
    /// default pipeline state (scissor + depth test on, src-over blending,
    /// back-face culling, tight unpack rows).
    ///
    /// `vertex_capacity` sizes the shared dynamic vertex buffer; the
    /// batching layer never submits more bytes than this in one draw.
    ///
    /// Fails when the context is older than GL 3.3 — there is no fallback
    /// path, callers should treat the error as fatal.
    pub fn new(
        mut loader: impl FnMut(&str) -> *const std::ffi::c_void,
        width: u32,
        height: u32,
        vertex_capacity: usize,
    ) -> Result<Self> {
        let gl = unsafe { glow::Context::from_loader_function(|s| loader(s)) };

        let version = gl.version();
        ensure!(
            version.major > 3 || (version.major == 3 && version.minor >= 3),
            "OpenGL 3.3+ required, context reports {}.{}",
            version.major,
            version.minor
        );
        log::info!(
            "GL backend: {}.{}{}",
            version.major,
            version.minor,
            if version.is_embedded { " ES" } else { "" }
        );

        let vbo = unsafe {
            gl.enable(glow::SCISSOR_TEST);
            gl.enable(glow::DEPTH_TEST);
            gl.depth_func(glow::LEQUAL);
            gl.enable(glow::BLEND);
            gl.blend_func_separate(
                glow::SRC_ALPHA,
                glow::ONE_MINUS_SRC_ALPHA,
                glow::ONE,
                glow::ONE_MINUS_SRC_ALPHA,
            );
            gl.enable(glow::CULL_FACE);
            gl.cull_face(glow::BACK);
            // Geometry is wound clockwise in top-left-origin screen space;
            // the projection's Y flip keeps it clockwise in NDC.
            gl.front_face(glow::CW);
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);

            let vbo = gl
                .create_buffer()
                .map_err(|e| anyhow!("create vertex buffer: {e}"))?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_size(glow::ARRAY_BUFFER, vertex_capacity as i32, glow::DYNAMIC_DRAW);
            vbo
        };

        let backend = Self {
            gl,
            width: width.max(1),
            height: height.max(1),
            vbo,
            vbo_capacity: vertex_capacity,
            textures: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
        };
        backend.check_gl_error("GlBackend::new");
        Ok(backend)
    }

    /// Logs any pending GL error, tagged with the originating call.
    /// Compiled out of release builds.
    fn check_gl_error(&self, call_site: &str) {
        if cfg!(debug_assertions) {
            let err = unsafe { self.gl.get_error() };
            if err != glow::NO_ERROR {
                log::error!("GL error {err:#06x} after {call_site}");
            }
        }
    }
}

impl RenderBackend for GlBackend {
    fn swapchain_width(&self) -> u32 {
        self.width
    }

    fn swapchain_height(&self) -> u32 {
        self.height
    }

    fn flip_z(&self) -> bool {
        true
    }

    fn clear(&mut self, color: ColorRgba) {
        unsafe {
            // GL scissors clears as well; this operation means the whole
            // framebuffer.
            self.gl.disable(glow::SCISSOR_TEST);
            self.gl.clear_color(color.r, color.g, color.b, color.a);
            self.gl.clear_depth_f64(1.0);
            self.gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
            self.gl.enable(glow::SCISSOR_TEST);
        }
    }

    /// Flushes pending GL commands. The buffer swap (and with it vsync via
    /// the swap interval) belongs to the windowing collaborator that owns
    /// the context.
    fn present(&mut self) {
        unsafe { self.gl.flush() };
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) {
        // The default framebuffer is resized by the context owner; we only
        // track the drawable size for viewport/scissor computation.
        self.width = width.max(1);
        self.height = height.max(1);
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
        let Some(res) = self.shaders.get(shader.gpu_handle()) else {
            log::error!("draw: unknown shader handle, dropping batch");
            return;
        };
        let stride = shader.stride();
        if stride == 0 || vertices.len() % stride != 0 {
            log::error!("draw: vertex bytes not a multiple of stride {stride}");
            return;
        }
        if vertices.len() > self.vbo_capacity {
            log::error!(
                "draw: {} vertex bytes exceed buffer capacity {}",
                vertices.len(),
                self.vbo_capacity
            );
            return;
        }
        let Some((sx, sy, sw, sh)) = scissor_to_px(scissor, self.width, self.height) else {
            return;
        };

        let gl = &self.gl;
        unsafe {
            gl.viewport(0, 0, self.width as i32, self.height as i32);
            gl.use_program(Some(res.program));

            // Upload every constant's shadow bytes through its uniform.
            let mut scratch = [0f32; 16];
            for (i, c) in res.constants.iter().enumerate() {
                if i >= shader.block_count() {
                    break;
                }
                let bytes = shader.block_shadow(i);
                if bytes.len() != c.size {
                    continue;
                }
                for (j, chunk) in bytes.chunks_exact(4).enumerate() {
                    scratch[j] = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                let floats = &scratch[..c.size / 4];
                let loc = Some(&c.location);
                match c.utype {
                    glow::FLOAT => gl.uniform_1_f32(loc, floats[0]),
                    glow::FLOAT_VEC2 => gl.uniform_2_f32_slice(loc, floats),
                    glow::FLOAT_VEC3 => gl.uniform_3_f32_slice(loc, floats),
                    glow::FLOAT_VEC4 => gl.uniform_4_f32_slice(loc, floats),
                    glow::FLOAT_MAT4 => gl.uniform_matrix_4_f32_slice(loc, false, floats),
                    _ => {}
                }
            }

            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            gl.buffer_sub_data_u8_slice(glow::ARRAY_BUFFER, 0, vertices);

            gl.active_texture(glow::TEXTURE0);
            match self.textures.get(texture) {
                Some(t) => gl.bind_texture(glow::TEXTURE_2D, Some(t.tex)),
                None => {
                    log::debug!("draw: texture handle did not resolve, sampling default data");
                    gl.bind_texture(glow::TEXTURE_2D, None);
                }
            }

            // GL scissor origin is bottom-left.
            let flipped_y = self.height.saturating_sub(sy + sh);
            gl.scissor(sx as i32, flipped_y as i32, sw as i32, sh as i32);

            gl.bind_vertex_array(Some(res.vao));
            gl.draw_arrays(glow::TRIANGLES, 0, (vertices.len() / stride) as i32);
            gl.bind_vertex_array(None);
        }
        self.check_gl_error("draw");
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<TextureHandle> {
        self.alloc_texture(width, height, format, None)
    }

    fn load_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
    ) -> Result<TextureHandle> {
        let expected = format.size() * width as usize * height as usize;
        ensure!(
            pixels.len() == expected,
            "load_texture: expected {expected} bytes for {width}x{height} {format:?}, got {}",
            pixels.len()
        );
        self.alloc_texture(width, height, format, Some(pixels))
    }

    fn update_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> bool {
        let Some(t) = self.textures.get(handle) else {
            log::error!("update_texture: unknown texture handle");
            return false;
        };
        if x + width > t.width || y + height > t.height {
            log::error!(
                "update_texture: rect {x},{y} {width}x{height} outside {}x{}",
                t.width,
                t.height
            );
            return false;
        }
        let expected = t.format.size() * width as usize * height as usize;
        if pixels.len() != expected {
            log::error!("update_texture: expected {expected} bytes, got {}", pixels.len());
            return false;
        }
        let Some((format, ty)) = gl_upload_format(t.format) else {
            return false;
        };
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(t.tex));
            self.gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                x as i32,
                y as i32,
                width as i32,
                height as i32,
                format,
                ty,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
        }
        self.check_gl_error("update_texture");
        true
    }

    fn destroy_texture(&mut self, handle: TextureHandle) -> bool {
        match self.textures.remove(handle) {
            Some(t) => {
                unsafe { self.gl.delete_texture(t.tex) };
                true
            }
            None => {
                log::error!("destroy_texture: unknown texture handle");
                false
            }
        }
    }

    fn load_shader(
        &mut self,
        vertex_src: &str,
        fragment_src: &str,
        layout_override: Option<&[PixelFormat]>,
    ) -> Result<(BackendShaderHandle, ShaderDesc)> {
        let gl = &self.gl;
        unsafe {
            let vs = compile_stage(gl, glow::VERTEX_SHADER, vertex_src, "vertex")?;
            let fs = match compile_stage(gl, glow::FRAGMENT_SHADER, fragment_src, "fragment") {
                Ok(fs) => fs,
                Err(e) => {
                    gl.delete_shader(vs);
                    return Err(e);
                }
            };

            let program = gl
                .create_program()
                .map_err(|e| anyhow!("create_program: {e}"))?;
            gl.attach_shader(program, vs);
            gl.attach_shader(program, fs);
            gl.link_program(program);
            gl.detach_shader(program, vs);
            gl.detach_shader(program, fs);
            gl.delete_shader(vs);
            gl.delete_shader(fs);
            if !gl.get_program_link_status(program) {
                let diag = gl.get_program_info_log(program);
                gl.delete_program(program);
                log::error!("shader program failed to link:\n{diag}");
                bail!("shader program link failed");
            }

            // ── vertex inputs: active attributes, location order ───────────
            let mut inputs = Vec::new();
            for i in 0..gl.get_active_attributes(program) {
                let Some(attr) = gl.get_active_attribute(program, i) else {
                    continue;
                };
                if attr.name.starts_with("gl_") {
                    continue;
                }
                let Some(kind) = attrib_kind(attr.atype) else {
                    log::warn!(
                        "load_shader: input `{}` has unsupported type {:#06x}, skipping",
                        attr.name,
                        attr.atype
                    );
                    continue;
                };
                let Some(location) = gl.get_attrib_location(program, &attr.name) else {
                    continue;
                };
                inputs.push(ShaderInput {
                    name: attr.name,
                    register: location,
                    kind,
                    format: PixelFormat::float_vector(kind.components()),
                });
            }
            inputs.sort_by_key(|input| input.register);

            if let Some(formats) = layout_override {
                if formats.len() != inputs.len() {
                    gl.delete_program(program);
                    bail!(
                        "layout override has {} formats for {} reflected inputs",
                        formats.len(),
                        inputs.len()
                    );
                }
                for (input, &fmt) in inputs.iter_mut().zip(formats) {
                    input.format = fmt;
                }
            }

            // ── constants: loose uniforms, one single-member block each ────
            gl.use_program(Some(program));
            let mut blocks = Vec::new();
            let mut constants = Vec::new();
            for i in 0..gl.get_active_uniforms(program) {
                let Some(u) = gl.get_active_uniform(program, i) else {
                    continue;
                };
                if u.utype == glow::SAMPLER_2D {
                    // All sampling goes through texture unit 0.
                    let loc = gl.get_uniform_location(program, &u.name);
                    gl.uniform_1_i32(loc.as_ref(), 0);
                    continue;
                }
                let Some(size) = uniform_size(u.utype) else {
                    log::warn!(
                        "load_shader: uniform `{}` has unsupported type {:#06x}, skipping",
                        u.name,
                        u.utype
                    );
                    continue;
                };
                if u.size != 1 {
                    log::warn!("load_shader: uniform array `{}` unsupported, skipping", u.name);
                    continue;
                }
                let Some(location) = gl.get_uniform_location(program, &u.name) else {
                    continue;
                };
                blocks.push(ConstantBlockDesc {
                    name: u.name.clone(),
                    size,
                    constants: vec![ShaderConstantDesc { name: u.name, size, offset: 0 }],
                });
                constants.push(GlConstant { location, utype: u.utype, size });
            }

            // ── VAO: tightly packed layout over the shared vertex buffer ───
            let vao = match gl.create_vertex_array() {
                Ok(vao) => vao,
                Err(e) => {
                    gl.delete_program(program);
                    return Err(anyhow!("create_vertex_array: {e}"));
                }
            };
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            let stride: usize = inputs.iter().map(|i| i.format.size()).sum();
            let mut offset = 0usize;
            for input in &inputs {
                let (comps, data_type, normalized) = vertex_attrib_params(input.format);
                gl.enable_vertex_attrib_array(input.register);
                gl.vertex_attrib_pointer_f32(
                    input.register,
                    comps as i32,
                    data_type,
                    normalized,
                    stride as i32,
                    offset as i32,
                );
                offset += input.format.size();
            }
            gl.bind_vertex_array(None);

            let handle = self.shaders.insert(GlShader {
                program,
                vao,
                constants,
            });
            self.check_gl_error("load_shader");
            Ok((handle, ShaderDesc { inputs, blocks }))
        }
    }

    fn destroy_shader(&mut self, handle: BackendShaderHandle) {
        match self.shaders.remove(handle) {
            Some(res) => unsafe {
                self.gl.delete_vertex_array(res.vao);
                self.gl.delete_program(res.program);
            },
            None => log::error!("destroy_shader: unknown shader handle"),
        }
    }

    fn default_shader_sources(&self) -> (&'static str, &'static str) {
        (DEFAULT_VERTEX_SRC, DEFAULT_FRAGMENT_SRC)
    }
}

impl Drop for GlBackend {
    fn drop(&mut self) {
        unsafe {
            for (_, res) in self.shaders.drain() {
                self.gl.delete_vertex_array(res.vao);
                self.gl.delete_program(res.program);
            }
            for (_, t) in self.textures.drain() {
                self.gl.delete_texture(t.tex);
            }
            self.gl.delete_buffer(self.vbo);
        }
    }
}

// ── helpers ───────────────────────────────────────────────────────────────

unsafe fn compile_stage(
    gl: &glow::Context,
    stage: u32,
    src: &str,
    label: &str,
) -> Result<glow::Shader> {
    unsafe {
        let shader = gl
            .create_shader(stage)
            .map_err(|e| anyhow!("create_shader ({label}): {e}"))?;
        gl.shader_source(shader, src);
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let diag = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            log::error!("{label} shader failed to compile:\n{diag}");
            bail!("{label} shader compilation failed");
        }
        Ok(shader)
    }
}

fn attrib_kind(atype: u32) -> Option<InputKind> {
    match atype {
        glow::FLOAT => Some(InputKind::Scalar),
        glow::FLOAT_VEC2 => Some(InputKind::Vec2),
        glow::FLOAT_VEC3 => Some(InputKind::Vec3),
        glow::FLOAT_VEC4 => Some(InputKind::Vec4),
        _ => None,
    }
}

fn uniform_size(utype: u32) -> Option<usize> {
    match utype {
        glow::FLOAT => Some(4),
        glow::FLOAT_VEC2 => Some(8),
        glow::FLOAT_VEC3 => Some(12),
        glow::FLOAT_VEC4 => Some(16),
        glow::FLOAT_MAT4 => Some(64),
        _ => None,
    }
}

/// (component count, GL data type, normalized) for a vertex element.
fn vertex_attrib_params(format: PixelFormat) -> (usize, u32, bool) {
    match format {
        PixelFormat::Unknown => (0, glow::FLOAT, false),
        PixelFormat::R32Float => (1, glow::FLOAT, false),
        PixelFormat::Rg32Float => (2, glow::FLOAT, false),
        PixelFormat::Rgb32Float => (3, glow::FLOAT, false),
        PixelFormat::Rgba32Float => (4, glow::FLOAT, false),
        PixelFormat::R8Norm => (1, glow::UNSIGNED_BYTE, true),
        PixelFormat::Rg8Norm => (2, glow::UNSIGNED_BYTE, true),
        PixelFormat::Rgba8Norm => (4, glow::UNSIGNED_BYTE, true),
        PixelFormat::R8Uint => (1, glow::UNSIGNED_BYTE, false),
    }
}

/// (internal format, upload format, component type) for a texel format.
fn gl_texel_format(format: PixelFormat) -> Option<(i32, u32, u32)> {
    let triple = match format {
        PixelFormat::Unknown => return None,
        PixelFormat::R32Float => (glow::R32F, glow::RED, glow::FLOAT),
        PixelFormat::Rg32Float => (glow::RG32F, glow::RG, glow::FLOAT),
        PixelFormat::Rgb32Float => (glow::RGB32F, glow::RGB, glow::FLOAT),
        PixelFormat::Rgba32Float => (glow::RGBA32F, glow::RGBA, glow::FLOAT),
        PixelFormat::R8Norm => (glow::R8, glow::RED, glow::UNSIGNED_BYTE),
        PixelFormat::Rg8Norm => (glow::RG8, glow::RG, glow::UNSIGNED_BYTE),
        PixelFormat::Rgba8Norm => (glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
        PixelFormat::R8Uint => (glow::R8UI, glow::RED_INTEGER, glow::UNSIGNED_BYTE),
    };
    Some((triple.0 as i32, triple.1, triple.2))
}

fn gl_upload_format(format: PixelFormat) -> Option<(u32, u32)> {
    gl_texel_format(format).map(|(_, fmt, ty)| (fmt, ty))
}

impl GlBackend {
    fn alloc_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Option<&[u8]>,
    ) -> Result<TextureHandle> {
        let (internal, fmt, ty) =
            gl_texel_format(format).with_context(|| format!("unsupported texel format {format:?}"))?;
        ensure!(width > 0 && height > 0, "zero-sized texture");

        let tex = unsafe {
            let tex = self
                .gl
                .create_texture()
                .map_err(|e| anyhow!("create_texture: {e}"))?;
            self.gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            // Integer formats cannot be linearly filtered.
            let filter = if format == PixelFormat::R8Uint {
                glow::NEAREST
            } else {
                glow::LINEAR
            };
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter as i32);
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter as i32);
            self.gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_S,
                glow::CLAMP_TO_EDGE as i32,
            );
            self.gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_T,
                glow::CLAMP_TO_EDGE as i32,
            );
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                width as i32,
                height as i32,
                0,
                fmt,
                ty,
                glow::PixelUnpackData::Slice(pixels),
            );
            tex
        };
        self.check_gl_error("alloc_texture");

        Ok(self.textures.insert(GlTexture {
            tex,
            width,
            height,
            format,
        }))
    }
}
