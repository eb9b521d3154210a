//! Direct3D11 backend over the `windows` crate.
//!
//! Shader reflection uses `ID3D11ShaderReflection` on the compiled bytecode:
//! input signature parameters become the vertex inputs (semantic names
//! lower-cased so the builtin convention matches across backends), and
//! reflected cbuffers become the constant blocks — one `ID3D11Buffer` each,
//! bound to the stages that reference them.
//!
//! Depth convention: clear 0.0 with `GREATER_EQUAL`, so the batcher counts
//! depth *up* (`flip_z() == false`) and later primitives win the test.

use std::ffi::{CString, c_void};

use anyhow::{Context as _, Result, bail, ensure};
use raw_window_handle::{HasWindowHandle, RawWindowHandle};
use slotmap::SlotMap;
use windows::Win32::Foundation::{HMODULE, HWND, RECT};
use windows::Win32::Graphics::Direct3D::Fxc::{
    D3DCOMPILE_ENABLE_STRICTNESS, D3DCompile, D3DReflect,
};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_11_0,
    D3D_NAME_UNDEFINED, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST, D3D_REGISTER_COMPONENT_FLOAT32,
    ID3DBlob,
};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::{
    DXGI_PRESENT, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_CHAIN_FLAG, DXGI_SWAP_EFFECT_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGISwapChain,
};
use windows::core::{Interface, PCSTR, s};

use crate::coords::{ColorRgba, Rect};
use crate::format::PixelFormat;
use crate::handle::{BackendShaderHandle, TextureHandle};
use crate::shader::{
    ConstantBlockDesc, InputKind, Shader, ShaderConstantDesc, ShaderDesc, ShaderInput,
};

use super::{RenderBackend, scissor_to_px};

pub const DEFAULT_SHADER_SRC: &str = include_str!("shaders/default.hlsl");

struct D3dTexture {
    tex: ID3D11Texture2D,
    srv: ID3D11ShaderResourceView,
    width: u32,
    height: u32,
    format: PixelFormat,
}

struct D3dConstantBuffer {
    buffer: ID3D11Buffer,
    size: usize,
    vs_slot: Option<u32>,
    ps_slot: Option<u32>,
}

struct D3dShader {
    vs: ID3D11VertexShader,
    ps: ID3D11PixelShader,
    layout: ID3D11InputLayout,
    /// One entry per constant block, in [`ShaderDesc`] block order.
    blocks: Vec<D3dConstantBuffer>,
}

/// Direct3D11 implementation of [`RenderBackend`].
pub struct D3d11Backend {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    swapchain: IDXGISwapChain,

    // Recreated on resize; the Options exist so the old views can be
    // released *before* ResizeBuffers, which D3D11 requires.
    rtv: Option<ID3D11RenderTargetView>,
    depth_tex: Option<ID3D11Texture2D>,
    dsv: Option<ID3D11DepthStencilView>,

    depth_state: ID3D11DepthStencilState,
    rasterizer: ID3D11RasterizerState,
    blend: ID3D11BlendState,
    sampler: ID3D11SamplerState,

    vbo: ID3D11Buffer,
    vbo_capacity: usize,

    width: u32,
    height: u32,
    textures: SlotMap<TextureHandle, D3dTexture>,
    shaders: SlotMap<BackendShaderHandle, D3dShader>,
}

impl D3d11Backend {
    /// Creates device, immediate context and a swapchain bound to `window`,
    /// plus the fixed pipeline state (solid fill, back-face cull, scissor
    /// on, depth on, src-over blending) and the shared dynamic vertex
    /// buffer of `vertex_capacity` bytes.
    ///
    /// Fails when no hardware device supports feature level 10.1+; callers
    /// should treat the error as fatal — there is no fallback device.
    pub fn new(window: &impl HasWindowHandle, width: u32, height: u32, vertex_capacity: usize)
    -> Result<Self> {
        let handle = window.window_handle().context("window has no handle")?;
        let RawWindowHandle::Win32(win32) = handle.as_raw() else {
            bail!("D3D11 backend requires a Win32 window handle");
        };
        let hwnd = HWND(win32.hwnd.get() as *mut c_void);

        let width = width.max(1);
        let height = height.max(1);

        let sd = DXGI_SWAP_CHAIN_DESC {
            BufferDesc: DXGI_MODE_DESC {
                Width: width,
                Height: height,
                RefreshRate: DXGI_RATIONAL { Numerator: 60, Denominator: 1 },
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                ScanlineOrdering: DXGI_MODE_SCANLINE_ORDER_UNSPECIFIED,
                Scaling: DXGI_MODE_SCALING_UNSPECIFIED,
            },
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 2,
            OutputWindow: hwnd,
            Windowed: true.into(),
            SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
            Flags: 0,
        };

        let feature_levels = [D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_1];
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        let mut swapchain: Option<IDXGISwapChain> = None;
        let mut level = D3D_FEATURE_LEVEL::default();

        // Prefer the debug layer so validation messages reach the log;
        // retry without when the SDK layers are not installed.
        let mut created = false;
        for flags in [
            D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_DEBUG,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
        ] {
            if cfg!(not(debug_assertions)) && flags.contains(D3D11_CREATE_DEVICE_DEBUG) {
                continue;
            }
            let result = unsafe {
                D3D11CreateDeviceAndSwapChain(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    HMODULE::default(),
                    flags,
                    Some(&feature_levels),
                    D3D11_SDK_VERSION,
                    Some(&sd),
                    Some(&mut swapchain),
                    Some(&mut device),
                    Some(&mut level),
                    Some(&mut context),
                )
            };
            if result.is_ok() {
                created = true;
                break;
            }
        }
        ensure!(created, "no compatible Direct3D11 device found");
        let (device, context, swapchain) = match (device, context, swapchain) {
            (Some(d), Some(c), Some(s)) => (d, c, s),
            _ => bail!("Direct3D11 device creation returned incomplete state"),
        };
        log::info!("D3D11 backend: feature level {:#x}", level.0);

        let (rtv, depth_tex, dsv) =
            create_framebuffer_views(&device, &swapchain, width, height)?;

        let depth_state = unsafe {
            let desc = D3D11_DEPTH_STENCIL_DESC {
                DepthEnable: true.into(),
                DepthWriteMask: D3D11_DEPTH_WRITE_MASK_ALL,
                DepthFunc: D3D11_COMPARISON_GREATER_EQUAL,
                ..Default::default()
            };
            let mut state = None;
            device
                .CreateDepthStencilState(&desc, Some(&mut state))
                .context("create depth-stencil state")?;
            state.context("depth-stencil state missing")?
        };

        let rasterizer = unsafe {
            let desc = D3D11_RASTERIZER_DESC {
                FillMode: D3D11_FILL_SOLID,
                CullMode: D3D11_CULL_BACK,
                // Geometry winds clockwise in NDC after the projection's
                // Y flip; keep the D3D default front face.
                FrontCounterClockwise: false.into(),
                DepthClipEnable: true.into(),
                ScissorEnable: true.into(),
                ..Default::default()
            };
            let mut state = None;
            device
                .CreateRasterizerState(&desc, Some(&mut state))
                .context("create rasterizer state")?;
            state.context("rasterizer state missing")?
        };

        let blend = unsafe {
            let mut desc = D3D11_BLEND_DESC::default();
            desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
                BlendEnable: true.into(),
                SrcBlend: D3D11_BLEND_SRC_ALPHA,
                DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
                BlendOp: D3D11_BLEND_OP_ADD,
                SrcBlendAlpha: D3D11_BLEND_ONE,
                DestBlendAlpha: D3D11_BLEND_INV_SRC_ALPHA,
                BlendOpAlpha: D3D11_BLEND_OP_ADD,
                RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
            };
            let mut state = None;
            device
                .CreateBlendState(&desc, Some(&mut state))
                .context("create blend state")?;
            state.context("blend state missing")?
        };

        let sampler = unsafe {
            let desc = D3D11_SAMPLER_DESC {
                Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
                AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
                ComparisonFunc: D3D11_COMPARISON_NEVER,
                MaxLOD: f32::MAX,
                ..Default::default()
            };
            let mut state = None;
            device
                .CreateSamplerState(&desc, Some(&mut state))
                .context("create sampler state")?;
            state.context("sampler state missing")?
        };

        let vbo = unsafe {
            let desc = D3D11_BUFFER_DESC {
                ByteWidth: vertex_capacity as u32,
                Usage: D3D11_USAGE_DYNAMIC,
                BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
                CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
                ..Default::default()
            };
            let mut buffer = None;
            device
                .CreateBuffer(&desc, None, Some(&mut buffer))
                .context("create shared vertex buffer")?;
            buffer.context("vertex buffer missing")?
        };

        Ok(Self {
            device,
            context,
            swapchain,
            rtv: Some(rtv),
            depth_tex: Some(depth_tex),
            dsv: Some(dsv),
            depth_state,
            rasterizer,
            blend,
            sampler,
            vbo,
            vbo_capacity: vertex_capacity,
            width,
            height,
            textures: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
        })
    }
}

impl RenderBackend for D3d11Backend {
    fn swapchain_width(&self) -> u32 {
        self.width
    }

    fn swapchain_height(&self) -> u32 {
        self.height
    }

    fn flip_z(&self) -> bool {
        false
    }

    fn clear(&mut self, color: ColorRgba) {
        let (Some(rtv), Some(dsv)) = (&self.rtv, &self.dsv) else { return };
        unsafe {
            self.context
                .ClearRenderTargetView(rtv, &[color.r, color.g, color.b, color.a]);
            self.context
                .ClearDepthStencilView(dsv, D3D11_CLEAR_DEPTH.0 as u32, 0.0, 0);
        }
    }

    fn present(&mut self) {
        let hr = unsafe { self.swapchain.Present(1, DXGI_PRESENT(0)) };
        if hr.is_err() {
            log::error!("Present failed: {hr:?}");
        }
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) {
        let width = width.max(1);
        let height = height.max(1);

        // Views referencing the old backbuffer must be released before
        // ResizeBuffers, or it fails with outstanding references.
        unsafe { self.context.OMSetRenderTargets(None, None) };
        self.rtv = None;
        self.dsv = None;
        self.depth_tex = None;

        let resized = unsafe {
            self.swapchain
                .ResizeBuffers(0, width, height, DXGI_FORMAT_UNKNOWN, DXGI_SWAP_CHAIN_FLAG(0))
        };
        if let Err(e) = resized {
            log::error!("ResizeBuffers({width}x{height}) failed: {e}");
            return;
        }

        match create_framebuffer_views(&self.device, &self.swapchain, width, height) {
            Ok((rtv, depth_tex, dsv)) => {
                self.rtv = Some(rtv);
                self.depth_tex = Some(depth_tex);
                self.dsv = Some(dsv);
                self.width = width;
                self.height = height;
            }
            Err(e) => log::error!("recreating framebuffer views failed: {e:#}"),
        }
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
        let (Some(rtv), Some(dsv)) = (&self.rtv, &self.dsv) else { return };

        unsafe {
            // Vertex upload.
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            if let Err(e) =
                self.context
                    .Map(&self.vbo, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
            {
                log::error!("draw: mapping vertex buffer failed: {e}");
                return;
            }
            std::ptr::copy_nonoverlapping(
                vertices.as_ptr(),
                mapped.pData as *mut u8,
                vertices.len(),
            );
            self.context.Unmap(&self.vbo, 0);

            // Constant uploads: whole-block shadow copies.
            for (i, block) in res.blocks.iter().enumerate() {
                if i >= shader.block_count() {
                    break;
                }
                let bytes = shader.block_shadow(i);
                if bytes.len() != block.size {
                    continue;
                }
                self.context.UpdateSubresource(
                    &block.buffer,
                    0,
                    None,
                    bytes.as_ptr() as *const c_void,
                    0,
                    0,
                );
                let bound = [Some(block.buffer.clone())];
                if let Some(slot) = block.vs_slot {
                    self.context.VSSetConstantBuffers(slot, Some(&bound));
                }
                if let Some(slot) = block.ps_slot {
                    self.context.PSSetConstantBuffers(slot, Some(&bound));
                }
            }

            // Fixed state + per-batch bindings.
            let viewport = D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: self.width as f32,
                Height: self.height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            };
            self.context.RSSetViewports(Some(&[viewport]));
            self.context.RSSetState(&self.rasterizer);
            let scissor_rect = RECT {
                left: sx as i32,
                top: sy as i32,
                right: (sx + sw) as i32,
                bottom: (sy + sh) as i32,
            };
            self.context.RSSetScissorRects(Some(&[scissor_rect]));

            self.context
                .OMSetRenderTargets(Some(&[Some(rtv.clone())]), dsv);
            self.context.OMSetDepthStencilState(&self.depth_state, 0);
            self.context.OMSetBlendState(&self.blend, None, u32::MAX);

            self.context.IASetInputLayout(&res.layout);
            self.context
                .IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            let stride_u32 = stride as u32;
            let offset = 0u32;
            self.context.IASetVertexBuffers(
                0,
                1,
                Some(&Some(self.vbo.clone())),
                Some(&stride_u32),
                Some(&offset),
            );

            self.context.VSSetShader(&res.vs, None);
            self.context.PSSetShader(&res.ps, None);
            self.context.PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));

            let srv = match self.textures.get(texture) {
                Some(t) => Some(t.srv.clone()),
                None => {
                    log::debug!("draw: texture handle did not resolve, sampling default data");
                    None
                }
            };
            self.context.PSSetShaderResources(0, Some(&[srv]));

            self.context.Draw((vertices.len() / stride) as u32, 0);
        }
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
        let row_pitch = t.format.size() * width as usize;
        if pixels.len() != row_pitch * height as usize {
            log::error!(
                "update_texture: expected {} bytes, got {}",
                row_pitch * height as usize,
                pixels.len()
            );
            return false;
        }
        let dst_box = D3D11_BOX {
            left: x,
            top: y,
            front: 0,
            right: x + width,
            bottom: y + height,
            back: 1,
        };
        unsafe {
            self.context.UpdateSubresource(
                &t.tex,
                0,
                Some(&dst_box),
                pixels.as_ptr() as *const c_void,
                row_pitch as u32,
                0,
            );
        }
        true
    }

    fn destroy_texture(&mut self, handle: TextureHandle) -> bool {
        if self.textures.remove(handle).is_none() {
            log::error!("destroy_texture: unknown texture handle");
            return false;
        }
        true
    }

    fn load_shader(
        &mut self,
        vertex_src: &str,
        fragment_src: &str,
        layout_override: Option<&[PixelFormat]>,
    ) -> Result<(BackendShaderHandle, ShaderDesc)> {
        let vs_blob = compile_stage(vertex_src, s!("vs_main"), s!("vs_5_0"), "vertex")?;
        let ps_blob = compile_stage(fragment_src, s!("ps_main"), s!("ps_5_0"), "fragment")?;
        let vs_bytes = blob_bytes(&vs_blob);
        let ps_bytes = blob_bytes(&ps_blob);

        let (vs, ps) = unsafe {
            let mut vs = None;
            self.device
                .CreateVertexShader(vs_bytes, None, Some(&mut vs))
                .context("create vertex shader")?;
            let mut ps = None;
            self.device
                .CreatePixelShader(ps_bytes, None, Some(&mut ps))
                .context("create pixel shader")?;
            (
                vs.context("vertex shader missing")?,
                ps.context("pixel shader missing")?,
            )
        };

        // ── reflect the vertex stage: inputs + cbuffers ───────────────────
        let vs_refl = reflect(vs_bytes)?;
        let mut raw_inputs = reflect_inputs(&vs_refl)?;
        raw_inputs.sort_by_key(|input| input.register);

        let mut inputs: Vec<ShaderInput> = raw_inputs
            .iter()
            .map(|raw| ShaderInput {
                name: raw.semantic.to_ascii_lowercase(),
                register: raw.register,
                kind: raw.kind,
                format: PixelFormat::float_vector(raw.kind.components()),
            })
            .collect();
        if let Some(formats) = layout_override {
            ensure!(
                formats.len() == inputs.len(),
                "layout override has {} formats for {} reflected inputs",
                formats.len(),
                inputs.len()
            );
            for (input, &fmt) in inputs.iter_mut().zip(formats) {
                input.format = fmt;
            }
        }

        // ── constant blocks from both stages, merged by name ──────────────
        let ps_refl = reflect(ps_bytes)?;
        let mut blocks = Vec::new();
        let mut buffers = Vec::new();
        collect_constant_blocks(&self.device, &vs_refl, Stage::Vertex, &mut blocks, &mut buffers)?;
        collect_constant_blocks(&self.device, &ps_refl, Stage::Pixel, &mut blocks, &mut buffers)?;

        // ── input layout: packed offsets from PixelFormat sizes ───────────
        let layout = unsafe {
            // Semantic name strings must outlive CreateInputLayout.
            let semantics: Vec<CString> = raw_inputs
                .iter()
                .map(|raw| CString::new(raw.semantic.as_str()).unwrap_or_default())
                .collect();
            let mut elements = Vec::with_capacity(inputs.len());
            let mut offset = 0u32;
            for (input, (raw, semantic)) in
                inputs.iter().zip(raw_inputs.iter().zip(&semantics))
            {
                elements.push(D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                    SemanticIndex: raw.semantic_index,
                    Format: dxgi_vertex_format(input.format),
                    InputSlot: 0,
                    AlignedByteOffset: offset,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                });
                offset += input.format.size() as u32;
            }
            let mut layout = None;
            self.device
                .CreateInputLayout(&elements, vs_bytes, Some(&mut layout))
                .context("create input layout")?;
            layout.context("input layout missing")?
        };

        let handle = self.shaders.insert(D3dShader {
            vs,
            ps,
            layout,
            blocks: buffers,
        });
        Ok((handle, ShaderDesc { inputs, blocks }))
    }

    fn destroy_shader(&mut self, handle: BackendShaderHandle) {
        if self.shaders.remove(handle).is_none() {
            log::error!("destroy_shader: unknown shader handle");
        }
    }

    fn default_shader_sources(&self) -> (&'static str, &'static str) {
        (DEFAULT_SHADER_SRC, DEFAULT_SHADER_SRC)
    }
}

impl Drop for D3d11Backend {
    fn drop(&mut self) {
        // Unbind everything first; the COM wrappers then release in reverse
        // of this struct's field order.
        unsafe { self.context.ClearState() };
    }
}

// ── construction helpers ──────────────────────────────────────────────────

fn create_framebuffer_views(
    device: &ID3D11Device,
    swapchain: &IDXGISwapChain,
    width: u32,
    height: u32,
) -> Result<(ID3D11RenderTargetView, ID3D11Texture2D, ID3D11DepthStencilView)> {
    unsafe {
        let backbuffer: ID3D11Texture2D =
            swapchain.GetBuffer(0).context("get swapchain backbuffer")?;
        let mut rtv = None;
        device
            .CreateRenderTargetView(&backbuffer, None, Some(&mut rtv))
            .context("create render target view")?;

        let depth_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_D24_UNORM_S8_UINT,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_DEPTH_STENCIL.0 as u32,
            ..Default::default()
        };
        let mut depth_tex = None;
        device
            .CreateTexture2D(&depth_desc, None, Some(&mut depth_tex))
            .context("create depth buffer")?;
        let depth_tex = depth_tex.context("depth buffer missing")?;

        let mut dsv = None;
        device
            .CreateDepthStencilView(&depth_tex, None, Some(&mut dsv))
            .context("create depth-stencil view")?;

        Ok((
            rtv.context("render target view missing")?,
            depth_tex,
            dsv.context("depth-stencil view missing")?,
        ))
    }
}

impl D3d11Backend {
    fn alloc_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Option<&[u8]>,
    ) -> Result<TextureHandle> {
        ensure!(width > 0 && height > 0, "zero-sized texture");
        let dxgi = dxgi_texel_format(format);
        ensure!(dxgi != DXGI_FORMAT_UNKNOWN, "unsupported texel format {format:?}");

        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            ..Default::default()
        };
        let initial = pixels.map(|p| D3D11_SUBRESOURCE_DATA {
            pSysMem: p.as_ptr() as *const c_void,
            SysMemPitch: (format.size() * width as usize) as u32,
            SysMemSlicePitch: 0,
        });

        let (tex, srv) = unsafe {
            let mut tex = None;
            self.device
                .CreateTexture2D(&desc, initial.as_ref().map(|d| d as *const _), Some(&mut tex))
                .context("create texture")?;
            let tex = tex.context("texture missing")?;
            let mut srv = None;
            self.device
                .CreateShaderResourceView(&tex, None, Some(&mut srv))
                .context("create shader resource view")?;
            (tex, srv.context("shader resource view missing")?)
        };

        Ok(self.textures.insert(D3dTexture {
            tex,
            srv,
            width,
            height,
            format,
        }))
    }
}

// ── shader helpers ────────────────────────────────────────────────────────

#[derive(Copy, Clone)]
enum Stage {
    Vertex,
    Pixel,
}

struct RawInput {
    semantic: String,
    semantic_index: u32,
    register: u32,
    kind: InputKind,
}

fn compile_stage(src: &str, entry: PCSTR, target: PCSTR, label: &str) -> Result<ID3DBlob> {
    unsafe {
        let mut code: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        let result = D3DCompile(
            src.as_ptr() as *const c_void,
            src.len(),
            None,
            None,
            None,
            entry,
            target,
            D3DCOMPILE_ENABLE_STRICTNESS,
            0,
            &mut code,
            Some(&mut errors),
        );
        if let Some(errors) = &errors {
            let diag = String::from_utf8_lossy(blob_bytes(errors));
            if result.is_err() {
                log::error!("{label} shader failed to compile:\n{diag}");
            } else if !diag.trim().is_empty() {
                log::warn!("{label} shader compile diagnostics:\n{diag}");
            }
        }
        if result.is_err() {
            bail!("{label} shader compilation failed");
        }
        code.context("compiler returned no bytecode")
    }
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    }
}

fn reflect(bytecode: &[u8]) -> Result<ID3D11ShaderReflection> {
    unsafe {
        let mut raw: *mut c_void = std::ptr::null_mut();
        D3DReflect(
            bytecode.as_ptr() as *const c_void,
            bytecode.len(),
            &ID3D11ShaderReflection::IID,
            &mut raw,
        )
        .context("D3DReflect")?;
        Ok(ID3D11ShaderReflection::from_raw(raw))
    }
}

fn reflect_inputs(reflection: &ID3D11ShaderReflection) -> Result<Vec<RawInput>> {
    unsafe {
        let mut shader_desc = D3D11_SHADER_DESC::default();
        reflection
            .GetDesc(&mut shader_desc)
            .context("shader reflection GetDesc")?;

        let mut inputs = Vec::new();
        for i in 0..shader_desc.InputParameters {
            let mut pd = D3D11_SIGNATURE_PARAMETER_DESC::default();
            if reflection.GetInputParameterDesc(i, &mut pd).is_err() {
                log::warn!("load_shader: malformed input signature entry {i}, skipping");
                continue;
            }
            // System-value inputs (SV_*) are fed by the pipeline, not the
            // vertex buffer.
            if pd.SystemValueType != D3D_NAME_UNDEFINED {
                continue;
            }
            let semantic = pd.SemanticName.to_string().unwrap_or_default();
            if pd.ComponentType != D3D_REGISTER_COMPONENT_FLOAT32 {
                log::warn!(
                    "load_shader: input `{semantic}` has unsupported component type, skipping"
                );
                continue;
            }
            let comps = (pd.Mask as u32).count_ones() as usize;
            let Some(kind) = InputKind::from_components(comps) else {
                log::warn!("load_shader: input `{semantic}` has invalid mask, skipping");
                continue;
            };
            inputs.push(RawInput {
                semantic,
                semantic_index: pd.SemanticIndex,
                register: pd.Register,
                kind,
            });
        }
        Ok(inputs)
    }
}

/// Reflects one stage's cbuffers into constant blocks, allocating a GPU
/// buffer per new block and recording the stage bind slot. Blocks already
/// present (merged from the other stage) only gain the extra slot.
fn collect_constant_blocks(
    device: &ID3D11Device,
    reflection: &ID3D11ShaderReflection,
    stage: Stage,
    blocks: &mut Vec<ConstantBlockDesc>,
    buffers: &mut Vec<D3dConstantBuffer>,
) -> Result<()> {
    unsafe {
        let mut shader_desc = D3D11_SHADER_DESC::default();
        reflection
            .GetDesc(&mut shader_desc)
            .context("shader reflection GetDesc")?;

        for i in 0..shader_desc.ConstantBuffers {
            let Some(cb) = reflection.GetConstantBufferByIndex(i) else {
                continue;
            };
            let mut bd = D3D11_SHADER_BUFFER_DESC::default();
            if cb.GetDesc(&mut bd).is_err() {
                log::warn!("load_shader: malformed constant buffer entry {i}, skipping");
                continue;
            }
            let name = bd.Name.to_string().unwrap_or_default();
            if bd.Size == 0 {
                log::warn!("load_shader: constant buffer `{name}` is zero-sized, skipping");
                continue;
            }

            let mut bind = D3D11_SHADER_INPUT_BIND_DESC::default();
            let name_c = CString::new(name.as_str()).unwrap_or_default();
            if reflection
                .GetResourceBindingDescByName(PCSTR(name_c.as_ptr() as *const u8), &mut bind)
                .is_err()
            {
                log::warn!("load_shader: no bind point for constant buffer `{name}`, skipping");
                continue;
            }

            if let Some(existing) = blocks.iter().position(|b| b.name == name) {
                match stage {
                    Stage::Vertex => buffers[existing].vs_slot = Some(bind.BindPoint),
                    Stage::Pixel => buffers[existing].ps_slot = Some(bind.BindPoint),
                }
                continue;
            }

            let mut constants = Vec::with_capacity(bd.Variables as usize);
            for j in 0..bd.Variables {
                let Some(var) = cb.GetVariableByIndex(j) else {
                    continue;
                };
                let mut vd = D3D11_SHADER_VARIABLE_DESC::default();
                if var.GetDesc(&mut vd).is_err() {
                    log::warn!("load_shader: malformed variable entry in `{name}`, skipping");
                    continue;
                }
                constants.push(ShaderConstantDesc {
                    name: vd.Name.to_string().unwrap_or_default(),
                    size: vd.Size as usize,
                    offset: vd.StartOffset as usize,
                });
            }

            let buffer_desc = D3D11_BUFFER_DESC {
                // cbuffer sizes must be 16-byte multiples; reflected sizes
                // already are.
                ByteWidth: bd.Size,
                Usage: D3D11_USAGE_DEFAULT,
                BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
                ..Default::default()
            };
            let mut buffer = None;
            device
                .CreateBuffer(&buffer_desc, None, Some(&mut buffer))
                .with_context(|| format!("create constant buffer `{name}`"))?;

            blocks.push(ConstantBlockDesc {
                name,
                size: bd.Size as usize,
                constants,
            });
            buffers.push(D3dConstantBuffer {
                buffer: buffer.context("constant buffer missing")?,
                size: bd.Size as usize,
                vs_slot: matches!(stage, Stage::Vertex).then_some(bind.BindPoint),
                ps_slot: matches!(stage, Stage::Pixel).then_some(bind.BindPoint),
            });
        }
        Ok(())
    }
}

// ── format mapping ────────────────────────────────────────────────────────

fn dxgi_texel_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Unknown => DXGI_FORMAT_UNKNOWN,
        PixelFormat::R32Float => DXGI_FORMAT_R32_FLOAT,
        PixelFormat::Rg32Float => DXGI_FORMAT_R32G32_FLOAT,
        PixelFormat::Rgb32Float => DXGI_FORMAT_R32G32B32_FLOAT,
        PixelFormat::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        PixelFormat::R8Norm => DXGI_FORMAT_R8_UNORM,
        PixelFormat::Rg8Norm => DXGI_FORMAT_R8G8_UNORM,
        PixelFormat::Rgba8Norm => DXGI_FORMAT_R8G8B8A8_UNORM,
        PixelFormat::R8Uint => DXGI_FORMAT_R8_UINT,
    }
}

fn dxgi_vertex_format(format: PixelFormat) -> DXGI_FORMAT {
    // Texel and vertex-element formats coincide for every format this
    // table supports.
    dxgi_texel_format(format)
}
