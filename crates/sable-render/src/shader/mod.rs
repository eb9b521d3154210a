//! Backend-independent shader abstraction.
//!
//! A backend's `load_shader` compiles and *reflects* the shader, producing a
//! [`ShaderDesc`]: the vertex inputs in declaration order and the constant
//! blocks with their members. [`Shader::from_desc`] turns that description
//! into the CPU-side value the batching engine works with:
//!
//! - a tightly packed vertex layout (offsets from [`PixelFormat::size`],
//!   never from GPU-reported alignment, so CPU vertex construction and the
//!   GPU input layout agree byte-for-byte);
//! - one packed shadow buffer for all constants (block shadows concatenated
//!   in declaration order, one allocation);
//! - builtin-slot offsets for the inputs the batcher writes automatically;
//! - per-input override slots for everything it does not.

use std::collections::HashMap;

use glam::Mat4;

use crate::format::PixelFormat;
use crate::handle::BackendShaderHandle;

/// Fixed capacity of one input-override slot (a vec4 of floats).
pub const MAX_INPUT_OVERRIDE_BYTES: usize = 16;

/// Size of the `mvp` builtin constant (one column-major 4×4 float matrix).
pub const MVP_BYTES: usize = 64;

// ── reflection description ────────────────────────────────────────────────

/// Logical type of a vertex input. Only floating-point scalars/vectors are
/// supported; reflection logs and skips integer or matrix inputs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InputKind {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
}

impl InputKind {
    #[inline]
    pub const fn components(self) -> usize {
        match self {
            InputKind::Scalar => 1,
            InputKind::Vec2 => 2,
            InputKind::Vec3 => 3,
            InputKind::Vec4 => 4,
        }
    }

    /// Classifies a component count; `None` for counts no float vector has.
    #[inline]
    pub const fn from_components(n: usize) -> Option<InputKind> {
        match n {
            1 => Some(InputKind::Scalar),
            2 => Some(InputKind::Vec2),
            3 => Some(InputKind::Vec3),
            4 => Some(InputKind::Vec4),
            _ => None,
        }
    }
}

/// Inputs the batching engine writes without caller intervention.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BuiltinSlot {
    /// `position: vec3` — xy in world units, z is the per-primitive depth.
    Position = 0,
    /// `texcoord: vec2`.
    Uv = 1,
    /// `color: vec4` (linear RGBA).
    Color = 2,
}

/// One reflected vertex input, in register/location order.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderInput {
    /// Attribute name (GL) or lower-cased semantic name (D3D11).
    pub name: String,
    /// Register / attribute location.
    pub register: u32,
    pub kind: InputKind,
    /// Resolved element format. Defaults to the float vector matching
    /// `kind`; a `load_shader` layout override replaces it.
    pub format: PixelFormat,
}

impl ShaderInput {
    /// The builtin slot this input binds to, if name and arity match the
    /// convention (`position`/vec3, `texcoord`/vec2, `color`/vec4).
    pub fn builtin(&self) -> Option<BuiltinSlot> {
        match (self.name.as_str(), self.kind) {
            ("position", InputKind::Vec3) => Some(BuiltinSlot::Position),
            ("texcoord", InputKind::Vec2) => Some(BuiltinSlot::Uv),
            ("color", InputKind::Vec4) => Some(BuiltinSlot::Color),
            _ => None,
        }
    }
}

/// One named constant inside a block. `offset` is relative to the block.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderConstantDesc {
    pub name: String,
    pub size: usize,
    pub offset: usize,
}

/// One reflected constant block. The backend allocates one GPU buffer per
/// non-empty block; the GL backend reflects each loose uniform as its own
/// single-member block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstantBlockDesc {
    pub name: String,
    pub size: usize,
    pub constants: Vec<ShaderConstantDesc>,
}

/// Everything reflection discovered about a compiled shader.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderDesc {
    pub inputs: Vec<ShaderInput>,
    pub blocks: Vec<ConstantBlockDesc>,
}

// ── constant locations ────────────────────────────────────────────────────

/// Resolved byte range of a named constant in the packed shadow buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConstantLocation {
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Copy, Clone)]
struct InputOverride {
    data: [u8; MAX_INPUT_OVERRIDE_BYTES],
    len: usize,
}

// ── shader ────────────────────────────────────────────────────────────────

/// CPU-side shader value: packed layout, constant shadow, overrides.
///
/// Owned by the renderer's shader table; the GPU objects live behind
/// `gpu_handle()` in the backend that compiled it.
#[derive(Debug)]
pub struct Shader {
    gpu: BackendShaderHandle,

    inputs: Vec<ShaderInput>,
    /// Packed byte offset of each input, parallel to `inputs`.
    input_offsets: Vec<usize>,
    stride: usize,
    builtin_offsets: [Option<usize>; 3],
    overrides: Vec<Option<InputOverride>>,

    /// Block shadows concatenated in declaration order.
    shadow: Vec<u8>,
    /// Base offset + size of each block within `shadow`.
    block_spans: Vec<ConstantLocation>,
    constants: Vec<ConstantLocation>,
    by_name: HashMap<String, usize>,
    mvp: Option<ConstantLocation>,
}

impl Shader {
    pub fn from_desc(gpu: BackendShaderHandle, desc: ShaderDesc) -> Self {
        // Tightly packed input layout, declaration order.
        let mut input_offsets = Vec::with_capacity(desc.inputs.len());
        let mut builtin_offsets = [None; 3];
        let mut stride = 0usize;
        for input in &desc.inputs {
            input_offsets.push(stride);
            if let Some(slot) = input.builtin() {
                builtin_offsets[slot as usize] = Some(stride);
            }
            stride += input.format.size();
        }

        // Packed shadow: block base = sum of preceding block sizes, constant
        // location = block base + reflected member offset.
        let mut block_spans = Vec::with_capacity(desc.blocks.len());
        let mut constants = Vec::new();
        let mut by_name = HashMap::new();
        let mut shadow_len = 0usize;
        for block in &desc.blocks {
            let base = shadow_len;
            block_spans.push(ConstantLocation { offset: base, size: block.size });
            for c in &block.constants {
                by_name.entry(c.name.clone()).or_insert(constants.len());
                constants.push(ConstantLocation { offset: base + c.offset, size: c.size });
            }
            shadow_len += block.size;
        }

        let mvp = by_name
            .get("mvp")
            .map(|&i| constants[i])
            .filter(|loc| loc.size == MVP_BYTES);

        let overrides = vec![None; desc.inputs.len()];

        Self {
            gpu,
            inputs: desc.inputs,
            input_offsets,
            stride,
            builtin_offsets,
            overrides,
            shadow: vec![0u8; shadow_len],
            block_spans,
            constants,
            by_name,
            mvp,
        }
    }

    #[inline]
    pub fn gpu_handle(&self) -> BackendShaderHandle {
        self.gpu
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn inputs(&self) -> &[ShaderInput] {
        &self.inputs
    }

    #[inline]
    pub fn input_offset(&self, index: usize) -> usize {
        self.input_offsets[index]
    }

    #[inline]
    pub fn builtin_offset(&self, slot: BuiltinSlot) -> Option<usize> {
        self.builtin_offsets[slot as usize]
    }

    // ── constants ─────────────────────────────────────────────────────────

    pub fn constant_location(&self, name: &str) -> Option<ConstantLocation> {
        self.by_name.get(name).map(|&i| self.constants[i])
    }

    /// Copies `bytes` into the shadow at the named constant. Returns false
    /// (and logs) when the name is unknown or the size does not match.
    pub fn set_constant(&mut self, name: &str, bytes: &[u8]) -> bool {
        let Some(loc) = self.constant_location(name) else {
            log::warn!("set_constant: shader has no constant named `{name}`");
            return false;
        };
        if bytes.len() != loc.size {
            log::warn!(
                "set_constant: `{name}` is {} bytes, got {}",
                loc.size,
                bytes.len()
            );
            return false;
        }
        self.shadow[loc.offset..loc.offset + loc.size].copy_from_slice(bytes);
        true
    }

    #[inline]
    pub fn has_mvp(&self) -> bool {
        self.mvp.is_some()
    }

    /// Writes the model-view-projection matrix into the `mvp` builtin
    /// constant, if the shader declares one. Called by the batcher before
    /// every flush.
    pub fn write_mvp(&mut self, mvp: Mat4) {
        if let Some(loc) = self.mvp {
            let cols = mvp.to_cols_array();
            self.shadow[loc.offset..loc.offset + MVP_BYTES]
                .copy_from_slice(bytemuck::cast_slice(&cols));
        }
    }

    /// Number of constant blocks (one GPU buffer each on the backend side).
    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_spans.len()
    }

    /// Shadow bytes of one block, for the backend's constant upload.
    #[inline]
    pub fn block_shadow(&self, index: usize) -> &[u8] {
        let span = self.block_spans[index];
        &self.shadow[span.offset..span.offset + span.size]
    }

    #[cfg(test)]
    pub(crate) fn shadow_len(&self) -> usize {
        self.shadow.len()
    }

    // ── input overrides ───────────────────────────────────────────────────

    /// Forces a constant value for the named vertex input across every
    /// vertex of subsequent draws. `bytes` must match the input's format
    /// size. Overrides targeting a builtin's byte range are caller error —
    /// the write order is zero-fill, builtins, then overrides, and nothing
    /// beyond that order is guaranteed; do not alias.
    pub fn set_input_override(&mut self, name: &str, bytes: &[u8]) -> bool {
        let Some(index) = self.inputs.iter().position(|i| i.name == name) else {
            log::warn!("set_input_override: shader has no input named `{name}`");
            return false;
        };
        let expected = self.inputs[index].format.size();
        if bytes.len() != expected || expected > MAX_INPUT_OVERRIDE_BYTES {
            log::warn!(
                "set_input_override: `{name}` is {expected} bytes, got {}",
                bytes.len()
            );
            return false;
        }
        let mut data = [0u8; MAX_INPUT_OVERRIDE_BYTES];
        data[..bytes.len()].copy_from_slice(bytes);
        self.overrides[index] = Some(InputOverride { data, len: bytes.len() });
        true
    }

    pub fn clear_input_override(&mut self, name: &str) -> bool {
        match self.inputs.iter().position(|i| i.name == name) {
            Some(index) => {
                self.overrides[index] = None;
                true
            }
            None => {
                log::warn!("clear_input_override: shader has no input named `{name}`");
                false
            }
        }
    }

    /// Override bytes for input `index`, if one is set.
    #[inline]
    pub fn override_bytes(&self, index: usize) -> Option<&[u8]> {
        self.overrides[index].as_ref().map(|o| &o.data[..o.len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    fn input(name: &str, register: u32, kind: InputKind) -> ShaderInput {
        ShaderInput {
            name: name.to_string(),
            register,
            kind,
            format: PixelFormat::float_vector(kind.components()),
        }
    }

    fn default_desc() -> ShaderDesc {
        ShaderDesc {
            inputs: vec![
                input("position", 0, InputKind::Vec3),
                input("texcoord", 1, InputKind::Vec2),
                input("color", 2, InputKind::Vec4),
            ],
            blocks: vec![ConstantBlockDesc {
                name: "globals".to_string(),
                size: 64,
                constants: vec![ShaderConstantDesc {
                    name: "mvp".to_string(),
                    size: 64,
                    offset: 0,
                }],
            }],
        }
    }

    fn shader(desc: ShaderDesc) -> Shader {
        Shader::from_desc(BackendShaderHandle::default(), desc)
    }

    // ── layout packing ────────────────────────────────────────────────────

    #[test]
    fn default_inputs_pack_to_24_byte_stride() {
        let s = shader(default_desc());
        assert_eq!(s.stride(), 24);
        assert_eq!(s.builtin_offset(BuiltinSlot::Position), Some(0));
        assert_eq!(s.builtin_offset(BuiltinSlot::Uv), Some(12));
        assert_eq!(s.builtin_offset(BuiltinSlot::Color), Some(20));
    }

    #[test]
    fn builtin_requires_conventional_arity() {
        // position as vec2 is an ordinary input, not the Position builtin.
        let desc = ShaderDesc {
            inputs: vec![input("position", 0, InputKind::Vec2)],
            blocks: vec![],
        };
        let s = shader(desc);
        assert_eq!(s.builtin_offset(BuiltinSlot::Position), None);
        assert_eq!(s.stride(), 8);
    }

    #[test]
    fn layout_override_format_drives_packing() {
        let mut desc = ShaderDesc {
            inputs: vec![
                input("position", 0, InputKind::Vec3),
                input("weight", 1, InputKind::Vec2),
            ],
            blocks: vec![],
        };
        // Reflection cannot tell a vec2 of unorm bytes from a float vec2;
        // the load-time layout override resolves it.
        desc.inputs[1].format = PixelFormat::Rg8Norm;
        let s = shader(desc);
        assert_eq!(s.stride(), 14);
        assert_eq!(s.input_offset(1), 12);
    }

    // ── constants ─────────────────────────────────────────────────────────

    #[test]
    fn shadow_is_packed_blocks_in_order() {
        let desc = ShaderDesc {
            inputs: vec![],
            blocks: vec![
                ConstantBlockDesc {
                    name: "globals".into(),
                    size: 64,
                    constants: vec![ShaderConstantDesc { name: "mvp".into(), size: 64, offset: 0 }],
                },
                ConstantBlockDesc {
                    name: "material".into(),
                    size: 32,
                    constants: vec![
                        ShaderConstantDesc { name: "tint".into(), size: 16, offset: 0 },
                        ShaderConstantDesc { name: "params".into(), size: 16, offset: 16 },
                    ],
                },
            ],
        };
        let s = shader(desc);
        assert_eq!(s.shadow_len(), 96);
        assert_eq!(s.block_count(), 2);
        assert_eq!(
            s.constant_location("tint"),
            Some(ConstantLocation { offset: 64, size: 16 })
        );
        assert_eq!(
            s.constant_location("params"),
            Some(ConstantLocation { offset: 80, size: 16 })
        );
    }

    #[test]
    fn set_constant_checks_size() {
        let mut s = shader(default_desc());
        assert!(!s.set_constant("mvp", &[0u8; 4]));
        assert!(s.set_constant("mvp", &[0u8; 64]));
        assert!(!s.set_constant("missing", &[0u8; 4]));
    }

    #[test]
    fn write_mvp_fills_the_builtin_constant() {
        let mut s = shader(default_desc());
        assert!(s.has_mvp());
        s.write_mvp(Mat4::IDENTITY);
        let expected = Mat4::IDENTITY.to_cols_array();
        let expected_bytes: &[u8] = bytemuck::cast_slice(&expected);
        assert_eq!(s.block_shadow(0), expected_bytes);
    }

    #[test]
    fn mvp_requires_matrix_size() {
        let desc = ShaderDesc {
            inputs: vec![],
            blocks: vec![ConstantBlockDesc {
                name: "globals".into(),
                size: 16,
                constants: vec![ShaderConstantDesc { name: "mvp".into(), size: 16, offset: 0 }],
            }],
        };
        assert!(!shader(desc).has_mvp());
    }

    // ── overrides ─────────────────────────────────────────────────────────

    #[test]
    fn override_round_trip() {
        let desc = ShaderDesc {
            inputs: vec![
                input("position", 0, InputKind::Vec3),
                input("glow", 1, InputKind::Scalar),
            ],
            blocks: vec![],
        };
        let mut s = shader(desc);
        let value = 2.5f32.to_le_bytes();
        assert!(s.set_input_override("glow", &value));
        assert_eq!(s.override_bytes(1), Some(&value[..]));
        assert_eq!(s.override_bytes(0), None);

        assert!(s.clear_input_override("glow"));
        assert_eq!(s.override_bytes(1), None);
    }

    #[test]
    fn override_rejects_wrong_size() {
        let desc = ShaderDesc {
            inputs: vec![input("glow", 0, InputKind::Scalar)],
            blocks: vec![],
        };
        let mut s = shader(desc);
        assert!(!s.set_input_override("glow", &[0u8; 8]));
        assert!(!s.set_input_override("nope", &[0u8; 4]));
    }
}
