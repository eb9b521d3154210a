//! Generational resource handles.
//!
//! All GPU resources are addressed through `slotmap` keys: O(1)
//! insert/remove/lookup with slot reuse, and a generation embedded in every
//! key so a stale handle never aliases a resource that later reused its
//! slot. Operations on stale handles log and no-op (see `RenderBackend`).

slotmap::new_key_type! {
    /// Texture owned by a backend.
    pub struct TextureHandle;

    /// GPU shader objects (program/stages, layout, constant buffers) owned
    /// by a backend.
    pub struct BackendShaderHandle;

    /// CPU-side [`Shader`](crate::shader::Shader) owned by the
    /// [`Renderer`](crate::render::Renderer).
    pub struct ShaderHandle;
}
