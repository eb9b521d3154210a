//! Cross-backend 2D rendering core.
//!
//! One drawing surface ([`render::Renderer`]) over distinct GPU APIs: a
//! [`backend::RenderBackend`] trait with OpenGL and Direct3D11
//! implementations, reflection-driven shader loading, and a state-keyed
//! vertex batching engine.

pub mod backend;
pub mod batch;
pub mod coords;
pub mod format;
pub mod handle;
pub mod logging;
pub mod render;
pub mod shader;
pub mod text;

pub use coords::{Camera, ColorRgba, Rect, Vec2, Viewport};
pub use format::PixelFormat;
pub use render::{Renderer, RendererInit, Texture};
