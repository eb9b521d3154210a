//! Coordinate and geometry types shared across the drawing surface and the
//! backends.
//!
//! Canonical CPU space:
//! - Logical pixels
//! - Origin top-left
//! - +X right, +Y down
//!
//! Backends convert to clip space via the camera's view-projection matrix;
//! the depth direction of that conversion is backend-specific (see
//! [`Camera::view_projection`]).

mod camera;
mod color;
mod rect;
mod vec2;
mod viewport;

pub use camera::Camera;
pub use color::ColorRgba;
pub use rect::Rect;
pub use vec2::Vec2;
pub use viewport::Viewport;
