//! Text: font table, glyph atlas, and glyph-quad layout.
//!
//! Rasterization is delegated to `fontdue`; this module owns the atlas
//! placement and the conversion of laid-out glyphs into textured quads for
//! the batching engine. The atlas texture is allocated through the backend
//! (`create_texture`) and glyph bitmaps are uploaded as dirty rectangles
//! (`update_texture`), so text exercises the same texture path as any other
//! dynamic atlas.

mod font_system;
mod glyph_atlas;

pub use font_system::{FontId, FontLoadError, FontSystem};
pub(crate) use glyph_atlas::GlyphAtlas;

use anyhow::Result;
use fontdue::layout::{CoordinateSystem, GlyphRasterConfig, Layout, LayoutSettings, TextStyle};

use crate::backend::RenderBackend;
use crate::coords::Vec2;
use crate::handle::TextureHandle;

/// One glyph ready for batching: destination rect + atlas UVs.
#[derive(Debug, Copy, Clone)]
pub(crate) struct GlyphQuad {
    pub min: Vec2,
    pub max: Vec2,
    pub uv_min: Vec2,
    pub uv_max: Vec2,
}

/// Fonts + atlas + reusable layout scratch.
///
/// The scratch buffers (`layout`, `snapshot`, `quads`) persist across
/// frames and are overwritten per call — frame-scoped, never lent out
/// beyond the returned slice.
pub(crate) struct TextSystem {
    pub fonts: FontSystem,
    atlas: GlyphAtlas,
    layout: Layout<()>,
    snapshot: Vec<(GlyphRasterConfig, f32, f32, f32, f32)>,
    quads: Vec<GlyphQuad>,
}

impl TextSystem {
    pub fn new(backend: &mut dyn RenderBackend, atlas_size: u32) -> Result<Self> {
        Ok(Self {
            fonts: FontSystem::new(),
            atlas: GlyphAtlas::new(backend, atlas_size)?,
            layout: Layout::new(CoordinateSystem::PositiveYDown),
            snapshot: Vec::new(),
            quads: Vec::new(),
        })
    }

    pub fn atlas_texture(&self) -> TextureHandle {
        self.atlas.texture()
    }

    /// Lays out `text` and returns one quad per visible glyph, rasterizing
    /// and uploading atlas entries on first use.
    pub fn layout_glyphs(
        &mut self,
        backend: &mut dyn RenderBackend,
        font: FontId,
        text: &str,
        origin: Vec2,
        px_size: f32,
        max_width: Option<f32>,
    ) -> &[GlyphQuad] {
        self.quads.clear();
        let Some(f) = self.fonts.get(font) else {
            log::warn!("draw_text: unknown FontId {font:?}, skipping");
            return &self.quads;
        };

        self.layout.reset(&LayoutSettings {
            x: origin.x,
            y: origin.y,
            max_width,
            ..LayoutSettings::default()
        });
        self.layout.append(&[f], &TextStyle::new(text, px_size, 0));

        // Snapshot positions so the borrow on `layout` ends before the
        // atlas (which needs `&mut`) comes into play.
        self.snapshot.clear();
        self.snapshot.extend(
            self.layout
                .glyphs()
                .iter()
                .filter(|g| g.char_data.rasterize() && g.width > 0 && g.height > 0)
                .map(|g| (g.key, g.x, g.y, g.width as f32, g.height as f32)),
        );

        for &(key, x, y, w, h) in &self.snapshot {
            let Some(entry) = self.atlas.get_or_insert(backend, f, key) else {
                continue;
            };
            self.quads.push(GlyphQuad {
                min: Vec2::new(x, y),
                max: Vec2::new(x + w, y + h),
                uv_min: Vec2::new(entry.uv_min[0], entry.uv_min[1]),
                uv_max: Vec2::new(entry.uv_max[0], entry.uv_max[1]),
            });
        }
        &self.quads
    }
}
