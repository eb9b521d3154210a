use std::collections::HashMap;

use anyhow::Result;
use fontdue::layout::GlyphRasterConfig;

use crate::backend::RenderBackend;
use crate::format::PixelFormat;
use crate::handle::TextureHandle;

/// Pixels between glyphs so linear filtering never bleeds neighbors.
const GLYPH_PADDING: u32 = 1;

#[derive(Debug, Copy, Clone)]
pub(crate) struct CachedGlyph {
    pub uv_min: [f32; 2],
    pub uv_max: [f32; 2],
}

/// Shelf-packed glyph atlas over a backend texture.
///
/// The texture is RGBA8 with white RGB and coverage in alpha, so glyph
/// quads render through the default shader like any other textured quad.
/// Each placed glyph is uploaded as its own dirty rectangle via
/// `update_texture`. The cache key is `GlyphRasterConfig` — font identity,
/// glyph index and pixel size — so a glyph is rasterized once per size.
pub(crate) struct GlyphAtlas {
    texture: TextureHandle,
    size: u32,
    cursor_x: u32,
    cursor_y: u32,
    row_height: u32,
    full: bool,
    cache: HashMap<GlyphRasterConfig, CachedGlyph>,
    /// Coverage-to-RGBA expansion scratch, reused per upload.
    staging: Vec<u8>,
}

impl GlyphAtlas {
    pub fn new(backend: &mut dyn RenderBackend, size: u32) -> Result<Self> {
        let texture = backend.create_texture(size, size, PixelFormat::Rgba8Norm)?;
        Ok(Self {
            texture,
            size,
            cursor_x: GLYPH_PADDING,
            cursor_y: GLYPH_PADDING,
            row_height: 0,
            full: false,
            cache: HashMap::new(),
            staging: Vec::new(),
        })
    }

    #[inline]
    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    /// Returns the cached atlas entry for `key`, rasterizing and uploading
    /// it on first use. `None` when the atlas is full or the glyph is
    /// empty.
    pub fn get_or_insert(
        &mut self,
        backend: &mut dyn RenderBackend,
        font: &fontdue::Font,
        key: GlyphRasterConfig,
    ) -> Option<CachedGlyph> {
        if let Some(cached) = self.cache.get(&key) {
            return Some(*cached);
        }
        let (metrics, coverage) = font.rasterize_config(key);
        if metrics.width == 0 || metrics.height == 0 {
            return None;
        }
        let entry =
            self.place(backend, &coverage, metrics.width as u32, metrics.height as u32)?;
        self.cache.insert(key, entry);
        Some(entry)
    }

    fn place(
        &mut self,
        backend: &mut dyn RenderBackend,
        coverage: &[u8],
        w: u32,
        h: u32,
    ) -> Option<CachedGlyph> {
        if self.full {
            return None;
        }

        // New shelf row when the glyph does not fit horizontally.
        if self.cursor_x + w + GLYPH_PADDING > self.size {
            self.cursor_y += self.row_height + GLYPH_PADDING;
            self.cursor_x = GLYPH_PADDING;
            self.row_height = 0;
        }
        if self.cursor_y + h + GLYPH_PADDING > self.size {
            log::warn!(
                "glyph atlas is full ({size}x{size}); further glyphs will not render",
                size = self.size
            );
            self.full = true;
            return None;
        }

        let gx = self.cursor_x;
        let gy = self.cursor_y;

        self.staging.clear();
        self.staging.reserve(coverage.len() * 4);
        for &c in coverage {
            self.staging.extend_from_slice(&[255, 255, 255, c]);
        }
        if !backend.update_texture(self.texture, gx, gy, w, h, &self.staging) {
            return None;
        }

        self.cursor_x += w + GLYPH_PADDING;
        self.row_height = self.row_height.max(h);

        let size_f = self.size as f32;
        Some(CachedGlyph {
            uv_min: [gx as f32 / size_f, gy as f32 / size_f],
            uv_max: [(gx + w) as f32 / size_f, (gy + h) as f32 / size_f],
        })
    }
}
