//! Per-frame input supplied by the host, and the glyph rasterizer boundary.

use std::ops::Range;

use bitflags::bitflags;
use cellgrid_core::geometry::Size;

use crate::color::Rgba;

/// Font-relative glyph identity. Combined with a [`GlyphMode`] it forms the
/// atlas key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphId {
    /// Host-assigned font face id.
    pub face: u32,
    pub glyph_index: u32,
}

impl GlyphId {
    pub const fn new(face: u32, glyph_index: u32) -> Self {
        Self { face, glyph_index }
    }
}

/// How a glyph is stored in the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlyphMode {
    Grayscale,
    Subpixel,
    Color,
    Builtin,
}

/// Atlas key: face + glyph index + rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphKey {
    pub face: u32,
    pub glyph_index: u32,
    pub mode: GlyphMode,
}

impl GlyphKey {
    pub const fn new(id: GlyphId, mode: GlyphMode) -> Self {
        Self {
            face: id.face,
            glyph_index: id.glyph_index,
            mode,
        }
    }
}

/// Pixel format of a rasterized glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlyphContent {
    /// One coverage byte per pixel.
    Coverage,
    /// RGBA8; RGB carry per-channel coverage.
    Subpixel,
    /// RGBA8 premultiplied color (emoji, images).
    Color,
    /// RGBA8 control data for procedurally shaded box-drawing glyphs.
    Builtin,
}

impl GlyphContent {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            GlyphContent::Coverage => 1,
            _ => 4,
        }
    }
}

/// Output of the external rasterizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterizedGlyph {
    pub width: u32,
    pub height: u32,
    /// Top-left of the bitmap relative to the cell's top-left, in pixels.
    pub offset: (i16, i16),
    pub content: GlyphContent,
    /// Tightly packed rows, `width * bytes_per_pixel` bytes each.
    pub pixels: Vec<u8>,
}

/// Glyph shaping and rasterization collaborator.
///
/// Called synchronously on the rendering thread, at most once per glyph key
/// per atlas generation.
pub trait GlyphRasterizer: Send {
    /// Rasterize `key`. `None` means the glyph has no visible pixels.
    fn rasterize(&mut self, key: GlyphKey, metrics: &FontMetrics) -> Option<RasterizedGlyph>;

    /// Storage mode for `id` when subpixel output is allowed. Color glyphs and
    /// builtin box-drawing glyphs answer with their own mode; the renderer
    /// downgrades `Subpixel` to `Grayscale` when subpixel text is off.
    fn preferred_mode(&self, id: GlyphId) -> GlyphMode {
        let _ = id;
        GlyphMode::Grayscale
    }
}

/// Per-row line rendition (DECDWL / DECDHL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LineRendition {
    #[default]
    Single,
    DoubleWidth,
    DoubleHeightTop,
    DoubleHeightBottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UnderlineStyle {
    #[default]
    None,
    Single,
    Double,
    Dotted,
    Dashed,
    Curly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decoration {
    pub underline: UnderlineStyle,
    /// Underline color; the foreground when `None`.
    pub underline_color: Option<Rgba>,
    pub strikethrough: bool,
    /// Cell borders drawn in the foreground color.
    pub gridlines: GridLines,
}

bitflags! {
    /// Cell border lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GridLines: u8 {
        const LEFT = 1 << 0;
        const TOP = 1 << 1;
        const RIGHT = 1 << 2;
        const BOTTOM = 1 << 3;
    }
}

/// One grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub glyph: Option<GlyphId>,
    pub fg: Rgba,
    pub bg: Rgba,
    pub decoration: Decoration,
    /// Columns covered: 1, or 2 for wide characters. The following cell of a
    /// wide character is a spacer with width 0.
    pub width: u8,
}

impl Cell {
    pub const fn blank(fg: Rgba, bg: Rgba) -> Self {
        Self {
            glyph: None,
            fg,
            bg,
            decoration: Decoration {
                underline: UnderlineStyle::None,
                underline_color: None,
                strikethrough: false,
                gridlines: GridLines::empty(),
            },
            width: 1,
        }
    }

    pub const fn with_glyph(mut self, glyph: GlyphId) -> Self {
        self.glyph = Some(glyph);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Row {
    pub cells: Vec<Cell>,
    pub rendition: LineRendition,
}

/// Which rows changed since the previous frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DirtyRegion {
    /// Rebuild everything.
    #[default]
    All,
    /// Only these rows changed.
    Rows(Range<usize>),
    /// Nothing changed in the grid (cursor, selection or the clock may have).
    None,
}

impl DirtyRegion {
    pub fn contains(&self, row: usize) -> bool {
        match self {
            DirtyRegion::All => true,
            DirtyRegion::Rows(range) => range.contains(&row),
            DirtyRegion::None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CursorShape {
    #[default]
    Block,
    Bar,
    Underline,
    HollowBox,
    DoubleUnderline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorState {
    pub row: usize,
    pub col: usize,
    pub shape: CursorShape,
    pub color: Rgba,
    pub blinking: bool,
}

/// Selected columns within one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectionSpan {
    pub row: usize,
    pub cols: Range<usize>,
}

/// Cell geometry and decoration metrics, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontMetrics {
    pub cell_size: Size<u16>,
    pub baseline: u16,
    pub underline_position: u16,
    pub underline_width: u16,
    pub strikethrough_position: u16,
    pub strikethrough_width: u16,
    pub double_underline_positions: (u16, u16),
    pub curly_half_height: f32,
    /// Bumped by the host whenever the font face, size or fallback chain
    /// changes. A change invalidates the glyph atlas.
    pub generation: u64,
}

impl Default for FontMetrics {
    fn default() -> Self {
        Self {
            cell_size: Size::new(9, 18),
            baseline: 14,
            underline_position: 15,
            underline_width: 1,
            strikethrough_position: 9,
            strikethrough_width: 1,
            double_underline_positions: (15, 17),
            curly_half_height: 1.5,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Palette {
    pub background: Rgba,
    pub foreground: Rgba,
    pub selection: Rgba,
    pub cursor: Rgba,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            background: Rgba::from_hex(0x0C0C0C),
            foreground: Rgba::from_hex(0xCCCCCC),
            selection: Rgba::new(0xFF, 0xFF, 0xFF, 0x50),
            cursor: Rgba::WHITE,
        }
    }
}

bitflags! {
    /// Time-varying effects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EffectFlags: u32 {
        /// Scroll dotted/dashed/curly underline patterns over time.
        const ANIMATE_LINES = 1 << 0;
        /// Blink the cursor.
        const BLINK_CURSOR = 1 << 1;
    }
}

/// Global per-frame settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
    pub font: FontMetrics,
    pub palette: Palette,
    /// Text gamma, clamped to `1.0..=2.2`.
    pub gamma: f32,
    /// DirectWrite-style enhanced contrast, `0.0..`.
    pub enhanced_contrast: f32,
    pub effects: EffectFlags,
    /// Pixels per second for animated line patterns.
    pub line_animation_speed: f32,
    /// Full blink cycle in seconds.
    pub cursor_blink_period: f32,
    /// Request subpixel (RGB) text where the rasterizer supports it.
    pub subpixel_text: bool,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            font: FontMetrics::default(),
            palette: Palette::default(),
            gamma: 1.8,
            enhanced_contrast: 0.5,
            effects: EffectFlags::empty(),
            line_animation_speed: 8.0,
            cursor_blink_period: 1.06,
            subpixel_text: false,
        }
    }
}

/// Target size in physical pixels.
pub type ViewportSize = Size<u32>;

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPayload {
    pub viewport: ViewportSize,
    pub rows: Vec<Row>,
    pub dirty: DirtyRegion,
    pub cursor: Option<CursorState>,
    pub selection: Vec<SelectionSpan>,
    pub settings: FrameSettings,
}

impl RenderPayload {
    /// An empty `columns`×`rows` grid filled with the palette background.
    pub fn blank(viewport: ViewportSize, columns: usize, rows: usize) -> Self {
        let settings = FrameSettings::default();
        let cell = Cell::blank(settings.palette.foreground, settings.palette.background);
        Self {
            viewport,
            rows: (0..rows)
                .map(|_| Row {
                    cells: vec![cell; columns],
                    rendition: LineRendition::Single,
                })
                .collect(),
            dirty: DirtyRegion::All,
            cursor: None,
            selection: Vec::new(),
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_region_contains() {
        assert!(DirtyRegion::All.contains(40));
        assert!(DirtyRegion::Rows(2..4).contains(3));
        assert!(!DirtyRegion::Rows(2..4).contains(4));
        assert!(!DirtyRegion::None.contains(0));
    }

    #[test]
    fn test_blank_payload() {
        let payload = RenderPayload::blank(Size::new(720, 432), 80, 24);
        assert_eq!(payload.rows.len(), 24);
        assert!(payload.rows.iter().all(|r| r.cells.len() == 80));
        assert_eq!(payload.rows[0].cells[0].bg, payload.settings.palette.background);
    }

    #[test]
    fn test_glyph_key_includes_mode() {
        let id = GlyphId {
            face: 1,
            glyph_index: 36,
        };
        assert_ne!(
            GlyphKey::new(id, GlyphMode::Grayscale),
            GlyphKey::new(id, GlyphMode::Subpixel)
        );
    }
}
