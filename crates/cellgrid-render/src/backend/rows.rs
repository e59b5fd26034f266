//! Per-row layer construction and caching.
//!
//! Background, text and decoration layers depend only on a row's cells, the
//! frame settings and atlas placements, so they are kept between frames and
//! rebuilt for the rows the host marks dirty.

use cellgrid_core::alloc::HashMap;
use cellgrid_gpu::GraphicsDevice;

use crate::atlas::{AtlasError, AtlasRegion, GlyphAtlas};
use crate::capability::SubpixelPath;
use crate::color::Rgba;
use crate::error::RenderError;
use crate::instance::{AtlasUnit, InstanceRecord, RenditionScale, ShadingMode};
use crate::payload::{
    Cell, CursorShape, CursorState, EffectFlags, FontMetrics, FrameSettings, GlyphContent,
    GlyphKey, GlyphMode, GlyphRasterizer, GridLines, LineRendition, Row, SelectionSpan,
    UnderlineStyle, ViewportSize,
};

/// Build a record, saturating coordinates into the wire types.
pub(crate) fn quad(mode: ShadingMode, x: i32, y: i32, width: i32, height: i32) -> InstanceRecord {
    let clamp_pos = |v: i32| v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    let clamp_size = |v: i32| v.clamp(0, u16::MAX as i32) as u16;
    InstanceRecord::new(
        mode,
        [clamp_pos(x), clamp_pos(y)],
        [clamp_size(width), clamp_size(height)],
    )
}

/// Append `record`, widening the previous record instead when the two are
/// horizontally adjacent with identical attributes. Only valid for modes
/// whose output does not depend on the quad origin.
fn push_merged(layer: &mut Vec<InstanceRecord>, record: InstanceRecord) {
    if let Some(last) = layer.last_mut() {
        let adjacent = last.position[0] as i32 + last.size[0] as i32 == record.position[0] as i32;
        if adjacent
            && last.shading_mode == record.shading_mode
            && last.position[1] == record.position[1]
            && last.size[1] == record.size[1]
            && last.color == record.color
            && last.rendition_scale == record.rendition_scale
        {
            if let Some(width) = last.size[0].checked_add(record.size[0]) {
                last.size[0] = width;
                return;
            }
        }
    }
    layer.push(record);
}

/// Whether any pixel of `record` lands inside the viewport.
pub(crate) fn on_screen(record: &InstanceRecord, viewport: ViewportSize) -> bool {
    let (x, y) = (record.position[0] as i64, record.position[1] as i64);
    let (width, height) = (record.size[0] as i64, record.size[1] as i64);
    width > 0
        && height > 0
        && x < viewport.width as i64
        && y < viewport.height as i64
        && x + width > 0
        && y + height > 0
}

/// Where a glyph lives and how it shades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GlyphPlacement {
    pub region: AtlasRegion,
    pub offset: (i16, i16),
    pub mode: ShadingMode,
    pub unit: AtlasUnit,
}

/// The two atlases, addressed by texture unit.
pub(crate) struct AtlasPair {
    pub coverage: GlyphAtlas,
    pub color: GlyphAtlas,
}

impl AtlasPair {
    pub fn get_mut(&mut self, unit: AtlasUnit) -> &mut GlyphAtlas {
        match unit {
            AtlasUnit::Coverage => &mut self.coverage,
            AtlasUnit::Color => &mut self.color,
        }
    }

    pub fn generations(&self) -> (u64, u64) {
        (self.coverage.generation(), self.color.generation())
    }
}

/// Glyph key to placement, including negative entries for glyphs with no
/// visible pixels.
#[derive(Default)]
pub(crate) struct PlacementCache {
    entries: HashMap<GlyphKey, Option<GlyphPlacement>>,
}

impl PlacementCache {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Forget placements in one atlas after it was reset.
    pub fn forget_unit(&mut self, unit: AtlasUnit) {
        self.entries
            .retain(|_, placement| placement.is_none_or(|p| p.unit != unit));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Why a row walk stopped early.
#[derive(Debug)]
pub(crate) enum WalkError {
    /// An atlas was full even after growing and has reset itself.
    AtlasFull(AtlasUnit),
    Render(RenderError),
}

impl From<RenderError> for WalkError {
    fn from(err: RenderError) -> Self {
        WalkError::Render(err)
    }
}

/// Everything glyph resolution touches during a walk.
pub(crate) struct GlyphResolver<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub rasterizer: &'a mut dyn GlyphRasterizer,
    pub atlases: &'a mut AtlasPair,
    pub placements: &'a mut PlacementCache,
    pub subpixel: SubpixelPath,
    pub glyphs_inserted: u32,
}

fn content_mode(content: GlyphContent) -> (ShadingMode, AtlasUnit) {
    match content {
        GlyphContent::Coverage => (ShadingMode::TextGrayscale, AtlasUnit::Coverage),
        GlyphContent::Subpixel => (ShadingMode::TextSubpixel, AtlasUnit::Color),
        GlyphContent::Color => (ShadingMode::TextPassthrough, AtlasUnit::Color),
        GlyphContent::Builtin => (ShadingMode::TextBuiltin, AtlasUnit::Color),
    }
}

impl GlyphResolver<'_> {
    /// Storage mode for a glyph under the current subpixel setting.
    fn key_for(&self, cell: &Cell) -> Option<GlyphKey> {
        let id = cell.glyph?;
        let mut mode = self.rasterizer.preferred_mode(id);
        if mode == GlyphMode::Subpixel && self.subpixel == SubpixelPath::Disabled {
            mode = GlyphMode::Grayscale;
        }
        Some(GlyphKey::new(id, mode))
    }

    /// Look up `key`, rasterizing and inserting it on a miss.
    fn resolve(
        &mut self,
        key: GlyphKey,
        metrics: &FontMetrics,
    ) -> Result<Option<GlyphPlacement>, WalkError> {
        if let Some(placement) = self.placements.entries.get(&key) {
            return Ok(*placement);
        }

        let Some(glyph) = self.rasterizer.rasterize(key, metrics) else {
            self.placements.entries.insert(key, None);
            return Ok(None);
        };
        let (mode, unit) = content_mode(glyph.content);

        let placement = match self.atlases.get_mut(unit).insert(
            self.device,
            key,
            &glyph.pixels,
            glyph.width,
            glyph.height,
        ) {
            Ok(region) => {
                self.glyphs_inserted += 1;
                Some(GlyphPlacement {
                    region,
                    offset: glyph.offset,
                    mode,
                    unit,
                })
            }
            Err(AtlasError::Full) => {
                self.placements.forget_unit(unit);
                return Err(WalkError::AtlasFull(unit));
            }
            Err(err @ (AtlasError::GlyphTooLarge { .. } | AtlasError::InvalidData { .. })) => {
                tracing::warn!("Skipping glyph {:?}: {}", key, err);
                None
            }
            Err(AtlasError::Device(err)) => return Err(WalkError::Render(err.into())),
        };
        self.placements.entries.insert(key, placement);
        Ok(placement)
    }
}

/// Pixel geometry of one row.
#[derive(Debug, Clone, Copy)]
struct RowGeometry {
    top: i32,
    height: i32,
    cell_width: i32,
    scale: RenditionScale,
    /// Top of the (possibly double-height) glyph box.
    origin_y: i32,
}

impl RowGeometry {
    fn new(font: &FontMetrics, index: usize, rendition: LineRendition) -> Self {
        let height = font.cell_size.height as i32;
        let top = index as i32 * height;
        let (scale, origin_y) = match rendition {
            LineRendition::Single => (RenditionScale::SINGLE, top),
            LineRendition::DoubleWidth => (RenditionScale::WIDE, top),
            LineRendition::DoubleHeightTop => (RenditionScale::LARGE, top),
            LineRendition::DoubleHeightBottom => (RenditionScale::LARGE, top - height),
        };
        Self {
            top,
            height,
            cell_width: font.cell_size.width as i32 * scale.x as i32,
            scale,
            origin_y,
        }
    }

    fn bottom(&self) -> i32 {
        self.top + self.height
    }

    fn x(&self, col: usize) -> i32 {
        col as i32 * self.cell_width
    }

    /// Clip a horizontal band `[y, y + h)` in glyph space to the row.
    fn clip_band(&self, y: i32, h: i32) -> Option<(i32, i32)> {
        let start = y.max(self.top);
        let end = (y + h).min(self.bottom());
        (end > start).then_some((start, end - start))
    }
}

/// The cached layers of one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RowLayers {
    pub background: Vec<InstanceRecord>,
    pub text: Vec<InstanceRecord>,
    pub decoration: Vec<InstanceRecord>,
    /// Contains on-screen line patterns that move when line animation is on.
    pub animated: bool,
}

fn text_record(geometry: &RowGeometry, x: i32, placement: &GlyphPlacement, fg: Rgba) -> Option<InstanceRecord> {
    let sx = geometry.scale.x as i32;
    let sy = geometry.scale.y as i32;
    let region = placement.region;
    let x = x + placement.offset.0 as i32 * sx;
    let mut y = geometry.origin_y + placement.offset.1 as i32 * sy;
    let width = region.width as i32 * sx;
    let mut height = region.height as i32 * sy;
    let mut texel_y = region.y as i32;

    if geometry.scale.y > 1 {
        // Drop whole texel rows above the visible half, then cut at the bottom.
        if y < geometry.top {
            let skip = (geometry.top - y) / sy;
            texel_y += skip;
            y += skip * sy;
            height -= skip * sy;
        }
        height = height.min(geometry.bottom() - y);
    }
    if width <= 0 || height <= 0 {
        return None;
    }

    Some(
        quad(placement.mode, x, y, width, height)
            .with_texcoord([region.x as u16, texel_y.max(0) as u16])
            .with_rendition(geometry.scale)
            .with_color(fg),
    )
}

fn line(
    geometry: &RowGeometry,
    mode: ShadingMode,
    x: i32,
    width: i32,
    position: u16,
    thickness: u16,
    color: Rgba,
) -> Option<InstanceRecord> {
    let sy = geometry.scale.y as i32;
    let y = geometry.origin_y + position as i32 * sy;
    let (y, h) = geometry.clip_band(y, thickness.max(1) as i32 * sy)?;
    Some(
        quad(mode, x, y, width, h)
            .with_rendition(geometry.scale)
            .with_color(color),
    )
}

fn curly(
    geometry: &RowGeometry,
    font: &FontMetrics,
    x: i32,
    width: i32,
    color: Rgba,
) -> Option<InstanceRecord> {
    let sy = geometry.scale.y as f32;
    let half_height = font.curly_half_height.max(0.5) * sy;
    let stroke = font.underline_width.max(1) as f32 * sy;
    let center = geometry.origin_y as f32 + font.underline_position as f32 * sy + stroke / 2.0;
    let y = (center - half_height).floor() as i32;
    let h = (2.0 * half_height + stroke).ceil() as i32;
    if y >= geometry.bottom() || y + h <= geometry.top {
        return None;
    }
    Some(
        quad(ShadingMode::CurlyLine, x, y, width, h)
            .with_rendition(geometry.scale)
            .with_color(color),
    )
}

fn decorate(
    layer: &mut Vec<InstanceRecord>,
    geometry: &RowGeometry,
    font: &FontMetrics,
    cell: &Cell,
    x: i32,
    width: i32,
) {
    let decoration = &cell.decoration;
    let color = decoration.underline_color.unwrap_or(cell.fg);

    let underline = match decoration.underline {
        UnderlineStyle::None => None,
        UnderlineStyle::Single => line(
            geometry,
            ShadingMode::SolidLine,
            x,
            width,
            font.underline_position,
            font.underline_width,
            color,
        ),
        UnderlineStyle::Double => {
            let (first, second) = font.double_underline_positions;
            if let Some(record) = line(geometry, ShadingMode::SolidLine, x, width, first, font.underline_width, color) {
                push_merged(layer, record);
            }
            line(geometry, ShadingMode::SolidLine, x, width, second, font.underline_width, color)
        }
        UnderlineStyle::Dotted => line(
            geometry,
            ShadingMode::DottedLine,
            x,
            width,
            font.underline_position,
            font.underline_width,
            color,
        ),
        UnderlineStyle::Dashed => line(
            geometry,
            ShadingMode::DashedLine,
            x,
            width,
            font.underline_position,
            font.underline_width,
            color,
        ),
        UnderlineStyle::Curly => curly(geometry, font, x, width, color),
    };
    if let Some(record) = underline {
        push_merged(layer, record);
    }

    if decoration.strikethrough {
        if let Some(record) = line(
            geometry,
            ShadingMode::SolidLine,
            x,
            width,
            font.strikethrough_position,
            font.strikethrough_width,
            cell.fg,
        ) {
            push_merged(layer, record);
        }
    }

    if !decoration.gridlines.is_empty() {
        gridlines(layer, geometry, font, decoration.gridlines, x, width, cell.fg);
    }
}

/// Cell borders. Horizontal lines may merge with the previous record; vertical
/// lines never do.
fn gridlines(
    layer: &mut Vec<InstanceRecord>,
    geometry: &RowGeometry,
    font: &FontMetrics,
    lines: GridLines,
    x: i32,
    width: i32,
    color: Rgba,
) {
    let thickness = font.underline_width.max(1) as i32;
    let stroke_x = thickness * geometry.scale.x as i32;
    let stroke_y = thickness * geometry.scale.y as i32;
    let (top, height) = (geometry.top, geometry.height);
    let rect = |x, y, w, h| {
        quad(ShadingMode::SolidLine, x, y, w, h)
            .with_rendition(geometry.scale)
            .with_color(color)
    };

    if lines.contains(GridLines::TOP) {
        push_merged(layer, rect(x, top, width, stroke_y));
    }
    if lines.contains(GridLines::BOTTOM) {
        push_merged(layer, rect(x, top + height - stroke_y, width, stroke_y));
    }
    if lines.contains(GridLines::LEFT) {
        layer.push(rect(x, top, stroke_x, height));
    }
    if lines.contains(GridLines::RIGHT) {
        layer.push(rect(x + width - stroke_x, top, stroke_x, height));
    }
}

/// Build the cached layers of row `index`.
pub(crate) fn build_row(
    resolver: &mut GlyphResolver<'_>,
    settings: &FrameSettings,
    viewport: ViewportSize,
    index: usize,
    row: &Row,
) -> Result<RowLayers, WalkError> {
    let font = &settings.font;
    let geometry = RowGeometry::new(font, index, row.rendition);
    let mut layers = RowLayers::default();

    for (col, cell) in row.cells.iter().enumerate() {
        let x = geometry.x(col);
        push_merged(
            &mut layers.background,
            quad(ShadingMode::Background, x, geometry.top, geometry.cell_width, geometry.height)
                .with_color(cell.bg),
        );

        if cell.width == 0 {
            continue;
        }
        let width = geometry.cell_width * cell.width as i32;

        if let Some(key) = resolver.key_for(cell) {
            if let Some(placement) = resolver.resolve(key, font)? {
                if let Some(record) = text_record(&geometry, x, &placement, cell.fg) {
                    layers.text.push(record);
                }
            }
        }

        decorate(&mut layers.decoration, &geometry, font, cell, x, width);
    }

    layers.animated = layers.decoration.iter().any(|record| {
        record
            .mode()
            .is_some_and(|mode| mode.is_time_varying(EffectFlags::ANIMATE_LINES))
            && on_screen(record, viewport)
    });
    Ok(layers)
}

/// Selection highlight for every span on a visible row.
pub(crate) fn selection_layer(
    rows: &[Row],
    spans: &[SelectionSpan],
    settings: &FrameSettings,
) -> Vec<InstanceRecord> {
    let mut layer = Vec::new();
    for span in spans {
        let Some(row) = rows.get(span.row) else {
            continue;
        };
        let start = span.cols.start.min(row.cells.len());
        let end = span.cols.end.min(row.cells.len());
        if start >= end {
            continue;
        }
        let geometry = RowGeometry::new(&settings.font, span.row, row.rendition);
        layer.push(
            quad(
                ShadingMode::FilledRect,
                geometry.x(start),
                geometry.top,
                geometry.x(end) - geometry.x(start),
                geometry.height,
            )
            .with_color(settings.palette.selection),
        );
    }
    layer
}

/// Cursor instances for `cursor`, shaped by [`CursorShape`].
pub(crate) fn cursor_layer(
    rows: &[Row],
    cursor: &CursorState,
    settings: &FrameSettings,
) -> Vec<InstanceRecord> {
    let Some(row) = rows.get(cursor.row) else {
        return Vec::new();
    };
    let font = &settings.font;
    let geometry = RowGeometry::new(font, cursor.row, row.rendition);
    let columns = row
        .cells
        .get(cursor.col)
        .map_or(1, |cell| cell.width.max(1) as i32);
    let x = geometry.x(cursor.col);
    let width = geometry.cell_width * columns;
    let (top, height) = (geometry.top, geometry.height);
    let thickness = font.underline_width.max(1) as i32 * geometry.scale.y as i32;
    let rect = |x, y, w, h| quad(ShadingMode::Cursor, x, y, w, h).with_color(cursor.color);

    match cursor.shape {
        CursorShape::Block => vec![rect(x, top, width, height)],
        CursorShape::Bar => vec![rect(x, top, thickness.max(geometry.scale.x as i32), height)],
        CursorShape::Underline => vec![rect(x, top + height - thickness, width, thickness)],
        CursorShape::HollowBox => vec![
            rect(x, top, width, 1),
            rect(x, top + height - 1, width, 1),
            rect(x, top + 1, 1, height - 2),
            rect(x + width - 1, top + 1, 1, height - 2),
        ],
        CursorShape::DoubleUnderline => {
            let (first, second) = font.double_underline_positions;
            [first, second]
                .into_iter()
                .map(|position| {
                    let y = geometry.origin_y + position as i32 * geometry.scale.y as i32;
                    rect(x, y.min(top + height - thickness), width, thickness)
                })
                .collect()
        }
    }
}

/// Color for glyph pixels covered by the cursor: the cell background, or
/// the cell foreground when the background matches the cursor.
pub(crate) fn cursor_text_color(rows: &[Row], cursor: &CursorState, settings: &FrameSettings) -> Rgba {
    match rows.get(cursor.row).and_then(|row| row.cells.get(cursor.col)) {
        Some(cell) if cell.bg == cursor.color => cell.fg,
        Some(cell) => cell.bg,
        None => settings.palette.background,
    }
}

/// `glyph` cut to the area of `clip`. The leading edges snap inward to whole
/// texels so the texcoord stays aligned.
fn clip_text(glyph: &InstanceRecord, clip: &InstanceRecord) -> Option<InstanceRecord> {
    let sx = glyph.rendition_scale[0].max(1) as i32;
    let sy = glyph.rendition_scale[1].max(1) as i32;
    let (x, y) = (glyph.position[0] as i32, glyph.position[1] as i32);
    let (clip_x, clip_y) = (clip.position[0] as i32, clip.position[1] as i32);

    let skip_x = ((clip_x - x).max(0) + sx - 1) / sx;
    let skip_y = ((clip_y - y).max(0) + sy - 1) / sy;
    let left = x + skip_x * sx;
    let top = y + skip_y * sy;
    let right = (x + glyph.size[0] as i32).min(clip_x + clip.size[0] as i32);
    let bottom = (y + glyph.size[1] as i32).min(clip_y + clip.size[1] as i32);
    if right <= left || bottom <= top {
        return None;
    }

    let mut record = *glyph;
    record.position = [left as i16, top as i16];
    record.size = [(right - left) as u16, (bottom - top) as u16];
    record.texcoord = [
        glyph.texcoord[0].saturating_add(skip_x as u16),
        glyph.texcoord[1].saturating_add(skip_y as u16),
    ];
    Some(record)
}

/// Glyphs of the cursor row re-emitted inside the cursor shapes in `color`.
pub(crate) fn cursor_foreground(
    cursor: &[InstanceRecord],
    text: &[InstanceRecord],
    color: Rgba,
) -> Vec<InstanceRecord> {
    cursor
        .iter()
        .flat_map(|rect| text.iter().filter_map(move |glyph| clip_text(glyph, rect)))
        .map(|record| record.with_color(color))
        .collect()
}

/// Inputs whose change invalidates every cached row.
#[derive(Debug, Clone, PartialEq)]
struct CacheKey {
    viewport: ViewportSize,
    settings: FrameSettings,
    atlas_generations: (u64, u64),
    device_epoch: u64,
}

/// Layers of previously built rows.
#[derive(Default)]
pub(crate) struct RowCache {
    rows: Vec<Option<RowLayers>>,
    key: Option<CacheKey>,
}

impl RowCache {
    /// Drop every row if the frame inputs changed since the last frame.
    /// Returns `true` if the cache was invalidated.
    pub fn validate(
        &mut self,
        viewport: ViewportSize,
        settings: &FrameSettings,
        atlas_generations: (u64, u64),
        device_epoch: u64,
    ) -> bool {
        let key = CacheKey {
            viewport,
            settings: *settings,
            atlas_generations,
            device_epoch,
        };
        if self.key.as_ref() == Some(&key) {
            return false;
        }
        let had_rows = self.rows.iter().any(Option::is_some);
        self.invalidate();
        self.key = Some(key);
        had_rows
    }

    /// Record the atlas generations the cached rows are valid for.
    pub fn settle(&mut self, atlas_generations: (u64, u64)) {
        if let Some(key) = self.key.as_mut() {
            key.atlas_generations = atlas_generations;
        }
    }

    pub fn invalidate(&mut self) {
        self.rows.iter_mut().for_each(|row| *row = None);
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.key = None;
    }

    pub fn resize(&mut self, rows: usize) {
        self.rows.resize(rows, None);
    }

    pub fn get(&self, row: usize) -> Option<&RowLayers> {
        self.rows.get(row).and_then(Option::as_ref)
    }

    pub fn needs_build(&self, row: usize, dirty: bool) -> bool {
        dirty || self.get(row).is_none()
    }

    pub fn store(&mut self, row: usize, layers: RowLayers) {
        if let Some(slot) = self.rows.get_mut(row) {
            *slot = Some(layers);
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &RowLayers> {
        self.rows.iter().flatten()
    }

    /// True if any cached row animates under `effects`.
    pub fn animated(&self, effects: EffectFlags) -> bool {
        effects.contains(EffectFlags::ANIMATE_LINES) && self.rows().any(|row| row.animated)
    }
}

#[cfg(test)]
mod tests {
    use cellgrid_core::geometry::Size;

    use super::*;
    use crate::payload::{Decoration, GlyphId, GridLines};

    fn settings() -> FrameSettings {
        FrameSettings::default()
    }

    #[test]
    fn test_push_merged_joins_equal_runs() {
        let mut layer = Vec::new();
        push_merged(&mut layer, quad(ShadingMode::Background, 0, 0, 9, 18).with_color(Rgba::RED));
        push_merged(&mut layer, quad(ShadingMode::Background, 9, 0, 9, 18).with_color(Rgba::RED));
        push_merged(&mut layer, quad(ShadingMode::Background, 18, 0, 9, 18).with_color(Rgba::WHITE));

        assert_eq!(layer.len(), 2);
        assert_eq!(layer[0].size, [18, 18]);
        assert_eq!(layer[1].position, [18, 0]);
    }

    #[test]
    fn test_quad_saturates() {
        let record = quad(ShadingMode::FilledRect, -40_000, 70_000, -5, 100_000);
        assert_eq!(record.position, [i16::MIN, i16::MAX]);
        assert_eq!(record.size, [0, u16::MAX]);
    }

    #[test]
    fn test_double_height_clips_to_row() {
        let font = FontMetrics::default();
        let top = RowGeometry::new(&font, 2, LineRendition::DoubleHeightTop);
        let bottom = RowGeometry::new(&font, 3, LineRendition::DoubleHeightBottom);
        let placement = GlyphPlacement {
            region: AtlasRegion::new(10, 20, 8, 16),
            offset: (0, 1),
            mode: ShadingMode::TextGrayscale,
            unit: AtlasUnit::Coverage,
        };

        let upper = text_record(&top, 0, &placement, Rgba::WHITE).unwrap();
        assert_eq!(upper.position[1] as i32, top.top + 2);
        assert_eq!(upper.position[1] as i32 + upper.size[1] as i32, top.bottom());
        assert_eq!(upper.rendition(), RenditionScale::LARGE);

        let lower = text_record(&bottom, 0, &placement, Rgba::WHITE).unwrap();
        assert_eq!(lower.position[1] as i32, bottom.top);
        assert_eq!(lower.texcoord[1], 20 + 8);
        assert!(lower.position[1] as i32 + lower.size[1] as i32 <= bottom.bottom());
    }

    #[test]
    fn test_cursor_shapes() {
        let settings = settings();
        let rows = vec![Row {
            cells: vec![Cell::blank(Rgba::WHITE, Rgba::BLACK); 4],
            rendition: LineRendition::Single,
        }];
        let mut cursor = CursorState {
            row: 0,
            col: 1,
            shape: CursorShape::HollowBox,
            color: Rgba::WHITE,
            blinking: false,
        };
        assert_eq!(cursor_layer(&rows, &cursor, &settings).len(), 4);

        cursor.shape = CursorShape::DoubleUnderline;
        assert_eq!(cursor_layer(&rows, &cursor, &settings).len(), 2);

        cursor.shape = CursorShape::Block;
        let block = cursor_layer(&rows, &cursor, &settings);
        assert_eq!(block[0].position, [9, 0]);
        assert_eq!(block[0].size, [9, 18]);

        cursor.row = 5;
        assert!(cursor_layer(&rows, &cursor, &settings).is_empty());
    }

    #[test]
    fn test_selection_clamps_to_row() {
        let settings = settings();
        let rows = vec![Row {
            cells: vec![Cell::blank(Rgba::WHITE, Rgba::BLACK); 4],
            rendition: LineRendition::DoubleWidth,
        }];
        let layer = selection_layer(
            &rows,
            &[
                SelectionSpan { row: 0, cols: 1..10 },
                SelectionSpan { row: 3, cols: 0..2 },
            ],
            &settings,
        );
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].position, [18, 0]);
        assert_eq!(layer[0].size, [54, 18]);
        assert_eq!(layer[0].mode(), Some(ShadingMode::FilledRect));
    }

    #[test]
    fn test_decorations_merge_and_flag_animation() {
        let font = FontMetrics::default();
        let geometry = RowGeometry::new(&font, 0, LineRendition::Single);
        let mut cell = Cell::blank(Rgba::WHITE, Rgba::BLACK).with_glyph(GlyphId {
            face: 0,
            glyph_index: 1,
        });
        cell.decoration = Decoration {
            underline: UnderlineStyle::Dotted,
            underline_color: Some(Rgba::RED),
            strikethrough: false,
            gridlines: GridLines::empty(),
        };

        let mut layer = Vec::new();
        decorate(&mut layer, &geometry, &font, &cell, 0, 9);
        decorate(&mut layer, &geometry, &font, &cell, 9, 9);
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].size[0], 18);
        assert_eq!(layer[0].rgba(), Rgba::RED);
        assert_eq!(layer[0].mode(), Some(ShadingMode::DottedLine));

        cell.decoration.underline = UnderlineStyle::Double;
        cell.decoration.strikethrough = true;
        let mut layer = Vec::new();
        decorate(&mut layer, &geometry, &font, &cell, 0, 9);
        assert_eq!(layer.len(), 3);
    }

    #[test]
    fn test_gridlines_border_the_cell() {
        let font = FontMetrics::default();
        let geometry = RowGeometry::new(&font, 1, LineRendition::Single);
        let mut cell = Cell::blank(Rgba::WHITE, Rgba::BLACK);
        cell.decoration.gridlines = GridLines::all();

        let mut layer = Vec::new();
        decorate(&mut layer, &geometry, &font, &cell, 9, 9);
        let rects: Vec<_> = layer.iter().map(|r| (r.position, r.size)).collect();
        assert_eq!(
            rects,
            vec![
                ([9, 18], [9, 1]),
                ([9, 35], [9, 1]),
                ([9, 18], [1, 18]),
                ([17, 18], [1, 18]),
            ]
        );
        assert!(layer.iter().all(|r| r.mode() == Some(ShadingMode::SolidLine)));
        assert!(layer.iter().all(|r| r.rgba() == Rgba::WHITE));

        cell.decoration.gridlines = GridLines::TOP;
        let mut layer = Vec::new();
        decorate(&mut layer, &geometry, &font, &cell, 0, 9);
        decorate(&mut layer, &geometry, &font, &cell, 9, 9);
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].size, [18, 1]);

        cell.decoration.gridlines = GridLines::TOP | GridLines::LEFT;
        let mut layer = Vec::new();
        decorate(&mut layer, &geometry, &font, &cell, 0, 9);
        decorate(&mut layer, &geometry, &font, &cell, 9, 9);
        assert_eq!(layer.len(), 4);
    }

    #[test]
    fn test_cursor_foreground_clips_to_cursor() {
        let glyph = quad(ShadingMode::TextGrayscale, 10, 2, 8, 8)
            .with_texcoord([40, 60])
            .with_color(Rgba::WHITE);
        let bar = quad(ShadingMode::Cursor, 9, 0, 3, 18);
        let records = cursor_foreground(&[bar], &[glyph], Rgba::BLACK);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position, [10, 2]);
        assert_eq!(records[0].size, [2, 8]);
        assert_eq!(records[0].texcoord, [40, 60]);
        assert_eq!(records[0].rgba(), Rgba::BLACK);
        assert_eq!(records[0].mode(), Some(ShadingMode::TextGrayscale));

        // Underline in the lower half skips whole texel rows.
        let underline = quad(ShadingMode::Cursor, 9, 7, 9, 2);
        let records = cursor_foreground(&[underline], &[glyph], Rgba::BLACK);
        assert_eq!(records[0].position, [10, 7]);
        assert_eq!(records[0].texcoord, [40, 65]);
        assert_eq!(records[0].size, [8, 2]);

        let elsewhere = quad(ShadingMode::Cursor, 30, 0, 9, 18);
        assert!(cursor_foreground(&[elsewhere], &[glyph], Rgba::BLACK).is_empty());
    }

    #[test]
    fn test_cursor_foreground_respects_rendition() {
        let glyph = quad(ShadingMode::TextGrayscale, 0, 0, 8, 8)
            .with_texcoord([0, 0])
            .with_rendition(RenditionScale::WIDE);
        let clip = quad(ShadingMode::Cursor, 3, 0, 4, 18);
        let records = cursor_foreground(&[clip], &[glyph], Rgba::BLACK);
        // x snaps from 3 up to the next texel boundary at 4.
        assert_eq!(records[0].position, [4, 0]);
        assert_eq!(records[0].size, [3, 8]);
        assert_eq!(records[0].texcoord, [2, 0]);
    }

    #[test]
    fn test_cursor_text_color_avoids_cursor_color() {
        let settings = settings();
        let mut rows = vec![Row {
            cells: vec![Cell::blank(Rgba::WHITE, Rgba::BLACK); 2],
            rendition: LineRendition::Single,
        }];
        let mut cursor = CursorState {
            row: 0,
            col: 0,
            shape: CursorShape::Block,
            color: Rgba::WHITE,
            blinking: false,
        };
        assert_eq!(cursor_text_color(&rows, &cursor, &settings), Rgba::BLACK);

        rows[0].cells[0].bg = Rgba::WHITE;
        rows[0].cells[0].fg = Rgba::RED;
        assert_eq!(cursor_text_color(&rows, &cursor, &settings), Rgba::RED);

        cursor.col = 7;
        assert_eq!(
            cursor_text_color(&rows, &cursor, &settings),
            settings.palette.background
        );
    }

    #[test]
    fn test_on_screen() {
        let viewport = Size::new(90, 36);
        assert!(on_screen(&quad(ShadingMode::Cursor, 0, 18, 9, 18), viewport));
        assert!(on_screen(&quad(ShadingMode::Cursor, -5, -5, 6, 6), viewport));
        assert!(!on_screen(&quad(ShadingMode::Cursor, 0, 36, 9, 18), viewport));
        assert!(!on_screen(&quad(ShadingMode::Cursor, 90, 0, 9, 18), viewport));
        assert!(!on_screen(&quad(ShadingMode::Cursor, 0, 0, 0, 18), viewport));
    }

    #[test]
    fn test_row_cache_invalidation() {
        let mut cache = RowCache::default();
        let settings = settings();
        let viewport = Size::new(100, 100);
        cache.validate(viewport, &settings, (0, 0), 0);
        cache.resize(2);
        cache.store(0, RowLayers::default());

        assert!(!cache.validate(viewport, &settings, (0, 0), 0));
        assert!(cache.get(0).is_some());
        assert!(cache.needs_build(1, false));
        assert!(cache.needs_build(0, true));

        assert!(cache.validate(viewport, &settings, (1, 0), 0));
        assert!(cache.get(0).is_none());
    }
}
