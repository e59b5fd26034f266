//! Whole-frame pixel tests against the CPU reference device.

use cellgrid_core::geometry::Size;
use cellgrid_gpu::{Capabilities, FeatureLevel, FeatureSet};
use cellgrid_render::device::{FrameCapture, SoftwareDevice};
use cellgrid_render::{
    Backend, CursorShape, CursorState, FontMetrics, GlyphContent, GlyphId, GlyphKey,
    GlyphRasterizer, GridLines, LineRendition, RasterizedGlyph, RenderError, RenderPayload, RendererConfig,
    Rgba, SelectionSpan, StreamStrategyKind, UnderlineStyle,
};

/// 4×4 blocks with a fixed coverage ramp, so every glyph is visible.
struct Blocks;

impl GlyphRasterizer for Blocks {
    fn rasterize(&mut self, _key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
        Some(RasterizedGlyph {
            width: 4,
            height: 4,
            offset: (2, 4),
            content: GlyphContent::Coverage,
            pixels: (0..16).map(|i| 0x40 + i * 0x0C).collect(),
        })
    }
}

fn software_backend(device: SoftwareDevice, config: RendererConfig) -> (Backend, FrameCapture) {
    let capture = device.capture();
    let backend = Backend::new(Box::new(device), Box::new(Blocks), config).unwrap();
    (backend, capture)
}

/// A small screen exercising every layer.
fn busy_payload() -> RenderPayload {
    let mut payload = RenderPayload::blank(Size::new(90, 72), 10, 4);
    for (row_index, row) in payload.rows.iter_mut().enumerate() {
        for (col, cell) in row.cells.iter_mut().enumerate() {
            if (row_index + col) % 3 == 0 {
                cell.bg = Rgba::from_hex(0x203040);
            }
            cell.glyph = Some(GlyphId::new(0, (row_index * 10 + col) as u32 % 7));
        }
    }
    payload.rows[1].cells[2].decoration.underline = UnderlineStyle::Dotted;
    payload.rows[1].cells[3].decoration.underline = UnderlineStyle::Curly;
    payload.rows[1].cells[4].decoration.underline = UnderlineStyle::Double;
    payload.rows[1].cells[5].decoration.strikethrough = true;
    payload.rows[2].rendition = LineRendition::DoubleWidth;
    payload.selection = vec![SelectionSpan { row: 3, cols: 1..6 }];
    payload.cursor = Some(CursorState {
        row: 0,
        col: 9,
        shape: CursorShape::HollowBox,
        color: Rgba::WHITE,
        blinking: false,
    });
    payload
}

fn render_once(device: SoftwareDevice, config: RendererConfig, payload: &RenderPayload) -> Vec<u8> {
    let (mut backend, capture) = software_backend(device, config);
    backend.render(payload).unwrap();
    capture.pixels()
}

#[test]
fn test_backgrounds_and_clear() {
    let (mut backend, capture) = software_backend(SoftwareDevice::new(), RendererConfig::default());
    let mut payload = RenderPayload::blank(Size::new(45, 36), 4, 2);
    for cell in &mut payload.rows[0].cells {
        cell.bg = Rgba::RED;
    }

    backend.render(&payload).unwrap();

    assert_eq!(capture.width(), 45);
    assert_eq!(capture.pixel(4, 5), Some([255, 0, 0, 255]));
    assert_eq!(capture.pixel(4, 20), Some([0x0C, 0x0C, 0x0C, 255]));
    // Right of the last column only the clear color shows.
    assert_eq!(capture.pixel(40, 5), Some([0, 0, 0, 255]));
}

#[test]
fn test_block_cursor_covers_cell() {
    let (mut backend, capture) = software_backend(SoftwareDevice::new(), RendererConfig::default());
    let mut payload = RenderPayload::blank(Size::new(36, 36), 4, 2);
    payload.cursor = Some(CursorState {
        row: 1,
        col: 2,
        shape: CursorShape::Block,
        color: Rgba::WHITE,
        blinking: false,
    });

    backend.render(&payload).unwrap();

    for (x, y) in [(18, 18), (26, 35), (22, 27)] {
        assert_eq!(capture.pixel(x, y), Some([255, 255, 255, 255]), "({x}, {y})");
    }
    assert_eq!(capture.pixel(17, 18), Some([0x0C, 0x0C, 0x0C, 255]));
}

#[test]
fn test_glyph_under_block_cursor_takes_cell_background() {
    let (mut backend, capture) = software_backend(SoftwareDevice::new(), RendererConfig::default());
    let mut payload = RenderPayload::blank(Size::new(36, 36), 4, 2);
    payload.rows[1].cells[2].glyph = Some(GlyphId::new(0, 1));
    payload.cursor = Some(CursorState {
        row: 1,
        col: 2,
        shape: CursorShape::Block,
        color: Rgba::WHITE,
        blinking: false,
    });

    backend.render(&payload).unwrap();

    // The glyph box spans (20, 22)..(24, 26); its densest texel is at (23, 25).
    let [r, g, b, _] = capture.pixel(23, 25).unwrap();
    assert!(r < 128 && g < 128 && b < 128, "glyph drawn as {:?}", [r, g, b]);
    assert_eq!(capture.pixel(19, 19), Some([255, 255, 255, 255]));
    assert_eq!(capture.pixel(25, 30), Some([255, 255, 255, 255]));
}

#[test]
fn test_gridlines_outline_cell() {
    let (mut backend, capture) = software_backend(SoftwareDevice::new(), RendererConfig::default());
    let mut payload = RenderPayload::blank(Size::new(36, 36), 4, 2);
    let cell = &mut payload.rows[0].cells[1];
    cell.fg = Rgba::RED;
    cell.decoration.gridlines = GridLines::all();

    backend.render(&payload).unwrap();

    for (x, y) in [(9, 0), (13, 0), (17, 0), (9, 9), (17, 9), (9, 17), (13, 17)] {
        assert_eq!(capture.pixel(x, y), Some([255, 0, 0, 255]), "({x}, {y})");
    }
    for (x, y) in [(13, 9), (8, 0), (18, 9), (13, 18)] {
        assert_eq!(capture.pixel(x, y), Some([0x0C, 0x0C, 0x0C, 255]), "({x}, {y})");
    }
}

#[test]
fn test_glyphs_draw_over_backgrounds() {
    let payload = busy_payload();
    let mut plain = payload.clone();
    for row in &mut plain.rows {
        for cell in &mut row.cells {
            cell.glyph = None;
        }
    }

    let with_text = render_once(SoftwareDevice::new(), RendererConfig::default(), &payload);
    let without = render_once(SoftwareDevice::new(), RendererConfig::default(), &plain);
    assert_ne!(with_text, without);
}

#[test]
fn test_stream_strategies_produce_identical_frames() {
    let payload = busy_payload();
    let reference = render_once(SoftwareDevice::new(), RendererConfig::default(), &payload);

    for kind in [StreamStrategyKind::Rotating, StreamStrategyKind::Orphan] {
        let config = RendererConfig::default().with_stream_strategy(kind);
        let (mut backend, capture) = software_backend(SoftwareDevice::new(), config);
        assert_eq!(backend.strategies().stream, kind);
        backend.render(&payload).unwrap();
        assert!(capture.pixels() == reference, "{kind} differs from persistent");
    }
}

#[test]
fn test_downlevel_device_matches_full_device() {
    let payload = busy_payload();
    let reference = render_once(SoftwareDevice::new(), RendererConfig::default(), &payload);

    let downlevel = SoftwareDevice::with_features(FeatureSet::new(
        FeatureLevel::Downlevel,
        Capabilities::empty(),
        4096,
    ));
    let (mut backend, capture) = software_backend(downlevel, RendererConfig::default());
    assert_eq!(backend.strategies().stream, StreamStrategyKind::Orphan);
    backend.render(&payload).unwrap();
    assert!(capture.pixels() == reference);
}

#[test]
fn test_batch_splits_do_not_change_output() {
    let payload = busy_payload();
    let reference = render_once(SoftwareDevice::new(), RendererConfig::default(), &payload);

    let config = RendererConfig::default().with_batch_capacity(7);
    let (mut backend, capture) = software_backend(SoftwareDevice::new(), config);
    let stats = backend.render(&payload).unwrap();
    assert!(stats.flushes > 1);
    assert!(capture.pixels() == reference);
}

#[test]
fn test_cached_rows_match_fresh_frame() {
    let payload = busy_payload();
    let (mut backend, capture) = software_backend(SoftwareDevice::new(), RendererConfig::default());
    backend.render(&payload).unwrap();
    let first = capture.pixels();

    let clean = RenderPayload {
        dirty: cellgrid_render::DirtyRegion::None,
        ..payload
    };
    let stats = backend.render(&clean).unwrap();
    assert_eq!(stats.rows_rebuilt, 0);
    assert!(capture.pixels() == first);
}

#[test]
fn test_atlas_overflow_resets_once() {
    let config = RendererConfig::default().with_atlas_size(16, 16);
    let (mut backend, _capture) = software_backend(SoftwareDevice::new(), config);

    let frame = |glyphs: std::ops::Range<u32>| {
        let mut payload = RenderPayload::blank(Size::new(270, 18), glyphs.len(), 1);
        for (cell, glyph) in payload.rows[0].cells.iter_mut().zip(glyphs) {
            cell.glyph = Some(GlyphId::new(0, glyph));
        }
        payload
    };

    // A 16×16 atlas holds nine padded 4×4 glyphs.
    let stats = backend.render(&frame(0..8)).unwrap();
    assert_eq!(stats.atlas_resets, 0);

    let stats = backend.render(&frame(8..16)).unwrap();
    assert_eq!(stats.atlas_resets, 1);
    assert_eq!(stats.glyphs_inserted, 9);

    // More distinct glyphs than one atlas can hold.
    assert!(matches!(
        backend.render(&frame(16..30)),
        Err(RenderError::ResourceExhausted(_))
    ));
    assert!(backend.render(&frame(0..8)).is_ok());
}
