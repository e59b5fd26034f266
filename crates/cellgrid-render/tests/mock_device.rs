//! Device call sequences observed through the recording mock.

use cellgrid_core::geometry::Size;
use cellgrid_gpu::{DeviceCall, MockDevice, MockProbe};
use cellgrid_render::{
    Backend, BackendState, CursorShape, CursorState, EffectFlags, FontMetrics, GlyphContent,
    GlyphId, GlyphKey, GlyphRasterizer, InstanceRecord, MAX_INSTANCES, RasterizedGlyph,
    RenderError, RenderPayload, RendererConfig, Rgba, SelectionSpan, ShadingMode,
    StreamStrategyKind, UnderlineStyle,
};

struct NoGlyphs;

impl GlyphRasterizer for NoGlyphs {
    fn rasterize(&mut self, _key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
        None
    }
}

/// A single opaque texel per glyph.
struct Dots;

impl GlyphRasterizer for Dots {
    fn rasterize(&mut self, _key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
        Some(RasterizedGlyph {
            width: 1,
            height: 1,
            offset: (4, 8),
            content: GlyphContent::Coverage,
            pixels: vec![0xFF],
        })
    }
}

fn backend_with(
    rasterizer: impl GlyphRasterizer + 'static,
    config: RendererConfig,
) -> (Backend, MockProbe) {
    cellgrid_core::logging::init_with_filter("cellgrid_render=debug");
    let (device, probe) = MockDevice::new();
    let backend = Backend::new(Box::new(device), Box::new(rasterizer), config).unwrap();
    (backend, probe)
}

fn backend(config: RendererConfig) -> (Backend, MockProbe) {
    backend_with(NoGlyphs, config)
}

fn cursor(row: usize, blinking: bool) -> CursorState {
    CursorState {
        row,
        col: 1,
        shape: CursorShape::Block,
        color: Rgba::WHITE,
        blinking,
    }
}

/// `columns`×`rows` cells whose backgrounds alternate, so none merge.
fn checkerboard(columns: usize, rows: usize) -> RenderPayload {
    let viewport = Size::new(columns as u32 * 9, rows as u32 * 18);
    let mut payload = RenderPayload::blank(viewport, columns, rows);
    for (y, row) in payload.rows.iter_mut().enumerate() {
        for (x, cell) in row.cells.iter_mut().enumerate() {
            if (x + y) % 2 == 0 {
                cell.bg = Rgba::RED;
            }
        }
    }
    payload
}

#[test]
fn test_empty_frame_issues_no_draws() {
    let (mut backend, probe) = backend(RendererConfig::default());
    probe.clear_calls();

    let stats = backend
        .render(&RenderPayload::blank(Size::new(100, 100), 0, 0))
        .unwrap();

    assert_eq!(stats.draw_calls, 0);
    assert_eq!(probe.count_draws(), 0);
    assert_eq!(probe.count_presents(), 1);
}

#[test]
fn test_seventy_thousand_instances_split_without_loss() {
    let (mut backend, probe) = backend(RendererConfig::default());
    let payload = checkerboard(350, 200);

    let stats = backend.render(&payload).unwrap();

    assert_eq!(stats.instances, 70_000);
    assert_eq!(stats.flushes, 2);
    assert_eq!(probe.drawn_instances(), 70_000);
    let counts: Vec<u32> = probe.draws().iter().map(|d| d.count).collect();
    assert_eq!(counts, [MAX_INSTANCES as u32, 70_000 - MAX_INSTANCES as u32]);
}

#[test]
fn test_draws_preserve_append_order() {
    let config = RendererConfig::default()
        .with_batch_capacity(5)
        .with_stream_strategy(StreamStrategyKind::Orphan);
    let (mut backend, probe) = backend(config);
    let payload = checkerboard(4, 3);

    backend.render(&payload).unwrap();

    let mut positions = Vec::new();
    for draw in probe.draws() {
        let bytes = &draw.bytes[..draw.count as usize * InstanceRecord::SIZE];
        for chunk in bytes.chunks_exact(InstanceRecord::SIZE) {
            let record = InstanceRecord::from_bytes(chunk).unwrap();
            assert_eq!(record.mode(), Some(ShadingMode::Background));
            positions.push((record.position[1], record.position[0]));
        }
    }
    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(positions, sorted);
    assert_eq!(positions.len(), 12);
}

#[test]
fn test_every_draw_follows_its_upload() {
    let config = RendererConfig::default().with_batch_capacity(10);
    let (mut backend, probe) = backend(config);
    backend.render(&checkerboard(8, 4)).unwrap();

    let calls = probe.calls();
    for (index, call) in calls.iter().enumerate() {
        if let DeviceCall::DrawInstances { buffer, .. } = call {
            let uploaded = calls[..index].iter().rev().find_map(|c| match c {
                DeviceCall::WriteMapped { id, .. } | DeviceCall::WriteBuffer { id, .. } => {
                    Some(*id)
                }
                _ => None,
            });
            assert_eq!(uploaded, Some(*buffer));
        }
    }
}

#[test]
fn test_state_set_once_across_frames() {
    let (mut backend, probe) = backend(RendererConfig::default());
    for _ in 0..5 {
        backend.render(&checkerboard(10, 10)).unwrap();
    }

    assert_eq!(probe.count_set_program(), 1);
    assert_eq!(probe.count_set_blend(), 1);
    assert_eq!(probe.count_bind_texture(), 2);
    assert_eq!(probe.count_presents(), 5);
}

#[test]
fn test_recovery_rebuilds_every_resource() {
    let (mut backend, probe) = backend(RendererConfig::default());
    backend.render(&checkerboard(4, 4)).unwrap();
    let live = probe.live_resources();

    probe.lose_device();
    let stats = backend.render(&checkerboard(4, 4)).unwrap();

    assert_eq!(stats.recoveries, 1);
    assert_eq!(
        probe.count(|c| matches!(c, DeviceCall::CreateProgram { .. })),
        2
    );
    assert_eq!(probe.live_resources(), live);
    assert_eq!(backend.last_stats().recoveries, 1);

    let stats = backend.render(&checkerboard(4, 4)).unwrap();
    assert_eq!(stats.recoveries, 0);
}

#[test]
fn test_release_destroys_everything() {
    let (mut backend, probe) = backend(RendererConfig::default());
    backend.render(&checkerboard(4, 4)).unwrap();
    assert!(probe.live_resources() > 0);

    backend.release_resources();
    assert_eq!(probe.live_resources(), 0);
    backend.release_resources();
    assert_eq!(
        probe.count(|c| matches!(c, DeviceCall::DestroyProgram { .. })),
        1
    );
}

#[test]
fn test_failed_recovery_is_retried_on_next_frame() {
    let (mut backend, probe) = backend(RendererConfig::default());
    backend.render(&checkerboard(4, 4)).unwrap();
    let live = probe.live_resources();

    probe.lose_device();
    probe.fail_next_recreate();
    assert_eq!(
        backend.render(&checkerboard(4, 4)),
        Err(RenderError::DeviceLost)
    );
    assert_eq!(backend.state(), BackendState::Lost);
    assert!(!backend.requires_continuous_redraw());

    let stats = backend.render(&checkerboard(4, 4)).unwrap();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(backend.state(), BackendState::Ready);
    assert_eq!(probe.count(|c| matches!(c, DeviceCall::Recreate)), 2);
    assert_eq!(probe.live_resources(), live);

    let stats = backend.render(&checkerboard(4, 4)).unwrap();
    assert_eq!(stats.recoveries, 0);
}

#[test]
fn test_release_while_lost() {
    let (mut backend, probe) = backend(RendererConfig::default());
    probe.lose_device();
    probe.fail_next_recreate();
    assert!(backend.render(&checkerboard(2, 2)).is_err());

    backend.release_resources();
    assert_eq!(backend.state(), BackendState::Released);
    assert_eq!(backend.render(&checkerboard(2, 2)), Err(RenderError::Released));
}

#[test]
fn test_static_frame_needs_no_redraw() {
    let (mut backend, probe) = backend_with(Dots, RendererConfig::default());
    let mut payload = checkerboard(4, 2);
    payload.settings.effects = EffectFlags::all();
    for cell in &mut payload.rows[0].cells {
        cell.glyph = Some(GlyphId::new(0, 7));
    }
    payload.rows[1].cells[0].decoration.underline = UnderlineStyle::Single;
    payload.selection = vec![SelectionSpan { row: 0, cols: 0..3 }];
    payload.cursor = Some(cursor(0, false));

    let stats = backend.render(&payload).unwrap();

    let modes: Vec<_> = probe
        .draws()
        .iter()
        .flat_map(|draw| {
            draw.bytes[..draw.count as usize * InstanceRecord::SIZE]
                .chunks_exact(InstanceRecord::SIZE)
                .filter_map(|chunk| InstanceRecord::from_bytes(chunk).and_then(|r| r.mode()))
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(modes.contains(&ShadingMode::TextGrayscale));
    assert!(modes.contains(&ShadingMode::FilledRect));
    assert!(modes.contains(&ShadingMode::Cursor));
    assert_eq!(modes.len() as u64, stats.instances);
    assert!(!backend.requires_continuous_redraw());
}

#[test]
fn test_offscreen_blinking_cursor_needs_no_redraw() {
    let (mut backend, _probe) = backend(RendererConfig::default());
    let mut payload = checkerboard(4, 4);
    // Rows 2 and 3 lie below the viewport.
    payload.viewport = Size::new(36, 36);
    payload.settings.effects = EffectFlags::BLINK_CURSOR;

    payload.cursor = Some(cursor(3, true));
    backend.render(&payload).unwrap();
    assert!(!backend.requires_continuous_redraw());

    payload.cursor = Some(cursor(9, true));
    backend.render(&payload).unwrap();
    assert!(!backend.requires_continuous_redraw());

    payload.cursor = Some(cursor(1, true));
    backend.render(&payload).unwrap();
    assert!(backend.requires_continuous_redraw());
}

#[test]
fn test_offscreen_line_animation_needs_no_redraw() {
    let (mut backend, _probe) = backend(RendererConfig::default());
    let mut payload = checkerboard(4, 4);
    payload.viewport = Size::new(36, 36);
    payload.settings.effects = EffectFlags::ANIMATE_LINES;

    payload.rows[3].cells[0].decoration.underline = UnderlineStyle::Curly;
    backend.render(&payload).unwrap();
    assert!(!backend.requires_continuous_redraw());

    payload.rows[0].cells[0].decoration.underline = UnderlineStyle::Dashed;
    backend.render(&payload).unwrap();
    assert!(backend.requires_continuous_redraw());
}
